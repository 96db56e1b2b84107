use tracing::warn;

use crate::store::Cache;

/// One token is debited per operation; the bucket refills linearly and the
/// key expires after a quiet period so idle callers cost nothing.
///
/// Keep the arithmetic in [`debit`] and the script in lockstep: the Lua side
/// is what actually runs (atomically, shared across nodes), the Rust side
/// exists so the math is testable without a store.
const CONSUME_SCRIPT: &str = r"
local tokens = tonumber(redis.call('HGET', KEYS[1], 'tokens'))
local ts = tonumber(redis.call('HGET', KEYS[1], 'ts'))
local capacity = tonumber(ARGV[1])
local refill = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])
if tokens == nil or ts == nil then
    tokens = capacity
    ts = now
end
local elapsed = math.max(0, now - ts) / 1000.0
tokens = math.min(capacity, tokens + elapsed * refill)
local allowed = 0
local retry = 0
if tokens >= 1 then
    tokens = tokens - 1
    allowed = 1
else
    retry = math.ceil((1 - tokens) / refill * 1000)
end
redis.call('HSET', KEYS[1], 'tokens', tokens, 'ts', now)
redis.call('PEXPIRE', KEYS[1], ttl)
return {allowed, retry}
";

#[derive(Debug, Clone, Copy)]
pub struct BucketPolicy {
    pub capacity: f64,
    pub refill_per_sec: f64,
    pub ttl_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    pub retry_after_ms: i64,
}

impl Decision {
    fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after_ms: 0,
        }
    }
}

/// Consumes one token for `key`. Serialized through the shared store so
/// every node sees the same bucket. When the store is unreachable this
/// fails open: availability beats precision for an admission control.
pub async fn consume(
    cache: &Cache,
    key: &str,
    policy: BucketPolicy,
    now_ms: i64,
) -> Decision {
    let mut conn = cache.conn();
    let outcome: Result<(i64, i64), redis::RedisError> = redis::Script::new(CONSUME_SCRIPT)
        .key(key)
        .arg(policy.capacity)
        .arg(policy.refill_per_sec)
        .arg(now_ms)
        .arg(policy.ttl_ms)
        .invoke_async(&mut conn)
        .await;

    match outcome {
        Ok((allowed, retry_after_ms)) => Decision {
            allowed: allowed == 1,
            retry_after_ms,
        },
        Err(err) => {
            warn!("rate limiter unavailable, failing open: {err}");
            Decision::allowed()
        }
    }
}

/// Rust mirror of the consume script, one refill-and-debit step.
#[cfg_attr(not(test), allow(dead_code))]
fn debit(tokens: f64, ts_ms: i64, policy: BucketPolicy, now_ms: i64) -> (f64, Decision) {
    let elapsed_s = (now_ms - ts_ms).max(0) as f64 / 1000.0;
    let refilled = (tokens + elapsed_s * policy.refill_per_sec).min(policy.capacity);
    if refilled >= 1.0 {
        (
            refilled - 1.0,
            Decision {
                allowed: true,
                retry_after_ms: 0,
            },
        )
    } else {
        let retry = ((1.0 - refilled) / policy.refill_per_sec * 1000.0).ceil() as i64;
        (
            refilled,
            Decision {
                allowed: false,
                retry_after_ms: retry,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: BucketPolicy = BucketPolicy {
        capacity: 3.0,
        refill_per_sec: 1.0,
        ttl_ms: 60_000,
    };

    #[test]
    fn a_full_bucket_allows_capacity_requests_then_denies() {
        let mut tokens = POLICY.capacity;
        for _ in 0..3 {
            let (rest, decision) = debit(tokens, 0, POLICY, 0);
            assert!(decision.allowed);
            tokens = rest;
        }
        let (_, denied) = debit(tokens, 0, POLICY, 0);
        assert!(!denied.allowed);
        assert!(denied.retry_after_ms > 0);
    }

    #[test]
    fn retry_hint_matches_the_refill_rate() {
        // Empty bucket, one token per second: the next token is a second out.
        let (_, decision) = debit(0.0, 0, POLICY, 0);
        assert_eq!(decision.retry_after_ms, 1000);

        // Half a token already accumulated: half a second remains.
        let (_, decision) = debit(0.5, 0, POLICY, 0);
        assert_eq!(decision.retry_after_ms, 500);
    }

    #[test]
    fn refill_is_linear_and_capped() {
        let (tokens, decision) = debit(0.0, 0, POLICY, 1_500);
        assert!(decision.allowed);
        // 1.5 tokens refilled, one spent.
        assert!((tokens - 0.5).abs() < 1e-9);

        let (tokens, _) = debit(0.0, 0, POLICY, 60_000);
        assert!((tokens - (POLICY.capacity - 1.0)).abs() < 1e-9);
    }

    #[test]
    fn clock_going_backwards_does_not_mint_tokens() {
        let (tokens, decision) = debit(1.0, 10_000, POLICY, 5_000);
        assert!(decision.allowed);
        assert!((tokens - 0.0).abs() < 1e-9);
    }
}
