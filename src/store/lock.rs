use uuid::Uuid;

use crate::{
    state::AppResult,
    store::{advance_lock_key, Cache},
    utils::HandleErr,
};

/// Guarded release: only the holder's token may delete the key, so a lock
/// that expired and was re-acquired elsewhere is never released by the old
/// holder.
const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

#[derive(Debug)]
pub struct AdvanceLock {
    room_id: Uuid,
    token: String,
}

/// Tries to take the per-room advance lock (`SET NX PX`). `None` means some
/// other node is currently driving this room.
pub async fn acquire(cache: &Cache, room_id: Uuid, ttl_ms: i64) -> AppResult<Option<AdvanceLock>> {
    let token = Uuid::new_v4().to_string();
    let mut conn = cache.conn();
    let acquired: Option<String> = redis::cmd("SET")
        .arg(advance_lock_key(room_id))
        .arg(&token)
        .arg("NX")
        .arg("PX")
        .arg(ttl_ms)
        .query_async(&mut conn)
        .await?;
    Ok(acquired.map(|_| AdvanceLock { room_id, token }))
}

/// Best effort; an expired lock is already gone and that is fine.
pub async fn release(cache: &Cache, lock: AdvanceLock) {
    let mut conn = cache.conn();
    let _: Option<i64> = redis::Script::new(RELEASE_SCRIPT)
        .key(advance_lock_key(lock.room_id))
        .arg(&lock.token)
        .invoke_async(&mut conn)
        .await
        .log_warn_with_msg("failed to release room advance lock");
}
