use itertools::Itertools;
use redis::AsyncCommands;
use tracing::debug;
use uuid::Uuid;

use crate::{
    room::model::PendingAction,
    state::AppResult,
    store::{pending_key, Cache},
};

/// Entries outlive their execution instant by a wide margin so a node that
/// was partitioned can still drain them; the TTL only bounds abandoned rooms.
const PENDING_TTL_MS: i64 = 10 * 60 * 1000;

pub async fn add(cache: &Cache, room_id: Uuid, action: &PendingAction) -> AppResult<()> {
    let key = pending_key(room_id);
    let member = serde_json::to_string(action)?;
    let mut conn = cache.conn();
    let mut pipe = redis::pipe();
    pipe.atomic()
        .zadd(&key, member, action.exec_at_ms)
        .pexpire(&key, PENDING_TTL_MS);
    let _: () = pipe.query_async(&mut conn).await?;
    Ok(())
}

pub async fn peek_next_due_at(cache: &Cache, room_id: Uuid) -> AppResult<Option<i64>> {
    let mut conn = cache.conn();
    let head: Vec<(String, f64)> = conn.zrange_withscores(pending_key(room_id), 0, 0).await?;
    Ok(head.first().map(|(_, score)| *score as i64))
}

/// All actions due at or before `now_ms`, paired with their raw member so
/// the caller can remove exactly what it drained.
pub async fn range_due(
    cache: &Cache,
    room_id: Uuid,
    now_ms: i64,
) -> AppResult<Vec<(String, PendingAction)>> {
    let mut conn = cache.conn();
    let raw: Vec<String> = conn
        .zrangebyscore(pending_key(room_id), "-inf", now_ms)
        .await?;
    Ok(parse_members(raw))
}

/// Upcoming actions (strictly after `now_ms`), bounded, for late-join replay.
pub async fn range_upcoming(
    cache: &Cache,
    room_id: Uuid,
    now_ms: i64,
    limit: usize,
) -> AppResult<Vec<PendingAction>> {
    let mut conn = cache.conn();
    let raw: Vec<String> = conn
        .zrangebyscore_limit(
            pending_key(room_id),
            format!("({now_ms}"),
            "+inf",
            0,
            limit as isize,
        )
        .await?;
    Ok(parse_members(raw)
        .into_iter()
        .map(|(_, action)| action)
        .collect())
}

pub async fn remove_all(cache: &Cache, room_id: Uuid, raw_members: &[String]) -> AppResult<()> {
    if raw_members.is_empty() {
        return Ok(());
    }
    let mut conn = cache.conn();
    let _: () = conn.zrem(pending_key(room_id), raw_members).await?;
    Ok(())
}

/// Readers tolerate malformed entries; a bad member is dropped, not fatal.
fn parse_members(raw: Vec<String>) -> Vec<(String, PendingAction)> {
    raw.into_iter()
        .filter_map(|member| match serde_json::from_str(&member) {
            Ok(action) => Some((member, action)),
            Err(err) => {
                debug!("dropping malformed pending entry: {err}");
                None
            }
        })
        .collect()
}

/// Execution order: ascending instant, ties broken by ascending sequence.
/// Clients apply the same tie-break.
pub fn sort_for_apply(actions: Vec<(String, PendingAction)>) -> Vec<(String, PendingAction)> {
    actions
        .into_iter()
        .sorted_by_key(|(_, a)| (a.exec_at_ms, a.seq))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::model::{Command, RoomSnapshot};

    fn action(seq: i64, exec_at_ms: i64) -> (String, PendingAction) {
        let patch = RoomSnapshot::new(Uuid::new_v4(), None, 0.0);
        let action = PendingAction {
            seq,
            exec_at_ms,
            server_now_ms: exec_at_ms - 2_000,
            command: Command::VideoPlay,
            patch,
        };
        (serde_json::to_string(&action).unwrap(), action)
    }

    #[test]
    fn ordering_breaks_instant_ties_by_sequence() {
        let unordered = vec![action(5, 100), action(3, 100), action(4, 50)];
        let ordered = sort_for_apply(unordered);
        let seqs: Vec<i64> = ordered.iter().map(|(_, a)| a.seq).collect();
        assert_eq!(seqs, vec![4, 3, 5]);
    }

    #[test]
    fn malformed_members_are_dropped_silently() {
        let (good_raw, good) = action(1, 10);
        let parsed = parse_members(vec!["{not json".to_owned(), good_raw.clone()]);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, good_raw);
        assert_eq!(parsed[0].1, good);
    }

    #[test]
    fn serialized_action_reparses_to_the_same_patch() {
        let (raw, original) = action(9, 1_234);
        let reparsed: PendingAction = serde_json::from_str(&raw).unwrap();
        assert_eq!(reparsed.patch, original.patch);
        assert_eq!(reparsed.command, original.command);
    }
}
