use redis::AsyncCommands;
use uuid::Uuid;

use crate::{
    state::AppResult,
    store::{presence_key, Cache},
};

const PRESENCE_TTL_SECS: i64 = 20 * 60;
const DIRTY_KEY: &str = "presence:dirty";

/// Registers one more connection for `user_id` in the room and marks the
/// room dirty for the next presence broadcast.
pub async fn join(cache: &Cache, room_id: Uuid, user_id: &str) -> AppResult<()> {
    let key = presence_key(room_id);
    let mut conn = cache.conn();
    let mut pipe = redis::pipe();
    pipe.atomic()
        .hincr(&key, user_id, 1i64)
        .expire(&key, PRESENCE_TTL_SECS)
        .sadd(DIRTY_KEY, room_id.to_string());
    let _: () = pipe.query_async(&mut conn).await?;
    Ok(())
}

/// Drops one connection; the user's entry disappears once the last
/// connection is gone so `HLEN` stays an online-user count.
pub async fn leave(cache: &Cache, room_id: Uuid, user_id: &str) -> AppResult<()> {
    let key = presence_key(room_id);
    let mut conn = cache.conn();
    let remaining: i64 = conn.hincr(&key, user_id, -1i64).await?;
    if remaining <= 0 {
        let _: () = conn.hdel(&key, user_id).await?;
    }
    let _: () = conn.sadd(DIRTY_KEY, room_id.to_string()).await?;
    Ok(())
}

pub async fn online_count(cache: &Cache, room_id: Uuid) -> AppResult<i64> {
    let mut conn = cache.conn();
    Ok(conn.hlen(presence_key(room_id)).await?)
}

/// Claims the set of rooms whose presence changed since the last tick. The
/// read and the delete are pipelined; a join racing the tick simply lands in
/// the next one.
pub async fn take_dirty(cache: &Cache) -> AppResult<Vec<Uuid>> {
    let mut conn = cache.conn();
    let mut pipe = redis::pipe();
    pipe.atomic().smembers(DIRTY_KEY).del(DIRTY_KEY);
    let (members, _): (Vec<String>, i64) = pipe.query_async(&mut conn).await?;
    Ok(members.into_iter().filter_map(|m| m.parse().ok()).collect())
}
