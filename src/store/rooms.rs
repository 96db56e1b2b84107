use std::collections::HashMap;

use redis::AsyncCommands;
use sqlx::Row;
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

use crate::{
    room::model::{PlaybackState, RoomSnapshot},
    state::{AppError, AppResult},
    store::{seq_key, state_key, Cache, Db},
};

/// Hot snapshots linger long enough to cover a whole viewing session.
const HOT_TTL_SECS: i64 = 6 * 60 * 60;

const ENSURE_SEQ_SCRIPT: &str = r"
local cur = tonumber(redis.call('GET', KEYS[1]) or '0')
local n = tonumber(ARGV[1])
if n > cur then
    redis.call('SET', KEYS[1], n)
end
return cur
";

pub fn to_field_map(snap: &RoomSnapshot) -> Vec<(String, String)> {
    let mut fields = vec![
        ("roomId".to_owned(), snap.room_id.to_string()),
        ("name".to_owned(), snap.name.clone()),
        (
            "playbackState".to_owned(),
            match snap.playback_state {
                PlaybackState::Playing => "playing".to_owned(),
                PlaybackState::Paused => "paused".to_owned(),
            },
        ),
        (
            "videoTimeAtRef".to_owned(),
            snap.video_time_at_ref.to_string(),
        ),
        (
            "referenceTimeMs".to_owned(),
            snap.reference_time_ms.to_string(),
        ),
        ("playbackRate".to_owned(), snap.playback_rate.to_string()),
        ("seq".to_owned(), snap.seq.to_string()),
        (
            "audienceDelaySeconds".to_owned(),
            snap.audience_delay_seconds.to_string(),
        ),
    ];
    if let Some(video_id) = &snap.video_id {
        fields.push(("videoId".to_owned(), video_id.clone()));
    }
    if let Some(controller) = &snap.controller_user_id {
        fields.push(("controllerUserId".to_owned(), controller.clone()));
    }
    if let Some(created_by) = &snap.created_by {
        fields.push(("createdBy".to_owned(), created_by.clone()));
    }
    fields
}

pub fn from_field_map(fields: &HashMap<String, String>) -> Option<RoomSnapshot> {
    Some(RoomSnapshot {
        room_id: fields.get("roomId")?.parse().ok()?,
        name: fields.get("name")?.clone(),
        video_id: fields.get("videoId").cloned(),
        playback_state: match fields.get("playbackState")?.as_str() {
            "playing" => PlaybackState::Playing,
            _ => PlaybackState::Paused,
        },
        video_time_at_ref: fields.get("videoTimeAtRef")?.parse().ok()?,
        reference_time_ms: fields.get("referenceTimeMs")?.parse().ok()?,
        playback_rate: fields.get("playbackRate")?.parse().ok()?,
        seq: fields.get("seq")?.parse().ok()?,
        controller_user_id: fields.get("controllerUserId").cloned(),
        audience_delay_seconds: fields
            .get("audienceDelaySeconds")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0),
        created_by: fields.get("createdBy").cloned(),
    })
}

pub async fn load_hot(cache: &Cache, room_id: Uuid) -> AppResult<Option<RoomSnapshot>> {
    let mut conn = cache.conn();
    let fields: HashMap<String, String> = conn.hgetall(state_key(room_id)).await?;
    if fields.is_empty() {
        return Ok(None);
    }
    Ok(from_field_map(&fields))
}

pub async fn set_hot(cache: &Cache, snap: &RoomSnapshot) -> AppResult<()> {
    let key = state_key(snap.room_id);
    let mut conn = cache.conn();
    let mut pipe = redis::pipe();
    pipe.atomic()
        .hset_multiple(&key, &to_field_map(snap))
        .expire(&key, HOT_TTL_SECS);
    let _: () = pipe.query_async(&mut conn).await?;
    Ok(())
}

/// Strictly increasing per room across every node; concurrent callers each
/// see a distinct value.
pub async fn next_seq(cache: &Cache, room_id: Uuid) -> AppResult<i64> {
    let mut conn = cache.conn();
    Ok(conn.incr(seq_key(room_id), 1i64).await?)
}

/// Monotonic set-if-greater, used when hydrating from the durable store so
/// the counter never falls behind a persisted snapshot.
pub async fn ensure_seq_at_least(cache: &Cache, room_id: Uuid, n: i64) -> AppResult<()> {
    let mut conn = cache.conn();
    let _: i64 = redis::Script::new(ENSURE_SEQ_SCRIPT)
        .key(seq_key(room_id))
        .arg(n)
        .invoke_async(&mut conn)
        .await?;
    Ok(())
}

fn reference_time_ms(row: &sqlx::postgres::PgRow) -> i64 {
    row.try_get::<Option<OffsetDateTime>, _>("reference_time")
        .ok()
        .flatten()
        .map(|t| (t.unix_timestamp_nanos() / 1_000_000) as i64)
        .unwrap_or(0)
}

fn ms_to_timestamp(ms: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000).ok()
}

fn snapshot_from_row(row: &sqlx::postgres::PgRow) -> AppResult<RoomSnapshot> {
    let playback_state: String = row.try_get("playback_state")?;
    Ok(RoomSnapshot {
        room_id: row.try_get("id")?,
        name: row.try_get("name")?,
        video_id: row.try_get("current_video_id")?,
        playback_state: match playback_state.as_str() {
            "playing" => PlaybackState::Playing,
            _ => PlaybackState::Paused,
        },
        video_time_at_ref: row.try_get("video_time_at_reference")?,
        reference_time_ms: reference_time_ms(row),
        playback_rate: row.try_get("playback_rate")?,
        seq: row.try_get("state_seq")?,
        controller_user_id: row.try_get("controller_user_id")?,
        audience_delay_seconds: row.try_get("audience_delay_seconds")?,
        created_by: row.try_get("created_by")?,
    })
}

async fn load_durable(db: &Db, room_id: Uuid) -> AppResult<Option<RoomSnapshot>> {
    let row = sqlx::query(
        "SELECT id, created_by, name, current_video_id, playback_rate, state_seq,
                reference_time, video_time_at_reference, playback_state,
                controller_user_id, audience_delay_seconds
         FROM rooms WHERE id = $1",
    )
    .bind(room_id)
    .fetch_optional(&**db)
    .await?;
    row.as_ref().map(snapshot_from_row).transpose()
}

/// Returns the room snapshot, creating the durable row on first contact.
/// Idempotent under concurrent callers; the insert is `ON CONFLICT DO
/// NOTHING` and everyone re-reads the winning row.
pub async fn get_or_create(
    cache: &Cache,
    db: &Db,
    room_id: Uuid,
    created_by: Option<&str>,
    default_audience_delay: f64,
) -> AppResult<RoomSnapshot> {
    if let Some(snap) = load_hot(cache, room_id).await? {
        return Ok(snap);
    }

    if let Some(snap) = load_durable(db, room_id).await? {
        ensure_seq_at_least(cache, room_id, snap.seq).await?;
        set_hot(cache, &snap).await?;
        return Ok(snap);
    }

    let fresh = RoomSnapshot::new(room_id, created_by, default_audience_delay);
    sqlx::query(
        "INSERT INTO rooms (id, created_by, name, audience_delay_seconds)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(room_id)
    .bind(&fresh.created_by)
    .bind(&fresh.name)
    .bind(fresh.audience_delay_seconds)
    .execute(&**db)
    .await?;

    let snap = load_durable(db, room_id).await?.unwrap_or(fresh);
    set_hot(cache, &snap).await?;
    Ok(snap)
}

fn is_undefined_column(err: &AppError) -> bool {
    match err {
        AppError::Sql(sqlx::Error::Database(db_err)) => db_err.code().as_deref() == Some("42703"),
        _ => false,
    }
}

async fn persist_full(db: &Db, snap: &RoomSnapshot) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO rooms (id, created_by, name, current_video_id, is_paused,
            playback_position_seconds, playback_rate, state_seq, reference_time,
            video_time_at_reference, playback_state, controller_user_id,
            audience_delay_seconds, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, now())
         ON CONFLICT (id) DO UPDATE SET
            name = EXCLUDED.name,
            current_video_id = EXCLUDED.current_video_id,
            is_paused = EXCLUDED.is_paused,
            playback_position_seconds = EXCLUDED.playback_position_seconds,
            playback_rate = EXCLUDED.playback_rate,
            state_seq = EXCLUDED.state_seq,
            reference_time = EXCLUDED.reference_time,
            video_time_at_reference = EXCLUDED.video_time_at_reference,
            playback_state = EXCLUDED.playback_state,
            controller_user_id = EXCLUDED.controller_user_id,
            audience_delay_seconds = EXCLUDED.audience_delay_seconds,
            updated_at = now()",
    )
    .bind(snap.room_id)
    .bind(&snap.created_by)
    .bind(&snap.name)
    .bind(&snap.video_id)
    .bind(snap.playback_state == PlaybackState::Paused)
    .bind(snap.video_time_at_ref)
    .bind(snap.playback_rate)
    .bind(snap.seq)
    .bind(ms_to_timestamp(snap.reference_time_ms))
    .bind(snap.video_time_at_ref)
    .bind(match snap.playback_state {
        PlaybackState::Playing => "playing",
        PlaybackState::Paused => "paused",
    })
    .bind(&snap.controller_user_id)
    .bind(snap.audience_delay_seconds)
    .execute(&**db)
    .await?;
    Ok(())
}

async fn persist_legacy(db: &Db, snap: &RoomSnapshot) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO rooms (id, created_by, name, current_video_id, is_paused,
            playback_position_seconds, playback_rate, state_seq, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now())
         ON CONFLICT (id) DO UPDATE SET
            name = EXCLUDED.name,
            current_video_id = EXCLUDED.current_video_id,
            is_paused = EXCLUDED.is_paused,
            playback_position_seconds = EXCLUDED.playback_position_seconds,
            playback_rate = EXCLUDED.playback_rate,
            state_seq = EXCLUDED.state_seq,
            updated_at = now()",
    )
    .bind(snap.room_id)
    .bind(&snap.created_by)
    .bind(&snap.name)
    .bind(&snap.video_id)
    .bind(snap.playback_state == PlaybackState::Paused)
    .bind(snap.video_time_at_ref)
    .bind(snap.playback_rate)
    .bind(snap.seq)
    .execute(&**db)
    .await?;
    Ok(())
}

/// Writes the snapshot to the durable store. A deployment whose schema does
/// not yet carry the newer columns answers with undefined-column (42703);
/// that one case retries with the legacy column subset.
pub async fn persist(db: &Db, snap: &RoomSnapshot) -> AppResult<()> {
    match persist_full(db, snap).await {
        Err(err) if is_undefined_column(&err) => {
            warn!(
                room = %snap.room_id,
                "room table is missing newer columns, retrying with legacy subset"
            );
            persist_legacy(db, snap).await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_map_roundtrips_a_full_snapshot() {
        let mut snap = RoomSnapshot::new(Uuid::new_v4(), Some("creator"), 1.5);
        snap.video_id = Some("abc12345678".to_owned());
        snap.playback_state = PlaybackState::Playing;
        snap.video_time_at_ref = 33.25;
        snap.reference_time_ms = 1_700_000_000_123;
        snap.playback_rate = 1.25;
        snap.seq = 42;
        snap.controller_user_id = Some("controller".to_owned());

        let map: HashMap<String, String> = to_field_map(&snap).into_iter().collect();
        assert_eq!(from_field_map(&map), Some(snap));
    }

    #[test]
    fn field_map_roundtrips_without_optional_fields() {
        let snap = RoomSnapshot::new(Uuid::new_v4(), None, 0.0);
        let map: HashMap<String, String> = to_field_map(&snap).into_iter().collect();
        let back = from_field_map(&map).unwrap();
        assert_eq!(back.video_id, None);
        assert_eq!(back.created_by, None);
        assert_eq!(back, snap);
    }

    #[test]
    fn incomplete_hash_is_treated_as_a_miss() {
        let mut map = HashMap::new();
        map.insert("name".to_owned(), "orphan".to_owned());
        assert_eq!(from_field_map(&map), None);
    }

    #[test]
    fn timestamp_conversion_is_millisecond_exact() {
        let ms = 1_700_000_000_123_i64;
        let ts = ms_to_timestamp(ms).unwrap();
        assert_eq!((ts.unix_timestamp_nanos() / 1_000_000) as i64, ms);
    }
}
