use itertools::Itertools;
use redis::AsyncCommands;
use tracing::debug;
use uuid::Uuid;

use crate::{
    room::model::ChatMessage,
    state::AppResult,
    store::{chat_key, Cache},
};

/// Appends a message, trims the room's history to the retention bound and
/// refreshes the list TTL.
pub async fn append(
    cache: &Cache,
    message: &ChatMessage,
    max_messages: i64,
    ttl_secs: i64,
) -> AppResult<()> {
    let key = chat_key(message.room_id);
    let entry = serde_json::to_string(message)?;
    let mut conn = cache.conn();
    let mut pipe = redis::pipe();
    pipe.atomic()
        .rpush(&key, entry)
        .ltrim(&key, -max_messages as isize, -1)
        .expire(&key, ttl_secs);
    let _: () = pipe.query_async(&mut conn).await?;
    Ok(())
}

/// Loads the most recent window in arrival order (ascending `atMs`).
pub async fn load(cache: &Cache, room_id: Uuid, limit: i64) -> AppResult<Vec<ChatMessage>> {
    let mut conn = cache.conn();
    let raw: Vec<String> = conn.lrange(chat_key(room_id), -limit as isize, -1).await?;
    Ok(parse_entries(raw))
}

fn parse_entries(raw: Vec<String>) -> Vec<ChatMessage> {
    raw.into_iter()
        .filter_map(|entry| match serde_json::from_str::<ChatMessage>(&entry) {
            Ok(message) => Some(message),
            Err(err) => {
                debug!("dropping malformed chat entry: {err}");
                None
            }
        })
        .sorted_by_key(|m| m.at_ms)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(at_ms: i64, text: &str) -> String {
        serde_json::to_string(&ChatMessage {
            id: format!("id-{at_ms}"),
            room_id: Uuid::nil(),
            user_id: "u1".to_owned(),
            display_name: "Ada".to_owned(),
            message: text.to_owned(),
            at_ms,
        })
        .unwrap()
    }

    #[test]
    fn entries_come_back_in_ascending_arrival_order() {
        let parsed = parse_entries(vec![message(30, "C"), message(10, "A"), message(20, "B")]);
        let texts: Vec<&str> = parsed.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(texts, vec!["A", "B", "C"]);
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let parsed = parse_entries(vec!["garbage".to_owned(), message(5, "ok")]);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].message, "ok");
    }
}
