use std::ops::Deref;

use redis::aio::ConnectionManager;
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

use crate::state::AppResult;

pub mod chat;
pub mod lock;
pub mod pending;
pub mod presence;
pub mod ratelimit;
pub mod rooms;

/// Shared key-value store handle. The connection manager multiplexes one
/// reconnecting connection for commands; pub/sub needs its own connection
/// and goes through [`Cache::client`].
#[derive(Clone)]
pub struct Cache {
    client: redis::Client,
    manager: ConnectionManager,
}

impl Cache {
    pub async fn connect(url: &str) -> AppResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, manager })
    }

    pub fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    pub fn client(&self) -> &redis::Client {
        &self.client
    }
}

/// Durable relational store handle.
#[derive(Clone)]
pub struct Db(PgPool);

impl Db {
    pub async fn connect(url: &str) -> AppResult<Self> {
        let pool = PgPoolOptions::new().max_connections(8).connect(url).await?;
        Ok(Self(pool))
    }
}

impl Deref for Db {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

pub fn state_key(room_id: Uuid) -> String {
    format!("room:state:{room_id}")
}

pub fn seq_key(room_id: Uuid) -> String {
    format!("room:seq:{room_id}")
}

pub fn pending_key(room_id: Uuid) -> String {
    format!("room:pending:{room_id}")
}

pub fn chat_key(room_id: Uuid) -> String {
    format!("room:chat:{room_id}")
}

pub fn presence_key(room_id: Uuid) -> String {
    format!("presence:{room_id}")
}

pub fn topic_key(room_id: Uuid) -> String {
    format!("room:topic:{room_id}")
}

pub fn advance_lock_key(room_id: Uuid) -> String {
    format!("lock:roomAdvance:{room_id}")
}

/// Extracts the room id back out of a pub/sub channel name.
pub fn room_of_topic(channel: &str) -> Option<Uuid> {
    channel.strip_prefix("room:topic:")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_keys_roundtrip() {
        let id = Uuid::new_v4();
        assert_eq!(room_of_topic(&topic_key(id)), Some(id));
        assert_eq!(room_of_topic("presence:whatever"), None);
    }
}
