use std::net::SocketAddr;

use clap::{Parser, ValueEnum};

use crate::store::ratelimit::BucketPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Logging {
    None,
    Info,
    Debug,
    All,
}

/// Every knob is an environment variable with a flag alias, so the same
/// binary runs unchanged in a container and on a laptop.
#[derive(Debug, Clone, Parser)]
#[command(name = "watchroom", about = "Realtime room synchronization server")]
pub struct Settings {
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:3001")]
    pub bind_addr: SocketAddr,

    #[arg(long, env = "REDIS_URL")]
    pub redis_url: String,

    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Shared secret for local bearer-token verification. When absent every
    /// token is checked against the external auth provider instead.
    #[arg(long, env = "AUTH_JWT_SECRET")]
    pub auth_jwt_secret: Option<String>,

    #[arg(long, env = "AUTH_PROVIDER_URL")]
    pub auth_provider_url: Option<String>,

    #[arg(long, env = "ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,

    /// Scheduling buffer for play/pause/rate commands.
    #[arg(long, env = "EXEC_BUFFER_MS", default_value_t = 2000)]
    pub exec_buffer_ms: i64,

    /// Scheduling buffer for seek and video switches, which need a little
    /// more client-side preroll.
    #[arg(long, env = "SEEK_BUFFER_MS", default_value_t = 2500)]
    pub seek_buffer_ms: i64,

    #[arg(long, env = "AUDIENCE_DELAY_SECONDS_DEFAULT", default_value_t = 0.0)]
    pub audience_delay_seconds_default: f64,

    #[arg(long, env = "CHAT_MAX_MESSAGES", default_value_t = 100)]
    pub chat_max_messages: i64,

    #[arg(long, env = "CHAT_TTL_SEC", default_value_t = 86_400)]
    pub chat_ttl_sec: i64,

    #[arg(long, env = "CHAT_MAX_LENGTH", default_value_t = 500)]
    pub chat_max_length: usize,

    #[arg(long, env = "ROOM_MAX_STAGE", default_value_t = 20)]
    pub room_max_stage: usize,

    #[arg(long, env = "ROOM_MAX_TABLE", default_value_t = 8)]
    pub room_max_table: usize,

    #[arg(long, env = "PRESENCE_BROADCAST_EVERY_MS", default_value_t = 2000)]
    pub presence_broadcast_every_ms: u64,

    #[arg(long, env = "CONN_BUCKET_CAPACITY", default_value_t = 20.0)]
    pub conn_bucket_capacity: f64,

    #[arg(long, env = "CONN_BUCKET_REFILL_PER_SEC", default_value_t = 1.0)]
    pub conn_bucket_refill_per_sec: f64,

    #[arg(long, env = "CMD_BUCKET_CAPACITY", default_value_t = 10.0)]
    pub cmd_bucket_capacity: f64,

    #[arg(long, env = "CMD_BUCKET_REFILL_PER_SEC", default_value_t = 2.0)]
    pub cmd_bucket_refill_per_sec: f64,

    #[arg(long, env = "CHAT_BUCKET_CAPACITY", default_value_t = 5.0)]
    pub chat_bucket_capacity: f64,

    #[arg(long, env = "CHAT_BUCKET_REFILL_PER_SEC", default_value_t = 1.0)]
    pub chat_bucket_refill_per_sec: f64,

    #[arg(long, env = "LIVEKIT_URL")]
    pub livekit_url: Option<String>,

    #[arg(long, env = "LIVEKIT_API_KEY")]
    pub livekit_api_key: Option<String>,

    #[arg(long, env = "LIVEKIT_API_SECRET")]
    pub livekit_api_secret: Option<String>,

    #[arg(long, env = "LOG", value_enum, default_value = "info")]
    pub log: Logging,
}

impl Settings {
    pub fn buffer_ms_for_seek(&self, is_seek: bool) -> i64 {
        if is_seek {
            self.seek_buffer_ms
        } else {
            self.exec_buffer_ms
        }
    }

    pub fn conn_policy(&self) -> BucketPolicy {
        BucketPolicy {
            capacity: self.conn_bucket_capacity,
            refill_per_sec: self.conn_bucket_refill_per_sec,
            ttl_ms: 120_000,
        }
    }

    pub fn cmd_policy(&self) -> BucketPolicy {
        BucketPolicy {
            capacity: self.cmd_bucket_capacity,
            refill_per_sec: self.cmd_bucket_refill_per_sec,
            ttl_ms: 60_000,
        }
    }

    pub fn chat_policy(&self) -> BucketPolicy {
        BucketPolicy {
            capacity: self.chat_bucket_capacity,
            refill_per_sec: self.chat_bucket_refill_per_sec,
            ttl_ms: 60_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Settings {
        Settings::parse_from([
            "watchroom",
            "--redis-url",
            "redis://localhost",
            "--database-url",
            "postgres://localhost/watchroom",
        ])
    }

    #[test]
    fn defaults_match_documented_buffers() {
        let settings = minimal();
        assert_eq!(settings.exec_buffer_ms, 2000);
        assert_eq!(settings.seek_buffer_ms, 2500);
        assert_eq!(settings.buffer_ms_for_seek(true), 2500);
        assert_eq!(settings.buffer_ms_for_seek(false), 2000);
    }

    #[test]
    fn origin_list_splits_on_commas() {
        let settings = Settings::parse_from([
            "watchroom",
            "--redis-url",
            "redis://localhost",
            "--database-url",
            "postgres://localhost/watchroom",
            "--allowed-origins",
            "https://a.example,https://b.example",
        ]);
        assert_eq!(
            settings.allowed_origins,
            vec!["https://a.example", "https://b.example"]
        );
    }
}
