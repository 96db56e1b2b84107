use std::sync::{atomic::AtomicI64, Arc};

use axum::{extract::FromRef, http::StatusCode, response::IntoResponse};
use tokio_util::sync::CancellationToken;

use crate::{
    protocol::ErrorCode,
    room::{advancer::RoomAdvancers, hub::RoomHub},
    settings::Settings,
    store::{Cache, Db},
};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub enum AppError {
    /// Client-visible failure, surfaced through an ack.
    Client {
        code: ErrorCode,
        retry_after_ms: Option<i64>,
    },
    Redis(redis::RedisError),
    Sql(sqlx::Error),
    Encode(String),
    Custom(String),
}

impl AppError {
    pub fn code(code: ErrorCode) -> Self {
        Self::Client {
            code,
            retry_after_ms: None,
        }
    }

    pub fn rate_limited(retry_after_ms: i64) -> Self {
        Self::Client {
            code: ErrorCode::RateLimited,
            retry_after_ms: Some(retry_after_ms),
        }
    }

    /// What the client gets to see. Store and serialization failures all
    /// collapse to `internal`; the details stay in the server log.
    pub fn to_client(&self) -> (ErrorCode, Option<i64>) {
        match self {
            AppError::Client {
                code,
                retry_after_ms,
            } => (*code, *retry_after_ms),
            _ => (ErrorCode::Internal, None),
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::Client {
                code,
                retry_after_ms: Some(ms),
            } => write!(f, "{}:{ms}", code.as_str()),
            AppError::Client { code, .. } => f.write_str(code.as_str()),
            AppError::Redis(e) => write!(f, "redis: {e}"),
            AppError::Sql(e) => write!(f, "sql: {e}"),
            AppError::Encode(e) => write!(f, "encode: {e}"),
            AppError::Custom(e) => f.write_str(e),
        }
    }
}

impl std::error::Error for AppError {}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        Self::Redis(err)
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Sql(err)
    }
}

impl From<rmp_serde::encode::Error> for AppError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Encode(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for AppError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Encode(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encode(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::Custom(err.to_string())
    }
}

impl From<&str> for AppError {
    fn from(err: &str) -> Self {
        Self::Custom(err.to_owned())
    }
}

impl From<String> for AppError {
    fn from(err: String) -> Self {
        Self::Custom(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        match self {
            AppError::Client {
                code: ErrorCode::RateLimited,
                retry_after_ms,
            } => {
                // Connection storms are rejected before the upgrade with the
                // retry hint in the body.
                let body = format!("rate_limited:{}", retry_after_ms.unwrap_or(0));
                (StatusCode::UNAUTHORIZED, body).into_response()
            }
            AppError::Client { code, .. } => {
                let status = match code {
                    ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
                    ErrorCode::Forbidden => StatusCode::FORBIDDEN,
                    _ => StatusCode::BAD_REQUEST,
                };
                (status, code.as_str()).into_response()
            }
            other => {
                tracing::error!("request failed: {other}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal").into_response()
            }
        }
    }
}

/// Cooperative shutdown handle passed into every spawned task.
#[derive(Clone, Default)]
pub struct Shutdown(CancellationToken);

impl Shutdown {
    pub fn new() -> Self {
        Self(CancellationToken::new())
    }

    pub fn shutdown(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.0.cancelled().await;
    }
}

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub cache: Cache,
    pub hub: RoomHub,
    pub advancers: RoomAdvancers,
    pub settings: Arc<Settings>,
    pub http: reqwest::Client,
    pub shutdown: Shutdown,
    pub sessions_online: Arc<AtomicI64>,
}

impl FromRef<AppState> for Db {
    fn from_ref(state: &AppState) -> Db {
        state.db.clone()
    }
}

impl FromRef<AppState> for Cache {
    fn from_ref(state: &AppState) -> Cache {
        state.cache.clone()
    }
}

impl FromRef<AppState> for RoomHub {
    fn from_ref(state: &AppState) -> RoomHub {
        state.hub.clone()
    }
}

impl FromRef<AppState> for RoomAdvancers {
    fn from_ref(state: &AppState) -> RoomAdvancers {
        state.advancers.clone()
    }
}

impl FromRef<AppState> for Arc<Settings> {
    fn from_ref(state: &AppState) -> Arc<Settings> {
        state.settings.clone()
    }
}

impl FromRef<AppState> for Shutdown {
    fn from_ref(state: &AppState) -> Shutdown {
        state.shutdown.clone()
    }
}
