use std::time::Duration;

use livekit_api::{
    access_token::{AccessToken, VideoGrants},
    services::room::RoomClient,
};
use sha2::{Digest, Sha256};
use sqlx::Row;
use tracing::warn;
use uuid::Uuid;

use crate::{
    protocol::ErrorCode,
    settings::Settings,
    state::{AppError, AppResult},
    store::Db,
};

/// Join tokens are short-lived; clients mint a fresh one per join attempt.
const TOKEN_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct SfuConfig {
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
}

impl SfuConfig {
    pub fn from_settings(settings: &Settings) -> Option<Self> {
        Some(Self {
            url: settings.livekit_url.clone()?,
            api_key: settings.livekit_api_key.clone()?,
            api_secret: settings.livekit_api_secret.clone()?,
        })
    }
}

pub fn stage_room(room_id: Uuid) -> String {
    format!("{room_id}-stage")
}

pub fn table_room(room_id: Uuid, table_id: &str) -> String {
    format!("{room_id}-table-{table_id}")
}

/// Table identifiers end up inside SFU room names, so only a conservative
/// character set survives.
pub fn sanitize_table_id(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(32)
        .collect();
    (!cleaned.is_empty()).then_some(cleaned)
}

/// Deterministic per-device identity. The SFU rejects duplicate identities
/// in one room, so a user on two devices needs two stable identities; the
/// suffix is derived from whatever per-tab handle the client supplies.
pub fn participant_identity(
    user_id: &str,
    tab_id: Option<&str>,
    client_id: Option<&str>,
) -> String {
    let seed = tab_id
        .or(client_id)
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let digest = Sha256::digest(seed.as_bytes());
    let suffix: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
    format!("{user_id}:{suffix}")
}

/// The room creator is always allowed on stage; everyone else needs a
/// `host` or `speaker` row in the role table.
pub async fn stage_allowed(
    db: &Db,
    room_id: Uuid,
    user_id: &str,
    created_by: Option<&str>,
) -> AppResult<bool> {
    if created_by == Some(user_id) {
        return Ok(true);
    }
    let row = sqlx::query("SELECT role FROM room_stage_roles WHERE room_id = $1 AND user_id = $2")
        .bind(room_id)
        .bind(user_id)
        .fetch_optional(&**db)
        .await?;
    Ok(row
        .map(|row| {
            let role: String = row.try_get("role").unwrap_or_default();
            role == "host" || role == "speaker"
        })
        .unwrap_or(false))
}

/// Best-effort occupancy check against the SFU control plane. An unreachable
/// control plane admits the participant; the SFU itself is the final word.
pub async fn has_capacity(config: &SfuConfig, room_name: &str, max: usize) -> bool {
    let client = RoomClient::with_api_key(&config.url, &config.api_key, &config.api_secret);
    match client.list_participants(room_name).await {
        Ok(participants) => participants.len() < max,
        Err(err) => {
            warn!("SFU control plane unavailable, skipping capacity check: {err}");
            true
        }
    }
}

pub fn mint_token(
    config: &SfuConfig,
    room_name: &str,
    identity: &str,
    display_name: Option<&str>,
    can_publish: bool,
) -> AppResult<String> {
    let grants = VideoGrants {
        room_join: true,
        room: room_name.to_owned(),
        can_publish,
        can_subscribe: true,
        ..Default::default()
    };
    let mut token = AccessToken::with_api_key(&config.api_key, &config.api_secret)
        .with_identity(identity)
        .with_grants(grants)
        .with_ttl(TOKEN_TTL);
    if let Some(name) = display_name {
        token = token.with_name(name);
    }
    token.to_jwt().map_err(|err| {
        AppError::Custom(format!("failed to sign SFU token: {err}"))
    })
}

pub fn not_configured() -> AppError {
    AppError::code(ErrorCode::LivekitNotConfigured)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_stable_per_tab_and_distinct_across_tabs() {
        let a1 = participant_identity("user-1", Some("tab-a"), None);
        let a2 = participant_identity("user-1", Some("tab-a"), None);
        let b = participant_identity("user-1", Some("tab-b"), None);
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert!(a1.starts_with("user-1:"));
    }

    #[test]
    fn client_id_seeds_the_suffix_when_no_tab_id_exists() {
        let a = participant_identity("user-1", None, Some("device-9"));
        let b = participant_identity("user-1", None, Some("device-9"));
        assert_eq!(a, b);
    }

    #[test]
    fn table_ids_are_reduced_to_a_safe_charset() {
        assert_eq!(sanitize_table_id("table 3!"), Some("table3".to_owned()));
        assert_eq!(sanitize_table_id("ok_id-7"), Some("ok_id-7".to_owned()));
        assert_eq!(sanitize_table_id("!!!"), None);
        assert_eq!(sanitize_table_id(&"x".repeat(50)).unwrap().len(), 32);
    }

    #[test]
    fn room_names_embed_the_room_and_table() {
        let id = Uuid::nil();
        assert_eq!(stage_room(id), format!("{id}-stage"));
        assert_eq!(table_room(id, "t1"), format!("{id}-table-t1"));
    }
}
