use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const VIDEO_ID_MAX_LEN: usize = 32;
pub const POSITION_SECONDS_MAX: f64 = 86_400.0;
pub const PLAYBACK_RATE_MIN: f64 = 0.25;
pub const PLAYBACK_RATE_MAX: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Playing,
    Paused,
}

/// The authoritative observable state of a room.
///
/// `video_time_at_ref` is the video position at wall-clock instant
/// `reference_time_ms`; every other instant is projected from that pair via
/// [`RoomSnapshot::time_at`]. Mutations happen only through scheduled
/// actions, so two observers that agree on the wall clock agree on the
/// playback position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room_id: Uuid,
    pub name: String,
    pub video_id: Option<String>,
    pub playback_state: PlaybackState,
    pub video_time_at_ref: f64,
    pub reference_time_ms: i64,
    pub playback_rate: f64,
    pub seq: i64,
    pub controller_user_id: Option<String>,
    pub audience_delay_seconds: f64,
    pub created_by: Option<String>,
}

impl RoomSnapshot {
    pub fn new(room_id: Uuid, created_by: Option<&str>, audience_delay_seconds: f64) -> Self {
        Self {
            room_id,
            name: "Watch room".to_owned(),
            video_id: None,
            playback_state: PlaybackState::Paused,
            video_time_at_ref: 0.0,
            reference_time_ms: 0,
            playback_rate: 1.0,
            seq: 0,
            controller_user_id: None,
            audience_delay_seconds,
            created_by: created_by.map(str::to_owned),
        }
    }

    /// Projects the video position to wall-clock instant `at_ms`.
    ///
    /// Negative elapsed time (an observer clock behind the reference) and
    /// negative positions both clamp to zero, so the projection never runs
    /// backwards past the start of the clip.
    pub fn time_at(&self, at_ms: i64) -> f64 {
        match self.playback_state {
            PlaybackState::Paused => self.video_time_at_ref.max(0.0),
            PlaybackState::Playing => {
                let elapsed_s = (at_ms - self.reference_time_ms).max(0) as f64 / 1000.0;
                (self.video_time_at_ref + elapsed_s * self.playback_rate).max(0.0)
            }
        }
    }

    /// Re-anchors the reference pair at `now_ms` without moving the
    /// projected position. Used before computing a command's patch so the
    /// patch starts from the freshest time base.
    pub fn advanced_to(&self, now_ms: i64) -> Self {
        let mut next = self.clone();
        next.video_time_at_ref = self.time_at(now_ms);
        next.reference_time_ms = now_ms;
        next
    }
}

/// A state transition requested by a client. Validation is shape-only; the
/// transition semantics live in [`apply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    #[serde(rename = "video:set")]
    VideoSet {
        #[serde(rename = "videoId")]
        video_id: Option<String>,
    },
    #[serde(rename = "video:play")]
    VideoPlay,
    #[serde(rename = "video:pause")]
    VideoPause,
    #[serde(rename = "video:seek")]
    VideoSeek {
        #[serde(rename = "positionSeconds")]
        position_seconds: f64,
    },
    #[serde(rename = "video:rate")]
    VideoRate {
        #[serde(rename = "playbackRate")]
        playback_rate: f64,
    },
    #[serde(rename = "hand:raise")]
    HandRaise,
}

impl Command {
    /// Ingress validation. Out-of-range rates are rejected rather than
    /// clamped; a client that sends 3.0 has a bug worth surfacing.
    pub fn validate(&self) -> Result<(), &'static str> {
        match self {
            Command::VideoSet { video_id: Some(v) } => {
                if v.is_empty() || v.len() > VIDEO_ID_MAX_LEN {
                    return Err("videoId must be 1-32 characters");
                }
            }
            Command::VideoSet { video_id: None } => {}
            Command::VideoSeek { position_seconds } => {
                // Negative positions are valid input; apply() clamps them
                // to the start of the clip.
                if !position_seconds.is_finite() || *position_seconds > POSITION_SECONDS_MAX {
                    return Err("positionSeconds out of range");
                }
            }
            Command::VideoRate { playback_rate } => {
                if !playback_rate.is_finite()
                    || *playback_rate < PLAYBACK_RATE_MIN
                    || *playback_rate > PLAYBACK_RATE_MAX
                {
                    return Err("playbackRate out of range");
                }
            }
            Command::VideoPlay | Command::VideoPause | Command::HandRaise => {}
        }
        Ok(())
    }

    /// Seeks and video switches get the longer scheduling buffer so clients
    /// have time to preload before the execution instant.
    pub fn wants_seek_buffer(&self) -> bool {
        matches!(self, Command::VideoSeek { .. } | Command::VideoSet { .. })
    }
}

/// A scheduled mutation: the command, the instant every observer applies it,
/// and the full prospective snapshot (`patch`) valid from that instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    pub seq: i64,
    pub exec_at_ms: i64,
    pub server_now_ms: i64,
    pub command: Command,
    pub patch: RoomSnapshot,
}

/// Computes the snapshot that results from executing `command` at
/// `exec_at_ms`, stamped with the already-assigned `seq`. Pure; the caller
/// decides when (and whether) the result becomes authoritative.
///
/// Play, pause and rate changes re-anchor the reference pair at the
/// execution instant so the projected position is continuous across the
/// transition. Only `video:set` and `video:seek` move the position.
pub fn apply(state: &RoomSnapshot, command: &Command, exec_at_ms: i64, seq: i64) -> RoomSnapshot {
    let mut next = state.clone();
    next.seq = seq;

    match command {
        Command::VideoSet { video_id } => {
            next.video_id = video_id.clone();
            next.playback_state = if video_id.is_some() {
                PlaybackState::Playing
            } else {
                PlaybackState::Paused
            };
            next.playback_rate = 1.0;
            next.video_time_at_ref = 0.0;
            next.reference_time_ms = exec_at_ms;
        }
        Command::VideoPlay => {
            next.video_time_at_ref = state.time_at(exec_at_ms);
            next.reference_time_ms = exec_at_ms;
            next.playback_state = PlaybackState::Playing;
        }
        Command::VideoPause => {
            next.video_time_at_ref = state.time_at(exec_at_ms);
            next.reference_time_ms = exec_at_ms;
            next.playback_state = PlaybackState::Paused;
        }
        Command::VideoSeek { position_seconds } => {
            next.video_time_at_ref = position_seconds.max(0.0);
            next.reference_time_ms = exec_at_ms;
        }
        Command::VideoRate { playback_rate } => {
            next.video_time_at_ref = state.time_at(exec_at_ms);
            next.reference_time_ms = exec_at_ms;
            next.playback_rate = *playback_rate;
        }
        Command::HandRaise => {}
    }

    next
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub room_id: Uuid,
    pub user_id: String,
    pub display_name: String,
    pub message: String,
    pub at_ms: i64,
}

/// Strips control characters, normalizes line endings, trims and caps the
/// message. Returns `None` when nothing printable is left.
pub fn sanitize_message(raw: &str, max_len: usize) -> Option<String> {
    let normalized = raw.replace("\r\n", "\n").replace('\r', "\n");
    let cleaned: String = normalized
        .chars()
        .filter(|c| !c.is_control() || *c == '\n')
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(max_len).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> Uuid {
        Uuid::new_v4()
    }

    fn playing_snapshot(at_ref: f64, ref_ms: i64, rate: f64) -> RoomSnapshot {
        let mut snap = RoomSnapshot::new(room(), Some("host"), 0.0);
        snap.video_id = Some("abc12345678".to_owned());
        snap.playback_state = PlaybackState::Playing;
        snap.video_time_at_ref = at_ref;
        snap.reference_time_ms = ref_ms;
        snap.playback_rate = rate;
        snap
    }

    #[test]
    fn time_advances_at_playback_rate_while_playing() {
        let snap = playing_snapshot(10.0, 1_000, 1.5);
        assert_eq!(snap.time_at(1_000), 10.0);
        assert_eq!(snap.time_at(3_000), 13.0);
        // Derivative equals the rate.
        let d = snap.time_at(5_000) - snap.time_at(4_000);
        assert!((d - 1.5).abs() < 1e-9);
    }

    #[test]
    fn time_is_frozen_while_paused() {
        let mut snap = playing_snapshot(42.0, 1_000, 1.0);
        snap.playback_state = PlaybackState::Paused;
        assert_eq!(snap.time_at(1_000), 42.0);
        assert_eq!(snap.time_at(999_999), 42.0);
    }

    #[test]
    fn observer_clock_behind_reference_clamps_to_reference_position() {
        let snap = playing_snapshot(10.0, 5_000, 2.0);
        assert_eq!(snap.time_at(1_000), 10.0);
    }

    #[test]
    fn play_and_pause_preserve_position_at_exec_instant() {
        let snap = playing_snapshot(20.0, 0, 1.0);
        let exec = 4_000;
        let before = snap.time_at(exec);

        let paused = apply(&snap, &Command::VideoPause, exec, 5);
        assert_eq!(paused.playback_state, PlaybackState::Paused);
        assert!((paused.time_at(exec) - before).abs() < 1e-9);
        assert_eq!(paused.seq, 5);

        let resumed = apply(&paused, &Command::VideoPlay, exec + 3_000, 6);
        assert!((resumed.time_at(exec + 3_000) - before).abs() < 1e-9);
        assert_eq!(resumed.playback_state, PlaybackState::Playing);
    }

    #[test]
    fn rate_change_is_continuous_and_changes_slope() {
        let snap = playing_snapshot(0.0, 0, 1.0);
        let exec = 10_000;
        let before = snap.time_at(exec);

        let changed = apply(
            &snap,
            &Command::VideoRate {
                playback_rate: 0.5,
            },
            exec,
            2,
        );
        assert!((changed.time_at(exec) - before).abs() < 1e-9);
        let d = changed.time_at(exec + 2_000) - changed.time_at(exec);
        assert!((d - 1.0).abs() < 1e-9);
    }

    #[test]
    fn video_set_resets_the_timeline() {
        let snap = playing_snapshot(300.0, 0, 2.0);
        let next = apply(
            &snap,
            &Command::VideoSet {
                video_id: Some("next-video".to_owned()),
            },
            9_000,
            7,
        );
        assert_eq!(next.video_id.as_deref(), Some("next-video"));
        assert_eq!(next.playback_state, PlaybackState::Playing);
        assert_eq!(next.playback_rate, 1.0);
        assert_eq!(next.video_time_at_ref, 0.0);
        assert_eq!(next.reference_time_ms, 9_000);

        let cleared = apply(&next, &Command::VideoSet { video_id: None }, 12_000, 8);
        assert_eq!(cleared.video_id, None);
        assert_eq!(cleared.playback_state, PlaybackState::Paused);
    }

    #[test]
    fn seek_clamps_negative_positions_to_zero() {
        let snap = playing_snapshot(50.0, 0, 1.0);
        let next = apply(
            &snap,
            &Command::VideoSeek {
                position_seconds: -5.0,
            },
            1_000,
            3,
        );
        assert_eq!(next.video_time_at_ref, 0.0);
        assert_eq!(next.playback_state, PlaybackState::Playing);
    }

    #[test]
    fn hand_raise_only_bumps_the_sequence() {
        let snap = playing_snapshot(10.0, 0, 1.0);
        let next = apply(&snap, &Command::HandRaise, 1_000, 9);
        assert_eq!(next.seq, 9);
        let mut expected = snap.clone();
        expected.seq = 9;
        assert_eq!(next, expected);
    }

    #[test]
    fn validation_rejects_out_of_range_input() {
        assert!(Command::VideoRate { playback_rate: 3.0 }.validate().is_err());
        assert!(Command::VideoRate {
            playback_rate: f64::NAN
        }
        .validate()
        .is_err());
        assert!(Command::VideoRate { playback_rate: 2.0 }.validate().is_ok());
        assert!(Command::VideoSeek {
            position_seconds: 90_000.0
        }
        .validate()
        .is_err());
        assert!(Command::VideoSeek {
            position_seconds: f64::NAN
        }
        .validate()
        .is_err());
        // A backwards seek is accepted; the applier clamps it to zero.
        assert!(Command::VideoSeek {
            position_seconds: -5.0
        }
        .validate()
        .is_ok());
        assert!(Command::VideoSet {
            video_id: Some("x".repeat(33))
        }
        .validate()
        .is_err());
        assert!(Command::VideoSet { video_id: None }.validate().is_ok());
    }

    #[test]
    fn advanced_to_keeps_the_projection_fixed() {
        let snap = playing_snapshot(10.0, 0, 1.25);
        let advanced = snap.advanced_to(8_000);
        assert_eq!(advanced.reference_time_ms, 8_000);
        for t in [8_000, 9_500, 20_000] {
            assert!((advanced.time_at(t) - snap.time_at(t)).abs() < 1e-9);
        }
    }

    #[test]
    fn sanitize_strips_control_characters_and_caps_length() {
        assert_eq!(
            sanitize_message("  hi\u{7}there\r\nok ", 500).as_deref(),
            Some("hithere\nok")
        );
        assert_eq!(sanitize_message("\u{0}\u{1}", 500), None);
        assert_eq!(sanitize_message("   ", 500), None);
        let long = "a".repeat(600);
        assert_eq!(sanitize_message(&long, 500).unwrap().chars().count(), 500);
    }
}
