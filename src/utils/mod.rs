use std::time::{SystemTime, UNIX_EPOCH};

mod errorext;
pub use errorext::HandleErr;

mod tracing;
pub use tracing::{init_tracing, TraceLayerExt};

/// Server wall clock in milliseconds since the unix epoch. All scheduling
/// math (`execAtMs`, `referenceTimeMs`, bucket refills) runs on this base.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
