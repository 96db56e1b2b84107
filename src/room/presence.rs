use std::time::Duration;

use tracing::debug;

use crate::{
    protocol::ServerEvent,
    room::hub::RoomHub,
    state::Shutdown,
    store::{presence, Cache},
    utils::HandleErr,
};

/// Periodically turns the shared dirty set into `presence:update` fan-out.
/// The take is consuming, so with several nodes ticking, each dirty room is
/// announced once per change, by whichever node claims it first.
pub async fn broadcast_loop(cache: Cache, hub: RoomHub, every_ms: u64, shutdown: Shutdown) {
    let mut interval = tokio::time::interval(Duration::from_millis(every_ms.max(250)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }

        let Some(dirty) = presence::take_dirty(&cache)
            .await
            .log_warn_with_msg("failed to read presence dirty set")
        else {
            continue;
        };

        for room_id in dirty {
            let Some(online_count) = presence::online_count(&cache, room_id)
                .await
                .log_warn_with_msg("failed to count presence")
            else {
                continue;
            };
            debug!(room = %room_id, online_count, "presence update");
            hub.publish(
                room_id,
                ServerEvent::PresenceUpdate {
                    room_id,
                    online_count,
                },
            )
            .await
            .log_warn_with_msg("failed to publish presence update");
        }
    }
}
