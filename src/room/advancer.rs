use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::sync::Notify;
use tracing::{debug, error};
use uuid::Uuid;

use crate::{
    room::model::{PendingAction, RoomSnapshot},
    state::{AppResult, Shutdown},
    store::{lock, pending, rooms, Cache, Db},
    utils::now_ms,
};

const LOCK_TTL_MS: i64 = 5_000;
const LOCK_CONTENDED_DELAY: Duration = Duration::from_millis(250);
const ERROR_RETRY_DELAY: Duration = Duration::from_secs(1);

/// One wake-up task per (node, room). A crowded room never starves quieter
/// ones: every room sleeps on its own timer and drains independently.
#[derive(Clone)]
pub struct RoomAdvancers {
    inner: Arc<AdvancerInner>,
}

struct AdvancerInner {
    cache: Cache,
    db: Db,
    default_audience_delay: f64,
    shutdown: Shutdown,
    tasks: Mutex<HashMap<Uuid, RoomTask>>,
    generation: AtomicU64,
}

struct RoomTask {
    generation: u64,
    wake: Arc<Notify>,
}

impl RoomAdvancers {
    pub fn new(cache: Cache, db: Db, default_audience_delay: f64, shutdown: Shutdown) -> Self {
        Self {
            inner: Arc::new(AdvancerInner {
                cache,
                db,
                default_audience_delay,
                shutdown,
                tasks: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Makes sure a wake-up loop is watching the room. Re-scheduling an
    /// already-watched room just pokes its timer so it re-reads the queue.
    pub fn schedule(&self, room_id: Uuid) {
        schedule(&self.inner, room_id);
    }

    pub fn watched_rooms(&self) -> usize {
        self.inner.tasks.lock().unwrap().len()
    }
}

fn schedule(inner: &Arc<AdvancerInner>, room_id: Uuid) {
    let mut tasks = inner.tasks.lock().unwrap();
    if let Some(task) = tasks.get(&room_id) {
        task.wake.notify_one();
        return;
    }
    let generation = inner.generation.fetch_add(1, Ordering::Relaxed);
    let wake = Arc::new(Notify::new());
    tasks.insert(
        room_id,
        RoomTask {
            generation,
            wake: wake.clone(),
        },
    );
    let inner = inner.clone();
    tokio::spawn(run_room(inner, room_id, generation, wake));
}

async fn run_room(inner: Arc<AdvancerInner>, room_id: Uuid, generation: u64, wake: Arc<Notify>) {
    loop {
        let next_due = match pending::peek_next_due_at(&inner.cache, room_id).await {
            Ok(next_due) => next_due,
            Err(err) => {
                error!(room = %room_id, "failed to peek pending queue: {err}");
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ERROR_RETRY_DELAY) => continue,
                }
            }
        };
        let Some(due_at) = next_due else {
            break;
        };

        let wait = Duration::from_millis((due_at - now_ms()).max(0) as u64);
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            // An earlier action may have been queued; restart the peek.
            _ = wake.notified() => continue,
            _ = tokio::time::sleep(wait) => {}
        }

        match advance(&inner, room_id).await {
            Ok(Advanced::Drained) | Ok(Advanced::NothingDue) => {}
            Ok(Advanced::LockContended) => {
                // Another node is driving this room right now; the entries it
                // drains disappear before our next peek.
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(LOCK_CONTENDED_DELAY) => {}
                }
            }
            Err(err) => {
                error!(room = %room_id, "room advance failed: {err}");
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ERROR_RETRY_DELAY) => {}
                }
            }
        }
    }

    {
        let mut tasks = inner.tasks.lock().unwrap();
        if tasks
            .get(&room_id)
            .is_some_and(|task| task.generation == generation)
        {
            tasks.remove(&room_id);
        }
    }

    if inner.shutdown.is_cancelled() {
        return;
    }

    // A schedule() that raced our exit may have been swallowed by the map
    // entry we just removed; one last peek closes the window.
    if let Ok(Some(_)) = pending::peek_next_due_at(&inner.cache, room_id).await {
        schedule(&inner, room_id);
    }
}

enum Advanced {
    Drained,
    NothingDue,
    LockContended,
}

async fn advance(inner: &AdvancerInner, room_id: Uuid) -> AppResult<Advanced> {
    let Some(advance_lock) = lock::acquire(&inner.cache, room_id, LOCK_TTL_MS).await? else {
        return Ok(Advanced::LockContended);
    };
    let result = drain_due(inner, room_id).await;
    lock::release(&inner.cache, advance_lock).await;
    result
}

/// With the advisory lock held: apply every due action in `(execAtMs, seq)`
/// order to the freshest snapshot, write it hot, persist it durably, then
/// remove exactly the drained entries.
async fn drain_due(inner: &AdvancerInner, room_id: Uuid) -> AppResult<Advanced> {
    let now = now_ms();
    let due = pending::range_due(&inner.cache, room_id, now).await?;
    if due.is_empty() {
        return Ok(Advanced::NothingDue);
    }

    let snapshot = rooms::get_or_create(
        &inner.cache,
        &inner.db,
        room_id,
        None,
        inner.default_audience_delay,
    )
    .await?;

    let ordered = pending::sort_for_apply(due);
    let advanced = fold_patches(snapshot, ordered.iter().map(|(_, action)| action));

    rooms::set_hot(&inner.cache, &advanced).await?;
    rooms::persist(&inner.db, &advanced).await?;

    let raw: Vec<String> = ordered.into_iter().map(|(raw, _)| raw).collect();
    pending::remove_all(&inner.cache, room_id, &raw).await?;
    debug!(room = %room_id, seq = advanced.seq, "room advanced");
    Ok(Advanced::Drained)
}

/// Replays action patches over a snapshot. Each patch is the full post-state
/// of its action, so applying is adoption; anything at or below the
/// snapshot's sequence has already happened and is dropped.
pub fn fold_patches<'a>(
    snapshot: RoomSnapshot,
    ordered: impl Iterator<Item = &'a PendingAction>,
) -> RoomSnapshot {
    let mut current = snapshot;
    for action in ordered {
        if action.seq > current.seq {
            current = action.patch.clone();
        }
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::model::{apply, Command, PlaybackState};

    fn base(seq: i64) -> RoomSnapshot {
        let mut snap = RoomSnapshot::new(Uuid::new_v4(), Some("host"), 0.0);
        snap.seq = seq;
        snap
    }

    fn action_for(snap: &RoomSnapshot, command: Command, exec_at_ms: i64, seq: i64) -> PendingAction {
        PendingAction {
            seq,
            exec_at_ms,
            server_now_ms: exec_at_ms - 2_000,
            patch: apply(snap, &command, exec_at_ms, seq),
            command,
        }
    }

    #[test]
    fn replay_adopts_patches_in_order() {
        let snap = base(0);
        let set = action_for(
            &snap,
            Command::VideoSet {
                video_id: Some("abc12345678".to_owned()),
            },
            1_000,
            1,
        );
        let pause = action_for(&set.patch, Command::VideoPause, 2_000, 2);

        let folded = fold_patches(snap, [&set, &pause].into_iter());
        assert_eq!(folded.seq, 2);
        assert_eq!(folded.playback_state, PlaybackState::Paused);
        assert_eq!(folded.video_id.as_deref(), Some("abc12345678"));
    }

    #[test]
    fn stale_actions_are_idempotently_dropped() {
        let snap = base(5);
        let stale = action_for(&base(0), Command::VideoPlay, 1_000, 4);
        let folded = fold_patches(snap.clone(), [&stale].into_iter());
        assert_eq!(folded, snap);

        // Re-applying an already-applied action is a no-op as well.
        let current = action_for(&snap, Command::VideoPlay, 2_000, 5);
        let folded = fold_patches(snap.clone(), [&current].into_iter());
        assert_eq!(folded, snap);
    }
}
