use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures_util::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    protocol::ServerEvent,
    room::advancer::RoomAdvancers,
    state::{AppResult, Shutdown},
    store::{room_of_topic, topic_key, Cache},
    utils::HandleErr,
};

/// Slots of per-room fan-out buffer. A subscriber that falls this far behind
/// gets a `Lagged` from the broadcast channel and is disconnected; it
/// re-syncs through the join flow.
pub const FANOUT_BUFFER: usize = 256;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Everything published to a room topic travels through the shared store so
/// other nodes see it; the origin id lets the publishing node skip its own
/// echo (local subscribers were already served directly).
#[derive(Serialize, Deserialize)]
struct TopicEnvelope {
    origin: Uuid,
    event: ServerEvent,
}

#[derive(Debug)]
enum TopicControl {
    Subscribe(Uuid),
    Unsubscribe(Uuid),
}

struct Topic {
    sender: broadcast::Sender<ServerEvent>,
    subscribers: usize,
}

/// Per-node registry of room fan-out topics, backed by one pub/sub
/// connection to the shared store.
#[derive(Clone)]
pub struct RoomHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    node_id: Uuid,
    cache: Cache,
    topics: Mutex<HashMap<Uuid, Topic>>,
    control: mpsc::UnboundedSender<TopicControl>,
}

impl RoomHub {
    pub fn new(cache: Cache) -> (Self, HubRelay) {
        let (control, control_rx) = mpsc::unbounded_channel();
        let hub = Self {
            inner: Arc::new(HubInner {
                node_id: Uuid::new_v4(),
                cache,
                topics: Mutex::new(HashMap::new()),
                control,
            }),
        };
        (hub.clone(), HubRelay { hub, control_rx })
    }

    /// Subscribes the caller to a room's fan-out. The first local subscriber
    /// also subscribes this node to the shared-store topic.
    pub fn join(&self, room_id: Uuid) -> broadcast::Receiver<ServerEvent> {
        let mut topics = self.inner.topics.lock().unwrap();
        let topic = topics.entry(room_id).or_insert_with(|| {
            self.inner
                .control
                .send(TopicControl::Subscribe(room_id))
                .log_warn_with_msg("hub relay is gone");
            let (sender, _) = broadcast::channel(FANOUT_BUFFER);
            Topic {
                sender,
                subscribers: 0,
            }
        });
        topic.subscribers += 1;
        topic.sender.subscribe()
    }

    pub fn leave(&self, room_id: Uuid) {
        let mut topics = self.inner.topics.lock().unwrap();
        if let Some(topic) = topics.get_mut(&room_id) {
            topic.subscribers = topic.subscribers.saturating_sub(1);
            if topic.subscribers == 0 {
                topics.remove(&room_id);
                self.inner
                    .control
                    .send(TopicControl::Unsubscribe(room_id))
                    .log_warn_with_msg("hub relay is gone");
            }
        }
    }

    /// Fans an event out to the room: local subscribers directly, remote
    /// nodes through the shared store. Local delivery does not depend on the
    /// pub/sub connection being healthy.
    pub async fn publish(&self, room_id: Uuid, event: ServerEvent) -> AppResult<()> {
        self.deliver_local(room_id, event.clone());
        let payload = serde_json::to_string(&TopicEnvelope {
            origin: self.inner.node_id,
            event,
        })?;
        let mut conn = self.inner.cache.conn();
        let _: () = conn.publish(topic_key(room_id), payload).await?;
        Ok(())
    }

    fn deliver_local(&self, room_id: Uuid, event: ServerEvent) {
        let topics = self.inner.topics.lock().unwrap();
        if let Some(topic) = topics.get(&room_id) {
            // Send only fails when no receiver is left, which is fine.
            let _ = topic.sender.send(event);
        }
    }

    pub fn local_room_count(&self) -> usize {
        self.inner.topics.lock().unwrap().len()
    }

    fn current_rooms(&self) -> Vec<Uuid> {
        self.inner.topics.lock().unwrap().keys().copied().collect()
    }
}

/// The node's pub/sub end of the hub. Runs until shutdown, reconnecting and
/// re-subscribing whenever the shared-store connection drops; missed fan-out
/// during the gap is repaired client-side via the join flow.
pub struct HubRelay {
    hub: RoomHub,
    control_rx: mpsc::UnboundedReceiver<TopicControl>,
}

impl HubRelay {
    pub async fn run(mut self, advancers: RoomAdvancers, shutdown: Shutdown) {
        loop {
            let pubsub = tokio::select! {
                _ = shutdown.cancelled() => return,
                conn = self.hub.inner.cache.client().get_async_pubsub() => conn,
            };
            let pubsub = match pubsub {
                Ok(pubsub) => pubsub,
                Err(err) => {
                    warn!("pub/sub connection failed: {err}");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };
            let (mut sink, mut stream) = pubsub.split();

            let mut healthy = true;
            for room_id in self.hub.current_rooms() {
                if sink.subscribe(topic_key(room_id)).await.log_err().is_none() {
                    healthy = false;
                    break;
                }
            }
            if !healthy {
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
            info!("room topic relay connected");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    ctl = self.control_rx.recv() => match ctl {
                        Some(TopicControl::Subscribe(room_id)) => {
                            if sink.subscribe(topic_key(room_id)).await.log_warn().is_none() {
                                break;
                            }
                        }
                        Some(TopicControl::Unsubscribe(room_id)) => {
                            if sink.unsubscribe(topic_key(room_id)).await.log_warn().is_none() {
                                break;
                            }
                        }
                        None => return,
                    },
                    msg = stream.next() => match msg {
                        Some(msg) => self.dispatch(&advancers, &msg),
                        None => {
                            warn!("pub/sub stream closed, reconnecting");
                            break;
                        }
                    },
                }
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    fn dispatch(&self, advancers: &RoomAdvancers, msg: &redis::Msg) {
        let Some(room_id) = room_of_topic(msg.get_channel_name()) else {
            return;
        };
        let Some(payload) = msg
            .get_payload::<String>()
            .log_warn_with_msg("unreadable topic payload")
        else {
            return;
        };
        let envelope: TopicEnvelope = match serde_json::from_str(&payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!("dropping malformed topic envelope: {err}");
                return;
            }
        };
        if envelope.origin == self.hub.inner.node_id {
            return;
        }
        // A remote action means this node may now hold the earliest wake for
        // the room; make sure an advancer is watching it.
        if matches!(envelope.event, ServerEvent::RoomAction { .. }) {
            advancers.schedule(room_id);
        }
        self.hub.deliver_local(room_id, envelope.event);
    }
}
