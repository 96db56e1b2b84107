use std::{
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    auth::AuthedUser,
    protocol::{
        encode_ack, encode_event, AckData, AckFrame, CallPresenceKind, ClientEvent, ErrorCode,
        ServerEvent,
    },
    room::model::{self, apply, ChatMessage, Command, PendingAction, RoomSnapshot},
    sfu,
    state::{AppError, AppResult, AppState},
    store::{chat, pending, presence, ratelimit, rooms},
    utils::{now_ms, HandleErr},
};

/// Outbound frames queued per connection before we give up on the socket.
const OUTBOUND_BUFFER: usize = 64;

/// How many upcoming actions a join ack replays to the late joiner.
const PENDING_REPLAY_LIMIT: usize = 5;

struct Membership {
    room_id: Uuid,
    forward: tokio::task::JoinHandle<()>,
}

/// Connection-scoped state shared between the dispatch loop and the
/// disconnect path, which may run while the loop is being torn down.
pub struct Session {
    user: AuthedUser,
    remote_ip: IpAddr,
    display_name: Mutex<Option<String>>,
    membership: Mutex<Option<Membership>>,
    call_joined: AtomicBool,
    /// Cancelled by a lagging fan-out to force-disconnect the socket.
    kick: CancellationToken,
}

impl Session {
    fn new(user: AuthedUser, remote_ip: IpAddr) -> Arc<Self> {
        Arc::new(Self {
            user,
            remote_ip,
            display_name: Mutex::new(None),
            membership: Mutex::new(None),
            call_joined: AtomicBool::new(false),
            kick: CancellationToken::new(),
        })
    }

    fn room_id(&self) -> Option<Uuid> {
        self.membership.lock().unwrap().as_ref().map(|m| m.room_id)
    }

    fn display_name(&self) -> Option<String> {
        self.display_name.lock().unwrap().clone()
    }

    fn effective_display_name(&self, from_request: Option<String>) -> String {
        if let Some(name) = &from_request {
            *self.display_name.lock().unwrap() = Some(name.clone());
        }
        from_request
            .or_else(|| self.display_name())
            .unwrap_or_else(|| "Guest".to_owned())
    }
}

/// Owns one client connection from upgrade to teardown.
pub async fn run(socket: WebSocket, state: AppState, user: AuthedUser, remote_ip: IpAddr) {
    info!(user = %user.user_id, ip = %remote_ip, "session connected");
    state.sessions_online.fetch_add(1, Ordering::Relaxed);

    let session = Session::new(user, remote_ip);
    let (sink, stream) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);

    let mut write_task = tokio::spawn(write_loop(sink, out_rx));
    let mut dispatch_task = tokio::spawn(dispatch_loop(
        stream,
        state.clone(),
        session.clone(),
        out_tx,
    ));

    tokio::select! {
        _ = state.shutdown.cancelled() => {
            write_task.abort();
            dispatch_task.abort();
        }
        _ = session.kick.cancelled() => {
            warn!(user = %session.user.user_id, "disconnecting lagging subscriber");
            write_task.abort();
            dispatch_task.abort();
        }
        _ = &mut write_task => { dispatch_task.abort(); }
        _ = &mut dispatch_task => { write_task.abort(); }
    }

    leave_current_room(&state, &session).await;
    state.sessions_online.fetch_sub(1, Ordering::Relaxed);
    info!(user = %session.user.user_id, ip = %session.remote_ip, "session closed");
}

async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut out_rx: mpsc::Receiver<Message>) {
    while let Some(message) = out_rx.recv().await {
        if sink.send(message).await.is_err() {
            break;
        }
    }
}

async fn dispatch_loop(
    mut stream: SplitStream<WebSocket>,
    state: AppState,
    session: Arc<Session>,
    out_tx: mpsc::Sender<Message>,
) {
    while let Some(message) = stream.next().await {
        let Ok(message) = message else {
            break;
        };
        match message {
            Message::Binary(bytes) => {
                let frame = match crate::protocol::decode_frame(&bytes) {
                    Ok(frame) => frame,
                    Err(err) => {
                        debug!("ignoring undecodable frame: {err}");
                        continue;
                    }
                };
                let ack_id = frame.id;
                let outcome = handle_event(&state, &session, &out_tx, frame.event).await;
                let Some(id) = ack_id else {
                    if let Err(err) = outcome {
                        debug!("fire-and-forget event failed: {err}");
                    }
                    continue;
                };
                let ack = match outcome {
                    Ok(data) => AckFrame::ok(id, data),
                    Err(err) => {
                        let (code, retry_after_ms) = err.to_client();
                        if code == ErrorCode::Internal {
                            warn!(user = %session.user.user_id, "request failed: {err}");
                        }
                        AckFrame::err(id, code, retry_after_ms)
                    }
                };
                let Some(bytes) = encode_ack(&ack).log_err_with_msg("failed to encode ack") else {
                    continue;
                };
                if out_tx.send(Message::Binary(bytes)).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Text(_) => {
                debug!("ignoring text frame on binary protocol");
            }
        }
    }
}

async fn handle_event(
    state: &AppState,
    session: &Arc<Session>,
    out_tx: &mpsc::Sender<Message>,
    event: ClientEvent,
) -> AppResult<AckData> {
    match event {
        ClientEvent::NtpPing { t0 } => {
            let t1 = now_ms();
            let t2 = now_ms();
            Ok(AckData::Pong { t0, t1, t2 })
        }
        ClientEvent::RoomJoin {
            room_id,
            display_name,
        } => {
            let room_id: Uuid = room_id
                .parse()
                .map_err(|_| AppError::code(ErrorCode::InvalidRoomId))?;
            session.effective_display_name(display_name);
            join_room(state, session, out_tx, room_id).await
        }
        ClientEvent::RoomStateRequest {} => {
            let room_id = require_room(session)?;
            room_state_ack(state, room_id, None).await
        }
        ClientEvent::RoomCommand { command } => handle_command(state, session, command).await,
        ClientEvent::ChatSend {
            message,
            display_name,
        } => handle_chat(state, session, message, display_name).await,
        ClientEvent::StageToken {
            display_name,
            tab_id,
            client_id,
        } => {
            stage_token(state, session, display_name, tab_id, client_id).await
        }
        ClientEvent::TableToken {
            table_id,
            tab_id,
            client_id,
        } => table_token(state, session, table_id, tab_id, client_id).await,
        ClientEvent::CallJoin {} => {
            let room_id = require_room(session)?;
            session.call_joined.store(true, Ordering::Relaxed);
            publish_call_presence(state, session, room_id, CallPresenceKind::Join).await?;
            Ok(AckData::Empty {})
        }
        ClientEvent::CallLeave {} => {
            let room_id = require_room(session)?;
            session.call_joined.store(false, Ordering::Relaxed);
            publish_call_presence(state, session, room_id, CallPresenceKind::Leave).await?;
            Ok(AckData::Empty {})
        }
        ClientEvent::CallPresenceUpdate { state: call_state } => {
            let room_id = require_room(session)?;
            state
                .hub
                .publish(
                    room_id,
                    ServerEvent::CallPresence {
                        room_id,
                        user_id: session.user.user_id.clone(),
                        kind: CallPresenceKind::Update,
                        state: call_state,
                    },
                )
                .await?;
            Ok(AckData::Empty {})
        }
        ClientEvent::CallSignal { to_user_id, data } => {
            let room_id = require_room(session)?;
            state
                .hub
                .publish(
                    room_id,
                    ServerEvent::CallSignal {
                        from_user_id: session.user.user_id.clone(),
                        to_user_id,
                        data,
                    },
                )
                .await?;
            Ok(AckData::Empty {})
        }
    }
}

fn require_room(session: &Session) -> AppResult<Uuid> {
    session
        .room_id()
        .ok_or_else(|| AppError::code(ErrorCode::NotInRoom))
}

async fn join_room(
    state: &AppState,
    session: &Arc<Session>,
    out_tx: &mpsc::Sender<Message>,
    room_id: Uuid,
) -> AppResult<AckData> {
    // A session is in at most one room; switching out releases the old
    // subscription and presence entry first.
    leave_current_room(state, session).await;

    // Subscribe before reading state so nothing published in between is
    // lost; anything already applied is dropped by seq on the client.
    let receiver = state.hub.join(room_id);
    let forward = tokio::spawn(forward_loop(
        receiver,
        out_tx.clone(),
        session.user.user_id.clone(),
        session.kick.clone(),
    ));
    *session.membership.lock().unwrap() = Some(Membership { room_id, forward });

    presence::join(&state.cache, room_id, &session.user.user_id).await?;

    room_state_ack(state, room_id, Some(&session.user.user_id)).await
}

/// Shared by join and `room:state:request`: current snapshot (with any due
/// actions already folded in), a short replay of upcoming actions, the
/// online count and the recent chat window.
async fn room_state_ack(
    state: &AppState,
    room_id: Uuid,
    creator: Option<&str>,
) -> AppResult<AckData> {
    let now = now_ms();
    let snapshot = load_current(state, room_id, now, creator).await?;
    let pending = pending::range_upcoming(&state.cache, room_id, now, PENDING_REPLAY_LIMIT).await?;
    if !pending.is_empty() {
        state.advancers.schedule(room_id);
    }
    let online_count = presence::online_count(&state.cache, room_id).await?;
    let chat = chat::load(&state.cache, room_id, state.settings.chat_max_messages).await?;
    Ok(AckData::RoomState {
        state: snapshot,
        pending,
        online_count,
        chat,
    })
}

/// The room snapshot as of `now`: the stored snapshot plus every action
/// whose execution instant has already passed but which the advancer has
/// not persisted yet.
async fn load_current(
    state: &AppState,
    room_id: Uuid,
    now: i64,
    creator: Option<&str>,
) -> AppResult<RoomSnapshot> {
    let snapshot = rooms::get_or_create(
        &state.cache,
        &state.db,
        room_id,
        creator,
        state.settings.audience_delay_seconds_default,
    )
    .await?;
    let due = pending::sort_for_apply(pending::range_due(&state.cache, room_id, now).await?);
    Ok(crate::room::advancer::fold_patches(
        snapshot,
        due.iter().map(|(_, action)| action),
    ))
}

async fn handle_command(
    state: &AppState,
    session: &Arc<Session>,
    command: Command,
) -> AppResult<AckData> {
    let room_id = require_room(session)?;
    command
        .validate()
        .map_err(|_| AppError::code(ErrorCode::InvalidCommand))?;

    let now = now_ms();

    // Raised hands are a social signal, not a timeline mutation: broadcast
    // immediately, skip scheduling and the command bucket.
    if matches!(command, Command::HandRaise) {
        state
            .hub
            .publish(
                room_id,
                ServerEvent::RoomHand {
                    room_id,
                    user_id: session.user.user_id.clone(),
                    display_name: session.display_name(),
                    at_ms: now,
                },
            )
            .await?;
        return Ok(AckData::Empty {});
    }

    let bucket_key = format!("rl:cmd:{room_id}:{}", session.user.user_id);
    let decision =
        ratelimit::consume(&state.cache, &bucket_key, state.settings.cmd_policy(), now).await;
    if !decision.allowed {
        return Err(AppError::rate_limited(decision.retry_after_ms));
    }

    let current = load_current(state, room_id, now, None).await?.advanced_to(now);
    let seq = rooms::next_seq(&state.cache, room_id).await?;
    let exec_at_ms = now + state.settings.buffer_ms_for_seek(command.wants_seek_buffer());
    let patch = apply(&current, &command, exec_at_ms, seq);
    let action = PendingAction {
        seq,
        exec_at_ms,
        server_now_ms: now,
        command,
        patch,
    };

    pending::add(&state.cache, room_id, &action).await?;
    state
        .hub
        .publish(
            room_id,
            ServerEvent::RoomAction {
                room_id,
                action: action.clone(),
            },
        )
        .await?;
    state.advancers.schedule(room_id);

    Ok(AckData::Action { action })
}

async fn handle_chat(
    state: &AppState,
    session: &Arc<Session>,
    message: String,
    display_name: Option<String>,
) -> AppResult<AckData> {
    let room_id = require_room(session)?;

    let now = now_ms();
    let bucket_key = format!("rl:chat:{room_id}:{}", session.user.user_id);
    let decision =
        ratelimit::consume(&state.cache, &bucket_key, state.settings.chat_policy(), now).await;
    if !decision.allowed {
        return Err(AppError::rate_limited(decision.retry_after_ms));
    }

    let text = model::sanitize_message(&message, state.settings.chat_max_length)
        .ok_or_else(|| AppError::code(ErrorCode::InvalidMessage))?;

    let chat_message = ChatMessage {
        id: Uuid::new_v4().to_string(),
        room_id,
        user_id: session.user.user_id.clone(),
        display_name: session.effective_display_name(display_name),
        message: text,
        at_ms: now,
    };

    chat::append(
        &state.cache,
        &chat_message,
        state.settings.chat_max_messages,
        state.settings.chat_ttl_sec,
    )
    .await?;
    state
        .hub
        .publish(
            room_id,
            ServerEvent::Chat {
                message: chat_message.clone(),
            },
        )
        .await?;

    Ok(AckData::Chat {
        message: chat_message,
    })
}

async fn stage_token(
    state: &AppState,
    session: &Arc<Session>,
    display_name: Option<String>,
    tab_id: Option<String>,
    client_id: Option<String>,
) -> AppResult<AckData> {
    let room_id = require_room(session)?;
    let config = sfu::SfuConfig::from_settings(&state.settings).ok_or_else(sfu::not_configured)?;

    let snapshot = rooms::get_or_create(
        &state.cache,
        &state.db,
        room_id,
        None,
        state.settings.audience_delay_seconds_default,
    )
    .await?;
    let allowed = sfu::stage_allowed(
        &state.db,
        room_id,
        &session.user.user_id,
        snapshot.created_by.as_deref(),
    )
    .await?;
    if !allowed {
        return Err(AppError::code(ErrorCode::Forbidden));
    }

    let room_name = sfu::stage_room(room_id);
    if !sfu::has_capacity(&config, &room_name, state.settings.room_max_stage).await {
        return Err(AppError::code(ErrorCode::StageFull));
    }

    let name = session.effective_display_name(display_name);
    let identity = sfu::participant_identity(
        &session.user.user_id,
        tab_id.as_deref(),
        client_id.as_deref(),
    );
    let token = sfu::mint_token(&config, &room_name, &identity, Some(&name), true)?;
    Ok(AckData::SfuToken {
        token,
        url: config.url,
        room: room_name,
    })
}

async fn table_token(
    state: &AppState,
    session: &Arc<Session>,
    table_id: String,
    tab_id: Option<String>,
    client_id: Option<String>,
) -> AppResult<AckData> {
    let room_id = require_room(session)?;
    let config = sfu::SfuConfig::from_settings(&state.settings).ok_or_else(sfu::not_configured)?;

    let table_id = sfu::sanitize_table_id(&table_id)
        .ok_or_else(|| AppError::code(ErrorCode::InvalidCommand))?;
    let room_name = sfu::table_room(room_id, &table_id);
    if !sfu::has_capacity(&config, &room_name, state.settings.room_max_table).await {
        return Err(AppError::code(ErrorCode::TableFull));
    }

    let name = session.display_name();
    let identity = sfu::participant_identity(
        &session.user.user_id,
        tab_id.as_deref(),
        client_id.as_deref(),
    );
    let token = sfu::mint_token(&config, &room_name, &identity, name.as_deref(), true)?;
    Ok(AckData::SfuToken {
        token,
        url: config.url,
        room: room_name,
    })
}

async fn publish_call_presence(
    state: &AppState,
    session: &Arc<Session>,
    room_id: Uuid,
    kind: CallPresenceKind,
) -> AppResult<()> {
    state
        .hub
        .publish(
            room_id,
            ServerEvent::CallPresence {
                room_id,
                user_id: session.user.user_id.clone(),
                kind,
                state: serde_json::Value::Null,
            },
        )
        .await
}

/// Moves room fan-out onto this connection's outbound queue. Lagging behind
/// the broadcast buffer or a full outbound queue kicks the session; replay
/// on rejoin is cheaper than an unbounded backlog.
async fn forward_loop(
    mut receiver: broadcast::Receiver<ServerEvent>,
    out_tx: mpsc::Sender<Message>,
    user_id: String,
    kick: CancellationToken,
) {
    loop {
        match receiver.recv().await {
            Ok(event) => {
                if let ServerEvent::CallSignal { to_user_id, .. } = &event {
                    if *to_user_id != user_id {
                        continue;
                    }
                }
                let Some(bytes) =
                    encode_event(&event).log_err_with_msg("failed to encode fan-out event")
                else {
                    continue;
                };
                if out_tx.try_send(Message::Binary(bytes)).is_err() {
                    kick.cancel();
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "fan-out receiver lagged");
                kick.cancel();
                return;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn leave_current_room(state: &AppState, session: &Arc<Session>) {
    let membership = session.membership.lock().unwrap().take();
    let Some(membership) = membership else {
        return;
    };
    membership.forward.abort();
    state.hub.leave(membership.room_id);

    if session.call_joined.swap(false, Ordering::Relaxed) {
        publish_call_presence(state, session, membership.room_id, CallPresenceKind::Leave)
            .await
            .log_warn_with_msg("failed to announce call leave");
    }

    presence::leave(&state.cache, membership.room_id, &session.user.user_id)
        .await
        .log_warn_with_msg("failed to decrement presence");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn presence_event(online_count: i64) -> ServerEvent {
        ServerEvent::PresenceUpdate {
            room_id: Uuid::nil(),
            online_count,
        }
    }

    fn signal_for(to: &str) -> ServerEvent {
        ServerEvent::CallSignal {
            from_user_id: "peer".to_owned(),
            to_user_id: to.to_owned(),
            data: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn forward_kicks_a_subscriber_whose_outbound_queue_is_full() {
        let (topic, receiver) = broadcast::channel(64);
        let (out_tx, _out_rx) = mpsc::channel(1);
        let kick = CancellationToken::new();
        tokio::spawn(forward_loop(
            receiver,
            out_tx,
            "u1".to_owned(),
            kick.clone(),
        ));

        // The first event fills the single outbound slot (nobody drains it);
        // the second cannot be queued and must kick the session.
        topic.send(presence_event(1)).unwrap();
        topic.send(presence_event(2)).unwrap();

        tokio::time::timeout(Duration::from_secs(1), kick.cancelled())
            .await
            .expect("lagging subscriber was not kicked");
    }

    #[tokio::test]
    async fn forward_delivers_only_signals_addressed_to_this_user() {
        let (topic, receiver) = broadcast::channel(64);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let kick = CancellationToken::new();
        tokio::spawn(forward_loop(receiver, out_tx, "u1".to_owned(), kick));

        topic.send(signal_for("someone-else")).unwrap();
        topic.send(signal_for("u1")).unwrap();

        let message = tokio::time::timeout(Duration::from_secs(1), out_rx.recv())
            .await
            .expect("no frame forwarded")
            .expect("outbound channel closed");
        let Message::Binary(bytes) = message else {
            panic!("expected a binary frame");
        };
        let event: ServerEvent = rmp_serde::from_slice(&bytes).unwrap();
        match event {
            ServerEvent::CallSignal { to_user_id, .. } => assert_eq!(to_user_id, "u1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
