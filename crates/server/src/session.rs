//! Per-connection session: protocol handshake, command dispatch and the
//! liveness deadline.
//!
//! A session starts unauthenticated and acts only on `Ping` and
//! `Authenticate`; every other command is ignored until a user is bound.
//! Nothing short of a protocol error terminates the session.

use crate::connection::{self, Connection, ConnectionError};
use crate::room::{PlayResult, Room};
use crate::state::{ServerState, User};
use phira_mp_proto::{ClientCommand, CodecError, Message, ServerCommand};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Tick and deadline of the liveness check. The deadline deliberately equals
/// the tick.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

/// Welcome chat trails the auth response so the client has processed it.
const WELCOME_DELAY: Duration = Duration::from_millis(300);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("heartbeat deadline elapsed")]
    HeartbeatExpired,
}

pub struct Session {
    pub id: Uuid,
    pub version: AtomicU8,
    pub connection: Connection,
    pub user: parking_lot::Mutex<Option<Arc<User>>>,
    cleanup: AtomicBool,
}

impl Session {
    fn new(connection: Connection) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            version: AtomicU8::new(0),
            connection,
            user: parking_lot::Mutex::new(None),
            cleanup: AtomicBool::new(false),
        })
    }

    /// Claims the one-shot connection-lost cleanup.
    pub fn begin_cleanup(&self) -> bool {
        !self.cleanup.swap(true, Ordering::AcqRel)
    }

    pub fn current_user(&self) -> Option<Arc<User>> {
        self.user.lock().clone()
    }
}

/// Owns one accepted socket until it dies, then runs the lost-connection
/// protocol.
pub async fn serve_connection(state: Arc<ServerState>, stream: TcpStream, peer: SocketAddr) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let connection = Connection::start(peer, write_half);
    let session = Session::new(connection);
    state.sessions.insert(session.id, session.clone());
    info!(session = %session.id, %peer, "session opened");

    match run_session(&state, &session, read_half).await {
        Ok(()) => debug!(session = %session.id, "session closed"),
        Err(error) => debug!(session = %session.id, %error, "session ended"),
    }
    state.connection_lost(&session).await;
}

async fn run_session(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    read_half: tokio::net::tcp::OwnedReadHalf,
) -> Result<(), SessionError> {
    let mut reader = BufReader::new(read_half);

    // the very first byte on the stream is the protocol version; it is
    // recorded and never echoed
    let version = timeout(HEARTBEAT_TIMEOUT, reader.read_u8())
        .await
        .map_err(|_| SessionError::HeartbeatExpired)??;
    session.version.store(version, Ordering::Relaxed);
    session.connection.touch();
    debug!(session = %session.id, version, "protocol version negotiated");

    let mut close_signal = session.connection.subscribe_close();
    let mut read = Box::pin(connection::read_frame(reader));
    let mut ticker = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            result = &mut read => {
                let (reader, payload) = result?;
                session.connection.touch();
                let command = ClientCommand::decode_payload(&payload)?;
                handle_command(state, session, command).await;
                read = Box::pin(connection::read_frame(reader));
            }
            _ = ticker.tick() => {
                if session.connection.idle_for() > HEARTBEAT_TIMEOUT {
                    return Err(SessionError::HeartbeatExpired);
                }
            }
            _ = close_signal.changed() => return Ok(()),
        }
    }
}

async fn handle_command(state: &Arc<ServerState>, session: &Arc<Session>, command: ClientCommand) {
    match command {
        ClientCommand::Ping => session.connection.send(ServerCommand::Pong),
        ClientCommand::Authenticate { token } => authenticate(state, session, token).await,
        other => {
            let Some(user) = session.current_user() else {
                trace!(session = %session.id, "ignoring command from unauthenticated session");
                return;
            };
            dispatch_authed(state, session, &user, other).await;
        }
    }
}

async fn authenticate(state: &Arc<ServerState>, session: &Arc<Session>, token: String) {
    let me = match state.api.me(&token).await {
        Ok(me) => me,
        Err(error) => {
            debug!(session = %session.id, %error, "authentication failed");
            session
                .connection
                .send(ServerCommand::Authenticate(Err(error.to_string())));
            return;
        }
    };
    if state.admin.is_user_banned(i64::from(me.id)) {
        warn!(session = %session.id, user = me.id, "banned user rejected");
        session
            .connection
            .send(ServerCommand::Authenticate(Err(
                "account is banned".to_string()
            )));
        return;
    }

    let user = state
        .users
        .entry(me.id)
        .or_insert_with(|| User::new(me.id, me.name.clone()))
        .clone();
    *user.name.lock() = me.name.clone();

    // one live session per user: the newest login wins
    if let Some(previous) = user.bind_session(session) {
        if previous.id != session.id {
            debug!(user = user.id, old = %previous.id, "rebinding user, closing previous session");
            previous.connection.close();
        }
    }
    *session.user.lock() = Some(user.clone());

    let room_state = match user.current_room() {
        Some(room) => Some(room.client_state(&user).await),
        None => None,
    };
    session
        .connection
        .send(ServerCommand::Authenticate(Ok((user.info(), room_state))));
    info!(session = %session.id, user = user.id, name = %me.name, "authenticated");

    if let Some(welcome) = state.config.welcome_message.clone() {
        if state.config.welcome_exempt_id != Some(user.id) {
            let session = session.clone();
            tokio::spawn(async move {
                tokio::time::sleep(WELCOME_DELAY).await;
                session.connection.send(ServerCommand::Message(Message::Chat {
                    user: crate::state::SYSTEM_USER_ID,
                    content: welcome,
                }));
            });
        }
    }
}

async fn dispatch_authed(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    user: &Arc<User>,
    command: ClientCommand,
) {
    let respond = |command: ServerCommand| session.connection.send(command);
    match command {
        ClientCommand::Ping | ClientCommand::Authenticate { .. } => unreachable!(),
        ClientCommand::Chat { message } => {
            let result = match user.current_room() {
                Some(room) => room.chat(user, message).await,
                None => Err("not in a room".to_string()),
            };
            respond(ServerCommand::Chat(result));
        }
        ClientCommand::Touches { frames } => {
            let Some(room) = user.current_room() else {
                return;
            };
            if let Some(frame) = frames.last() {
                *user.game_time.lock() = frame.time;
            }
            {
                let mut replay = user.replay.lock().await;
                if let Some(writer) = replay.as_mut() {
                    let raw = ClientCommand::Touches {
                        frames: frames.clone(),
                    }
                    .encode_to_vec();
                    writer.append(&raw).await;
                }
            }
            room.relay_touches(user.id, frames).await;
        }
        ClientCommand::Judges { judgements } => {
            let Some(room) = user.current_room() else {
                return;
            };
            {
                let mut replay = user.replay.lock().await;
                if let Some(writer) = replay.as_mut() {
                    let raw = ClientCommand::Judges {
                        judgements: judgements.clone(),
                    }
                    .encode_to_vec();
                    writer.append(&raw).await;
                }
            }
            room.relay_judgements(user.id, judgements).await;
        }
        ClientCommand::CreateRoom { id } => {
            respond(ServerCommand::CreateRoom(
                create_room(state, user, id).await,
            ));
        }
        ClientCommand::JoinRoom { id, monitor } => {
            respond(ServerCommand::JoinRoom(
                join_room(state, user, id, monitor).await,
            ));
        }
        ClientCommand::LeaveRoom => match user.current_room() {
            Some(room) => {
                let outcome = room.on_user_leave(user).await;
                respond(ServerCommand::LeaveRoom(Ok(())));
                state.handle_outcome(&room, outcome).await;
            }
            None => respond(ServerCommand::LeaveRoom(Err("not in a room".to_string()))),
        },
        ClientCommand::LockRoom { lock } => {
            let result = match user.current_room() {
                Some(room) => room.set_lock(user, lock).await,
                None => Err("not in a room".to_string()),
            };
            respond(ServerCommand::LockRoom(result));
        }
        ClientCommand::CycleRoom { cycle } => {
            let result = match user.current_room() {
                Some(room) => room.set_cycle(user, cycle).await,
                None => Err("not in a room".to_string()),
            };
            respond(ServerCommand::CycleRoom(result));
        }
        ClientCommand::SelectChart { id } => {
            let result = match user.current_room() {
                Some(room) => {
                    // resolve the display name before taking the room lock
                    let name = state.api.chart_name(id).await;
                    room.select_chart(user, id, name).await
                }
                None => Err("not in a room".to_string()),
            };
            respond(ServerCommand::SelectChart(result));
        }
        ClientCommand::RequestStart => {
            let result = match user.current_room() {
                Some(room) => room.request_start(user).await,
                None => Err("not in a room".to_string()),
            };
            respond(ServerCommand::RequestStart(result));
        }
        ClientCommand::Ready => {
            let result = match user.current_room() {
                Some(room) => room.ready(user).await,
                None => Err("not in a room".to_string()),
            };
            respond(ServerCommand::Ready(result));
        }
        ClientCommand::CancelReady => {
            let result = match user.current_room() {
                Some(room) => room.cancel_ready(user).await,
                None => Err("not in a room".to_string()),
            };
            respond(ServerCommand::CancelReady(result));
        }
        ClientCommand::Played { id } => {
            played(state, session, user, id).await;
        }
        ClientCommand::Abort => {
            let Some(room) = user.current_room() else {
                respond(ServerCommand::Abort(Err("not in a room".to_string())));
                return;
            };
            match room.abort(user).await {
                Ok(outcome) => {
                    respond(ServerCommand::Abort(Ok(())));
                    state.handle_outcome(&room, outcome).await;
                }
                Err(reason) => respond(ServerCommand::Abort(Err(reason))),
            }
        }
    }
}

async fn create_room(
    state: &Arc<ServerState>,
    user: &Arc<User>,
    id: String,
) -> Result<(), String> {
    if !state.room_creation_enabled.load(Ordering::Relaxed) {
        return Err("room creation is disabled".to_string());
    }
    if user.current_room().is_some() {
        return Err("already in a room".to_string());
    }
    let id = if id == "0" {
        state.random_room_id()
    } else {
        if id.is_empty() || id.len() > 32 || id.chars().any(char::is_whitespace) {
            return Err("invalid room id".to_string());
        }
        id
    };
    let room = Room::new(state.env.clone(), id.clone(), user);
    match state.rooms.entry(id.clone()) {
        dashmap::mapref::entry::Entry::Occupied(_) => {
            return Err("room id already taken".to_string())
        }
        dashmap::mapref::entry::Entry::Vacant(entry) => {
            entry.insert(room.clone());
        }
    }
    user.set_room(&room);
    user.monitor.store(false, Ordering::Relaxed);
    room.announce_created(user).await;
    info!(room = %room.id, host = user.id, "room created");
    state.emit_admin_update();
    Ok(())
}

async fn join_room(
    state: &Arc<ServerState>,
    user: &Arc<User>,
    id: String,
    monitor: bool,
) -> Result<phira_mp_proto::JoinRoomResponse, String> {
    if user.current_room().is_some() {
        return Err("already in a room".to_string());
    }
    let room = if id == "0" {
        state
            .pick_recruiting_room()
            .await
            .ok_or_else(|| "no recruiting room available".to_string())?
    } else {
        state
            .rooms
            .get(&id)
            .map(|room| room.clone())
            .ok_or_else(|| "room not found".to_string())?
    };
    if state.admin.is_room_banned(&room.id, i64::from(user.id)) {
        return Err("you are banned from this room".to_string());
    }
    let response = room.add_user(user, monitor, false).await?;
    info!(room = %room.id, user = user.id, monitor, "user joined room");
    Ok(response)
}

async fn played(state: &Arc<ServerState>, session: &Arc<Session>, user: &Arc<User>, id: i32) {
    let Some(room) = user.current_room() else {
        session
            .connection
            .send(ServerCommand::Played(Err("not in a room".to_string())));
        return;
    };
    // validate the record before touching the room lock
    let record = match state.api.record(id).await {
        Ok(record) => record,
        Err(error) => {
            session
                .connection
                .send(ServerCommand::Played(Err(error.to_string())));
            return;
        }
    };
    if record.player != user.id {
        warn!(user = user.id, record = id, "play record belongs to another player");
        session.connection.send(ServerCommand::Played(Err(
            "record does not belong to you".to_string(),
        )));
        return;
    }
    let result = PlayResult {
        score: record.score,
        accuracy: record.accuracy,
        full_combo: record.full_combo,
    };
    match room.played(user, record.id, result).await {
        Ok(outcome) => {
            session.connection.send(ServerCommand::Played(Ok(())));
            state.handle_outcome(&room, outcome).await;
        }
        Err(reason) => session.connection.send(ServerCommand::Played(Err(reason))),
    }
}
