//! Process-wide state: interned users, live sessions, rooms, feature flags
//! and the lifecycle hooks tying them together.

use crate::admin_data::AdminStore;
use crate::api::ApiClient;
use crate::config::Config;
use crate::push::{PushEvent, PushHub};
use crate::replay::ReplayWriter;
use crate::room::{Room, RoomEnv, RoomOutcome};
use crate::session::Session;
use crate::trust::TrustStore;
use dashmap::DashMap;
use phira_mp_proto::{Message, ServerCommand, UserInfo};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

/// Distinguished sender id for server-originated chat.
pub const SYSTEM_USER_ID: i32 = 0;

/// A player or monitor, interned process-wide by id. Re-authentication of a
/// known id reuses the same entry and rebinds its session.
pub struct User {
    pub id: i32,
    pub name: parking_lot::Mutex<String>,
    session: parking_lot::Mutex<Weak<Session>>,
    room: parking_lot::Mutex<Weak<Room>>,
    pub monitor: AtomicBool,
    pub game_time: parking_lot::Mutex<f32>,
    pub replay: tokio::sync::Mutex<Option<ReplayWriter>>,
}

impl User {
    pub fn new(id: i32, name: String) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: parking_lot::Mutex::new(name),
            session: parking_lot::Mutex::new(Weak::new()),
            room: parking_lot::Mutex::new(Weak::new()),
            monitor: AtomicBool::new(false),
            game_time: parking_lot::Mutex::new(0.0),
            replay: tokio::sync::Mutex::new(None),
        })
    }

    pub fn display_name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn info(&self) -> UserInfo {
        UserInfo {
            id: self.id,
            name: self.display_name(),
            monitor: self.monitor.load(Ordering::Relaxed),
        }
    }

    /// Delivery to an offline user is a no-op.
    pub fn send(&self, command: ServerCommand) {
        if let Some(session) = self.session.lock().upgrade() {
            session.connection.send(command);
        }
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.lock().upgrade()
    }

    pub fn is_online(&self) -> bool {
        self.session().is_some()
    }

    /// Binds a new session, returning the previously bound one if any.
    pub fn bind_session(&self, session: &Arc<Session>) -> Option<Arc<Session>> {
        let mut guard = self.session.lock();
        let previous = guard.upgrade();
        *guard = Arc::downgrade(session);
        previous
    }

    /// Clears the binding only if it still points at the given session, so a
    /// stale disconnect never unbinds a newer login.
    pub fn clear_session_if(&self, session: &Session) {
        let mut guard = self.session.lock();
        if guard.upgrade().is_some_and(|bound| bound.id == session.id) {
            *guard = Weak::new();
        }
    }

    pub fn current_room(&self) -> Option<Arc<Room>> {
        self.room.lock().upgrade()
    }

    pub fn set_room(&self, room: &Arc<Room>) {
        *self.room.lock() = Arc::downgrade(room);
    }

    pub fn clear_room(&self) {
        *self.room.lock() = Weak::new();
    }
}

pub struct ServerState {
    pub config: Config,
    pub api: ApiClient,
    pub env: Arc<RoomEnv>,
    pub room_creation_enabled: AtomicBool,
    pub sessions: DashMap<Uuid, Arc<Session>>,
    pub users: DashMap<i32, Arc<User>>,
    pub rooms: DashMap<String, Arc<Room>>,
    pub admin: AdminStore,
    pub trust: TrustStore,
    pub push: Arc<PushHub>,
    pub started_at: Instant,
    push_events: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<PushEvent>>>,
}

impl ServerState {
    pub fn new(config: Config) -> Arc<Self> {
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let env = Arc::new(RoomEnv {
            push: push_tx,
            replay_enabled: AtomicBool::new(false),
            record_dir: config.record_dir(),
        });
        let admin = AdminStore::load(config.admin_data_file());
        let api = ApiClient::new(&config.api_base_url);
        let users = DashMap::new();
        users.insert(
            SYSTEM_USER_ID,
            User::new(SYSTEM_USER_ID, config.server_name.clone()),
        );
        Arc::new(Self {
            config,
            api,
            env,
            room_creation_enabled: AtomicBool::new(true),
            sessions: DashMap::new(),
            users,
            rooms: DashMap::new(),
            admin,
            trust: TrustStore::new(),
            push: Arc::new(PushHub::new()),
            started_at: Instant::now(),
            push_events: parking_lot::Mutex::new(Some(push_rx)),
        })
    }

    /// The push worker takes the event receiver exactly once.
    pub fn take_push_events(&self) -> Option<mpsc::UnboundedReceiver<PushEvent>> {
        self.push_events.lock().take()
    }

    pub fn emit_admin_update(&self) {
        let _ = self.env.push.send(PushEvent::AdminUpdate);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Interned user count, not counting the system user.
    pub fn user_count(&self) -> usize {
        self.users.len().saturating_sub(1)
    }

    pub fn random_room_id(&self) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let id = rng.gen_range(100_000..1_000_000).to_string();
            if !self.rooms.contains_key(&id) {
                return id;
            }
        }
    }

    /// Uniform pick among rooms currently open to random matchmaking.
    pub async fn pick_recruiting_room(&self) -> Option<Arc<Room>> {
        let candidates: Vec<_> = self.rooms.iter().map(|room| room.clone()).collect();
        let mut eligible = Vec::new();
        for room in candidates {
            if room.recruitable().await {
                eligible.push(room);
            }
        }
        if eligible.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..eligible.len());
        Some(eligible.swap_remove(index))
    }

    /// Applies the registry-side follow-up of a room operation.
    pub async fn handle_outcome(&self, room: &Arc<Room>, outcome: RoomOutcome) {
        match outcome {
            RoomOutcome::None => {}
            RoomOutcome::Destroy => self.destroy_room(room).await,
            RoomOutcome::DisbandContest => {
                self.disband_room(room, "房间已被管理员解散:比赛已结束").await;
            }
        }
    }

    /// Removal of an emptied room. Remaining monitors are unbound.
    pub async fn destroy_room(&self, room: &Arc<Room>) {
        self.rooms.remove(&room.id);
        for member in room.take_members().await {
            member.clear_room();
            member.monitor.store(false, Ordering::Relaxed);
        }
        info!(room = %room.id, "room destroyed");
        self.emit_admin_update();
    }

    /// Disband protocol: every member gets a system chat naming the reason,
    /// is unbound, and has its session closed.
    pub async fn disband_room(&self, room: &Arc<Room>, reason: &str) {
        self.rooms.remove(&room.id);
        let members = room.take_members().await;
        for member in &members {
            member.clear_room();
            member.monitor.store(false, Ordering::Relaxed);
            member.send(ServerCommand::Message(Message::Chat {
                user: SYSTEM_USER_ID,
                content: reason.to_string(),
            }));
        }
        for member in &members {
            if let Some(session) = member.session() {
                session.connection.close();
            }
        }
        info!(room = %room.id, members = members.len(), "room disbanded");
        self.emit_admin_update();
    }

    /// Cleanup after a receive error, socket close or heartbeat deadline.
    /// Idempotent per session.
    pub async fn connection_lost(&self, session: &Arc<Session>) {
        if !session.begin_cleanup() {
            return;
        }
        self.sessions.remove(&session.id);
        session.connection.close();
        let user = session.user.lock().take();
        if let Some(user) = user {
            // a re-authentication may have rebound the user to a newer
            // session; only the still-current session kicks them from
            // their room
            let still_bound = user
                .session()
                .is_some_and(|bound| bound.id == session.id);
            user.clear_session_if(session);
            if still_bound {
                if let Some(room) = user.current_room() {
                    let outcome = room.on_user_leave(&user).await;
                    self.handle_outcome(&room, outcome).await;
                }
            }
            info!(session = %session.id, user = user.id, "connection lost");
        } else {
            info!(session = %session.id, "connection lost");
        }
    }

    /// Admin relocation of a disconnected user into another room.
    pub async fn move_user(
        &self,
        user_id: i32,
        room_id: &str,
        monitor: bool,
    ) -> Result<(), &'static str> {
        let user = self
            .users
            .get(&user_id)
            .map(|user| user.clone())
            .ok_or("user-not-found")?;
        if user.is_online() {
            return Err("user-online");
        }
        let target = self
            .rooms
            .get(room_id)
            .map(|room| room.clone())
            .ok_or("room-not-found")?;
        if let Some(source) = user.current_room() {
            let outcome = source.on_user_leave(&user).await;
            self.handle_outcome(&source, outcome).await;
        }
        target
            .add_user(&user, monitor, true)
            .await
            .map_err(|reason| match reason.as_str() {
                "room is full" => "room-full",
                "game already started" => "wrong-state",
                "not in the contest whitelist" => "not-whitelisted",
                _ => "cannot-join",
            })?;
        self.emit_admin_update();
        Ok(())
    }

    /// Chat from the system user to every connected session, roomed or not.
    pub fn broadcast_chat(&self, content: &str) {
        let command = ServerCommand::Message(Message::Chat {
            user: SYSTEM_USER_ID,
            content: content.to_string(),
        });
        for session in self.sessions.iter() {
            session.connection.send(command.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> Arc<ServerState> {
        let mut config = Config::default();
        config.home = std::env::temp_dir().join("phira_mp_state_tests");
        ServerState::new(config)
    }

    #[test]
    fn system_user_is_preinserted() {
        let state = test_state();
        assert!(state.users.contains_key(&SYSTEM_USER_ID));
        assert_eq!(state.user_count(), 0);
    }

    #[test]
    fn random_room_ids_are_six_decimal_digits() {
        let state = test_state();
        for _ in 0..32 {
            let id = state.random_room_id();
            assert_eq!(id.len(), 6);
            assert!(id.chars().all(|c| c.is_ascii_digit()));
            assert!(id.parse::<u32>().unwrap() >= 100_000);
        }
    }

    #[tokio::test]
    async fn recruiting_pick_skips_locked_rooms() {
        let state = test_state();
        let host = User::new(1, "host".into());
        let room = Room::new(state.env.clone(), "111111".into(), &host);
        host.set_room(&room);
        state.rooms.insert(room.id.clone(), room.clone());
        assert_eq!(
            state.pick_recruiting_room().await.unwrap().id,
            "111111"
        );
        room.set_lock(&host, true).await.unwrap();
        assert!(state.pick_recruiting_room().await.is_none());
    }

    #[tokio::test]
    async fn destroying_a_room_unbinds_monitors() {
        let state = test_state();
        let host = User::new(1, "host".into());
        let room = Room::new(state.env.clone(), "222222".into(), &host);
        host.set_room(&room);
        state.rooms.insert(room.id.clone(), room.clone());
        let monitor = User::new(9, "watcher".into());
        room.add_user(&monitor, true, false).await.unwrap();

        let outcome = room.on_user_leave(&host).await;
        state.handle_outcome(&room, outcome).await;
        assert!(!state.rooms.contains_key("222222"));
        assert!(monitor.current_room().is_none());
        assert!(host.current_room().is_none());
    }

    #[tokio::test]
    async fn move_user_places_a_disconnected_user() {
        let state = test_state();
        let host = User::new(1, "host".into());
        let room = Room::new(state.env.clone(), "333333".into(), &host);
        host.set_room(&room);
        state.rooms.insert(room.id.clone(), room.clone());

        assert_eq!(
            state.move_user(5, "333333", false).await,
            Err("user-not-found")
        );
        let drifter = User::new(5, "drifter".into());
        state.users.insert(5, drifter.clone());
        assert_eq!(
            state.move_user(5, "444444", false).await,
            Err("room-not-found")
        );
        state.move_user(5, "333333", false).await.unwrap();
        assert_eq!(drifter.current_room().unwrap().id, "333333");

        // moving again relocates out of the source room first
        let other_host = User::new(2, "other".into());
        let other = Room::new(state.env.clone(), "555555".into(), &other_host);
        other_host.set_room(&other);
        state.rooms.insert(other.id.clone(), other.clone());
        state.move_user(5, "555555", true).await.unwrap();
        assert_eq!(drifter.current_room().unwrap().id, "555555");
        let snapshot = room.snapshot().await;
        assert!(!snapshot.players.iter().any(|(id, _)| *id == 5));
    }
}
