//! Room state machine: membership, readiness, results, host succession and
//! the chart-select → ready-up → play → end lifecycle.
//!
//! Every mutating operation takes the room mutex for the whole transition
//! and performs its broadcasts while the lock is held, so each recipient
//! observes events in transition order. Cross-room operations never hold two
//! room locks at once.

use crate::push::PushEvent;
use crate::replay::ReplayWriter;
use crate::state::User;
use phira_mp_proto::{
    ClientRoomState, JoinRoomResponse, Judgement, Message, RoomState, ServerCommand, TouchFrame,
    UserInfo,
};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

pub const DEFAULT_MAX_PLAYERS: usize = 32678;

/// Shared hooks a room needs from the rest of the server: the telemetry
/// event channel plus the replay recording switch. Holding these instead of
/// the server state avoids a back-reference cycle.
pub struct RoomEnv {
    pub push: mpsc::UnboundedSender<PushEvent>,
    pub replay_enabled: AtomicBool,
    pub record_dir: PathBuf,
}

/// Follow-up the caller must apply through the server registry once the room
/// lock has been released.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomOutcome {
    None,
    /// The last player left; drop the room.
    Destroy,
    /// A contest play finished; disband the room.
    DisbandContest,
}

#[derive(Debug, Clone, Copy)]
pub struct PlayResult {
    pub score: i32,
    pub accuracy: f32,
    pub full_combo: bool,
}

/// Read-only projection for the HTTP views and telemetry push.
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub id: String,
    pub state: RoomState,
    pub host_id: i32,
    pub host_name: String,
    pub locked: bool,
    pub cycle: bool,
    pub live: bool,
    pub recruiting: bool,
    pub contest: bool,
    pub max_players: usize,
    pub chart: Option<i32>,
    pub players: Vec<(i32, String)>,
    pub monitors: Vec<(i32, String)>,
}

struct RoomInner {
    players: Vec<Arc<User>>,
    monitors: Vec<Arc<User>>,
    host: i32,
    state: RoomState,
    chart: Option<i32>,
    locked: bool,
    cycle: bool,
    recruiting: bool,
    live: bool,
    contest: bool,
    max_players: usize,
    whitelist: HashSet<i64>,
    ready: HashSet<i32>,
    results: HashMap<i32, PlayResult>,
    record_ids: HashMap<i32, i32>,
    aborted: HashSet<i32>,
}

impl RoomInner {
    fn members(&self) -> impl Iterator<Item = &Arc<User>> {
        self.players.iter().chain(self.monitors.iter())
    }

    fn is_member(&self, user_id: i32) -> bool {
        self.members().any(|member| member.id == user_id)
    }

    fn is_player(&self, user_id: i32) -> bool {
        self.players.iter().any(|player| player.id == user_id)
    }

    fn broadcast(&self, command: ServerCommand) {
        for member in self.members() {
            member.send(command.clone());
        }
    }

    fn member_infos(&self) -> Vec<UserInfo> {
        self.members().map(|member| member.info()).collect()
    }

    fn require_host(&self, user_id: i32) -> Result<(), String> {
        if self.host == user_id {
            Ok(())
        } else {
            Err("only the host can do this".to_string())
        }
    }

    fn all_ready(&self) -> bool {
        self.members().all(|member| self.ready.contains(&member.id))
    }

    /// The play is over once every player has either reported a result or
    /// aborted.
    fn all_played(&self) -> bool {
        !self.players.is_empty()
            && self
                .players
                .iter()
                .all(|player| {
                    self.results.contains_key(&player.id) || self.aborted.contains(&player.id)
                })
    }
}

pub struct Room {
    pub id: String,
    env: Arc<RoomEnv>,
    inner: Mutex<RoomInner>,
}

fn log_text(message: &Message) -> String {
    match message {
        Message::Chat { user, content } => format!("[{user}] {content}"),
        Message::CreateRoom { user } => format!("room created by {user}"),
        Message::JoinRoom { user, name } => format!("{name} ({user}) joined"),
        Message::LeaveRoom { user, name } => format!("{name} ({user}) left"),
        Message::NewHost { user } => format!("{user} is now the host"),
        Message::SelectChart { user, name, id } => {
            format!("{user} selected chart {name} ({id})")
        }
        Message::GameStart { user } => format!("{user} started the game"),
        Message::Ready { user } => format!("{user} is ready"),
        Message::CancelReady { user } => format!("{user} cancelled ready"),
        Message::CancelGame { user } => format!("{user} cancelled the game"),
        Message::StartPlaying => "playing".to_string(),
        Message::Played {
            user,
            score,
            accuracy,
            ..
        } => format!("{user} played: {score} ({accuracy:.2})"),
        Message::GameEnd => "game ended".to_string(),
        Message::Abort { user } => format!("{user} aborted"),
        Message::LockRoom { lock } => format!("room {}", if *lock { "locked" } else { "unlocked" }),
        Message::CycleRoom { cycle } => {
            format!("cycle mode {}", if *cycle { "on" } else { "off" })
        }
    }
}

impl Room {
    /// Builds a room with its creator as host and sole player. The caller
    /// owns registry insertion and the user's room binding.
    pub fn new(env: Arc<RoomEnv>, id: String, host: &Arc<User>) -> Arc<Self> {
        Arc::new(Self {
            id,
            env,
            inner: Mutex::new(RoomInner {
                players: vec![host.clone()],
                monitors: Vec::new(),
                host: host.id,
                state: RoomState::SelectChart,
                chart: None,
                locked: false,
                cycle: false,
                recruiting: true,
                live: false,
                contest: false,
                max_players: DEFAULT_MAX_PLAYERS,
                whitelist: HashSet::new(),
                ready: HashSet::new(),
                results: HashMap::new(),
                record_ids: HashMap::new(),
                aborted: HashSet::new(),
            }),
        })
    }

    fn push_update(&self) {
        let _ = self.env.push.send(PushEvent::RoomUpdate(self.id.clone()));
    }

    fn broadcast_message(&self, inner: &RoomInner, message: Message) {
        let text = log_text(&message);
        inner.broadcast(ServerCommand::Message(message));
        let _ = self
            .env
            .push
            .send(PushEvent::RoomLog(self.id.clone(), text));
    }

    pub async fn announce_created(&self, host: &Arc<User>) {
        let inner = self.inner.lock().await;
        self.broadcast_message(&inner, Message::CreateRoom { user: host.id });
        self.push_update();
    }

    /// Monitors are always admitted (and mark the room live); players are
    /// gated by the contest whitelist, capacity, lock and lifecycle phase.
    pub async fn add_user(
        self: &Arc<Self>,
        user: &Arc<User>,
        monitor: bool,
        via_admin: bool,
    ) -> Result<JoinRoomResponse, String> {
        let mut inner = self.inner.lock().await;
        if inner.is_member(user.id) {
            return Err("already in this room".to_string());
        }
        if monitor {
            inner.live = true;
        } else {
            if inner.contest && !inner.whitelist.contains(&i64::from(user.id)) {
                return Err("not in the contest whitelist".to_string());
            }
            if inner.players.len() >= inner.max_players {
                return Err("room is full".to_string());
            }
            if !via_admin && inner.locked {
                return Err("room is locked".to_string());
            }
            if inner.state != RoomState::SelectChart {
                return Err("game already started".to_string());
            }
        }
        let name = user.display_name();
        self.broadcast_message(
            &inner,
            Message::JoinRoom {
                user: user.id,
                name,
            },
        );
        user.monitor.store(monitor, Ordering::Relaxed);
        inner.broadcast(ServerCommand::OnJoinRoom(user.info()));
        if monitor {
            inner.monitors.push(user.clone());
        } else {
            inner.players.push(user.clone());
        }
        user.set_room(self);
        let response = JoinRoomResponse {
            state: inner.state,
            users: inner.member_infos(),
            live: inner.live,
        };
        self.push_update();
        Ok(response)
    }

    /// Leave protocol: broadcast, drop membership, promote a new host if
    /// needed, then re-evaluate readiness or completion for the remaining
    /// members.
    pub async fn on_user_leave(&self, user: &Arc<User>) -> RoomOutcome {
        let mut inner = self.inner.lock().await;
        if !inner.is_member(user.id) {
            return RoomOutcome::None;
        }
        self.broadcast_message(
            &inner,
            Message::LeaveRoom {
                user: user.id,
                name: user.display_name(),
            },
        );
        inner.players.retain(|player| player.id != user.id);
        inner.monitors.retain(|monitor| monitor.id != user.id);
        inner.ready.remove(&user.id);
        inner.results.remove(&user.id);
        inner.record_ids.remove(&user.id);
        inner.aborted.remove(&user.id);
        user.clear_room();
        user.monitor.store(false, Ordering::Relaxed);

        if inner.players.is_empty() {
            return RoomOutcome::Destroy;
        }
        if inner.host == user.id {
            let new_host = inner.players[0].clone();
            inner.host = new_host.id;
            new_host.send(ServerCommand::ChangeHost(true));
            self.broadcast_message(&inner, Message::NewHost { user: new_host.id });
        }
        let outcome = match inner.state {
            RoomState::WaitingForReady => {
                self.check_ready(&mut inner).await;
                RoomOutcome::None
            }
            RoomState::Playing => self.check_played(&mut inner).await,
            RoomState::SelectChart => RoomOutcome::None,
        };
        self.push_update();
        outcome
    }

    pub async fn chat(&self, user: &Arc<User>, content: String) -> Result<(), String> {
        let inner = self.inner.lock().await;
        if !inner.is_member(user.id) {
            return Err("not in this room".to_string());
        }
        self.broadcast_message(
            &inner,
            Message::Chat {
                user: user.id,
                content,
            },
        );
        Ok(())
    }

    /// Server-originated chat, attributed to the system user.
    pub async fn system_chat(&self, content: String) {
        let inner = self.inner.lock().await;
        self.broadcast_message(&inner, Message::Chat { user: 0, content });
    }

    pub async fn set_lock(&self, user: &Arc<User>, lock: bool) -> Result<(), String> {
        let mut inner = self.inner.lock().await;
        inner.require_host(user.id)?;
        inner.locked = lock;
        inner.recruiting = !lock;
        self.broadcast_message(&inner, Message::LockRoom { lock });
        self.push_update();
        Ok(())
    }

    pub async fn set_cycle(&self, user: &Arc<User>, cycle: bool) -> Result<(), String> {
        let mut inner = self.inner.lock().await;
        inner.require_host(user.id)?;
        inner.cycle = cycle;
        self.broadcast_message(&inner, Message::CycleRoom { cycle });
        self.push_update();
        Ok(())
    }

    /// The chart display name is resolved by the caller before the lock is
    /// taken; metadata lookup never blocks a transition.
    pub async fn select_chart(
        &self,
        user: &Arc<User>,
        chart_id: i32,
        chart_name: String,
    ) -> Result<(), String> {
        let mut inner = self.inner.lock().await;
        inner.require_host(user.id)?;
        if inner.state != RoomState::SelectChart {
            return Err("cannot select a chart now".to_string());
        }
        inner.chart = Some(chart_id);
        self.broadcast_message(
            &inner,
            Message::SelectChart {
                user: user.id,
                name: chart_name,
                id: chart_id,
            },
        );
        self.push_update();
        Ok(())
    }

    pub async fn request_start(&self, user: &Arc<User>) -> Result<(), String> {
        let mut inner = self.inner.lock().await;
        inner.require_host(user.id)?;
        if inner.state != RoomState::SelectChart {
            return Err("game already started".to_string());
        }
        if inner.chart.is_none() {
            return Err("no chart selected".to_string());
        }
        inner.ready.insert(user.id);
        self.broadcast_message(&inner, Message::GameStart { user: user.id });
        inner.state = RoomState::WaitingForReady;
        inner.broadcast(ServerCommand::ChangeState {
            state: RoomState::WaitingForReady,
            chart: None,
        });
        self.check_ready(&mut inner).await;
        self.push_update();
        Ok(())
    }

    pub async fn ready(&self, user: &Arc<User>) -> Result<(), String> {
        let mut inner = self.inner.lock().await;
        if !inner.is_member(user.id) {
            return Err("not in this room".to_string());
        }
        if inner.state != RoomState::WaitingForReady {
            return Err("not in the ready phase".to_string());
        }
        inner.ready.insert(user.id);
        self.broadcast_message(&inner, Message::Ready { user: user.id });
        self.check_ready(&mut inner).await;
        self.push_update();
        Ok(())
    }

    /// The host cancelling tears the ready phase down; anyone else merely
    /// retracts their own readiness.
    pub async fn cancel_ready(&self, user: &Arc<User>) -> Result<(), String> {
        let mut inner = self.inner.lock().await;
        if !inner.is_member(user.id) {
            return Err("not in this room".to_string());
        }
        if inner.state != RoomState::WaitingForReady {
            return Err("not in the ready phase".to_string());
        }
        if inner.host == user.id {
            inner.ready.clear();
            self.broadcast_message(&inner, Message::CancelGame { user: user.id });
            inner.state = RoomState::SelectChart;
            let chart = inner.chart;
            inner.broadcast(ServerCommand::ChangeState {
                state: RoomState::SelectChart,
                chart,
            });
        } else {
            inner.ready.remove(&user.id);
            self.broadcast_message(&inner, Message::CancelReady { user: user.id });
        }
        self.push_update();
        Ok(())
    }

    pub async fn played(
        &self,
        user: &Arc<User>,
        record_id: i32,
        result: PlayResult,
    ) -> Result<RoomOutcome, String> {
        let mut inner = self.inner.lock().await;
        if inner.state != RoomState::Playing {
            return Err("not playing".to_string());
        }
        if !inner.is_player(user.id) {
            return Err("not a player in this room".to_string());
        }
        if inner.results.contains_key(&user.id) {
            return Err("result already submitted".to_string());
        }
        inner.results.insert(user.id, result);
        inner.record_ids.insert(user.id, record_id);
        {
            let mut replay = user.replay.lock().await;
            if let Some(writer) = replay.as_mut() {
                writer.update_record_id(record_id as u32).await;
            }
        }
        self.broadcast_message(
            &inner,
            Message::Played {
                user: user.id,
                score: result.score,
                accuracy: result.accuracy,
                full_combo: result.full_combo,
            },
        );
        let outcome = self.check_played(&mut inner).await;
        self.push_update();
        Ok(outcome)
    }

    pub async fn abort(&self, user: &Arc<User>) -> Result<RoomOutcome, String> {
        let mut inner = self.inner.lock().await;
        if inner.state != RoomState::Playing {
            return Err("not playing".to_string());
        }
        if !inner.is_player(user.id) {
            return Err("not a player in this room".to_string());
        }
        inner.aborted.insert(user.id);
        self.broadcast_message(&inner, Message::Abort { user: user.id });
        let outcome = self.check_played(&mut inner).await;
        self.push_update();
        Ok(outcome)
    }

    /// Admin-forced start: without `force` every member must be ready.
    pub async fn force_start(&self, force: bool) -> Result<(), String> {
        let mut inner = self.inner.lock().await;
        if inner.state != RoomState::WaitingForReady {
            return Err("room is not waiting for ready".to_string());
        }
        if !force && !inner.all_ready() {
            return Err("not everyone is ready".to_string());
        }
        self.start_playing(&mut inner).await;
        self.push_update();
        Ok(())
    }

    /// Relay a player's live input stream to the room's monitors.
    pub async fn relay_touches(&self, player: i32, frames: Vec<TouchFrame>) {
        let inner = self.inner.lock().await;
        if inner.state != RoomState::Playing || inner.monitors.is_empty() {
            return;
        }
        let command = ServerCommand::Touches { player, frames };
        for monitor in &inner.monitors {
            monitor.send(command.clone());
        }
    }

    pub async fn relay_judgements(&self, player: i32, judgements: Vec<Judgement>) {
        let inner = self.inner.lock().await;
        if inner.state != RoomState::Playing || inner.monitors.is_empty() {
            return;
        }
        let command = ServerCommand::Judges {
            player,
            judgements,
        };
        for monitor in &inner.monitors {
            monitor.send(command.clone());
        }
    }

    async fn check_ready(&self, inner: &mut RoomInner) {
        if inner.state == RoomState::WaitingForReady && !inner.contest && inner.all_ready() {
            self.start_playing(inner).await;
        }
    }

    async fn start_playing(&self, inner: &mut RoomInner) {
        inner.results.clear();
        inner.record_ids.clear();
        inner.aborted.clear();
        if self.env.replay_enabled.load(Ordering::Relaxed) {
            if let Some(chart) = inner.chart {
                for player in &inner.players {
                    match ReplayWriter::create(&self.env.record_dir, player.id, chart).await {
                        Ok(writer) => *player.replay.lock().await = Some(writer),
                        Err(error) => {
                            warn!(room = %self.id, player = player.id, %error, "replay writer start failed");
                        }
                    }
                }
            }
        }
        self.broadcast_message(inner, Message::StartPlaying);
        inner.state = RoomState::Playing;
        inner.broadcast(ServerCommand::ChangeState {
            state: RoomState::Playing,
            chart: None,
        });
    }

    async fn check_played(&self, inner: &mut RoomInner) -> RoomOutcome {
        if inner.state != RoomState::Playing || !inner.all_played() {
            return RoomOutcome::None;
        }
        for player in &inner.players {
            let mut replay = player.replay.lock().await;
            if let Some(writer) = replay.as_mut() {
                writer.dispose().await;
            }
            *replay = None;
        }
        self.broadcast_message(inner, Message::GameEnd);
        if inner.contest {
            info!(room = %self.id, "contest play finished, room will be disbanded");
            return RoomOutcome::DisbandContest;
        }
        inner.ready.clear();
        inner.results.clear();
        inner.record_ids.clear();
        inner.aborted.clear();
        if inner.cycle && inner.players.len() >= 2 {
            let host_index = inner
                .players
                .iter()
                .position(|player| player.id == inner.host)
                .unwrap_or(0);
            let next_index = (host_index + 1) % inner.players.len();
            let old_host = inner.players[host_index].clone();
            let new_host = inner.players[next_index].clone();
            inner.host = new_host.id;
            old_host.send(ServerCommand::ChangeHost(false));
            new_host.send(ServerCommand::ChangeHost(true));
            self.broadcast_message(&*inner, Message::NewHost { user: new_host.id });
        }
        inner.state = RoomState::SelectChart;
        let chart = inner.chart;
        inner.broadcast(ServerCommand::ChangeState {
            state: RoomState::SelectChart,
            chart,
        });
        RoomOutcome::None
    }

    pub async fn client_state(&self, user: &Arc<User>) -> ClientRoomState {
        let inner = self.inner.lock().await;
        ClientRoomState {
            id: self.id.clone(),
            state: inner.state,
            live: inner.live,
            locked: inner.locked,
            cycle: inner.cycle,
            is_host: inner.host == user.id,
            is_ready: inner.ready.contains(&user.id),
            users: inner
                .members()
                .map(|member| (member.id, member.info()))
                .collect(),
            chart: inner.chart,
        }
    }

    pub async fn snapshot(&self) -> RoomSnapshot {
        let inner = self.inner.lock().await;
        let host_name = inner
            .players
            .iter()
            .find(|player| player.id == inner.host)
            .map(|player| player.display_name())
            .unwrap_or_default();
        RoomSnapshot {
            id: self.id.clone(),
            state: inner.state,
            host_id: inner.host,
            host_name,
            locked: inner.locked,
            cycle: inner.cycle,
            live: inner.live,
            recruiting: inner.recruiting,
            contest: inner.contest,
            max_players: inner.max_players,
            chart: inner.chart,
            players: inner
                .players
                .iter()
                .map(|player| (player.id, player.display_name()))
                .collect(),
            monitors: inner
                .monitors
                .iter()
                .map(|monitor| (monitor.id, monitor.display_name()))
                .collect(),
        }
    }

    /// Whether random matchmaking may place a player here.
    pub async fn recruitable(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.recruiting
            && !inner.locked
            && inner.state == RoomState::SelectChart
            && inner.players.len() < inner.max_players
    }

    pub async fn set_max_players(&self, max_players: usize) {
        let mut inner = self.inner.lock().await;
        inner.max_players = max_players;
        self.push_update();
    }

    pub async fn set_contest(&self, enabled: bool, whitelist: Option<HashSet<i64>>) {
        let mut inner = self.inner.lock().await;
        inner.contest = enabled;
        if let Some(whitelist) = whitelist {
            inner.whitelist = whitelist;
        }
        self.push_update();
    }

    pub async fn set_whitelist(&self, whitelist: HashSet<i64>) {
        let mut inner = self.inner.lock().await;
        inner.whitelist = whitelist;
        self.push_update();
    }

    /// Empties the room for disband, returning every former member. The
    /// caller clears the users' room bindings.
    pub async fn take_members(&self) -> Vec<Arc<User>> {
        let mut inner = self.inner.lock().await;
        let mut members: Vec<_> = inner.players.drain(..).collect();
        members.extend(inner.monitors.drain(..));
        members
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn test_env() -> Arc<RoomEnv> {
        let (push, _rx) = mpsc::unbounded_channel();
        // keep the receiver alive is unnecessary: sends may fail silently
        Arc::new(RoomEnv {
            push,
            replay_enabled: AtomicBool::new(false),
            record_dir: env::temp_dir().join("phira_mp_room_tests"),
        })
    }

    fn user(id: i32) -> Arc<User> {
        User::new(id, format!("user-{id}"))
    }

    async fn room_with_players(env: &Arc<RoomEnv>, ids: &[i32]) -> (Arc<Room>, Vec<Arc<User>>) {
        let users: Vec<_> = ids.iter().map(|id| user(*id)).collect();
        let room = Room::new(env.clone(), "100000".to_string(), &users[0]);
        users[0].set_room(&room);
        for extra in &users[1..] {
            room.add_user(extra, false, false).await.unwrap();
        }
        (room, users)
    }

    async fn play_through(room: &Arc<Room>, users: &[Arc<User>]) -> RoomOutcome {
        room.select_chart(&users[0], 5, "Chart5".into()).await.unwrap();
        room.request_start(&users[0]).await.unwrap();
        for extra in &users[1..] {
            room.ready(extra).await.unwrap();
        }
        let mut outcome = RoomOutcome::None;
        for (index, player) in users.iter().enumerate() {
            outcome = room
                .played(
                    player,
                    1000 + index as i32,
                    PlayResult {
                        score: 900_000,
                        accuracy: 0.98,
                        full_combo: true,
                    },
                )
                .await
                .unwrap();
        }
        outcome
    }

    #[tokio::test]
    async fn host_is_always_a_player() {
        let env = test_env();
        let (room, users) = room_with_players(&env, &[1, 2]).await;
        let snapshot = room.snapshot().await;
        assert_eq!(snapshot.host_id, 1);
        assert!(snapshot.players.iter().any(|(id, _)| *id == snapshot.host_id));

        // host leaves: first remaining player takes over
        let outcome = room.on_user_leave(&users[0]).await;
        assert_eq!(outcome, RoomOutcome::None);
        let snapshot = room.snapshot().await;
        assert_eq!(snapshot.host_id, 2);
        assert!(snapshot.players.iter().any(|(id, _)| *id == 2));
    }

    #[tokio::test]
    async fn last_player_leaving_destroys_the_room() {
        let env = test_env();
        let (room, users) = room_with_players(&env, &[1]).await;
        let monitor = user(9);
        room.add_user(&monitor, true, false).await.unwrap();
        assert_eq!(room.on_user_leave(&users[0]).await, RoomOutcome::Destroy);
    }

    #[tokio::test]
    async fn a_user_joins_a_room_at_most_once() {
        let env = test_env();
        let (room, users) = room_with_players(&env, &[1]).await;
        assert!(room.add_user(&users[0], false, false).await.is_err());
        assert!(room.add_user(&users[0], true, false).await.is_err());
    }

    #[tokio::test]
    async fn contest_mode_gates_players_but_not_monitors() {
        let env = test_env();
        let (room, _users) = room_with_players(&env, &[10]).await;
        room.set_contest(true, Some([10i64, 20i64].into_iter().collect()))
            .await;

        let outsider = user(30);
        assert!(room.add_user(&outsider, false, false).await.is_err());
        let whitelisted = user(20);
        assert!(room.add_user(&whitelisted, false, false).await.is_ok());
        let monitor = user(30);
        let response = room.add_user(&monitor, true, false).await.unwrap();
        assert!(response.live);
    }

    #[tokio::test]
    async fn full_room_rejects_players() {
        let env = test_env();
        let (room, _users) = room_with_players(&env, &[1]).await;
        room.set_max_players(1).await;
        assert_eq!(
            room.add_user(&user(2), false, false).await.unwrap_err(),
            "room is full"
        );
    }

    #[tokio::test]
    async fn ready_set_is_empty_in_select_chart() {
        let env = test_env();
        let (room, users) = room_with_players(&env, &[1, 2]).await;
        room.select_chart(&users[0], 5, "Chart5".into()).await.unwrap();
        room.request_start(&users[0]).await.unwrap();
        room.cancel_ready(&users[0]).await.unwrap();
        let state = room.client_state(&users[0]).await;
        assert_eq!(state.state, RoomState::SelectChart);
        assert!(!state.is_ready);
        assert_eq!(state.chart, Some(5));
    }

    #[tokio::test]
    async fn non_host_cancel_ready_only_retracts_their_flag() {
        let env = test_env();
        let (room, users) = room_with_players(&env, &[1, 2, 3]).await;
        room.select_chart(&users[0], 5, "Chart5".into()).await.unwrap();
        room.request_start(&users[0]).await.unwrap();
        room.ready(&users[1]).await.unwrap();
        room.cancel_ready(&users[1]).await.unwrap();
        let state = room.client_state(&users[1]).await;
        assert_eq!(state.state, RoomState::WaitingForReady);
        assert!(!state.is_ready);
    }

    #[tokio::test]
    async fn all_ready_starts_the_game() {
        let env = test_env();
        let (room, users) = room_with_players(&env, &[1, 2]).await;
        room.select_chart(&users[0], 5, "Chart5".into()).await.unwrap();
        room.request_start(&users[0]).await.unwrap();
        assert_eq!(
            room.client_state(&users[0]).await.state,
            RoomState::WaitingForReady
        );
        room.ready(&users[1]).await.unwrap();
        assert_eq!(room.client_state(&users[0]).await.state, RoomState::Playing);
    }

    #[tokio::test]
    async fn play_completion_returns_to_select_chart() {
        let env = test_env();
        let (room, users) = room_with_players(&env, &[1, 2]).await;
        let outcome = play_through(&room, &users).await;
        assert_eq!(outcome, RoomOutcome::None);
        let snapshot = room.snapshot().await;
        assert_eq!(snapshot.state, RoomState::SelectChart);
        assert_eq!(snapshot.chart, Some(5));
        // results cleared for the next play
        let state = room.client_state(&users[0]).await;
        assert!(!state.is_ready);
    }

    #[tokio::test]
    async fn abort_counts_toward_completion() {
        let env = test_env();
        let (room, users) = room_with_players(&env, &[1, 2]).await;
        room.select_chart(&users[0], 5, "Chart5".into()).await.unwrap();
        room.request_start(&users[0]).await.unwrap();
        room.ready(&users[1]).await.unwrap();
        room.abort(&users[0]).await.unwrap();
        assert_eq!(room.client_state(&users[0]).await.state, RoomState::Playing);
        let outcome = room
            .played(
                &users[1],
                7,
                PlayResult {
                    score: 1,
                    accuracy: 0.1,
                    full_combo: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, RoomOutcome::None);
        assert_eq!(
            room.client_state(&users[0]).await.state,
            RoomState::SelectChart
        );
    }

    #[tokio::test]
    async fn cycle_mode_rotates_the_host() {
        let env = test_env();
        let (room, users) = room_with_players(&env, &[1, 2]).await;
        room.set_cycle(&users[0], true).await.unwrap();
        play_through(&room, &users).await;
        assert_eq!(room.snapshot().await.host_id, 2);
        // and around again
        play_through_with_host(&room, &users, 1).await;
        assert_eq!(room.snapshot().await.host_id, 1);
    }

    async fn play_through_with_host(room: &Arc<Room>, users: &[Arc<User>], host_index: usize) {
        room.select_chart(&users[host_index], 5, "Chart5".into())
            .await
            .unwrap();
        room.request_start(&users[host_index]).await.unwrap();
        for (index, player) in users.iter().enumerate() {
            if index != host_index {
                room.ready(player).await.unwrap();
            }
        }
        for (index, player) in users.iter().enumerate() {
            room.played(
                player,
                2000 + index as i32,
                PlayResult {
                    score: 1,
                    accuracy: 0.5,
                    full_combo: false,
                },
            )
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn contest_play_requests_disband() {
        let env = test_env();
        let (room, users) = room_with_players(&env, &[10, 20]).await;
        room.set_contest(true, Some([10i64, 20i64].into_iter().collect()))
            .await;
        room.select_chart(&users[0], 5, "Chart5".into()).await.unwrap();
        room.request_start(&users[0]).await.unwrap();
        // contest rooms never auto-start
        room.ready(&users[1]).await.unwrap();
        assert_eq!(
            room.client_state(&users[0]).await.state,
            RoomState::WaitingForReady
        );
        room.force_start(false).await.unwrap();
        let mut outcome = RoomOutcome::None;
        for (index, player) in users.iter().enumerate() {
            outcome = room
                .played(
                    player,
                    3000 + index as i32,
                    PlayResult {
                        score: 1,
                        accuracy: 0.5,
                        full_combo: false,
                    },
                )
                .await
                .unwrap();
        }
        assert_eq!(outcome, RoomOutcome::DisbandContest);
    }

    #[tokio::test]
    async fn host_only_operations_are_rejected_for_others() {
        let env = test_env();
        let (room, users) = room_with_players(&env, &[1, 2]).await;
        assert!(room.set_lock(&users[1], true).await.is_err());
        assert!(room.set_cycle(&users[1], true).await.is_err());
        assert!(room
            .select_chart(&users[1], 5, "Chart5".into())
            .await
            .is_err());
        assert!(room.request_start(&users[1]).await.is_err());
    }

    #[tokio::test]
    async fn locking_stops_recruiting() {
        let env = test_env();
        let (room, users) = room_with_players(&env, &[1]).await;
        assert!(room.recruitable().await);
        room.set_lock(&users[0], true).await.unwrap();
        assert!(!room.recruitable().await);
        let snapshot = room.snapshot().await;
        assert!(snapshot.locked);
        assert!(!snapshot.recruiting);
        room.set_lock(&users[0], false).await.unwrap();
        assert!(room.recruitable().await);
    }

    #[tokio::test]
    async fn locked_room_rejects_players_but_admin_bypasses() {
        let env = test_env();
        let (room, users) = room_with_players(&env, &[1]).await;
        room.set_lock(&users[0], true).await.unwrap();
        assert_eq!(
            room.add_user(&user(2), false, false).await.unwrap_err(),
            "room is locked"
        );
        assert!(room.add_user(&user(2), false, true).await.is_ok());
    }
}
