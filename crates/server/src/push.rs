//! Realtime telemetry push over WebSocket.
//!
//! Rooms and the server registry emit [`PushEvent`]s on a channel; a worker
//! task snapshots the affected state and fans JSON frames out to the
//! subscribed clients. Clients are either room subscribers (one room at a
//! time) or admin subscribers (all-rooms snapshots).

use crate::room::RoomSnapshot;
use crate::state::ServerState;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use chrono::Utc;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use phira_mp_proto::RoomState;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// A client is closed once it has been silent for longer than this; the
/// sweep runs on the same period.
pub const WS_HEARTBEAT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub enum PushEvent {
    RoomUpdate(String),
    RoomLog(String, String),
    AdminUpdate,
}

pub struct PushClient {
    pub id: u64,
    sender: parking_lot::Mutex<Option<mpsc::UnboundedSender<String>>>,
    pub room: parking_lot::Mutex<Option<String>>,
    pub admin: AtomicBool,
    last_activity: parking_lot::Mutex<Instant>,
}

impl PushClient {
    fn send_value(&self, value: &Value) {
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(value.to_string());
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Dropping the sender ends the client's socket loop.
    fn close(&self) {
        self.sender.lock().take();
    }
}

#[derive(Default)]
pub struct PushHub {
    clients: DashMap<u64, Arc<PushClient>>,
    next_id: AtomicU64,
}

impl PushHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self) -> (Arc<PushClient>, mpsc::UnboundedReceiver<String>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let client = Arc::new(PushClient {
            id,
            sender: parking_lot::Mutex::new(Some(sender)),
            room: parking_lot::Mutex::new(None),
            admin: AtomicBool::new(false),
            last_activity: parking_lot::Mutex::new(Instant::now()),
        });
        self.clients.insert(id, client.clone());
        (client, receiver)
    }

    fn unregister(&self, id: u64) {
        self.clients.remove(&id);
    }

    pub fn send_room(&self, room_id: &str, value: &Value) {
        for client in self.clients.iter() {
            if client.room.lock().as_deref() == Some(room_id) {
                client.send_value(value);
            }
        }
    }

    pub fn send_admins(&self, value: &Value) {
        for client in self.clients.iter() {
            if client.admin.load(Ordering::Relaxed) {
                client.send_value(value);
            }
        }
    }

    /// Ping every client and close the ones that have gone silent.
    pub fn heartbeat_sweep(&self) {
        let ping = json!({ "type": "ping" });
        let mut expired = Vec::new();
        for client in self.clients.iter() {
            if client.idle_for() > WS_HEARTBEAT {
                expired.push(client.id);
                client.close();
            } else {
                client.send_value(&ping);
            }
        }
        for id in expired {
            debug!(client = id, "ws client timed out");
            self.clients.remove(&id);
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

fn state_name(state: RoomState) -> &'static str {
    match state {
        RoomState::SelectChart => "SelectChart",
        RoomState::WaitingForReady => "WaitingForReady",
        RoomState::Playing => "Playing",
    }
}

/// Room object shared by `GET /rooms` and the `room_update` push.
pub fn room_json(snapshot: &RoomSnapshot) -> Value {
    let players: Vec<Value> = snapshot
        .players
        .iter()
        .map(|(id, name)| json!({ "id": id, "name": name, "isMonitor": false }))
        .chain(
            snapshot
                .monitors
                .iter()
                .map(|(id, name)| json!({ "id": id, "name": name, "isMonitor": true })),
        )
        .collect();
    json!({
        "id": snapshot.id,
        "state": state_name(snapshot.state),
        "hostId": snapshot.host_id,
        "hostName": snapshot.host_name,
        "playerCount": snapshot.players.len(),
        "monitorCount": snapshot.monitors.len(),
        "isLocked": snapshot.locked,
        "isCycle": snapshot.cycle,
        "isLive": snapshot.live,
        "isRecruiting": snapshot.recruiting,
        "selectedChartId": snapshot.chart,
        "players": players,
    })
}

/// Richer per-room object for admin subscribers and `GET /admin/rooms`.
pub fn admin_room_json(snapshot: &RoomSnapshot) -> Value {
    let mut value = room_json(snapshot);
    if let Value::Object(object) = &mut value {
        object.insert("maxPlayers".into(), json!(snapshot.max_players));
        object.insert("isContest".into(), json!(snapshot.contest));
    }
    value
}

async fn room_update_value(state: &ServerState, room_id: &str) -> Option<Value> {
    let room = state.rooms.get(room_id)?.clone();
    let snapshot = room.snapshot().await;
    Some(json!({ "type": "room_update", "data": room_json(&snapshot) }))
}

pub async fn admin_update_value(state: &ServerState) -> Value {
    let mut rooms = Vec::new();
    let handles: Vec<_> = state.rooms.iter().map(|room| room.clone()).collect();
    for room in handles {
        rooms.push(admin_room_json(&room.snapshot().await));
    }
    json!({ "type": "admin_update", "data": { "rooms": rooms } })
}

/// Consumes room/admin events and fans them out to subscribers.
pub async fn run_push_worker(state: Arc<ServerState>, mut events: mpsc::UnboundedReceiver<PushEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            PushEvent::RoomUpdate(room_id) => {
                if let Some(value) = room_update_value(&state, &room_id).await {
                    state.push.send_room(&room_id, &value);
                }
            }
            PushEvent::RoomLog(room_id, message) => {
                let value = json!({
                    "type": "room_log",
                    "data": { "time": Utc::now().to_rfc3339(), "message": message },
                });
                state.push.send_room(&room_id, &value);
            }
            PushEvent::AdminUpdate => {
                let value = admin_update_value(&state).await;
                state.push.send_admins(&value);
            }
        }
    }
}

fn admin_token_accepted(state: &ServerState, token: &str, ip: SocketAddr) -> bool {
    if state
        .config
        .admin_token
        .as_deref()
        .is_some_and(|admin| admin == token)
    {
        return true;
    }
    if state
        .config
        .view_token
        .as_deref()
        .is_some_and(|view| view == token)
    {
        return true;
    }
    state.trust.validate_temp_token(token, ip.ip())
}

async fn handle_client_text(state: &Arc<ServerState>, client: &Arc<PushClient>, peer: SocketAddr, text: &str) {
    let Ok(message) = serde_json::from_str::<Value>(text) else {
        client.send_value(&json!({ "type": "error", "message": "invalid json" }));
        return;
    };
    match message.get("type").and_then(Value::as_str) {
        Some("ping") => {
            client.touch();
            client.send_value(&json!({ "type": "pong" }));
        }
        Some("subscribe") => {
            client.touch();
            let Some(room_id) = message.get("roomId").and_then(Value::as_str) else {
                client.send_value(&json!({ "type": "error", "message": "roomId required" }));
                return;
            };
            if !state.rooms.contains_key(room_id) {
                client.send_value(&json!({ "type": "error", "message": "room not found" }));
                return;
            }
            *client.room.lock() = Some(room_id.to_string());
            client.send_value(&json!({ "type": "subscribed", "roomId": room_id }));
            if let Some(update) = room_update_value(state, room_id).await {
                client.send_value(&update);
            }
        }
        Some("unsubscribe") => {
            client.touch();
            *client.room.lock() = None;
            client.send_value(&json!({ "type": "unsubscribed" }));
        }
        Some("admin_subscribe") => {
            client.touch();
            let token = message.get("token").and_then(Value::as_str).unwrap_or("");
            if admin_token_accepted(state, token, peer) {
                client.admin.store(true, Ordering::Relaxed);
                client.send_value(&json!({ "type": "admin_subscribed" }));
                client.send_value(&admin_update_value(state).await);
                info!(client = client.id, "admin ws subscriber attached");
            } else {
                client.send_value(&json!({ "type": "error", "message": "invalid token" }));
            }
        }
        Some("admin_unsubscribe") => {
            client.touch();
            client.admin.store(false, Ordering::Relaxed);
            client.send_value(&json!({ "type": "admin_unsubscribed" }));
        }
        _ => {
            client.send_value(&json!({ "type": "error", "message": "unknown message type" }));
        }
    }
}

pub async fn handle_socket(state: Arc<ServerState>, socket: WebSocket, peer: SocketAddr) {
    let (client, mut outgoing) = state.push.register();
    debug!(client = client.id, %peer, "ws client connected");
    let (mut ws_tx, mut ws_rx) = socket.split();
    loop {
        tokio::select! {
            queued = outgoing.recv() => match queued {
                Some(text) => {
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                // the hub closed us (heartbeat timeout)
                None => break,
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    handle_client_text(&state, &client, peer, text.as_str()).await;
                }
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => client.touch(),
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    debug!(client = client.id, %error, "ws read error");
                    break;
                }
            },
        }
    }
    state.push.unregister(client.id);
    debug!(client = client.id, "ws client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> RoomSnapshot {
        RoomSnapshot {
            id: "652398".into(),
            state: RoomState::WaitingForReady,
            host_id: 42,
            host_name: "A".into(),
            locked: false,
            cycle: true,
            live: true,
            recruiting: true,
            contest: false,
            max_players: 8,
            chart: Some(100),
            players: vec![(42, "A".into()), (43, "B".into())],
            monitors: vec![(99, "obs".into())],
        }
    }

    #[test]
    fn room_json_shape() {
        let value = room_json(&snapshot());
        assert_eq!(value["id"], "652398");
        assert_eq!(value["state"], "WaitingForReady");
        assert_eq!(value["hostId"], 42);
        assert_eq!(value["hostName"], "A");
        assert_eq!(value["playerCount"], 2);
        assert_eq!(value["monitorCount"], 1);
        assert_eq!(value["isLive"], true);
        assert_eq!(value["selectedChartId"], 100);
        assert_eq!(value["players"].as_array().unwrap().len(), 3);
        assert_eq!(value["players"][2]["isMonitor"], true);
    }

    #[test]
    fn admin_room_json_adds_admin_fields() {
        let value = admin_room_json(&snapshot());
        assert_eq!(value["maxPlayers"], 8);
        assert_eq!(value["isContest"], false);
    }

    #[tokio::test]
    async fn hub_routes_by_subscription() {
        let hub = PushHub::new();
        let (room_client, mut room_rx) = hub.register();
        let (admin_client, mut admin_rx) = hub.register();
        let (idle_client, mut idle_rx) = hub.register();
        *room_client.room.lock() = Some("652398".into());
        admin_client.admin.store(true, Ordering::Relaxed);

        hub.send_room("652398", &json!({ "n": 1 }));
        hub.send_admins(&json!({ "n": 2 }));

        assert_eq!(room_rx.recv().await.unwrap(), r#"{"n":1}"#);
        assert_eq!(admin_rx.recv().await.unwrap(), r#"{"n":2}"#);
        assert!(idle_rx.try_recv().is_err());
        let _ = idle_client;
    }

    #[tokio::test]
    async fn heartbeat_sweep_closes_idle_clients() {
        let hub = PushHub::new();
        let (client, mut rx) = hub.register();
        *client.last_activity.lock() = Instant::now() - WS_HEARTBEAT - Duration::from_secs(1);
        hub.heartbeat_sweep();
        assert_eq!(hub.client_count(), 0);
        // channel closed: the socket loop would now terminate
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn heartbeat_sweep_pings_live_clients() {
        let hub = PushHub::new();
        let (_client, mut rx) = hub.register();
        hub.heartbeat_sweep();
        assert_eq!(hub.client_count(), 1);
        let text = rx.recv().await.unwrap();
        assert_eq!(text, r#"{"type":"ping"}"#);
    }
}
