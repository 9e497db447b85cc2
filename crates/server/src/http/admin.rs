//! `/admin` surface: OTP bootstrap, room controls, feature toggles, ban
//! management and contest administration.

use super::{AdminAccess, Failure};
use crate::push::admin_room_json;
use crate::room::Room;
use crate::state::ServerState;
use crate::trust::TEMP_TOKEN_TTL_MILLIS;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const MAX_ADMIN_CHAT_LEN: usize = 200;

pub fn router() -> Router<Arc<ServerState>> {
    Router::new()
        .route("/admin/otp/request", post(otp_request))
        .route("/admin/otp/verify", post(otp_verify))
        .route("/admin/rooms", get(list_rooms))
        .route("/admin/rooms/{id}/max_users", post(set_max_users))
        .route("/admin/rooms/{id}/disband", post(disband_room))
        .route("/admin/rooms/{id}/chat", post(room_chat))
        .route("/admin/broadcast", post(broadcast))
        .route("/admin/replay/config", get(get_replay_config).post(set_replay_config))
        .route(
            "/admin/room-creation/config",
            get(get_room_creation_config).post(set_room_creation_config),
        )
        .route("/admin/ip-blacklist", get(list_blacklist))
        .route("/admin/ip-blacklist/remove", post(remove_blacklisted))
        .route("/admin/ip-blacklist/clear", post(clear_blacklist))
        .route("/admin/users/{id}", get(user_info))
        .route("/admin/ban/user", post(ban_user))
        .route("/admin/ban/room", post(ban_room))
        .route("/admin/users/{id}/disconnect", post(disconnect_user))
        .route("/admin/users/{id}/move", post(move_user))
        .route("/admin/contest/rooms/{id}/config", post(contest_config))
        .route("/admin/contest/rooms/{id}/whitelist", post(contest_whitelist))
        .route("/admin/contest/rooms/{id}/start", post(contest_start))
}

fn ok() -> Json<Value> {
    Json(json!({ "ok": true }))
}

fn lookup_room(state: &ServerState, id: &str) -> Result<Arc<Room>, Failure> {
    state
        .rooms
        .get(id)
        .map(|room| room.clone())
        .ok_or_else(|| Failure::not_found("room-not-found"))
}

// --- OTP bootstrap (only when no permanent token is configured) ---

#[derive(Deserialize)]
struct OtpVerifyRequest {
    ssid: String,
    otp: String,
}

async fn otp_request(State(state): State<Arc<ServerState>>) -> Result<Json<Value>, Failure> {
    if state.config.admin_token.is_some() {
        return Err(Failure::forbidden("otp-disabled"));
    }
    let (ssid, otp) = state.trust.create_otp_request();
    // the OTP is revealed to the operator through the server log only
    info!(%ssid, otp, "admin otp issued");
    Ok(Json(json!({ "ok": true, "ssid": ssid })))
}

async fn otp_verify(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(body): Json<OtpVerifyRequest>,
) -> Result<Json<Value>, Failure> {
    if state.config.admin_token.is_some() {
        return Err(Failure::forbidden("otp-disabled"));
    }
    if state.trust.is_blacklisted(peer.ip()) {
        return Err(Failure::forbidden("blacklisted"));
    }
    let ssid: Uuid = body
        .ssid
        .parse()
        .map_err(|_| Failure::bad_request("invalid-ssid"))?;
    match state.trust.verify_otp(ssid, &body.otp, peer.ip()) {
        Some(token) => Ok(Json(json!({
            "ok": true,
            "token": token,
            "expiresIn": TEMP_TOKEN_TTL_MILLIS,
        }))),
        None => Err(Failure::unauthorized()),
    }
}

// --- rooms ---

async fn list_rooms(
    State(state): State<Arc<ServerState>>,
    _access: AdminAccess,
) -> Json<Value> {
    let rooms: Vec<_> = state.rooms.iter().map(|room| room.clone()).collect();
    let mut entries = Vec::with_capacity(rooms.len());
    for room in rooms {
        entries.push(admin_room_json(&room.snapshot().await));
    }
    Json(json!({ "ok": true, "rooms": entries }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MaxUsersRequest {
    max_users: usize,
}

async fn set_max_users(
    State(state): State<Arc<ServerState>>,
    _access: AdminAccess,
    Path(id): Path<String>,
    Json(body): Json<MaxUsersRequest>,
) -> Result<Json<Value>, Failure> {
    if body.max_users == 0 {
        return Err(Failure::bad_request("bad-request"));
    }
    let room = lookup_room(&state, &id)?;
    room.set_max_players(body.max_users).await;
    state.emit_admin_update();
    Ok(ok())
}

async fn disband_room(
    State(state): State<Arc<ServerState>>,
    _access: AdminAccess,
    Path(id): Path<String>,
) -> Result<Json<Value>, Failure> {
    let room = lookup_room(&state, &id)?;
    state.disband_room(&room, "房间已被管理员解散").await;
    Ok(ok())
}

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
}

async fn room_chat(
    State(state): State<Arc<ServerState>>,
    _access: AdminAccess,
    Path(id): Path<String>,
    Json(body): Json<ChatRequest>,
) -> Result<Json<Value>, Failure> {
    if body.message.chars().count() > MAX_ADMIN_CHAT_LEN {
        return Err(Failure::bad_request("message-too-long"));
    }
    let room = lookup_room(&state, &id)?;
    room.system_chat(body.message).await;
    Ok(ok())
}

async fn broadcast(
    State(state): State<Arc<ServerState>>,
    _access: AdminAccess,
    Json(body): Json<ChatRequest>,
) -> Json<Value> {
    state.broadcast_chat(&body.message);
    ok()
}

// --- feature toggles ---

#[derive(Deserialize)]
struct ToggleRequest {
    enabled: bool,
}

async fn get_replay_config(
    State(state): State<Arc<ServerState>>,
    _access: AdminAccess,
) -> Json<Value> {
    Json(json!({
        "ok": true,
        "enabled": state.env.replay_enabled.load(Ordering::Relaxed),
    }))
}

async fn set_replay_config(
    State(state): State<Arc<ServerState>>,
    _access: AdminAccess,
    Json(body): Json<ToggleRequest>,
) -> Json<Value> {
    state.env.replay_enabled.store(body.enabled, Ordering::Relaxed);
    info!(enabled = body.enabled, "replay recording toggled");
    ok()
}

async fn get_room_creation_config(
    State(state): State<Arc<ServerState>>,
    _access: AdminAccess,
) -> Json<Value> {
    Json(json!({
        "ok": true,
        "enabled": state.room_creation_enabled.load(Ordering::Relaxed),
    }))
}

async fn set_room_creation_config(
    State(state): State<Arc<ServerState>>,
    _access: AdminAccess,
    Json(body): Json<ToggleRequest>,
) -> Json<Value> {
    state
        .room_creation_enabled
        .store(body.enabled, Ordering::Relaxed);
    info!(enabled = body.enabled, "room creation toggled");
    ok()
}

// --- ip blacklist ---

async fn list_blacklist(
    State(state): State<Arc<ServerState>>,
    _access: AdminAccess,
) -> Json<Value> {
    let entries: Vec<_> = state
        .trust
        .blacklist_entries()
        .into_iter()
        .map(|(ip, expires_at)| {
            json!({ "ip": ip.to_string(), "expiresAt": expires_at.to_rfc3339() })
        })
        .collect();
    Json(json!({ "ok": true, "entries": entries }))
}

#[derive(Deserialize)]
struct BlacklistRemoveRequest {
    ip: String,
}

async fn remove_blacklisted(
    State(state): State<Arc<ServerState>>,
    _access: AdminAccess,
    Json(body): Json<BlacklistRemoveRequest>,
) -> Result<Json<Value>, Failure> {
    let ip = body
        .ip
        .parse()
        .map_err(|_| Failure::bad_request("invalid-ip"))?;
    let removed = state.trust.remove_blacklisted(ip);
    Ok(Json(json!({ "ok": true, "removed": removed })))
}

async fn clear_blacklist(
    State(state): State<Arc<ServerState>>,
    _access: AdminAccess,
) -> Json<Value> {
    state.trust.clear_blacklist();
    ok()
}

// --- users ---

async fn user_info(
    State(state): State<Arc<ServerState>>,
    _access: AdminAccess,
    Path(id): Path<i32>,
) -> Result<Json<Value>, Failure> {
    let user = state
        .users
        .get(&id)
        .map(|user| user.clone())
        .ok_or_else(|| Failure::not_found("user-not-found"))?;
    Ok(Json(json!({
        "ok": true,
        "user": {
            "id": user.id,
            "name": user.display_name(),
            "online": user.is_online(),
            "monitor": user.monitor.load(Ordering::Relaxed),
            "roomId": user.current_room().map(|room| room.id.clone()),
            "banned": state.admin.is_user_banned(i64::from(user.id)),
        },
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BanUserRequest {
    user_id: i64,
    banned: bool,
    #[serde(default)]
    disconnect: bool,
}

async fn ban_user(
    State(state): State<Arc<ServerState>>,
    _access: AdminAccess,
    Json(body): Json<BanUserRequest>,
) -> Json<Value> {
    state.admin.set_user_ban(body.user_id, body.banned).await;
    if body.banned && body.disconnect {
        if let Ok(user_id) = i32::try_from(body.user_id) {
            if let Some(user) = state.users.get(&user_id).map(|user| user.clone()) {
                if let Some(session) = user.session() {
                    session.connection.close();
                }
            }
        }
    }
    info!(user = body.user_id, banned = body.banned, "user ban updated");
    ok()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BanRoomRequest {
    user_id: i64,
    room_id: String,
    banned: bool,
}

async fn ban_room(
    State(state): State<Arc<ServerState>>,
    _access: AdminAccess,
    Json(body): Json<BanRoomRequest>,
) -> Json<Value> {
    state
        .admin
        .set_room_ban(&body.room_id, body.user_id, body.banned)
        .await;
    info!(
        user = body.user_id,
        room = %body.room_id,
        banned = body.banned,
        "room ban updated"
    );
    ok()
}

async fn disconnect_user(
    State(state): State<Arc<ServerState>>,
    _access: AdminAccess,
    Path(id): Path<i32>,
) -> Result<Json<Value>, Failure> {
    let user = state
        .users
        .get(&id)
        .map(|user| user.clone())
        .ok_or_else(|| Failure::not_found("user-not-found"))?;
    if let Some(session) = user.session() {
        session.connection.close();
    }
    Ok(ok())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoveUserRequest {
    room_id: String,
    #[serde(default)]
    monitor: bool,
}

async fn move_user(
    State(state): State<Arc<ServerState>>,
    _access: AdminAccess,
    Path(id): Path<i32>,
    Json(body): Json<MoveUserRequest>,
) -> Result<Json<Value>, Failure> {
    state
        .move_user(id, &body.room_id, body.monitor)
        .await
        .map_err(|slug| match slug {
            "user-not-found" | "room-not-found" => Failure::not_found(slug),
            other => Failure::bad_request(other),
        })?;
    Ok(ok())
}

// --- contest administration ---

#[derive(Deserialize)]
struct ContestConfigRequest {
    enabled: bool,
    #[serde(default)]
    whitelist: Option<Vec<i64>>,
}

async fn contest_config(
    State(state): State<Arc<ServerState>>,
    _access: AdminAccess,
    Path(id): Path<String>,
    Json(body): Json<ContestConfigRequest>,
) -> Result<Json<Value>, Failure> {
    let room = lookup_room(&state, &id)?;
    room.set_contest(body.enabled, body.whitelist.map(|ids| ids.into_iter().collect()))
        .await;
    info!(room = %id, enabled = body.enabled, "contest mode updated");
    Ok(ok())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContestWhitelistRequest {
    user_ids: Vec<i64>,
}

async fn contest_whitelist(
    State(state): State<Arc<ServerState>>,
    _access: AdminAccess,
    Path(id): Path<String>,
    Json(body): Json<ContestWhitelistRequest>,
) -> Result<Json<Value>, Failure> {
    let room = lookup_room(&state, &id)?;
    room.set_whitelist(body.user_ids.into_iter().collect()).await;
    Ok(ok())
}

#[derive(Deserialize)]
struct ContestStartRequest {
    #[serde(default)]
    force: bool,
}

async fn contest_start(
    State(state): State<Arc<ServerState>>,
    _access: AdminAccess,
    Path(id): Path<String>,
    Json(body): Json<ContestStartRequest>,
) -> Result<Json<Value>, Failure> {
    let room = lookup_room(&state, &id)?;
    room.force_start(body.force)
        .await
        .map_err(|_| Failure::bad_request("cannot-start"))?;
    Ok(ok())
}
