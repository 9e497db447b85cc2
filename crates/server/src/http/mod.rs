//! HTTP JSON API: public read-only views, the admin surface, the replay
//! download service and the telemetry WebSocket endpoint.

mod admin;
mod replay_api;

use crate::push::{self, room_json};
use crate::state::ServerState;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

pub const SERVER_VERSION: &str = "1.0.0";

/// Uniform error body: `{ok: false, error: <slug>}` with a matching status.
#[derive(Debug)]
pub struct Failure {
    status: StatusCode,
    slug: &'static str,
}

impl Failure {
    pub fn bad_request(slug: &'static str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            slug,
        }
    }

    pub fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            slug: "unauthorized",
        }
    }

    pub fn forbidden(slug: &'static str) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            slug,
        }
    }

    pub fn not_found(slug: &'static str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            slug,
        }
    }
}

impl IntoResponse for Failure {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "ok": false, "error": self.slug })),
        )
            .into_response()
    }
}

/// Admin authentication level. The view token is admitted for reads only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAccess {
    Full,
    ReadOnly,
}

fn query_param(parts: &Parts, name: &str) -> Option<String> {
    let query = parts.uri.query()?;
    for pair in query.split('&') {
        let mut split = pair.splitn(2, '=');
        if split.next() == Some(name) {
            return split.next().map(str::to_string);
        }
    }
    None
}

fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get("x-admin-token")
        .and_then(|value| value.to_str().ok())
    {
        return Some(token.to_string());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn peer_ip(parts: &Parts) -> Option<IpAddr> {
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
}

impl FromRequestParts<Arc<ServerState>> for AdminAccess {
    type Rejection = Failure;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<ServerState>,
    ) -> Result<Self, Self::Rejection> {
        let token = query_param(parts, "token")
            .or_else(|| token_from_headers(&parts.headers))
            .ok_or_else(Failure::unauthorized)?;
        if state
            .config
            .admin_token
            .as_deref()
            .is_some_and(|admin| admin == token)
        {
            return Ok(Self::Full);
        }
        if state
            .config
            .view_token
            .as_deref()
            .is_some_and(|view| view == token)
        {
            if parts.method == Method::GET {
                return Ok(Self::ReadOnly);
            }
            return Err(Failure::forbidden("view-token-readonly"));
        }
        if let Some(ip) = peer_ip(parts) {
            if state.trust.validate_temp_token(&token, ip) {
                return Ok(Self::Full);
            }
        }
        Err(Failure::unauthorized())
    }
}

pub fn router(state: Arc<ServerState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    Router::new()
        .route("/rooms", get(list_rooms))
        .route("/room", get(public_room_view))
        .route("/status", get(status))
        .route("/ws", get(ws_upgrade))
        .merge(admin::router())
        .merge(replay_api::router())
        .layer(cors)
        .with_state(state)
}

async fn list_rooms(State(state): State<Arc<ServerState>>) -> Json<Value> {
    let rooms: Vec<_> = state.rooms.iter().map(|room| room.clone()).collect();
    let mut entries = Vec::with_capacity(rooms.len());
    for room in rooms {
        entries.push(room_json(&room.snapshot().await));
    }
    Json(json!({ "count": entries.len(), "rooms": entries }))
}

/// Legacy public view with chart names resolved out-of-band.
async fn public_room_view(State(state): State<Arc<ServerState>>) -> Json<Value> {
    let rooms: Vec<_> = state.rooms.iter().map(|room| room.clone()).collect();
    let mut entries = Vec::with_capacity(rooms.len());
    for room in rooms {
        let snapshot = room.snapshot().await;
        let chart = match snapshot.chart {
            Some(id) => {
                let name = state.api.chart_name(id).await;
                json!({ "name": name, "id": id })
            }
            None => Value::Null,
        };
        entries.push(json!({
            "roomid": snapshot.id,
            "cycle": snapshot.cycle,
            "lock": snapshot.locked,
            "host": { "name": snapshot.host_name, "id": snapshot.host_id },
            "state": match snapshot.state {
                phira_mp_proto::RoomState::SelectChart => "SelectChart",
                phira_mp_proto::RoomState::WaitingForReady => "WaitingForReady",
                phira_mp_proto::RoomState::Playing => "Playing",
            },
            "chart": chart,
            "players": snapshot
                .players
                .iter()
                .map(|(id, name)| json!({ "name": name, "id": id }))
                .collect::<Vec<_>>(),
        }));
    }
    Json(json!({ "total": entries.len(), "rooms": entries }))
}

async fn status(State(state): State<Arc<ServerState>>) -> Json<Value> {
    Json(json!({
        "serverName": state.config.server_name,
        "version": SERVER_VERSION,
        "uptime": state.uptime_seconds(),
        "roomCount": state.rooms.len(),
        "sessionCount": state.sessions.len(),
        "userCount": state.user_count(),
    }))
}

async fn ws_upgrade(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| push::handle_socket(state, socket, peer))
}
