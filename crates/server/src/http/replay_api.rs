//! Replay HTTP surface: short-lived session auth, throttled downloads and
//! deletion of a user's own recordings.

use super::Failure;
use crate::replay::{self, REPLAY_EXTENSION};
use crate::state::ServerState;
use crate::trust::REPLAY_SESSION_TTL_MILLIS;
use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Download throttle: one chunk of this size per second.
const THROTTLE_CHUNK: usize = 50 * 1024;

pub fn router() -> Router<Arc<ServerState>> {
    Router::new()
        .route("/replay/auth", post(auth))
        .route("/replay/download", get(download))
        .route("/replay/delete", post(delete))
}

#[derive(Deserialize)]
struct AuthRequest {
    token: String,
}

async fn auth(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<AuthRequest>,
) -> Result<Json<Value>, Failure> {
    let me = state
        .api
        .me(&body.token)
        .await
        .map_err(|_| Failure::unauthorized())?;
    let session_token = state.trust.create_replay_session(me.id);
    let mut by_chart: BTreeMap<i32, Vec<Value>> = BTreeMap::new();
    for (chart_id, timestamp, size) in
        replay::list_recordings(&state.env.record_dir, me.id).await
    {
        by_chart
            .entry(chart_id)
            .or_default()
            .push(json!({ "timestamp": timestamp, "size": size }));
    }
    let charts: Vec<_> = by_chart
        .into_iter()
        .map(|(chart_id, files)| json!({ "chartId": chart_id, "files": files }))
        .collect();
    Ok(Json(json!({
        "ok": true,
        "sessionToken": session_token,
        "expiresIn": REPLAY_SESSION_TTL_MILLIS,
        "charts": charts,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadQuery {
    session_token: String,
    chart_id: i32,
    timestamp: i64,
}

async fn download(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, Failure> {
    let user_id = state
        .trust
        .validate_replay_session(&query.session_token)
        .ok_or_else(Failure::unauthorized)?;
    let path = replay::recording_path(
        &state.env.record_dir,
        user_id,
        query.chart_id,
        query.timestamp,
    );
    let file = File::open(&path)
        .await
        .map_err(|_| Failure::not_found("not-found"))?;

    let throttled = stream::unfold((Some(file), true), |(file, first)| async move {
        let mut file = file?;
        if !first {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        let mut chunk = vec![0u8; THROTTLE_CHUNK];
        match file.read(&mut chunk).await {
            Ok(0) => None,
            Ok(read) => {
                chunk.truncate(read);
                Some((Ok(Bytes::from(chunk)), (Some(file), false)))
            }
            Err(error) => Some((Err(error), (None, false))),
        }
    });
    let headers = [
        (header::CONTENT_TYPE, "application/octet-stream".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!(
                "attachment; filename={}.{REPLAY_EXTENSION}",
                query.timestamp
            ),
        ),
    ];
    Ok((headers, Body::from_stream(throttled)).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteRequest {
    session_token: String,
    chart_id: i32,
    timestamp: i64,
}

async fn delete(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<DeleteRequest>,
) -> Result<Json<Value>, Failure> {
    let user_id = state
        .trust
        .validate_replay_session(&body.session_token)
        .ok_or_else(Failure::unauthorized)?;
    let path = replay::recording_path(
        &state.env.record_dir,
        user_id,
        body.chart_id,
        body.timestamp,
    );
    tokio::fs::remove_file(&path)
        .await
        .map_err(|_| Failure::not_found("not-found"))?;
    Ok(Json(json!({ "ok": true })))
}
