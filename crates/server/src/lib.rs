pub mod admin_data;
pub mod api;
pub mod config;
pub mod connection;
pub mod http;
pub mod push;
pub mod replay;
pub mod room;
pub mod session;
pub mod state;
pub mod trust;

use state::ServerState;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{interval, MissedTickBehavior};
use tracing::warn;

const TRUST_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const REPLAY_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Accept loop of the game TCP listener; every socket gets its own session
/// task.
pub async fn run_game_listener(state: Arc<ServerState>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(session::serve_connection(state.clone(), stream, peer));
            }
            Err(error) => warn!(%error, "accept failed"),
        }
    }
}

/// Spawns the push worker and the periodic sweeps.
pub fn spawn_background_tasks(state: &Arc<ServerState>) {
    if let Some(events) = state.take_push_events() {
        tokio::spawn(push::run_push_worker(state.clone(), events));
    }

    let trust_state = state.clone();
    tokio::spawn(async move {
        let mut ticker = interval(TRUST_SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            trust_state.trust.sweep();
        }
    });

    let push_state = state.clone();
    tokio::spawn(async move {
        let mut ticker = interval(push::WS_HEARTBEAT);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            push_state.push.heartbeat_sweep();
        }
    });

    let record_dir = state.env.record_dir.clone();
    tokio::spawn(async move {
        let mut ticker = interval(REPLAY_SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(error) = replay::retention_sweep(&record_dir).await {
                warn!(%error, "replay retention sweep failed");
            }
        }
    });
}
