use phira_mp_server::config::Config;
use phira_mp_server::state::ServerState;
use phira_mp_server::{http, run_game_listener, spawn_background_tasks};
use std::env;
use std::net::{Ipv6Addr, SocketAddr};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() {
    let log_filter = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let config = Config::load().expect("configuration");
    let state = ServerState::new(config);
    spawn_background_tasks(&state);

    let game_listener = TcpListener::bind((Ipv6Addr::UNSPECIFIED, state.config.game_port))
        .await
        .expect("game listener");
    info!(port = state.config.game_port, "game server listening");

    if state.config.http_service {
        let http_listener = TcpListener::bind((Ipv6Addr::UNSPECIFIED, state.config.http_port))
            .await
            .expect("http listener");
        info!(port = state.config.http_port, "http service listening");
        let router = http::router(state.clone());
        tokio::spawn(async move {
            axum::serve(
                http_listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .expect("http server");
        });
    }

    run_game_listener(state, game_listener).await;
}
