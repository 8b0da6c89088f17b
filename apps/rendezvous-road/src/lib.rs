//! Rendezvous server: peers announce a role over a websocket, the server
//! tells them when their pairing is complete and relays negotiation frames
//! between them.

pub mod config;
pub mod handlers;
pub mod registry;
pub mod router;
pub mod websocket;

use axum::{routing::get, Router};
use std::future::Future;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::handlers::{health_check, hello};
use crate::websocket::{websocket_handler, SignalingState};
use rendezvous_proto::RENDEZVOUS_PATH;

pub use config::Config;

pub fn app(state: SignalingState) -> Router {
    Router::new()
        .route("/", get(hello))
        .route("/health", get(health_check))
        .route(RENDEZVOUS_PATH, get(websocket_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serves until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    state: SignalingState,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await
}
