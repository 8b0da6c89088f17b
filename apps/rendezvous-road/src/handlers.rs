use axum::{extract::State, response::Json};
use serde::Serialize;

use crate::websocket::SignalingState;
use rendezvous_proto::Role;

/// Body of `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    /// Roles currently registered, sorted.
    pub roles: Vec<Role>,
}

/// GET / - plain liveness greeting
pub async fn hello() -> &'static str {
    "Hello World"
}

/// GET /health - health check with current membership
pub async fn health_check(State(state): State<SignalingState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        roles: state.roles(),
    })
}
