//! Fan-out of negotiation frames between registered roles.

use thiserror::Error;

use crate::registry::{ConnectionId, Delivery, Outbound, Registry};
use rendezvous_proto::Role;

/// Why a negotiation frame was not forwarded.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("sender has not announced a role")]
    Unregistered,
    #[error("role {0} is held by another channel")]
    Stale(Role),
}

/// Deliveries that forward `text` from `sender` to every other registered
/// role. The text is passed through untouched.
///
/// Frames from a channel that no longer owns `sender` are refused, so output
/// produced for a displaced or departed endpoint never reaches anyone.
pub fn relay(
    registry: &Registry,
    sender: &Role,
    connection: ConnectionId,
    text: &str,
) -> Result<Vec<Delivery>, RelayError> {
    if registry.owner(sender) != Some(connection) {
        return Err(RelayError::Stale(sender.clone()));
    }

    let mut targets: Vec<_> = registry
        .endpoints()
        .filter(|(role, _)| *role != sender)
        .collect();
    targets.sort_by(|a, b| a.0.cmp(b.0));

    Ok(targets
        .into_iter()
        .map(|(role, endpoint)| Delivery::new(role, endpoint, Outbound::Relay(text.to_string())))
        .collect())
}
