use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::engine::{EngineEvent, PeerConnectionEngine};
use rendezvous_proto::{Envelope, IceCandidate, Role};

/// A state machine that turns inbound envelopes into outbound ones.
///
/// The session driver owns the channel; implementations only see parsed
/// envelopes and never touch the socket.
#[async_trait]
pub trait Negotiator: Send {
    fn role(&self) -> &Role;

    /// Current state, for logging.
    fn phase(&self) -> &'static str;

    fn is_connected(&self) -> bool;

    fn is_closed(&self) -> bool;

    /// Called once the opener has been written to the channel.
    fn mark_registered(&mut self);

    /// Applies one inbound envelope, returning the reply to send, if any.
    async fn handle(&mut self, envelope: Envelope) -> Option<Envelope>;

    fn take_engine_events(&mut self) -> Option<mpsc::UnboundedReceiver<EngineEvent>>;

    /// Releases the engine. Idempotent.
    async fn close(&mut self);
}

/// Candidates only make sense once a remote description is in place.
pub(crate) async fn apply_candidate<E: PeerConnectionEngine>(
    engine: &E,
    role: &Role,
    remote_described: bool,
    candidate: IceCandidate,
) {
    if !remote_described {
        debug!(role = %role, "dropping candidate received before remote description");
        return;
    }
    if let Err(err) = engine.add_ice_candidate(candidate).await {
        warn!(role = %role, error = %err, "failed to apply remote candidate");
    }
}
