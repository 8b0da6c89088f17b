use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::registry::{
    deliver_all, generate_connection_id, ConnectionId, Endpoint, Outbound, Registration,
    Registry, RegistryError,
};
use crate::router::{self, RelayError};
use rendezvous_proto::{Envelope, Frame, Role, CLOSE_CMD};

/// Shared server state: one registry behind one lock.
///
/// Deliveries are queued while the lock is held. Every channel has an
/// unbounded writer queue, so this never waits on the network, and it keeps
/// status updates from two concurrent registrations in a consistent order.
#[derive(Clone)]
pub struct SignalingState {
    registry: Arc<Mutex<Registry>>,
}

impl SignalingState {
    pub fn new(config: &Config) -> Self {
        Self::from_registry(Registry::new(
            config.pairing_rules.clone(),
            config.role_conflict,
        ))
    }

    pub fn from_registry(registry: Registry) -> Self {
        Self {
            registry: Arc::new(Mutex::new(registry)),
        }
    }

    pub fn roles(&self) -> Vec<Role> {
        self.registry.lock().roles()
    }

    pub fn owner(&self, role: &Role) -> Option<ConnectionId> {
        self.registry.lock().owner(role)
    }

    /// Registers `role` for the endpoint's channel and broadcasts the
    /// resulting readiness. A displaced holder is told to close. When the
    /// channel already held a different role, that role is released under the
    /// same lock, so nobody sees a membership in which one channel holds both.
    pub fn register(
        &self,
        previous: Option<&Role>,
        role: Role,
        endpoint: Endpoint,
    ) -> Result<(), RegistryError> {
        let mut registry = self.registry.lock();
        let connection = endpoint.connection;
        let outcome = registry.register(role.clone(), endpoint)?;

        if let Registration::Replaced(displaced) = outcome {
            info!(
                role = %role,
                old = %displaced.connection,
                new = %connection,
                "role taken over; closing previous channel"
            );
            let _ = displaced.tx.send(Outbound::Shutdown { announce: true });
        }
        if let Some(previous) = previous.filter(|previous| **previous != role) {
            if registry.unregister(previous, connection) {
                info!(old = %previous, new = %role, %connection, "channel switched roles");
            }
        }

        let sent = deliver_all(registry.compute_readiness());
        debug!(role = %role, %connection, sent, "readiness evaluated");
        Ok(())
    }

    /// Drops `role` if `connection` still holds it and tells the remaining
    /// peers who they are waiting for.
    pub fn unregister(&self, role: &Role, connection: ConnectionId) -> bool {
        let mut registry = self.registry.lock();
        if !registry.unregister(role, connection) {
            return false;
        }
        let sent = deliver_all(registry.waiting_notices());
        debug!(role = %role, %connection, sent, "role unregistered");
        true
    }

    pub fn relay(
        &self,
        sender: Option<&Role>,
        connection: ConnectionId,
        text: &str,
    ) -> Result<usize, RelayError> {
        let sender = sender.ok_or(RelayError::Unregistered)?;
        let registry = self.registry.lock();
        let deliveries = router::relay(&registry, sender, connection, text)?;
        Ok(deliver_all(deliveries))
    }
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<SignalingState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SignalingState) {
    let connection = generate_connection_id();
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
    let mut writer = tokio::spawn(write_outbound(sink, rx, connection));
    let mut writer_finished = false;
    let mut role: Option<Role> = None;

    debug!(%connection, "channel opened");

    loop {
        let next = tokio::select! {
            next = stream.next() => next,
            _ = &mut writer => {
                writer_finished = true;
                break;
            }
        };

        let text = match next {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!(%connection, "ignoring non-utf8 binary frame");
                    continue;
                }
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                warn!(%connection, error = %err, "channel read failed");
                break;
            }
        };

        match Frame::parse(&text) {
            Ok(Frame::Close) => {
                debug!(%connection, "peer hung up");
                break;
            }
            Ok(Frame::Envelope(Envelope::Opener { sender })) => {
                let endpoint = Endpoint::new(connection, tx.clone());
                match state.register(role.as_ref(), sender.clone(), endpoint) {
                    Ok(()) => {
                        info!(role = %sender, %connection, "role registered");
                        role = Some(sender);
                    }
                    Err(err) => warn!(%connection, error = %err, "opener refused"),
                }
            }
            Ok(Frame::Envelope(envelope)) if envelope.is_negotiation() => {
                let kind = envelope.kind();
                match state.relay(role.as_ref(), connection, &text) {
                    Ok(sent) => debug!(%connection, kind, sent, "relayed"),
                    Err(err) => warn!(%connection, kind, error = %err, "relay dropped"),
                }
            }
            Ok(Frame::Envelope(envelope)) => {
                let kind = envelope.kind();
                warn!(%connection, kind, "ignoring envelope not meant for the server");
            }
            Err(err) => warn!(%connection, error = %err, "ignoring malformed frame"),
        }
    }

    if let Some(role) = role.take() {
        if state.unregister(&role, connection) {
            info!(role = %role, %connection, "role released");
        }
    }
    if !writer_finished {
        let _ = tx.send(Outbound::Shutdown { announce: false });
        drop(tx);
        let _ = writer.await;
    }
    debug!(%connection, "channel closed");
}

async fn write_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    connection: ConnectionId,
) {
    while let Some(outbound) = rx.recv().await {
        let text = match outbound {
            Outbound::Status(status) => match Envelope::status(status).to_text() {
                Ok(text) => text,
                Err(err) => {
                    warn!(%connection, error = %err, "failed to encode status");
                    continue;
                }
            },
            Outbound::Relay(text) => text,
            Outbound::Shutdown { announce } => {
                if announce {
                    let _ = sink.send(Message::Text(CLOSE_CMD.to_string())).await;
                }
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        };
        if let Err(err) = sink.send(Message::Text(text)).await {
            debug!(%connection, error = %err, "channel write failed");
            break;
        }
    }
}
