use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::{EngineError, EngineEvent, PeerConnectionEngine};
use crate::negotiation::{apply_candidate, Negotiator};
use rendezvous_proto::{Envelope, ReadinessStatus, Role, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderState {
    Idle,
    Registered,
    AwaitingOffer,
    Connected,
    Closed,
}

impl ResponderState {
    fn as_str(self) -> &'static str {
        match self {
            ResponderState::Idle => "idle",
            ResponderState::Registered => "registered",
            ResponderState::AwaitingOffer => "awaiting-offer",
            ResponderState::Connected => "connected",
            ResponderState::Closed => "closed",
        }
    }
}

/// The side that answers. Offers are accepted only while the latest status
/// from the server is `ready`.
pub struct Responder<E> {
    role: Role,
    engine: E,
    state: ResponderState,
    remote_described: bool,
}

impl<E: PeerConnectionEngine> Responder<E> {
    pub fn new(role: impl Into<Role>, engine: E) -> Self {
        Self {
            role: role.into(),
            engine,
            state: ResponderState::Idle,
            remote_described: false,
        }
    }

    pub fn state(&self) -> ResponderState {
        self.state
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    fn on_status(&mut self, status: ReadinessStatus) {
        match (self.state, status.is_ready()) {
            (ResponderState::Registered, true) => {
                self.state = ResponderState::AwaitingOffer;
                info!(role = %self.role, "pairing ready, awaiting offer");
            }
            (ResponderState::AwaitingOffer, false) => {
                self.state = ResponderState::Registered;
                info!(role = %self.role, %status, "pairing lost before offer");
            }
            (_, ready) => {
                debug!(role = %self.role, state = self.phase(), ready, %status, "status noted");
            }
        }
    }

    async fn answer(&mut self, sdp: String) -> Result<SessionDescription, EngineError> {
        self.engine
            .set_remote_description(SessionDescription::offer(sdp))
            .await?;
        self.remote_described = true;
        let answer = self.engine.create_answer().await?;
        self.engine.set_local_description(answer.clone()).await?;
        Ok(self.engine.local_description().await.unwrap_or(answer))
    }

    async fn on_offer(&mut self, sdp: String) -> Option<Envelope> {
        if self.state != ResponderState::AwaitingOffer {
            warn!(role = %self.role, state = self.phase(), "offer before readiness dropped");
            return None;
        }
        match self.answer(sdp).await {
            Ok(answer) => {
                self.state = ResponderState::Connected;
                info!(role = %self.role, "answer created");
                Some(Envelope::from(answer))
            }
            Err(err) => {
                warn!(role = %self.role, error = %err, "could not answer offer");
                None
            }
        }
    }
}

#[async_trait]
impl<E: PeerConnectionEngine> Negotiator for Responder<E> {
    fn role(&self) -> &Role {
        &self.role
    }

    fn phase(&self) -> &'static str {
        self.state.as_str()
    }

    fn is_connected(&self) -> bool {
        self.state == ResponderState::Connected
    }

    fn is_closed(&self) -> bool {
        self.state == ResponderState::Closed
    }

    fn mark_registered(&mut self) {
        if self.state == ResponderState::Idle {
            self.state = ResponderState::Registered;
        }
    }

    async fn handle(&mut self, envelope: Envelope) -> Option<Envelope> {
        if self.state == ResponderState::Closed {
            return None;
        }
        match envelope {
            Envelope::Status { status } => {
                self.on_status(status);
                None
            }
            Envelope::Offer { sdp } => self.on_offer(sdp).await,
            Envelope::Candidate(candidate) => {
                apply_candidate(&self.engine, &self.role, self.remote_described, candidate).await;
                None
            }
            other => {
                debug!(role = %self.role, kind = other.kind(), "ignoring envelope");
                None
            }
        }
    }

    fn take_engine_events(&mut self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.engine.take_events()
    }

    async fn close(&mut self) {
        if self.state == ResponderState::Closed {
            return;
        }
        if let Err(err) = self.engine.close().await {
            warn!(role = %self.role, error = %err, "engine close failed");
        }
        self.state = ResponderState::Closed;
    }
}
