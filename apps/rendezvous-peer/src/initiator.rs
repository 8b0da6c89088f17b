use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::{EngineError, EngineEvent, MediaKind, PeerConnectionEngine};
use crate::negotiation::{apply_candidate, Negotiator};
use rendezvous_proto::{Envelope, ReadinessStatus, Role, SessionDescription};

/// Where an [`Initiator`] is in its negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiatorState {
    Idle,
    Registered,
    OfferSent,
    Connected,
    Closed,
}

impl InitiatorState {
    fn as_str(self) -> &'static str {
        match self {
            InitiatorState::Idle => "idle",
            InitiatorState::Registered => "registered",
            InitiatorState::OfferSent => "offer-sent",
            InitiatorState::Connected => "connected",
            InitiatorState::Closed => "closed",
        }
    }
}

/// The side that publishes media and makes the offer once its pairing is
/// ready.
pub struct Initiator<E> {
    role: Role,
    engine: E,
    state: InitiatorState,
    pending_tracks: Vec<MediaKind>,
    remote_described: bool,
}

impl<E: PeerConnectionEngine> Initiator<E> {
    pub fn new(role: impl Into<Role>, engine: E) -> Self {
        Self {
            role: role.into(),
            engine,
            state: InitiatorState::Idle,
            pending_tracks: Vec::new(),
            remote_described: false,
        }
    }

    /// Tracks added to the engine right before the first offer.
    pub fn with_tracks(mut self, tracks: impl IntoIterator<Item = MediaKind>) -> Self {
        self.pending_tracks.extend(tracks);
        self
    }

    pub fn state(&self) -> InitiatorState {
        self.state
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    async fn make_offer(&mut self) -> Result<SessionDescription, EngineError> {
        while let Some(&kind) = self.pending_tracks.first() {
            self.engine.add_track(kind).await?;
            self.pending_tracks.remove(0);
            debug!(role = %self.role, %kind, "outbound track added");
        }
        let offer = self.engine.create_offer().await?;
        self.engine.set_local_description(offer.clone()).await?;
        Ok(self.engine.local_description().await.unwrap_or(offer))
    }

    async fn on_status(&mut self, status: ReadinessStatus) -> Option<Envelope> {
        if !status.is_ready() {
            info!(role = %self.role, %status, "pairing not ready");
            return None;
        }
        if self.state != InitiatorState::Registered {
            debug!(role = %self.role, state = self.phase(), "ignoring repeated ready");
            return None;
        }
        match self.make_offer().await {
            Ok(offer) => {
                self.state = InitiatorState::OfferSent;
                info!(role = %self.role, "offer created");
                Some(Envelope::from(offer))
            }
            Err(err) => {
                warn!(role = %self.role, error = %err, "could not create offer");
                None
            }
        }
    }

    async fn on_answer(&mut self, sdp: String) {
        if self.state != InitiatorState::OfferSent {
            warn!(role = %self.role, state = self.phase(), "unexpected answer dropped");
            return;
        }
        match self
            .engine
            .set_remote_description(SessionDescription::answer(sdp))
            .await
        {
            Ok(()) => {
                self.remote_described = true;
                self.state = InitiatorState::Connected;
                info!(role = %self.role, "answer applied");
            }
            Err(err) => warn!(role = %self.role, error = %err, "could not apply answer"),
        }
    }
}

#[async_trait]
impl<E: PeerConnectionEngine> Negotiator for Initiator<E> {
    fn role(&self) -> &Role {
        &self.role
    }

    fn phase(&self) -> &'static str {
        self.state.as_str()
    }

    fn is_connected(&self) -> bool {
        self.state == InitiatorState::Connected
    }

    fn is_closed(&self) -> bool {
        self.state == InitiatorState::Closed
    }

    fn mark_registered(&mut self) {
        if self.state == InitiatorState::Idle {
            self.state = InitiatorState::Registered;
        }
    }

    async fn handle(&mut self, envelope: Envelope) -> Option<Envelope> {
        if self.state == InitiatorState::Closed {
            return None;
        }
        match envelope {
            Envelope::Status { status } => self.on_status(status).await,
            Envelope::Answer { sdp } => {
                self.on_answer(sdp).await;
                None
            }
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
        if self.state == InitiatorState::Closed {
            return;
        }
        if let Err(err) = self.engine.close().await {
            warn!(role = %self.role, error = %err, "engine close failed");
        }
        self.state = InitiatorState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::{Call, MockEngine};
    use rendezvous_proto::IceCandidate;

    fn ready() -> Envelope {
        Envelope::status(ReadinessStatus::Ready)
    }

    fn registered(engine: &MockEngine) -> Initiator<MockEngine> {
        let mut initiator =
            Initiator::new("robotino", engine.clone()).with_tracks([MediaKind::Video]);
        initiator.mark_registered();
        initiator
    }

    #[test_timeout::tokio_timeout_test]
    async fn ready_produces_exactly_one_offer() {
        let engine = MockEngine::new("init");
        let mut initiator = registered(&engine);

        let reply = initiator.handle(ready()).await.expect("offer");
        assert_eq!(reply.kind(), "offer");
        assert_eq!(initiator.state(), InitiatorState::OfferSent);

        assert!(initiator.handle(ready()).await.is_none());
        assert_eq!(engine.count(|c| *c == Call::CreateOffer), 1);
        assert_eq!(
            engine.calls()[..3],
            [
                Call::AddTrack(MediaKind::Video),
                Call::CreateOffer,
                Call::SetLocal(rendezvous_proto::SdpKind::Offer)
            ]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn waiting_status_does_not_offer() {
        let engine = MockEngine::new("init");
        let mut initiator = registered(&engine);
        let waiting = Envelope::status(ReadinessStatus::WaitingFor(Role::new("browser")));

        assert!(initiator.handle(waiting).await.is_none());
        assert_eq!(initiator.state(), InitiatorState::Registered);
        assert!(engine.calls().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn answer_connects_after_offer() {
        let engine = MockEngine::new("init");
        let mut initiator = registered(&engine);

        // An answer before any offer is stray.
        assert!(initiator
            .handle(Envelope::Answer { sdp: "early".into() })
            .await
            .is_none());
        assert_eq!(initiator.state(), InitiatorState::Registered);

        initiator.handle(ready()).await;
        initiator
            .handle(Envelope::Answer { sdp: "v=0".into() })
            .await;
        assert!(initiator.is_connected());
        assert!(engine
            .calls()
            .contains(&Call::SetRemote(SessionDescription::answer("v=0"))));
    }

    #[test_timeout::tokio_timeout_test]
    async fn engine_failure_keeps_state_and_allows_retry() {
        let engine = MockEngine::new("init");
        let mut initiator = registered(&engine);
        engine.fail_on("create_offer");

        assert!(initiator.handle(ready()).await.is_none());
        assert_eq!(initiator.state(), InitiatorState::Registered);

        engine.recover("create_offer");
        assert!(initiator.handle(ready()).await.is_some());
        assert_eq!(initiator.state(), InitiatorState::OfferSent);
        assert_eq!(engine.count(|c| *c == Call::AddTrack(MediaKind::Video)), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn candidates_wait_for_remote_description() {
        let engine = MockEngine::new("init");
        let mut initiator = registered(&engine);
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };

        initiator.handle(Envelope::Candidate(candidate.clone())).await;
        assert_eq!(engine.count(|c| matches!(c, Call::AddCandidate(_))), 0);

        initiator.handle(ready()).await;
        initiator.handle(Envelope::Answer { sdp: "v=0".into() }).await;
        initiator.handle(Envelope::Candidate(candidate.clone())).await;
        assert!(engine.calls().contains(&Call::AddCandidate(candidate)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_releases_engine_once() {
        let engine = MockEngine::new("init");
        let mut initiator = registered(&engine);

        initiator.close().await;
        initiator.close().await;
        assert!(initiator.is_closed());
        assert!(engine.is_closed());
        assert_eq!(engine.count(|c| *c == Call::Close), 1);
        assert!(initiator.handle(ready()).await.is_none());
    }
}
