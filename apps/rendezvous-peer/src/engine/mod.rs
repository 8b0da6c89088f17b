//! The media peer connection the state machines drive.
//!
//! Session descriptions and candidates cross this boundary as the opaque
//! wire types from `rendezvous-proto`; an engine is free to do whatever it
//! likes with them. Callbacks from the engine are delivered as
//! [`EngineEvent`]s on a channel so that the task owning the state machine
//! sees them in order with everything else.

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

use rendezvous_proto::{IceCandidate, SessionDescription};

pub mod mock;
pub mod rtc;

pub use self::mock::MockEngine;
pub use self::rtc::WebRtcEngine;

/// Kind of media track sent or received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Peer connection state as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

/// Callback from the engine, delivered to the task that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    TrackReceived { kind: MediaKind, id: String },
    ConnectionStateChanged(ConnectionState),
}

/// Failure of one engine operation. The attempt is abandoned, the session goes on.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{op} failed: {reason}")]
    Operation { op: &'static str, reason: String },
    #[error("no local description has been set")]
    NoLocalDescription,
    #[error("peer connection is closed")]
    Closed,
}

impl EngineError {
    pub fn operation(op: &'static str, reason: impl fmt::Display) -> Self {
        EngineError::Operation {
            op,
            reason: reason.to_string(),
        }
    }
}

/// The media transport a negotiator drives.
#[async_trait]
pub trait PeerConnectionEngine: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    /// The description to publish. May differ from what was passed to
    /// [`PeerConnectionEngine::set_local_description`] once candidates have
    /// been gathered into it.
    async fn local_description(&self) -> Option<SessionDescription>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    async fn add_track(&self, kind: MediaKind) -> Result<(), EngineError>;

    /// Hands out the event stream. Only the first call returns `Some`.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>>;

    async fn close(&self) -> Result<(), EngineError>;
}
