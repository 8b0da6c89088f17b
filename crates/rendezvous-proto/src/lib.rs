//! Shared wire protocol for the rendezvous server and its peers.
//!
//! Every frame on a rendezvous channel is either a JSON envelope tagged by
//! its `type` field or one of the bare close sentinels. Session descriptions
//! and candidates are carried as opaque strings; nothing here looks inside
//! them.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Path the rendezvous server accepts channels on.
pub const RENDEZVOUS_PATH: &str = "/ws";

/// Sentinel a peer sends to hang up its own channel.
pub const CLOSE: &str = "close";

/// Sentinel the server sends before closing a channel it no longer wants.
pub const CLOSE_CMD: &str = "close cmd";

const WAITING_PREFIX: &str = "waiting for ";

/// Why a frame could not be turned into an [`Envelope`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("envelope has no `type` field")]
    MissingType,
}

/// Logical identity of an endpoint, independent of its network address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(String);

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Role {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Value of a `status` envelope.
///
/// On the wire this is a plain string: `"ready"` or `"waiting for <role>"`.
/// Anything else is preserved verbatim as [`ReadinessStatus::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ReadinessStatus {
    Ready,
    WaitingFor(Role),
    Other(String),
}

impl ReadinessStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, ReadinessStatus::Ready)
    }
}

impl From<String> for ReadinessStatus {
    fn from(value: String) -> Self {
        if value == "ready" {
            return ReadinessStatus::Ready;
        }
        match value.strip_prefix(WAITING_PREFIX) {
            Some(role) if !role.is_empty() => ReadinessStatus::WaitingFor(Role::new(role)),
            _ => ReadinessStatus::Other(value),
        }
    }
}

impl From<ReadinessStatus> for String {
    fn from(value: ReadinessStatus) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ReadinessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessStatus::Ready => f.write_str("ready"),
            ReadinessStatus::WaitingFor(role) => write!(f, "{WAITING_PREFIX}{role}"),
            ReadinessStatus::Other(text) => f.write_str(text),
        }
    }
}

/// Which half of the offer/answer exchange a description is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Opaque negotiation blob produced by a peer connection engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate, field names as browsers serialise them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

/// JSON message exchanged over a rendezvous channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    /// Announces the sender's role; first message on every channel.
    Opener { sender: Role },
    Status { status: ReadinessStatus },
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate(IceCandidate),
    /// Any `type` this build does not know about.
    #[serde(other)]
    Unknown,
}

impl Envelope {
    pub fn opener(role: impl Into<Role>) -> Self {
        Envelope::Opener {
            sender: role.into(),
        }
    }

    pub fn status(status: ReadinessStatus) -> Self {
        Envelope::Status { status }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Opener { .. } => "opener",
            Envelope::Status { .. } => "status",
            Envelope::Offer { .. } => "offer",
            Envelope::Answer { .. } => "answer",
            Envelope::Candidate(_) => "candidate",
            Envelope::Unknown => "unknown",
        }
    }

    /// True for the envelopes the server relays between peers.
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            Envelope::Offer { .. } | Envelope::Answer { .. } | Envelope::Candidate(_)
        )
    }

    pub fn session_description(&self) -> Option<SessionDescription> {
        match self {
            Envelope::Offer { sdp } => Some(SessionDescription::offer(sdp.clone())),
            Envelope::Answer { sdp } => Some(SessionDescription::answer(sdp.clone())),
            _ => None,
        }
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<SessionDescription> for Envelope {
    fn from(desc: SessionDescription) -> Self {
        match desc.kind {
            SdpKind::Offer => Envelope::Offer { sdp: desc.sdp },
            SdpKind::Answer => Envelope::Answer { sdp: desc.sdp },
        }
    }
}

/// One text frame as received from a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Either close sentinel.
    Close,
    Envelope(Envelope),
}

impl Frame {
    pub fn parse(text: &str) -> Result<Frame, ProtocolError> {
        if is_close_sentinel(text) {
            return Ok(Frame::Close);
        }
        let value: serde_json::Value = serde_json::from_str(text)?;
        if value.get("type").and_then(serde_json::Value::as_str).is_none() {
            return Err(ProtocolError::MissingType);
        }
        Ok(Frame::Envelope(serde_json::from_value(value)?))
    }
}

pub fn is_close_sentinel(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed == CLOSE || trimmed == CLOSE_CMD
}
