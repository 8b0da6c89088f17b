//! Rendezvous peers: an initiator that offers media once its pairing is
//! ready and a responder that answers.

pub mod cli;
pub mod config;
pub mod engine;
pub mod initiator;
pub mod negotiation;
pub mod responder;
pub mod session;

pub use config::ClientConfig;
pub use initiator::{Initiator, InitiatorState};
pub use negotiation::Negotiator;
pub use responder::{Responder, ResponderState};
pub use session::{run_session, SessionConfig, SessionEnd, SessionError, SessionReport};
