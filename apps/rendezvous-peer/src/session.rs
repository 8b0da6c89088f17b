//! Drives one negotiator over one rendezvous channel.

use futures_util::{Sink, SinkExt, StreamExt};
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ClientConfig;
use crate::engine::{EngineEvent, MediaKind};
use crate::negotiation::Negotiator;
use rendezvous_proto::{is_close_sentinel, Envelope, Frame, ProtocolError, Role, CLOSE};

/// What a session needs from [`ClientConfig`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub url: Url,
    pub negotiation_timeout: Option<Duration>,
}

impl From<&ClientConfig> for SessionConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            url: config.url.clone(),
            negotiation_timeout: config.negotiation_timeout,
        }
    }
}

/// Why a session ended abnormally.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not reach rendezvous server: {0}")]
    Connect(#[source] tungstenite::Error),
    #[error("rendezvous channel failed: {0}")]
    Transport(#[source] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("negotiation did not complete within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The server sent a close sentinel.
    ClosedByServer,
    /// The socket ended without a sentinel.
    ChannelClosed,
    /// The local shutdown signal fired.
    Interrupted,
}

/// How a session ended and whether negotiation got as far as `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReport {
    pub end: SessionEnd,
    pub connected: bool,
}

/// Connects, announces the negotiator's role and feeds it every frame until
/// the channel closes, `shutdown` resolves, or the negotiation deadline
/// passes. The negotiator is closed on every exit path.
pub async fn run_session<N, S>(
    config: &SessionConfig,
    negotiator: &mut N,
    shutdown: S,
) -> Result<SessionReport, SessionError>
where
    N: Negotiator,
    S: Future<Output = ()> + Send,
{
    let result = drive(config, negotiator, shutdown).await;
    negotiator.close().await;
    match &result {
        Ok(report) => info!(
            role = %negotiator.role(),
            end = ?report.end,
            connected = report.connected,
            "session ended"
        ),
        Err(err) => warn!(role = %negotiator.role(), error = %err, "session failed"),
    }
    result
}

async fn drive<N, S>(
    config: &SessionConfig,
    negotiator: &mut N,
    shutdown: S,
) -> Result<SessionReport, SessionError>
where
    N: Negotiator,
    S: Future<Output = ()> + Send,
{
    let (socket, _) = connect_async(config.url.as_str())
        .await
        .map_err(SessionError::Connect)?;
    let (mut sink, mut stream) = socket.split();

    let role = negotiator.role().clone();
    let opener = Envelope::opener(role.clone()).to_text()?;
    sink.send(Message::Text(opener))
        .await
        .map_err(SessionError::Transport)?;
    negotiator.mark_registered();
    info!(role = %role, url = %config.url, "registered with rendezvous server");

    let mut events = negotiator.take_engine_events();
    let deadline = config
        .negotiation_timeout
        .map(|timeout| (timeout, Instant::now() + timeout));
    tokio::pin!(shutdown);
    // Frames read while the engine was busy, in arrival order.
    let mut backlog: VecDeque<String> = VecDeque::new();

    loop {
        let text = match backlog.pop_front() {
            Some(text) => text,
            None => tokio::select! {
                _ = &mut shutdown => {
                    return Ok(interrupted(&mut sink, negotiator).await);
                }
                _ = wait_until(deadline), if !negotiator.is_connected() => {
                    return Err(timed_out(&mut sink, deadline).await);
                }
                event = next_event(&mut events) => {
                    match event {
                        Some(event) => log_event(role.as_str(), event),
                        None => events = None,
                    }
                    continue;
                }
                frame = stream.next() => match inbound(&role, frame)? {
                    Inbound::Text(text) => text,
                    Inbound::Skip => continue,
                    Inbound::End => return Ok(report(negotiator, SessionEnd::ChannelClosed)),
                },
            },
        };

        let envelope = match Frame::parse(&text) {
            Ok(Frame::Close) => {
                info!(role = %role, "server asked us to close");
                let _ = sink.send(Message::Close(None)).await;
                return Ok(report(negotiator, SessionEnd::ClosedByServer));
            }
            Ok(Frame::Envelope(envelope)) => envelope,
            Err(err) => {
                warn!(role = %role, error = %err, "ignoring malformed frame");
                continue;
            }
        };

        let kind = envelope.kind();
        let before = negotiator.phase();
        let deadline_applies = !negotiator.is_connected();
        // Engine calls can stall; the channel and the local signals stay live
        // while they run.
        let outcome = {
            let handling = negotiator.handle(envelope);
            tokio::pin!(handling);
            loop {
                tokio::select! {
                    reply = &mut handling => break Handled::Reply(reply),
                    _ = &mut shutdown => break Handled::Interrupted,
                    _ = wait_until(deadline), if deadline_applies => break Handled::TimedOut,
                    frame = stream.next() => match inbound(&role, frame)? {
                        Inbound::Text(text) if is_close_sentinel(&text) => {
                            break Handled::ClosedByServer;
                        }
                        Inbound::Text(text) => backlog.push_back(text),
                        Inbound::Skip => {}
                        Inbound::End => break Handled::ChannelClosed,
                    },
                }
            }
        };

        match outcome {
            Handled::Reply(reply) => {
                debug!(
                    role = %role,
                    kind,
                    from = before,
                    to = negotiator.phase(),
                    "envelope handled"
                );
                if let Some(reply) = reply {
                    sink.send(Message::Text(reply.to_text()?))
                        .await
                        .map_err(SessionError::Transport)?;
                }
            }
            Handled::Interrupted => return Ok(interrupted(&mut sink, negotiator).await),
            Handled::TimedOut => return Err(timed_out(&mut sink, deadline).await),
            Handled::ClosedByServer => {
                info!(role = %role, kind, "server asked us to close mid-negotiation");
                let _ = sink.send(Message::Close(None)).await;
                return Ok(report(negotiator, SessionEnd::ClosedByServer));
            }
            Handled::ChannelClosed => return Ok(report(negotiator, SessionEnd::ChannelClosed)),
        }
    }
}

/// How an envelope's handling ended.
enum Handled {
    Reply(Option<Envelope>),
    Interrupted,
    TimedOut,
    ClosedByServer,
    ChannelClosed,
}

enum Inbound {
    Text(String),
    Skip,
    End,
}

fn inbound(
    role: &Role,
    frame: Option<Result<Message, tungstenite::Error>>,
) -> Result<Inbound, SessionError> {
    match frame {
        Some(Ok(Message::Text(text))) => Ok(Inbound::Text(text)),
        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
            Ok(text) => Ok(Inbound::Text(text)),
            Err(_) => {
                warn!(role = %role, "ignoring non-utf8 binary frame");
                Ok(Inbound::Skip)
            }
        },
        Some(Ok(Message::Close(_))) | None => Ok(Inbound::End),
        Some(Ok(_)) => Ok(Inbound::Skip),
        Some(Err(err)) => Err(SessionError::Transport(err)),
    }
}

async fn interrupted<W, N>(sink: &mut W, negotiator: &N) -> SessionReport
where
    W: Sink<Message> + Unpin,
    N: Negotiator,
{
    info!(role = %negotiator.role(), phase = negotiator.phase(), "interrupted; hanging up");
    let _ = sink.send(Message::Text(CLOSE.to_string())).await;
    let _ = sink.send(Message::Close(None)).await;
    report(negotiator, SessionEnd::Interrupted)
}

async fn timed_out<W>(sink: &mut W, deadline: Option<(Duration, Instant)>) -> SessionError
where
    W: Sink<Message> + Unpin,
{
    let timeout = deadline.map(|(timeout, _)| timeout).unwrap_or_default();
    let _ = sink.send(Message::Close(None)).await;
    SessionError::Timeout(timeout)
}

fn report<N: Negotiator>(negotiator: &N, end: SessionEnd) -> SessionReport {
    SessionReport {
        end,
        connected: negotiator.is_connected(),
    }
}

async fn wait_until(deadline: Option<(Duration, Instant)>) {
    match deadline {
        Some((_, at)) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<EngineEvent>>,
) -> Option<EngineEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn log_event(role: &str, event: EngineEvent) {
    match event {
        EngineEvent::TrackReceived { kind, id } => match kind {
            MediaKind::Video => info!(role, track = %id, "video track received"),
            MediaKind::Audio => info!(role, track = %id, "audio track received"),
        },
        EngineEvent::ConnectionStateChanged(state) if state.is_terminal() => {
            warn!(role, ?state, "peer connection state changed")
        }
        EngineEvent::ConnectionStateChanged(state) => {
            info!(role, ?state, "peer connection state changed")
        }
    }
}
