use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{EngineError, EngineEvent, MediaKind, PeerConnectionEngine};
use rendezvous_proto::{IceCandidate, SdpKind, SessionDescription};

/// One call made against a [`MockEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    AddTrack(MediaKind),
    Close,
}

/// In-memory engine that records calls and produces placeholder
/// descriptions. Clones share state, so a test can keep a handle while the
/// state machine owns another.
#[derive(Clone)]
pub struct MockEngine {
    inner: Arc<Inner>,
}

struct Inner {
    label: String,
    calls: Mutex<Vec<Call>>,
    failing: Mutex<HashSet<&'static str>>,
    stalling: Mutex<HashSet<&'static str>>,
    local: Mutex<Option<SessionDescription>>,
    closed: Mutex<bool>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
}

impl MockEngine {
    pub fn new(label: impl Into<String>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                label: label.into(),
                calls: Mutex::new(Vec::new()),
                failing: Mutex::new(HashSet::new()),
                stalling: Mutex::new(HashSet::new()),
                local: Mutex::new(None),
                closed: Mutex::new(false),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        }
    }

    /// Makes every later call to `op` (e.g. `"create_offer"`) fail.
    pub fn fail_on(&self, op: &'static str) {
        self.inner.failing.lock().insert(op);
    }

    pub fn recover(&self, op: &'static str) {
        self.inner.failing.lock().remove(op);
    }

    /// Makes every later call to `op` record itself and then never return.
    pub fn stall_on(&self, op: &'static str) {
        self.inner.stalling.lock().insert(op);
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.inner.events_tx.send(event);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.calls.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.inner.calls.lock().iter().filter(|c| predicate(c)).count()
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.lock()
    }

    fn record(&self, op: &'static str, call: Call) -> Result<(), EngineError> {
        if *self.inner.closed.lock() {
            return Err(EngineError::Closed);
        }
        self.inner.calls.lock().push(call);
        if self.inner.failing.lock().contains(op) {
            return Err(EngineError::operation(op, "injected failure"));
        }
        Ok(())
    }

    async fn enter(&self, op: &'static str, call: Call) -> Result<(), EngineError> {
        self.record(op, call)?;
        let stalled = self.inner.stalling.lock().contains(op);
        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    fn sdp(&self, kind: &str) -> String {
        format!(
            "v=0\r\no=mock-{} 0 0 IN IP4 127.0.0.1\r\ns={}\r\n",
            self.inner.label, kind
        )
    }
}

#[async_trait]
impl PeerConnectionEngine for MockEngine {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        self.enter("create_offer", Call::CreateOffer).await?;
        Ok(SessionDescription::offer(self.sdp("offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.enter("create_answer", Call::CreateAnswer).await?;
        Ok(SessionDescription::answer(self.sdp("answer")))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.enter("set_local_description", Call::SetLocal(desc.kind)).await?;
        *self.inner.local.lock() = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.record("set_remote_description", Call::SetRemote(desc))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.inner.local.lock().clone()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.record("add_ice_candidate", Call::AddCandidate(candidate))
    }

    async fn add_track(&self, kind: MediaKind) -> Result<(), EngineError> {
        self.enter("add_track", Call::AddTrack(kind)).await
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.inner.events_rx.lock().take()
    }

    async fn close(&self) -> Result<(), EngineError> {
        let mut closed = self.inner.closed.lock();
        if !*closed {
            *closed = true;
            self.inner.calls.lock().push(Call::Close);
        }
        Ok(())
    }
}
