use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::{ConnectionState, EngineError, EngineEvent, MediaKind, PeerConnectionEngine};
use rendezvous_proto::{IceCandidate, SessionDescription};

const STREAM_ID: &str = "rendezvous";

/// [`PeerConnectionEngine`] backed by webrtc-rs.
///
/// Local descriptions are published only after ICE gathering completes, so
/// every candidate travels inside the SDP and no trickle is needed.
pub struct WebRtcEngine {
    pc: Arc<RTCPeerConnection>,
    tracks: Mutex<Vec<Arc<TrackLocalStaticSample>>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
}

impl WebRtcEngine {
    pub async fn new(stun_urls: &[String]) -> Result<Self, EngineError> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(|e| EngineError::operation("register_default_codecs", e))?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(|e| EngineError::operation("register_default_interceptors", e))?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if stun_urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: stun_urls.to_vec(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| EngineError::operation("new_peer_connection", e))?,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let state_tx = events_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let _ = state_tx.send(EngineEvent::ConnectionStateChanged(connection_state(state)));
            Box::pin(async {})
        }));

        let track_tx = events_tx;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => Some(MediaKind::Audio),
                    RTPCodecType::Video => Some(MediaKind::Video),
                    _ => None,
                };
                if let Some(kind) = kind {
                    let _ = track_tx.send(EngineEvent::TrackReceived {
                        kind,
                        id: track.id(),
                    });
                }
                Box::pin(async {})
            },
        ));

        Ok(Self {
            pc,
            tracks: Mutex::new(Vec::new()),
            events: Mutex::new(Some(events_rx)),
        })
    }
}

fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

fn to_wire(desc: RTCSessionDescription) -> Result<SessionDescription, EngineError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(EngineError::operation(
            "session_description",
            format!("unsupported sdp type {other}"),
        )),
    }
}

fn from_wire(desc: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    let SessionDescription { kind, sdp } = desc;
    match kind {
        rendezvous_proto::SdpKind::Offer => RTCSessionDescription::offer(sdp),
        rendezvous_proto::SdpKind::Answer => RTCSessionDescription::answer(sdp),
    }
    .map_err(|e| EngineError::operation("session_description", e))
}

#[async_trait]
impl PeerConnectionEngine for WebRtcEngine {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| EngineError::operation("create_offer", e))?;
        to_wire(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| EngineError::operation("create_answer", e))?;
        to_wire(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        let desc = from_wire(desc)?;
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| EngineError::operation("set_local_description", e))?;
        let _ = gathered.recv().await;
        debug!("ice gathering complete");
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.pc
            .set_remote_description(from_wire(desc)?)
            .await
            .map_err(|e| EngineError::operation("set_remote_description", e))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc
            .local_description()
            .await
            .and_then(|desc| to_wire(desc).ok())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| EngineError::operation("add_ice_candidate", e))
    }

    async fn add_track(&self, kind: MediaKind) -> Result<(), EngineError> {
        let mime_type = match kind {
            MediaKind::Audio => MIME_TYPE_OPUS,
            MediaKind::Video => MIME_TYPE_VP8,
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            kind.to_string(),
            STREAM_ID.to_owned(),
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| EngineError::operation("add_track", e))?;

        // RTCP has to be drained for the interceptors to make progress.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
            trace!("rtcp reader finished");
        });

        self.tracks.lock().push(track);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.events.lock().take()
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.tracks.lock().clear();
        self.pc
            .close()
            .await
            .map_err(|e| EngineError::operation("close", e))
    }
}
