use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_remote::TrackRemote;

use super::{DataChannelHandle, LocalTrack, NegotiationOptions, PeerBackend, PeerLink, SenderId};
use crate::config::{ChannelOptions, SessionConfig};
use crate::error::SessionError;
use crate::events::{
    ChannelEvent, ChannelState, EventSink, IceConnectionState, MediaKind, PeerConnectionState,
    PeerEvent, RemoteTrack, SignalingState,
};
use crate::protocol::{Frame, IceCandidate, SessionDescription};

fn to_setup_error(err: impl std::fmt::Display) -> SessionError {
    SessionError::TransportSetup(err.to_string())
}

fn build_api(setting: SettingEngine) -> Result<API, SessionError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Both description types serialize as `{"type", "sdp"}`.
fn convert<T: Serialize, U: DeserializeOwned>(value: &T) -> Result<U, SessionError> {
    serde_json::to_value(value)
        .and_then(serde_json::from_value)
        .map_err(|err| SessionError::MessageDecodeError(err.to_string()))
}

fn ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        RTCIceConnectionState::Unspecified => return None,
    })
}

fn peer_state(state: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    Some(match state {
        RTCPeerConnectionState::New => PeerConnectionState::New,
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        RTCPeerConnectionState::Unspecified => return None,
    })
}

fn signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
    }
}

fn media_kind(kind: RTPCodecType) -> MediaKind {
    match kind {
        RTPCodecType::Audio => MediaKind::Audio,
        _ => MediaKind::Video,
    }
}

/// [`PeerBackend`] over webrtc-rs.
#[derive(Clone, Default)]
pub struct RtcBackend {
    setting: Option<Arc<dyn Fn() -> SettingEngine + Send + Sync>>,
}

impl RtcBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the setting engine used for each link, e.g. to pin network
    /// types in tests.
    pub fn with_setting_engine<F>(mut self, build: F) -> Self
    where
        F: Fn() -> SettingEngine + Send + Sync + 'static,
    {
        self.setting = Some(Arc::new(build));
        self
    }
}

#[async_trait]
impl PeerBackend for RtcBackend {
    async fn create_link(
        &self,
        config: &SessionConfig,
        sink: EventSink<PeerEvent>,
    ) -> Result<Arc<dyn PeerLink>, SessionError> {
        let setting = match &self.setting {
            Some(build) => build(),
            None => SettingEngine::default(),
        };
        let api = build_api(setting)?;
        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ice_candidate_pool_size: config.ice_candidate_pool_size,
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(to_setup_error)?,
        );
        RtcLink::wire(&pc, &sink);
        tracing::debug!(target = "webrtc", origin = sink.origin(), "peer connection created");
        Ok(Arc::new(RtcLink {
            pc,
            sink,
            senders: Mutex::new(HashMap::new()),
            next_sender: AtomicU64::new(1),
        }))
    }
}

pub struct RtcLink {
    pc: Arc<RTCPeerConnection>,
    sink: EventSink<PeerEvent>,
    senders: Mutex<HashMap<u64, Arc<RTCRtpSender>>>,
    next_sender: AtomicU64,
}

impl RtcLink {
    fn wire(pc: &Arc<RTCPeerConnection>, sink: &EventSink<PeerEvent>) {
        let candidates = sink.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            match candidate {
                Some(candidate) => match candidate.to_json() {
                    Ok(init) => {
                        candidates.emit(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(target = "webrtc", error = %err, "failed to serialize local candidate");
                    }
                },
                None => {
                    candidates.emit(PeerEvent::IceGatheringComplete);
                }
            }
            Box::pin(async {})
        }));

        let ice = sink.clone();
        pc.on_ice_connection_state_change(Box::new(move |state| {
            tracing::debug!(target = "webrtc", state = %state, "ice connection state");
            if let Some(state) = ice_state(state) {
                ice.emit(PeerEvent::IceConnectionState(state));
            }
            Box::pin(async {})
        }));

        let connection = sink.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            tracing::debug!(target = "webrtc", state = %state, "peer connection state");
            if let Some(state) = peer_state(state) {
                connection.emit(PeerEvent::ConnectionState(state));
            }
            Box::pin(async {})
        }));

        let signaling = sink.clone();
        pc.on_signaling_state_change(Box::new(move |state| {
            signaling.emit(PeerEvent::SignalingState(signaling_state(state)));
            Box::pin(async {})
        }));

        let channels = sink.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            tracing::debug!(target = "webrtc", label = dc.label(), "remote data channel");
            let handle = RtcDataChannel::attach(dc, channels.clone());
            channels.emit(PeerEvent::RemoteChannel(handle.clone()));
            handle.wire();
            Box::pin(async {})
        }));

        let tracks = sink.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            tracks.emit(PeerEvent::Track(RemoteTrack {
                id: track.id(),
                stream_id: track.stream_id(),
                kind: media_kind(track.kind()),
                track: Some(track),
            }));
            Box::pin(async {})
        }));
    }

    async fn ensure_recv_transceiver(&self, kind: RTPCodecType) -> Result<(), SessionError> {
        let transceivers = self.pc.get_transceivers().await;
        if transceivers.iter().any(|t| t.kind() == kind) {
            return Ok(());
        }
        self.pc
            .add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|err| SessionError::negotiation("add_transceiver", err))?;
        Ok(())
    }
}

#[async_trait]
impl PeerLink for RtcLink {
    async fn create_offer(
        &self,
        options: NegotiationOptions,
    ) -> Result<SessionDescription, SessionError> {
        if options.offer_to_receive_audio {
            self.ensure_recv_transceiver(RTPCodecType::Audio).await?;
        }
        if options.offer_to_receive_video {
            self.ensure_recv_transceiver(RTPCodecType::Video).await?;
        }
        let offer = self
            .pc
            .create_offer(Some(RTCOfferOptions {
                ice_restart: options.ice_restart,
                ..Default::default()
            }))
            .await
            .map_err(|err| SessionError::negotiation("create_offer", err))?;
        convert(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, SessionError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| SessionError::negotiation("create_answer", err))?;
        convert(&answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), SessionError> {
        let desc: RTCSessionDescription = convert(&desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|err| SessionError::negotiation("set_local_description", err))
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), SessionError> {
        let desc: RTCSessionDescription = convert(&desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|err| SessionError::negotiation("set_remote_description", err))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| SessionError::negotiation("add_ice_candidate", err))
    }

    async fn create_data_channel(
        &self,
        label: &str,
        options: ChannelOptions,
    ) -> Result<Arc<dyn DataChannelHandle>, SessionError> {
        let init = RTCDataChannelInit {
            ordered: Some(options.ordered),
            max_retransmits: options.max_retransmits,
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(|err| SessionError::ChannelCreateFailed {
                label: label.to_string(),
                reason: err.to_string(),
            })?;
        let handle = RtcDataChannel::attach(dc, self.sink.clone());
        handle.wire();
        Ok(handle)
    }

    async fn add_track(&self, track: LocalTrack) -> Result<SenderId, SessionError> {
        let sender = self
            .pc
            .add_track(track)
            .await
            .map_err(|err| SessionError::negotiation("add_track", err))?;
        let id = self.next_sender.fetch_add(1, Ordering::Relaxed);
        self.senders.lock().insert(id, sender);
        Ok(SenderId(id))
    }

    async fn remove_track(&self, sender: SenderId) -> Result<(), SessionError> {
        let Some(rtp_sender) = self.senders.lock().remove(&sender.0) else {
            return Ok(());
        };
        self.pc
            .remove_track(&rtp_sender)
            .await
            .map_err(|err| SessionError::negotiation("remove_track", err))
    }

    fn signaling_state(&self) -> SignalingState {
        signaling_state(self.pc.signaling_state())
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target = "webrtc", error = %err, "peer connection close failed");
        }
    }
}

/// Data channel with a dedicated writer task so sends stay synchronous for
/// callers.
pub struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
    sink: EventSink<PeerEvent>,
    outbound: mpsc::UnboundedSender<Frame>,
}

impl RtcDataChannel {
    fn attach(dc: Arc<RTCDataChannel>, sink: EventSink<PeerEvent>) -> Arc<Self> {
        let label = dc.label().to_string();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let writer_dc = dc.clone();
        let writer_sink = sink.clone();
        let writer_label = label.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let len = frame.len();
                let result = match frame {
                    Frame::Text(text) => writer_dc.send_text(text).await,
                    Frame::Binary(bytes) => writer_dc.send(&bytes).await,
                };
                if let Err(err) = result {
                    tracing::warn!(
                        target = "webrtc",
                        label = %writer_label,
                        frame_len = len,
                        error = %err,
                        "data channel send failed"
                    );
                    writer_sink.emit(PeerEvent::Channel {
                        label: writer_label.clone(),
                        event: ChannelEvent::Error(err.to_string()),
                    });
                }
            }
        });
        Arc::new(Self {
            dc,
            label,
            sink,
            outbound,
        })
    }

    fn wire(&self) {
        let open_sink = self.sink.clone();
        let label = self.label.clone();
        self.dc.on_open(Box::new(move || {
            tracing::debug!(target = "webrtc", label = %label, "data channel open");
            open_sink.emit(PeerEvent::Channel {
                label,
                event: ChannelEvent::Open,
            });
            Box::pin(async {})
        }));

        let close_sink = self.sink.clone();
        let label = self.label.clone();
        self.dc.on_close(Box::new(move || {
            tracing::debug!(target = "webrtc", label = %label, "data channel closed");
            close_sink.emit(PeerEvent::Channel {
                label: label.clone(),
                event: ChannelEvent::Closed,
            });
            Box::pin(async {})
        }));

        let message_sink = self.sink.clone();
        let label = self.label.clone();
        self.dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let frame = if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => Frame::Text(text),
                    Err(_) => Frame::Binary(msg.data),
                }
            } else {
                Frame::Binary(msg.data)
            };
            message_sink.emit(PeerEvent::Channel {
                label: label.clone(),
                event: ChannelEvent::Frame(frame),
            });
            Box::pin(async {})
        }));

        let error_sink = self.sink.clone();
        let label = self.label.clone();
        self.dc.on_error(Box::new(move |err| {
            tracing::warn!(target = "webrtc", label = %label, error = %err, "data channel error");
            error_sink.emit(PeerEvent::Channel {
                label: label.clone(),
                event: ChannelEvent::Error(err.to_string()),
            });
            Box::pin(async {})
        }));
    }
}

#[async_trait]
impl DataChannelHandle for RtcDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn ready_state(&self) -> ChannelState {
        match self.dc.ready_state() {
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing => ChannelState::Closing,
            RTCDataChannelState::Closed => ChannelState::Closed,
            _ => ChannelState::Connecting,
        }
    }

    fn send(&self, frame: Frame) -> Result<(), SessionError> {
        if self.ready_state() != ChannelState::Open {
            return Err(SessionError::ChannelSendFailed {
                label: self.label.clone(),
            });
        }
        self.outbound
            .send(frame)
            .map_err(|_| SessionError::ChannelFailed {
                label: self.label.clone(),
                reason: "writer stopped".into(),
            })
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn close(&self) {
        if let Err(err) = self.dc.close().await {
            tracing::debug!(target = "webrtc", label = %self.label, error = %err, "data channel close failed");
        }
    }
}
