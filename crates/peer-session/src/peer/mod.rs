mod negotiator;
mod rtc;

pub use negotiator::{NegotiationPhase, Negotiator};
pub use rtc::{RtcBackend, RtcDataChannel, RtcLink};

use std::sync::Arc;

use async_trait::async_trait;
use webrtc::track::track_local::TrackLocal;

use crate::config::{ChannelOptions, SessionConfig};
use crate::error::SessionError;
use crate::events::{ChannelState, EventSink, PeerEvent, SignalingState};
use crate::protocol::{Frame, IceCandidate, SessionDescription};

pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

/// Handle for a track added with [`PeerLink::add_track`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SenderId(pub u64);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NegotiationOptions {
    pub offer_to_receive_audio: bool,
    pub offer_to_receive_video: bool,
    pub ice_restart: bool,
}

/// One side of a data channel. Lifecycle and inbound frames are reported
/// through the link's event sink as [`PeerEvent::Channel`].
#[async_trait]
pub trait DataChannelHandle: Send + Sync {
    fn label(&self) -> String;
    fn ready_state(&self) -> ChannelState;
    fn send(&self, frame: Frame) -> Result<(), SessionError>;
    async fn buffered_amount(&self) -> usize;
    async fn close(&self);
}

/// Negotiation primitives of one peer connection.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_offer(
        &self,
        options: NegotiationOptions,
    ) -> Result<SessionDescription, SessionError>;
    async fn create_answer(&self) -> Result<SessionDescription, SessionError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), SessionError>;
    async fn set_remote_description(&self, desc: SessionDescription)
    -> Result<(), SessionError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError>;
    async fn create_data_channel(
        &self,
        label: &str,
        options: ChannelOptions,
    ) -> Result<Arc<dyn DataChannelHandle>, SessionError>;
    async fn add_track(&self, track: LocalTrack) -> Result<SenderId, SessionError>;
    async fn remove_track(&self, sender: SenderId) -> Result<(), SessionError>;
    fn signaling_state(&self) -> SignalingState;
    async fn close(&self);
}

/// Factory for peer links; every link reports through its own sink.
#[async_trait]
pub trait PeerBackend: Send + Sync + 'static {
    async fn create_link(
        &self,
        config: &SessionConfig,
        sink: EventSink<PeerEvent>,
    ) -> Result<Arc<dyn PeerLink>, SessionError>;
}
