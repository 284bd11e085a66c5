use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use webrtc::track::track_remote::TrackRemote;

use crate::error::SessionError;
use crate::peer::DataChannelHandle;
use crate::protocol::{Frame, IceCandidate, SignalMessage};

/// Identity of one component instance. Events from an instance that has since
/// been replaced carry a stale origin and are discarded by the session loop.
pub type Origin = u64;

static NEXT_ORIGIN: AtomicU64 = AtomicU64::new(1);

pub fn next_origin() -> Origin {
    NEXT_ORIGIN.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug)]
pub struct Stamped<E> {
    pub origin: Origin,
    pub event: E,
}

pub struct EventSink<E> {
    origin: Origin,
    tx: mpsc::UnboundedSender<Stamped<E>>,
}

impl<E> Clone for EventSink<E> {
    fn clone(&self) -> Self {
        Self {
            origin: self.origin,
            tx: self.tx.clone(),
        }
    }
}

impl<E> EventSink<E> {
    pub fn new(origin: Origin, tx: mpsc::UnboundedSender<Stamped<E>>) -> Self {
        Self { origin, tx }
    }

    /// Sink with a fresh origin and its receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Stamped<E>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(next_origin(), tx), rx)
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Same receiver, new identity.
    pub fn rebind(&self) -> Self {
        Self::new(next_origin(), self.tx.clone())
    }

    pub fn emit(&self, event: E) -> bool {
        self.tx
            .send(Stamped {
                origin: self.origin,
                event,
            })
            .is_ok()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignalingEvent {
    Connecting,
    Connected,
    Disconnected { reason: String },
    Retry { attempt: u32, delay: Duration },
    Error(SessionError),
    Message(SignalMessage),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Connecting => "connecting",
            ChannelState::Open => "open",
            ChannelState::Closing => "closing",
            ChannelState::Closed => "closed",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Closed,
    Frame(Frame),
    Error(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    pub track: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    IceGatheringComplete,
    IceConnectionState(IceConnectionState),
    ConnectionState(PeerConnectionState),
    SignalingState(SignalingState),
    /// Channel opened by the remote side; not yet bound.
    RemoteChannel(Arc<dyn DataChannelHandle>),
    Channel { label: String, event: ChannelEvent },
    Track(RemoteTrack),
    /// Negotiation output that must go out over signaling.
    Outbound(SignalMessage),
    Failed(SessionError),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            PeerEvent::IceGatheringComplete => f.write_str("IceGatheringComplete"),
            PeerEvent::IceConnectionState(state) => {
                f.debug_tuple("IceConnectionState").field(state).finish()
            }
            PeerEvent::ConnectionState(state) => {
                f.debug_tuple("ConnectionState").field(state).finish()
            }
            PeerEvent::SignalingState(state) => {
                f.debug_tuple("SignalingState").field(state).finish()
            }
            PeerEvent::RemoteChannel(handle) => f
                .debug_tuple("RemoteChannel")
                .field(&handle.label())
                .finish(),
            PeerEvent::Channel { label, event } => f
                .debug_struct("Channel")
                .field("label", label)
                .field("event", event)
                .finish(),
            PeerEvent::Track(track) => f.debug_tuple("Track").field(track).finish(),
            PeerEvent::Outbound(message) => f.debug_tuple("Outbound").field(message).finish(),
            PeerEvent::Failed(err) => f.debug_tuple("Failed").field(err).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rebind_keeps_receiver_but_changes_origin() {
        let (sink, mut rx) = EventSink::<SignalingEvent>::channel();
        let next = sink.rebind();
        assert_ne!(sink.origin(), next.origin());

        assert!(sink.emit(SignalingEvent::Connecting));
        assert!(next.emit(SignalingEvent::Connected));
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.origin, sink.origin());
        assert_eq!(second.origin, next.origin());
        assert_eq!(second.event, SignalingEvent::Connected);
    }

    #[test]
    fn emit_reports_closed_receiver() {
        let (sink, rx) = EventSink::<SignalingEvent>::channel();
        drop(rx);
        assert!(!sink.emit(SignalingEvent::Connecting));
    }
}
