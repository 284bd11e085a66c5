use crate::error::SessionError;
use crate::events::{ChannelState, IceConnectionState, PeerConnectionState, SignalingState};
use crate::protocol::Role;
use crate::signaling::TransportPhase;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionPhase {
    #[default]
    Idle,
    Connecting,
    SignalingConnected,
    PeerConnecting,
    PeerConnected,
    Disconnected,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoomInfo {
    pub code: String,
    pub role: Role,
}

/// Snapshot of one session as observed by collaborators.
///
/// `is_websocket_connected` may drop back to `false` while
/// `is_peer_connected` stays `true`; a lost signaling link does not end an
/// established peer path.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub is_websocket_connected: bool,
    pub is_peer_connected: bool,
    pub error: Option<SessionError>,
    pub can_retry: bool,
    pub current_room: Option<RoomInfo>,
}

impl SessionState {
    pub(crate) fn set_error(&mut self, error: SessionError) {
        self.can_retry = error.retryable();
        self.error = Some(error);
    }

    pub(crate) fn clear_error(&mut self) {
        self.error = None;
        self.can_retry = false;
    }

    pub(crate) fn mark_peer_connected(&mut self) {
        self.phase = SessionPhase::PeerConnected;
        self.is_peer_connected = true;
        self.clear_error();
    }
}

/// Low-level view of the link for status displays.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostics {
    pub transport: Option<TransportPhase>,
    pub ice: Option<IceConnectionState>,
    pub connection: Option<PeerConnectionState>,
    pub signaling: Option<SignalingState>,
    pub channel: ChannelState,
    pub pending_candidates: usize,
    pub queued_renegotiations: usize,
}
