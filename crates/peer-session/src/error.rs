use thiserror::Error;

/// Every failure a session can observe.
///
/// Network and negotiation failures are folded into [`crate::SessionState`]
/// rather than returned; only contract violations come back as `Err`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("signaling connect timed out")]
    TransportTimeout,
    #[error("signaling transport closed: {reason}")]
    TransportClosed { reason: String },
    #[error("signaling reconnect gave up after {attempts} attempts")]
    TransportReconnectExhausted { attempts: u32 },
    #[error("signaling transport setup failed: {0}")]
    TransportSetup(String),
    #[error("negotiation failed during {stage}: {reason}")]
    NegotiationFailed { stage: &'static str, reason: String },
    #[error("peer connection failed")]
    IceConnectionFailed,
    #[error("failed to create data channel {label}: {reason}")]
    ChannelCreateFailed { label: String, reason: String },
    #[error("data channel {label} is not open")]
    ChannelSendFailed { label: String },
    #[error("data channel {label} failed: {reason}")]
    ChannelFailed { label: String, reason: String },
    #[error("malformed message: {0}")]
    MessageDecodeError(String),
    #[error("对方已离开房间")]
    PeerLeft,
    #[error("signaling server error: {0}")]
    SignalingServer(String),
    #[error("session manager not initialized")]
    ManagerNotInitialized,
    #[error("no room to retry")]
    NoRoomInfo,
    #[error("peer connection not established")]
    PeerNotReady,
    #[error("invalid room code {0:?}")]
    InvalidRoomCode(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SessionError {
    /// Whether a manual `retry()` is a sensible next step.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            SessionError::TransportTimeout
                | SessionError::TransportClosed { .. }
                | SessionError::TransportSetup(_)
                | SessionError::NegotiationFailed { .. }
                | SessionError::IceConnectionFailed
                | SessionError::ChannelCreateFailed { .. }
                | SessionError::ChannelFailed { .. }
                | SessionError::PeerLeft
                | SessionError::SignalingServer(_)
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            SessionError::TransportTimeout => "transport_timeout",
            SessionError::TransportClosed { .. } => "transport_closed",
            SessionError::TransportReconnectExhausted { .. } => "transport_reconnect_exhausted",
            SessionError::TransportSetup(_) => "transport_setup",
            SessionError::NegotiationFailed { .. } => "negotiation_failed",
            SessionError::IceConnectionFailed => "ice_connection_failed",
            SessionError::ChannelCreateFailed { .. } => "channel_create_failed",
            SessionError::ChannelSendFailed { .. } => "channel_send_failed",
            SessionError::ChannelFailed { .. } => "channel_failed",
            SessionError::MessageDecodeError(_) => "message_decode_error",
            SessionError::PeerLeft => "peer_left",
            SessionError::SignalingServer(_) => "signaling_server",
            SessionError::ManagerNotInitialized => "manager_not_initialized",
            SessionError::NoRoomInfo => "no_room_info",
            SessionError::PeerNotReady => "peer_not_ready",
            SessionError::InvalidRoomCode(_) => "invalid_room_code",
            SessionError::InvalidConfig(_) => "invalid_config",
        }
    }

    pub(crate) fn negotiation(stage: &'static str, err: impl std::fmt::Display) -> Self {
        SessionError::NegotiationFailed {
            stage,
            reason: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
