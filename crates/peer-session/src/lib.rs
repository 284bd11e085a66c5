//! Client-side session manager for room-based peer-to-peer links.
//!
//! A [`PeerSession`] joins a room on a signaling server, negotiates a WebRTC
//! peer connection with the other occupant, multiplexes tagged messages and
//! binary data over its data channels, and reports everything through a
//! single observable [`SessionState`].

pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod peer;
pub mod protocol;
pub mod router;
pub mod session;
pub mod signaling;

pub use channel::{ChannelMultiplexer, Inbound, Outbound, SendOutcome};
pub use config::{ChannelOptions, IceServer, ReconnectPolicy, SessionConfig, SessionConfigBuilder};
pub use error::SessionError;
pub use events::{ChannelState, MediaKind, RemoteTrack};
pub use peer::{NegotiationOptions, PeerBackend, PeerLink, RtcBackend};
pub use protocol::{ChannelMessage, Frame, IceCandidate, Role, SessionDescription, SignalMessage};
pub use router::{MessageRouter, Registration};
pub use session::{Diagnostics, PeerSession, RoomInfo, SessionPhase, SessionState};
pub use signaling::{Connector, SignalingTransport, WsConnector};
