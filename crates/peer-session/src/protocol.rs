use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::SessionError;

/// Which side of the room a client occupies. Only the sender ever opens a
/// negotiation on first contact.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Sender => "sender",
            Role::Receiver => "receiver",
        }
    }

    pub fn counterpart(self) -> Role {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = SessionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "sender" => Ok(Role::Sender),
            "receiver" => Ok(Role::Receiver),
            other => Err(SessionError::InvalidConfig(format!("unknown role {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Offer/answer body as exchanged over signaling: `{"type": "...", "sdp": "..."}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn rollback() -> Self {
        Self {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

/// Raw shape of every signaling frame.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PeerJoinedPayload {
    role: Role,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignalMessage {
    PeerJoined { role: Role },
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    Error { error: String },
    Disconnection { reason: Option<String> },
}

impl SignalMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::PeerJoined { .. } => "peer-joined",
            SignalMessage::Offer(_) => "offer",
            SignalMessage::Answer(_) => "answer",
            SignalMessage::IceCandidate(_) => "ice-candidate",
            SignalMessage::Error { .. } => "error",
            SignalMessage::Disconnection { .. } => "disconnection",
        }
    }

    /// Decodes one inbound text frame.
    ///
    /// `Ok(None)` means the frame was well formed but carries a type this
    /// client does not consume.
    pub fn decode(text: &str) -> Result<Option<Self>, SessionError> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|err| SessionError::MessageDecodeError(err.to_string()))?;
        let payload = envelope.payload;
        let message = match envelope.kind.as_str() {
            "peer-joined" => {
                let body: PeerJoinedPayload = from_payload(payload, "peer-joined")?;
                SignalMessage::PeerJoined { role: body.role }
            }
            "offer" => SignalMessage::Offer(from_payload(payload, "offer")?),
            "answer" => SignalMessage::Answer(from_payload(payload, "answer")?),
            "ice-candidate" => SignalMessage::IceCandidate(from_payload(payload, "ice-candidate")?),
            "error" => {
                let error = envelope
                    .error
                    .or_else(|| {
                        payload
                            .get("error")
                            .and_then(Value::as_str)
                            .map(str::to_owned)
                    })
                    .unwrap_or_else(|| "unknown signaling error".to_owned());
                SignalMessage::Error { error }
            }
            "disconnection" => SignalMessage::Disconnection {
                reason: payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
            },
            other => {
                tracing::debug!(target = "signaling", kind = other, "ignoring unknown message type");
                return Ok(None);
            }
        };
        Ok(Some(message))
    }

    pub fn to_json(&self) -> String {
        let (payload, error) = match self {
            SignalMessage::PeerJoined { role } => (json!({ "role": role }), None),
            SignalMessage::Offer(desc) | SignalMessage::Answer(desc) => (json!(desc), None),
            SignalMessage::IceCandidate(candidate) => (json!(candidate), None),
            SignalMessage::Error { error } => (json!({ "error": error }), Some(error.clone())),
            SignalMessage::Disconnection { reason } => (json!({ "reason": reason }), None),
        };
        let envelope = Envelope {
            kind: self.kind().to_owned(),
            payload,
            error,
        };
        json!(envelope).to_string()
    }
}

fn from_payload<T: serde::de::DeserializeOwned>(
    payload: Value,
    kind: &str,
) -> Result<T, SessionError> {
    serde_json::from_value(payload)
        .map_err(|err| SessionError::MessageDecodeError(format!("{kind}: {err}")))
}

/// Application message carried as JSON text on a data channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl ChannelMessage {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            channel: None,
        }
    }

    pub fn on_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Logical channel tag, falling back to the carrying channel's label.
    pub fn tag<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.channel.as_deref().unwrap_or(fallback)
    }

    pub fn decode(text: &str) -> Result<Self, SessionError> {
        serde_json::from_str(text).map_err(|err| SessionError::MessageDecodeError(err.to_string()))
    }

    pub fn to_json(&self) -> String {
        json!(self).to_string()
    }
}

/// One data channel payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
