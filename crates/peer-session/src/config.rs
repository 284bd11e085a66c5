use std::env;
use std::time::Duration;

use url::Url;

use crate::error::SessionError;
use crate::protocol::Role;

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080/ws/webrtc";
pub const DEFAULT_CHANNEL_LABEL: &str = "shared-channel";
pub const DEFAULT_CHANNEL_PARAM: &str = "shared";
pub const DEFAULT_DATA_TAG: &str = "file-transfer";
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;
pub const ROOM_CODE_LEN: usize = 6;

const DEFAULT_ICE_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:global.stun.twilio.com:3478",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Signaling reconnect behaviour. The n-th retry (0-based) waits
/// `base_delay * 2^n`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelOptions {
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            ordered: true,
            max_retransmits: Some(3),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Signaling endpoint; `http(s)` is rewritten to `ws(s)`.
    pub signaling_url: String,
    /// Label of the data channel the sender opens eagerly.
    pub channel_label: String,
    /// Value of the `channel` query parameter on the room URL.
    pub channel_param: String,
    /// Tag binary frames are routed under.
    pub data_tag: String,
    pub ice_servers: Vec<IceServer>,
    pub ice_candidate_pool_size: u8,
    pub reconnect: ReconnectPolicy,
    pub channel: ChannelOptions,
    pub chunk_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            channel_param: DEFAULT_CHANNEL_PARAM.to_string(),
            data_tag: DEFAULT_DATA_TAG.to_string(),
            ice_servers: DEFAULT_ICE_SERVERS
                .iter()
                .map(|url| IceServer::stun(*url))
                .collect(),
            ice_candidate_pool_size: 10,
            reconnect: ReconnectPolicy::default(),
            channel: ChannelOptions::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = env::var("ROOM_PEER_SIGNALING_URL") {
            if !url.trim().is_empty() {
                config.signaling_url = url.trim().to_string();
            }
        }
        if let Ok(servers) = env::var("ROOM_PEER_ICE_SERVERS") {
            let parsed: Vec<IceServer> = servers
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(IceServer::stun)
                .collect();
            if !parsed.is_empty() {
                config.ice_servers = parsed;
            }
        }
        if env::var("ROOM_PEER_LOCALHOST_ONLY").is_ok() {
            config.ice_servers.clear();
        }
        config
    }

    /// Signaling URL for one room: `<base>?code=..&role=..&channel=..`.
    pub fn room_url(&self, code: &str, role: Role) -> Result<Url, SessionError> {
        let mut url = derive_websocket_url(&self.signaling_url)?;
        url.query_pairs_mut()
            .append_pair("code", code)
            .append_pair("role", role.as_str())
            .append_pair("channel", &self.channel_param);
        Ok(url)
    }
}

pub fn derive_websocket_url(base: &str) -> Result<Url, SessionError> {
    let mut url = Url::parse(base)
        .map_err(|err| SessionError::InvalidConfig(format!("signaling url {base}: {err}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SessionError::InvalidConfig(format!(
                "unsupported signaling scheme {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SessionError::InvalidConfig(format!("cannot use scheme {scheme}")))?;
    Ok(url)
}

/// Room codes are six ASCII alphanumerics.
pub fn validate_room_code(code: &str) -> Result<(), SessionError> {
    let trimmed = code.trim();
    if trimmed.len() == ROOM_CODE_LEN && trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
        Ok(())
    } else {
        Err(SessionError::InvalidRoomCode(code.to_string()))
    }
}

pub struct SessionConfigBuilder {
    config: SessionConfig,
    ice_servers: Option<Vec<IceServer>>,
}

impl SessionConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
            ice_servers: None,
        }
    }

    pub fn signaling_url(mut self, url: impl Into<String>) -> Self {
        self.config.signaling_url = url.into();
        self
    }

    pub fn channel_label(mut self, label: impl Into<String>) -> Self {
        self.config.channel_label = label.into();
        self
    }

    pub fn data_tag(mut self, tag: impl Into<String>) -> Self {
        self.config.data_tag = tag.into();
        self
    }

    pub fn add_ice_server(mut self, urls: Vec<String>) -> Self {
        self.ice_servers.get_or_insert_with(Vec::new).push(IceServer {
            urls,
            username: None,
            credential: None,
        });
        self
    }

    pub fn add_ice_server_with_credentials(
        mut self,
        urls: Vec<String>,
        username: String,
        credential: String,
    ) -> Self {
        self.ice_servers.get_or_insert_with(Vec::new).push(IceServer {
            urls,
            username: Some(username),
            credential: Some(credential),
        });
        self
    }

    /// No STUN/TURN; host candidates only.
    pub fn localhost_only(mut self) -> Self {
        self.ice_servers = Some(Vec::new());
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    pub fn channel_options(mut self, options: ChannelOptions) -> Self {
        self.config.channel = options;
        self
    }

    pub fn build(mut self) -> Result<SessionConfig, SessionError> {
        derive_websocket_url(&self.config.signaling_url)?;
        if self.config.channel_label.is_empty() {
            return Err(SessionError::InvalidConfig(
                "channel label must not be empty".into(),
            ));
        }
        if let Some(servers) = self.ice_servers.take() {
            self.config.ice_servers = servers;
        }
        Ok(self.config)
    }
}

impl Default for SessionConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
