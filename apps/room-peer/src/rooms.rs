use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum RoomError {
    #[error("invalid room server url: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("server rejected request: {0}")]
    Server(String),
    #[error("room {code} is unavailable: {message}")]
    Unavailable { code: String, message: String },
    #[error("the sender of room {0} is not online")]
    SenderOffline(String),
}

#[derive(Debug, Deserialize)]
struct CreateRoomResponse {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct RoomStatus {
    pub success: bool,
    #[serde(default)]
    pub sender_online: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// HTTP client for the room endpoints next to the signaling server.
pub struct RoomClient {
    base: Url,
    client: reqwest::Client,
}

impl RoomClient {
    pub fn new(base: &str) -> Result<Self, RoomError> {
        let mut base = Url::parse(base)
            .map_err(|err| RoomError::InvalidConfig(format!("{base}: {err}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()?;
        Ok(Self { base, client })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Signaling endpoint served by the same host.
    pub fn signaling_url(&self) -> Result<Url, RoomError> {
        self.endpoint("ws/webrtc")
    }

    fn endpoint(&self, path: &str) -> Result<Url, RoomError> {
        self.base
            .join(path)
            .map_err(|err| RoomError::InvalidConfig(format!("invalid endpoint {path}: {err}")))
    }

    pub async fn create_room(&self) -> Result<String, RoomError> {
        let endpoint = self.endpoint("api/create-room")?;
        let response = self
            .client
            .post(endpoint)
            .json(&serde_json::json!({}))
            .send()
            .await?;
        let status = response.status();
        let payload = response
            .json::<CreateRoomResponse>()
            .await
            .map_err(|err| {
                if status.is_success() {
                    RoomError::Network(err)
                } else {
                    RoomError::Server(format!("{status}"))
                }
            })?;
        if !status.is_success() {
            return Err(match payload.error {
                Some(error) => RoomError::Server(error),
                None => RoomError::HttpStatus(status),
            });
        }
        match payload.code {
            Some(code) => {
                tracing::info!(target = "rooms", code = %code, "room created");
                Ok(code)
            }
            None => Err(RoomError::Server(
                payload
                    .error
                    .unwrap_or_else(|| "response carried no room code".into()),
            )),
        }
    }

    pub async fn room_status(&self, code: &str) -> Result<RoomStatus, RoomError> {
        let mut endpoint = self.endpoint("api/room-info")?;
        endpoint.query_pairs_mut().append_pair("code", code);
        let response = self.client.get(endpoint).send().await?;
        if !response.status().is_success() {
            return Err(RoomError::HttpStatus(response.status()));
        }
        Ok(response.json::<RoomStatus>().await?)
    }

    /// Fails unless the room exists and its sender is online.
    pub async fn check_joinable(&self, code: &str) -> Result<(), RoomError> {
        let status = self.room_status(code).await?;
        if !status.success {
            return Err(RoomError::Unavailable {
                code: code.to_string(),
                message: status
                    .message
                    .unwrap_or_else(|| "room does not exist or has expired".into()),
            });
        }
        if !status.sender_online {
            return Err(RoomError::SenderOffline(code.to_string()));
        }
        tracing::debug!(target = "rooms", code, "room is joinable");
        Ok(())
    }
}
