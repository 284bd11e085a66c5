use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use url::Url;

use super::{Connector, SocketFrame, SocketPair};
use crate::error::SessionError;

/// Connects to the signaling server over tokio-tungstenite.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<SocketPair, SessionError> {
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| SessionError::TransportSetup(err.to_string()))?;
        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<SocketFrame>();

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(err) = sink.send(Message::Text(text)).await {
                    tracing::debug!(target = "signaling", error = %err, "websocket send failed");
                    return;
                }
            }
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client disconnect".into(),
                })))
                .await;
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(next) = source.next().await {
                let frame = match next {
                    Ok(Message::Text(text)) => SocketFrame::Text(text),
                    Ok(Message::Binary(bytes)) => SocketFrame::Binary(Bytes::from(bytes)),
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = match frame {
                            Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                            None => (None, "closed".to_string()),
                        };
                        let _ = inbound_tx.send(SocketFrame::Closed { code, reason });
                        return;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        let _ = inbound_tx.send(SocketFrame::Closed {
                            code: None,
                            reason: err.to_string(),
                        });
                        return;
                    }
                };
                if inbound_tx.send(frame).is_err() {
                    return;
                }
            }
            let _ = inbound_tx.send(SocketFrame::Closed {
                code: None,
                reason: "stream ended".to_string(),
            });
        });

        Ok(SocketPair {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
