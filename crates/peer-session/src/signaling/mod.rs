mod websocket;

pub use websocket::WsConnector;

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use url::Url;

use crate::config::ReconnectPolicy;
use crate::error::SessionError;
use crate::events::{EventSink, Origin, SignalingEvent};
use crate::protocol::SignalMessage;

/// Frame surfaced by a connected socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketFrame {
    Text(String),
    Binary(Bytes),
    Closed { code: Option<u16>, reason: String },
}

/// Both halves of an open signaling socket. Dropping `outbound` closes it.
pub struct SocketPair {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<SocketFrame>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &Url) -> Result<SocketPair, SessionError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportPhase {
    Idle,
    Connecting,
    Open,
    Closed,
}

struct TransportState {
    phase: TransportPhase,
    url: Option<Url>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    queue: VecDeque<String>,
    reconnect_count: u32,
    user_disconnecting: bool,
    epoch: u64,
    tasks: Vec<JoinHandle<()>>,
}

impl TransportState {
    fn track(&mut self, handle: JoinHandle<()>) {
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(handle);
    }
}

struct Shared {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    sink: EventSink<SignalingEvent>,
    state: Mutex<TransportState>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        for task in self.state.get_mut().tasks.drain(..) {
            task.abort();
        }
    }
}

/// Persistent signaling link with an outbound queue and exponential
/// reconnect.
#[derive(Clone)]
pub struct SignalingTransport {
    inner: Arc<Shared>,
}

impl SignalingTransport {
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        sink: EventSink<SignalingEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Shared {
                connector,
                policy,
                sink,
                state: Mutex::new(TransportState {
                    phase: TransportPhase::Idle,
                    url: None,
                    outbound: None,
                    queue: VecDeque::new(),
                    reconnect_count: 0,
                    user_disconnecting: false,
                    epoch: 0,
                    tasks: Vec::new(),
                }),
            }),
        }
    }

    pub fn origin(&self) -> Origin {
        self.inner.sink.origin()
    }

    pub fn phase(&self) -> TransportPhase {
        self.inner.state.lock().phase
    }

    pub fn is_connected(&self) -> bool {
        self.phase() == TransportPhase::Open
    }

    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.state.lock().reconnect_count
    }

    /// Opens the socket. Resolves once it is open or the first attempt has
    /// failed; failures also schedule a reconnect.
    pub async fn connect(&self, url: Url) -> Result<(), SessionError> {
        {
            let mut state = self.inner.state.lock();
            if matches!(state.phase, TransportPhase::Open | TransportPhase::Connecting) {
                return Ok(());
            }
            state.url = Some(url);
            state.user_disconnecting = false;
            state.reconnect_count = 0;
        }
        self.open_socket().await
    }

    async fn open_socket(&self) -> Result<(), SessionError> {
        let (epoch, url) = {
            let mut state = self.inner.state.lock();
            if state.user_disconnecting {
                return Err(SessionError::TransportClosed {
                    reason: "disconnected".into(),
                });
            }
            let Some(url) = state.url.clone() else {
                return Err(SessionError::TransportSetup("no signaling url".into()));
            };
            state.epoch += 1;
            state.phase = TransportPhase::Connecting;
            (state.epoch, url)
        };
        self.inner.sink.emit(SignalingEvent::Connecting);
        tracing::debug!(target = "signaling", url = %url, epoch, "connecting");

        let attempt = timeout(
            self.inner.policy.connect_timeout,
            self.inner.connector.connect(&url),
        )
        .await;
        let result = match attempt {
            Ok(result) => result,
            Err(_) => Err(SessionError::TransportTimeout),
        };

        match result {
            Ok(pair) => self.on_open(epoch, pair),
            Err(err) => {
                {
                    let mut state = self.inner.state.lock();
                    if state.epoch != epoch {
                        return Err(err);
                    }
                    state.phase = TransportPhase::Closed;
                }
                tracing::warn!(target = "signaling", error = %err, "connect failed");
                self.inner.sink.emit(SignalingEvent::Error(err.clone()));
                self.schedule_reconnect(epoch);
                Err(err)
            }
        }
    }

    fn on_open(&self, epoch: u64, pair: SocketPair) -> Result<(), SessionError> {
        let SocketPair { outbound, inbound } = pair;
        let flushed = {
            let mut state = self.inner.state.lock();
            if state.epoch != epoch || state.user_disconnecting {
                return Err(SessionError::TransportClosed {
                    reason: "superseded".into(),
                });
            }
            let mut flushed = 0usize;
            while let Some(text) = state.queue.pop_front() {
                if let Err(mpsc::error::SendError(text)) = outbound.send(text) {
                    state.queue.push_front(text);
                    break;
                }
                flushed += 1;
            }
            state.phase = TransportPhase::Open;
            state.reconnect_count = 0;
            state.outbound = Some(outbound);
            flushed
        };
        tracing::info!(target = "signaling", epoch, flushed, "signaling connected");
        self.inner.sink.emit(SignalingEvent::Connected);

        let reader = self.clone();
        let handle = tokio::spawn(async move { reader.read_loop(epoch, inbound).await });
        self.inner.state.lock().track(handle);
        Ok(())
    }

    async fn read_loop(&self, epoch: u64, mut inbound: mpsc::UnboundedReceiver<SocketFrame>) {
        let reason = loop {
            let Some(frame) = inbound.recv().await else {
                break "socket dropped".to_string();
            };
            let text = match frame {
                SocketFrame::Text(text) => text,
                SocketFrame::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(err) => {
                        self.report_decode(SessionError::MessageDecodeError(err.to_string()));
                        continue;
                    }
                },
                SocketFrame::Closed { code, reason } => {
                    tracing::debug!(target = "signaling", ?code, %reason, "socket closed");
                    break reason;
                }
            };
            match SignalMessage::decode(&text) {
                Ok(Some(message)) => {
                    tracing::trace!(target = "signaling", kind = message.kind(), "received");
                    self.inner.sink.emit(SignalingEvent::Message(message));
                }
                Ok(None) => {}
                Err(err) => self.report_decode(err),
            }
        };
        self.on_closed(epoch, reason);
    }

    fn report_decode(&self, err: SessionError) {
        tracing::warn!(target = "signaling", error = %err, "dropping malformed signaling frame");
        self.inner.sink.emit(SignalingEvent::Error(err));
    }

    fn on_closed(&self, epoch: u64, reason: String) {
        let user_initiated = {
            let mut state = self.inner.state.lock();
            if state.epoch != epoch {
                return;
            }
            state.phase = TransportPhase::Closed;
            state.outbound = None;
            state.user_disconnecting
        };
        tracing::info!(target = "signaling", %reason, user_initiated, "signaling disconnected");
        self.inner
            .sink
            .emit(SignalingEvent::Disconnected { reason });
        if !user_initiated {
            self.schedule_reconnect(epoch);
        }
    }

    fn schedule_reconnect(&self, epoch: u64) {
        let mut state = self.inner.state.lock();
        if state.user_disconnecting || state.epoch != epoch {
            return;
        }
        let max = self.inner.policy.max_attempts;
        if state.reconnect_count >= max {
            drop(state);
            tracing::error!(target = "signaling", attempts = max, "reconnect attempts exhausted");
            self.inner
                .sink
                .emit(SignalingEvent::Error(SessionError::TransportReconnectExhausted {
                    attempts: max,
                }));
            return;
        }
        let delay = self.inner.policy.delay_for(state.reconnect_count);
        state.reconnect_count += 1;
        let attempt = state.reconnect_count;
        tracing::info!(
            target = "signaling",
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        self.inner
            .sink
            .emit(SignalingEvent::Retry { attempt, delay });

        let transport = self.clone();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            {
                let state = transport.inner.state.lock();
                if state.user_disconnecting || state.epoch != epoch {
                    return;
                }
            }
            let _ = transport.open_socket().await;
        });
        state.track(handle);
    }

    /// Sends now when open; otherwise queues and returns `false`.
    pub fn send(&self, message: &SignalMessage) -> bool {
        let text = message.to_json();
        let mut state = self.inner.state.lock();
        if state.phase == TransportPhase::Open {
            if let Some(outbound) = state.outbound.as_ref() {
                match outbound.send(text) {
                    Ok(()) => return true,
                    Err(mpsc::error::SendError(text)) => {
                        state.queue.push_back(text);
                        return false;
                    }
                }
            }
        }
        tracing::debug!(
            target = "signaling",
            kind = message.kind(),
            queued = state.queue.len() + 1,
            "queueing while disconnected"
        );
        state.queue.push_back(text);
        false
    }

    /// Closes the socket and suppresses reconnects. Queued messages are
    /// discarded.
    pub fn disconnect(&self) {
        let tasks = {
            let mut state = self.inner.state.lock();
            state.user_disconnecting = true;
            state.epoch += 1;
            state.phase = TransportPhase::Closed;
            state.outbound = None;
            state.queue.clear();
            std::mem::take(&mut state.tasks)
        };
        for task in tasks {
            task.abort();
        }
        tracing::debug!(target = "signaling", "disconnected by client");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Stamped;
    use std::time::Duration;

    struct Refusing;

    #[async_trait]
    impl Connector for Refusing {
        async fn connect(&self, _url: &Url) -> Result<SocketPair, SessionError> {
            Err(SessionError::TransportSetup("refused".into()))
        }
    }

    fn transport(
        connector: Arc<dyn Connector>,
    ) -> (
        SignalingTransport,
        mpsc::UnboundedReceiver<Stamped<SignalingEvent>>,
    ) {
        let (sink, rx) = EventSink::channel();
        (
            SignalingTransport::new(connector, ReconnectPolicy::default(), sink),
            rx,
        )
    }

    #[tokio::test]
    async fn send_before_connect_is_queued() {
        let (transport, _rx) = transport(Arc::new(Refusing));
        let sent = transport.send(&SignalMessage::Disconnection { reason: None });
        assert!(!sent);
        assert_eq!(transport.queued(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_reconnect() {
        let (transport, mut rx) = transport(Arc::new(Refusing));
        let url = Url::parse("ws://127.0.0.1:1/ws").unwrap();
        assert!(transport.connect(url).await.is_err());

        let mut saw_retry = false;
        while let Ok(stamped) = rx.try_recv() {
            if matches!(stamped.event, SignalingEvent::Retry { attempt: 1, .. }) {
                saw_retry = true;
            }
        }
        assert!(saw_retry);

        transport.disconnect();
        tokio::time::sleep(Duration::from_secs(60)).await;
        while let Ok(stamped) = rx.try_recv() {
            assert!(
                !matches!(stamped.event, SignalingEvent::Connecting),
                "reconnect ran after disconnect"
            );
        }
        assert_eq!(transport.phase(), TransportPhase::Closed);
    }
}
