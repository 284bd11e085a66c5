mod state;

pub use state::{Diagnostics, RoomInfo, SessionPhase, SessionState};

use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::channel::{ChannelMultiplexer, Inbound, SendOutcome};
use crate::config::{SessionConfig, validate_room_code};
use crate::error::SessionError;
use crate::events::{
    ChannelEvent, ChannelState, EventSink, IceConnectionState, Origin, PeerConnectionState,
    PeerEvent, RemoteTrack, SignalingEvent, SignalingState, Stamped,
};
use crate::peer::{
    LocalTrack, NegotiationOptions, NegotiationPhase, Negotiator, PeerBackend, RtcBackend,
    SenderId,
};
use crate::protocol::{ChannelMessage, Role, SignalMessage};
use crate::router::{MessageRouter, Registration};
use crate::signaling::{Connector, SignalingTransport, WsConnector};

const LEAVE_REASON: &str = "user disconnected";

struct SessionInner {
    generation: u64,
    shut_down: bool,
    signaling: Option<SignalingTransport>,
    peer_origin: Option<Origin>,
    negotiator: Option<Arc<Negotiator>>,
    mux: Option<Arc<ChannelMultiplexer>>,
    remote_tracks: Vec<RemoteTrack>,
    ice: Option<IceConnectionState>,
    connection: Option<PeerConnectionState>,
    signaling_state: Option<SignalingState>,
}

/// Resources detached from the session under the lock and released after it.
#[derive(Default)]
struct Teardown {
    signaling: Option<SignalingTransport>,
    negotiator: Option<Arc<Negotiator>>,
    mux: Option<Arc<ChannelMultiplexer>>,
}

impl Teardown {
    /// Channel, then peer link, then signaling.
    fn run(self, notify: Option<&str>) {
        if let (Some(reason), Some(signaling)) = (notify, self.signaling.as_ref()) {
            if signaling.is_connected() {
                signaling.send(&SignalMessage::Disconnection {
                    reason: Some(reason.to_string()),
                });
            }
        }
        if let Some(mux) = self.mux {
            mux.close();
        }
        if let Some(negotiator) = self.negotiator {
            negotiator.destroy();
        }
        if let Some(signaling) = self.signaling {
            signaling.disconnect();
        }
    }
}

impl SessionInner {
    fn detach_peer(&mut self) -> Teardown {
        self.peer_origin = None;
        self.remote_tracks.clear();
        self.ice = None;
        self.connection = None;
        self.signaling_state = None;
        Teardown {
            signaling: None,
            negotiator: self.negotiator.take(),
            mux: self.mux.take(),
        }
    }

    fn detach_all(&mut self) -> Teardown {
        let mut teardown = self.detach_peer();
        teardown.signaling = self.signaling.take();
        teardown
    }
}

struct SessionShared {
    config: SessionConfig,
    backend: Arc<dyn PeerBackend>,
    connector: Arc<dyn Connector>,
    router: MessageRouter,
    inner: Mutex<SessionInner>,
    link_gate: AsyncMutex<()>,
    state_tx: watch::Sender<SessionState>,
    tracks_tx: broadcast::Sender<RemoteTrack>,
    signal_sink: EventSink<SignalingEvent>,
    peer_sink: EventSink<PeerEvent>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        if let Some(task) = self.event_loop.get_mut().take() {
            task.abort();
        }
        let teardown = self.inner.get_mut().detach_all();
        if tokio::runtime::Handle::try_current().is_ok() {
            teardown.run(None);
        } else if let Some(signaling) = teardown.signaling {
            signaling.disconnect();
        }
    }
}

/// Owns one peer-to-peer session: signaling, negotiation, data channels and
/// routing, observed through a single [`SessionState`].
///
/// All state changes happen either synchronously inside a public call or on
/// the session's event task. Every asynchronous continuation re-checks the
/// session generation before touching state, so work started before a
/// `disconnect()` cannot leak into the next session.
///
/// Must be created inside a Tokio runtime.
#[derive(Clone)]
pub struct PeerSession {
    shared: Arc<SessionShared>,
}

impl PeerSession {
    pub fn new(
        config: SessionConfig,
        backend: Arc<dyn PeerBackend>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (signal_sink, signal_rx) = EventSink::channel();
        let (peer_sink, peer_rx) = EventSink::channel();
        let (state_tx, _) = watch::channel(SessionState::default());
        let (tracks_tx, _) = broadcast::channel(16);
        let shared = Arc::new(SessionShared {
            config,
            backend,
            connector,
            router: MessageRouter::new(),
            inner: Mutex::new(SessionInner {
                generation: 0,
                shut_down: false,
                signaling: None,
                peer_origin: None,
                negotiator: None,
                mux: None,
                remote_tracks: Vec::new(),
                ice: None,
                connection: None,
                signaling_state: None,
            }),
            link_gate: AsyncMutex::new(()),
            state_tx,
            tracks_tx,
            signal_sink,
            peer_sink,
            event_loop: Mutex::new(None),
        });
        let task = tokio::spawn(run_events(Arc::downgrade(&shared), signal_rx, peer_rx));
        *shared.event_loop.lock() = Some(task);
        Self { shared }
    }

    /// Session over webrtc-rs and a WebSocket signaling server.
    pub fn with_webrtc(config: SessionConfig) -> Self {
        Self::new(config, Arc::new(RtcBackend::new()), Arc::new(WsConnector))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn state(&self) -> SessionState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn router(&self) -> &MessageRouter {
        &self.shared.router
    }

    fn is_current(&self, generation: u64) -> bool {
        self.shared.inner.lock().generation == generation
    }

    /// Applies `apply` to the state if `generation` is still live.
    fn update<F>(&self, generation: u64, apply: F) -> bool
    where
        F: FnOnce(&mut SessionState),
    {
        let inner = self.shared.inner.lock();
        if inner.generation != generation {
            tracing::trace!(target = "session", generation, "dropping stale state update");
            return false;
        }
        self.shared.state_tx.send_if_modified(|state| {
            let before = state.clone();
            apply(state);
            *state != before
        });
        true
    }

    fn fail(&self, generation: u64, err: SessionError) {
        tracing::warn!(target = "session", error = %err, code = err.code(), "session error");
        self.update(generation, |state| {
            if !state.is_peer_connected {
                state.phase = SessionPhase::Failed;
            }
            state.set_error(err);
        });
    }

    /// Joins `code` as `role`.
    ///
    /// A call made while a previous connect is still in flight is ignored.
    /// Network failures are reported through [`SessionState`]; only contract
    /// violations are returned.
    pub async fn connect(&self, code: &str, role: Role) -> Result<(), SessionError> {
        validate_room_code(code)?;
        let code = code.trim().to_string();
        let url = self.shared.config.room_url(&code, role)?;

        let (generation, signaling, previous) = {
            let mut inner = self.shared.inner.lock();
            if inner.shut_down {
                return Err(SessionError::ManagerNotInitialized);
            }
            let current = self.shared.state_tx.borrow().clone();
            if current.phase == SessionPhase::Connecting {
                tracing::info!(target = "session", code = %code, %role, "connect ignored; already connecting");
                return Ok(());
            }
            if connected_to(&current, &code, role) {
                tracing::debug!(target = "session", code = %code, %role, "already in room");
                return Ok(());
            }
            let previous = inner.detach_all();
            inner.generation += 1;
            let signaling = SignalingTransport::new(
                self.shared.connector.clone(),
                self.shared.config.reconnect,
                self.shared.signal_sink.rebind(),
            );
            inner.signaling = Some(signaling.clone());
            self.shared.state_tx.send_replace(SessionState {
                phase: SessionPhase::Connecting,
                current_room: Some(RoomInfo {
                    code: code.clone(),
                    role,
                }),
                ..SessionState::default()
            });
            (inner.generation, signaling, previous)
        };
        previous.run(Some(LEAVE_REASON));
        tracing::info!(target = "session", code = %code, %role, generation, "connecting");

        match self.ensure_peer_link(generation).await {
            Ok(Some(_)) => {}
            Ok(None) => return Ok(()),
            Err(err) => {
                self.fail(generation, err);
                return Ok(());
            }
        }
        if !self.is_current(generation) {
            return Ok(());
        }
        if let Err(err) = signaling.connect(url).await {
            tracing::debug!(target = "session", error = %err, "initial signaling connect failed");
        }
        Ok(())
    }

    /// Leaves the room. State is reset before this returns; sockets and the
    /// peer link close in the background. Registered handlers are removed.
    pub fn disconnect(&self) {
        self.reset();
        self.shared.router.clear();
        tracing::info!(target = "session", "disconnected");
    }

    fn reset(&self) {
        let teardown = {
            let mut inner = self.shared.inner.lock();
            inner.generation += 1;
            let teardown = inner.detach_all();
            self.shared.state_tx.send_replace(SessionState::default());
            teardown
        };
        teardown.run(Some(LEAVE_REASON));
    }

    /// Rebuilds everything for the current room. Handlers stay registered.
    pub async fn retry(&self) -> Result<(), SessionError> {
        let room = {
            let inner = self.shared.inner.lock();
            if inner.shut_down {
                return Err(SessionError::ManagerNotInitialized);
            }
            self.shared.state_tx.borrow().current_room.clone()
        };
        let Some(room) = room else {
            return Err(SessionError::NoRoomInfo);
        };
        tracing::info!(target = "session", code = %room.code, role = %room.role, "retrying");
        self.reset();
        self.connect(&room.code, room.role).await
    }

    /// Permanently retires this manager.
    pub fn shutdown(&self) {
        self.disconnect();
        self.shared.inner.lock().shut_down = true;
        if let Some(task) = self.shared.event_loop.lock().take() {
            task.abort();
        }
    }

    pub fn is_connected_to_room(&self, code: &str, role: Role) -> bool {
        connected_to(&self.shared.state_tx.borrow(), code, role)
    }

    /// Sends on the primary channel, tagging the message with `channel` when
    /// given. `false` means queued until the channel opens, or failed.
    pub fn send_message(&self, mut message: ChannelMessage, channel: Option<&str>) -> bool {
        if let Some(channel) = channel {
            message.channel = Some(channel.to_string());
        }
        let mux = self.shared.inner.lock().mux.clone();
        let Some(mux) = mux else {
            tracing::warn!(target = "session", kind = %message.kind, "no peer link; message not sent");
            return false;
        };
        report_send(mux.send_message(message))
    }

    pub fn send_data(&self, bytes: Bytes) -> bool {
        let mux = self.shared.inner.lock().mux.clone();
        let Some(mux) = mux else {
            tracing::warn!(target = "session", len = bytes.len(), "no peer link; data not sent");
            return false;
        };
        report_send(mux.send_data(bytes))
    }

    pub fn register_message_handler<F>(&self, channel: &str, handler: F) -> Registration
    where
        F: Fn(&ChannelMessage) + Send + Sync + 'static,
    {
        self.shared.router.register_message_handler(channel, handler)
    }

    pub fn register_data_handler<F>(&self, channel: &str, handler: F) -> Registration
    where
        F: Fn(&Bytes) + Send + Sync + 'static,
    {
        self.shared.router.register_data_handler(channel, handler)
    }

    pub fn channel_state(&self) -> ChannelState {
        match self.shared.inner.lock().mux.as_ref() {
            Some(mux) => mux.primary_state(),
            None => ChannelState::Closed,
        }
    }

    pub async fn buffered_amount(&self) -> usize {
        let mux = self.shared.inner.lock().mux.clone();
        match mux {
            Some(mux) => mux.buffered_amount().await,
            None => 0,
        }
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let inner = self.shared.inner.lock();
        Diagnostics {
            transport: inner.signaling.as_ref().map(SignalingTransport::phase),
            ice: inner.ice,
            connection: inner.connection,
            signaling: inner.signaling_state,
            channel: inner
                .mux
                .as_ref()
                .map_or(ChannelState::Closed, |mux| mux.primary_state()),
            pending_candidates: inner
                .negotiator
                .as_ref()
                .map_or(0, |negotiator| negotiator.pending_candidates()),
            queued_renegotiations: inner
                .negotiator
                .as_ref()
                .map_or(0, |negotiator| negotiator.queued_renegotiations()),
        }
    }

    pub fn remote_tracks(&self) -> Vec<RemoteTrack> {
        self.shared.inner.lock().remote_tracks.clone()
    }

    pub fn subscribe_tracks(&self) -> broadcast::Receiver<RemoteTrack> {
        self.shared.tracks_tx.subscribe()
    }

    /// Requests a fresh offer. Returns `false` when deferred behind an
    /// in-flight negotiation or when it failed; failures land in the state.
    pub async fn renegotiate(&self, options: NegotiationOptions) -> Result<bool, SessionError> {
        let (generation, negotiator) = {
            let inner = self.shared.inner.lock();
            (inner.generation, inner.negotiator.clone())
        };
        let Some(negotiator) = negotiator else {
            return Err(SessionError::PeerNotReady);
        };
        match negotiator.renegotiate(options).await {
            Ok(sent) => Ok(sent),
            Err(err) => {
                self.fail(generation, err);
                Ok(false)
            }
        }
    }

    /// Sender-side manual offer, building the peer link if the previous one
    /// was torn down.
    pub async fn create_offer_now(&self) -> Result<bool, SessionError> {
        let (generation, room) = {
            let inner = self.shared.inner.lock();
            if inner.shut_down {
                return Err(SessionError::ManagerNotInitialized);
            }
            (inner.generation, self.shared.state_tx.borrow().current_room.clone())
        };
        let Some(room) = room else {
            return Err(SessionError::NoRoomInfo);
        };
        if room.role != Role::Sender {
            tracing::debug!(target = "session", "only the sender creates offers");
            return Ok(false);
        }
        let negotiator = match self.ensure_peer_link(generation).await {
            Ok(Some(negotiator)) => negotiator,
            Ok(None) => return Ok(false),
            Err(err) => {
                self.fail(generation, err);
                return Ok(false);
            }
        };
        self.update(generation, |state| {
            if !state.is_peer_connected {
                state.phase = SessionPhase::PeerConnecting;
            }
        });
        match negotiator.renegotiate(NegotiationOptions::default()).await {
            Ok(sent) => Ok(sent),
            Err(err) => {
                self.fail(generation, err);
                Ok(false)
            }
        }
    }

    /// Adds a local media track and renegotiates if the peer is connected.
    pub async fn add_track(&self, track: LocalTrack) -> Result<SenderId, SessionError> {
        let negotiator = self
            .shared
            .inner
            .lock()
            .negotiator
            .clone()
            .ok_or(SessionError::PeerNotReady)?;
        let sender = negotiator.add_track(track).await?;
        if self.state().is_peer_connected {
            self.renegotiate(NegotiationOptions::default()).await?;
        }
        Ok(sender)
    }

    pub async fn remove_track(&self, sender: SenderId) -> Result<(), SessionError> {
        let negotiator = self
            .shared
            .inner
            .lock()
            .negotiator
            .clone()
            .ok_or(SessionError::PeerNotReady)?;
        negotiator.remove_track(sender).await?;
        if self.state().is_peer_connected {
            self.renegotiate(NegotiationOptions::default()).await?;
        }
        Ok(())
    }

    /// Returns the live negotiator, creating the peer link (and, for the
    /// sender, the primary channel) when there is none. `None` means the
    /// session moved on while the link was being built.
    async fn ensure_peer_link(
        &self,
        generation: u64,
    ) -> Result<Option<Arc<Negotiator>>, SessionError> {
        let _gate = self.shared.link_gate.lock().await;
        let (sink, role) = {
            let mut inner = self.shared.inner.lock();
            if inner.generation != generation {
                return Ok(None);
            }
            if let Some(negotiator) = inner.negotiator.clone() {
                return Ok(Some(negotiator));
            }
            let sink = self.shared.peer_sink.rebind();
            inner.peer_origin = Some(sink.origin());
            inner.mux = Some(Arc::new(ChannelMultiplexer::new(
                self.shared.config.channel_label.clone(),
                self.shared.config.data_tag.clone(),
            )));
            let role = self
                .shared
                .state_tx
                .borrow()
                .current_room
                .as_ref()
                .map(|room| room.role);
            (sink, role)
        };

        let link = self
            .shared
            .backend
            .create_link(&self.shared.config, sink.clone())
            .await?;

        let (negotiator, mux) = {
            let mut inner = self.shared.inner.lock();
            if inner.generation != generation || inner.peer_origin != Some(sink.origin()) {
                drop(inner);
                tokio::spawn(async move { link.close().await });
                return Ok(None);
            }
            let negotiator = Negotiator::new(link, sink);
            inner.negotiator = Some(negotiator.clone());
            (negotiator, inner.mux.clone())
        };
        tracing::debug!(target = "session", origin = negotiator.origin(), ?role, "peer link ready");

        if role == Some(Role::Sender) {
            if let Some(mux) = mux {
                mux.create_channel(
                    negotiator.link().as_ref(),
                    &self.shared.config.channel_label,
                    self.shared.config.channel,
                )
                .await?;
            }
        }
        Ok(Some(negotiator))
    }

    /// Drops a peer link that already carried a negotiation so a newly
    /// joined peer starts from a clean link.
    fn discard_used_link(&self, generation: u64) {
        let teardown = {
            let mut inner = self.shared.inner.lock();
            if inner.generation != generation {
                return;
            }
            let used = inner.negotiator.as_ref().is_some_and(|negotiator| {
                negotiator.has_remote_description()
                    || negotiator.phase() == NegotiationPhase::Negotiating
            });
            if !used {
                return;
            }
            inner.detach_peer()
        };
        tracing::debug!(target = "session", "discarding previous peer link");
        teardown.run(None);
    }

    async fn on_signaling(&self, stamped: Stamped<SignalingEvent>) {
        let (generation, signaling) = {
            let inner = self.shared.inner.lock();
            match inner.signaling.as_ref() {
                Some(signaling) if signaling.origin() == stamped.origin => {
                    (inner.generation, signaling.clone())
                }
                _ => {
                    tracing::trace!(target = "session", origin = stamped.origin, "stale signaling event");
                    return;
                }
            }
        };

        match stamped.event {
            SignalingEvent::Connecting => {
                tracing::trace!(target = "session", "signaling connecting");
            }
            SignalingEvent::Connected => {
                self.update(generation, |state| {
                    state.is_websocket_connected = true;
                    state.clear_error();
                    if !matches!(
                        state.phase,
                        SessionPhase::PeerConnecting | SessionPhase::PeerConnected
                    ) {
                        state.phase = SessionPhase::SignalingConnected;
                    }
                });
            }
            SignalingEvent::Disconnected { reason } => {
                self.update(generation, |state| {
                    state.is_websocket_connected = false;
                    if !state.is_peer_connected {
                        state.phase = SessionPhase::Disconnected;
                        state.set_error(SessionError::TransportClosed { reason });
                    }
                });
            }
            SignalingEvent::Retry { attempt, delay } => {
                tracing::info!(
                    target = "session",
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "signaling reconnect scheduled"
                );
            }
            SignalingEvent::Error(err) => self.on_signaling_error(generation, err),
            SignalingEvent::Message(message) => {
                self.on_signal_message(generation, &signaling, message).await
            }
        }
    }

    fn on_signaling_error(&self, generation: u64, err: SessionError) {
        match err {
            SessionError::MessageDecodeError(_) => {
                self.update(generation, |state| state.set_error(err));
            }
            SessionError::TransportReconnectExhausted { .. } => {
                self.update(generation, |state| {
                    state.is_websocket_connected = false;
                    if !state.is_peer_connected {
                        state.phase = SessionPhase::Failed;
                    }
                    state.error = Some(err);
                    state.can_retry = false;
                });
            }
            other => {
                self.update(generation, |state| {
                    state.is_websocket_connected = false;
                    if !state.is_peer_connected {
                        state.set_error(other);
                    }
                });
            }
        }
    }

    async fn on_signal_message(
        &self,
        generation: u64,
        signaling: &SignalingTransport,
        message: SignalMessage,
    ) {
        let Some(room) = self.state().current_room else {
            return;
        };
        tracing::debug!(target = "session", kind = message.kind(), role = %room.role, "signal");
        match message {
            SignalMessage::PeerJoined { role: remote } => {
                if remote == room.role {
                    tracing::warn!(target = "session", %remote, "peer joined with our own role; ignoring");
                    return;
                }
                if self.state().is_peer_connected {
                    tracing::debug!(target = "session", "peer already connected; ignoring join");
                    return;
                }
                self.discard_used_link(generation);
                self.update(generation, |state| {
                    state.phase = SessionPhase::PeerConnecting;
                    state.clear_error();
                });
                let negotiator = match self.ensure_peer_link(generation).await {
                    Ok(Some(negotiator)) => negotiator,
                    Ok(None) => return,
                    Err(err) => return self.fail(generation, err),
                };
                if room.role != Role::Sender || !self.is_current(generation) {
                    return;
                }
                if let Err(err) = negotiator.renegotiate(NegotiationOptions::default()).await {
                    self.fail(generation, err);
                }
            }
            SignalMessage::Offer(offer) => {
                let negotiator = match self.ensure_peer_link(generation).await {
                    Ok(Some(negotiator)) => negotiator,
                    Ok(None) => return,
                    Err(err) => return self.fail(generation, err),
                };
                self.update(generation, |state| {
                    if !state.is_peer_connected {
                        state.phase = SessionPhase::PeerConnecting;
                    }
                });
                let polite = room.role == Role::Receiver;
                if let Err(err) = negotiator.handle_remote_offer(offer, polite).await {
                    self.fail(generation, err);
                }
            }
            SignalMessage::Answer(answer) => {
                let negotiator = self.shared.inner.lock().negotiator.clone();
                let Some(negotiator) = negotiator else {
                    tracing::warn!(target = "session", "answer without a peer link; ignoring");
                    return;
                };
                if let Err(err) = negotiator.handle_remote_answer(answer).await {
                    self.fail(generation, err);
                }
            }
            SignalMessage::IceCandidate(candidate) => {
                let negotiator = match self.ensure_peer_link(generation).await {
                    Ok(Some(negotiator)) => negotiator,
                    Ok(None) => return,
                    Err(err) => return self.fail(generation, err),
                };
                if let Err(err) = negotiator.add_ice_candidate(candidate).await {
                    tracing::warn!(target = "session", error = %err, "remote candidate rejected");
                }
            }
            SignalMessage::Error { error } => {
                self.update(generation, |state| {
                    if !state.is_peer_connected {
                        state.phase = SessionPhase::Failed;
                    }
                    state.set_error(SessionError::SignalingServer(error));
                });
            }
            SignalMessage::Disconnection { reason } => {
                self.on_peer_left(generation, signaling, reason);
            }
        }
    }

    /// The remote peer left: drop the link and channels, keep signaling so
    /// the peer can rejoin the same room.
    fn on_peer_left(
        &self,
        generation: u64,
        signaling: &SignalingTransport,
        reason: Option<String>,
    ) {
        let teardown = {
            let mut inner = self.shared.inner.lock();
            if inner.generation != generation {
                return;
            }
            inner.detach_peer()
        };
        teardown.run(None);
        tracing::info!(target = "session", reason = reason.as_deref().unwrap_or(""), "peer left room");
        let websocket = signaling.is_connected();
        self.update(generation, |state| {
            state.is_peer_connected = false;
            state.is_websocket_connected = websocket;
            state.phase = if websocket {
                SessionPhase::SignalingConnected
            } else {
                SessionPhase::Disconnected
            };
            state.set_error(SessionError::PeerLeft);
        });
    }

    async fn on_peer(&self, stamped: Stamped<PeerEvent>) {
        let (generation, negotiator, mux, signaling) = {
            let inner = self.shared.inner.lock();
            if inner.peer_origin != Some(stamped.origin) {
                tracing::trace!(target = "session", origin = stamped.origin, "stale peer event");
                return;
            }
            (
                inner.generation,
                inner.negotiator.clone(),
                inner.mux.clone(),
                inner.signaling.clone(),
            )
        };

        match stamped.event {
            PeerEvent::LocalCandidate(candidate) => {
                if let Some(signaling) = signaling {
                    signaling.send(&SignalMessage::IceCandidate(candidate));
                }
            }
            PeerEvent::IceGatheringComplete => {
                tracing::debug!(target = "session", "ice gathering complete");
            }
            PeerEvent::IceConnectionState(ice) => {
                self.record(generation, |inner| inner.ice = Some(ice));
                let link = match ice {
                    IceConnectionState::Connected | IceConnectionState::Completed => {
                        Some(Connectivity::Up)
                    }
                    IceConnectionState::Disconnected => Some(Connectivity::Down),
                    IceConnectionState::Failed => Some(Connectivity::Broken),
                    _ => None,
                };
                if let Some(link) = link {
                    self.on_connectivity(generation, link);
                }
            }
            PeerEvent::ConnectionState(connection) => {
                self.record(generation, |inner| inner.connection = Some(connection));
                let link = match connection {
                    PeerConnectionState::Connected => Some(Connectivity::Up),
                    PeerConnectionState::Disconnected => Some(Connectivity::Down),
                    PeerConnectionState::Failed => Some(Connectivity::Broken),
                    _ => None,
                };
                if let Some(link) = link {
                    self.on_connectivity(generation, link);
                }
            }
            PeerEvent::SignalingState(signaling_state) => {
                self.record(generation, |inner| {
                    inner.signaling_state = Some(signaling_state)
                });
                if let Some(negotiator) = negotiator {
                    if let Err(err) = negotiator.on_signaling_state(signaling_state).await {
                        self.fail(generation, err);
                    }
                }
            }
            PeerEvent::RemoteChannel(handle) => match mux {
                Some(mux) => mux.bind_channel(handle),
                None => {
                    tokio::spawn(async move { handle.close().await });
                }
            },
            PeerEvent::Channel { label, event } => {
                let Some(mux) = mux else {
                    return;
                };
                self.on_channel(generation, &mux, &label, event);
            }
            PeerEvent::Track(track) => {
                tracing::info!(target = "session", id = %track.id, kind = ?track.kind, "remote track");
                self.record(generation, |inner| inner.remote_tracks.push(track.clone()));
                let _ = self.shared.tracks_tx.send(track);
            }
            PeerEvent::Outbound(message) => {
                if let Some(signaling) = signaling {
                    signaling.send(&message);
                }
            }
            PeerEvent::Failed(err) => self.fail(generation, err),
        }
    }

    fn record<F>(&self, generation: u64, apply: F)
    where
        F: FnOnce(&mut SessionInner),
    {
        let mut inner = self.shared.inner.lock();
        if inner.generation == generation {
            apply(&mut inner);
        }
    }

    fn on_connectivity(&self, generation: u64, link: Connectivity) {
        match link {
            Connectivity::Up => {
                self.update(generation, SessionState::mark_peer_connected);
            }
            Connectivity::Down => {
                self.update(generation, |state| {
                    state.is_peer_connected = false;
                    state.phase = SessionPhase::Disconnected;
                });
            }
            Connectivity::Broken => {
                self.update(generation, |state| {
                    state.is_peer_connected = false;
                    state.phase = SessionPhase::Failed;
                    state.set_error(SessionError::IceConnectionFailed);
                });
            }
        }
    }

    fn on_channel(
        &self,
        generation: u64,
        mux: &ChannelMultiplexer,
        label: &str,
        event: ChannelEvent,
    ) {
        match event {
            ChannelEvent::Open => {
                mux.handle_open(label);
                if label == mux.primary() {
                    self.update(generation, SessionState::mark_peer_connected);
                }
            }
            ChannelEvent::Closed => {
                mux.handle_closed(label);
            }
            ChannelEvent::Frame(frame) => match mux.handle_frame(label, frame) {
                Ok(Inbound::Message { tag, message }) => {
                    self.shared.router.route_message(&tag, &message);
                }
                Ok(Inbound::Data { tag, bytes }) => {
                    self.shared.router.route_data(&tag, &bytes);
                }
                Err(err) => {
                    tracing::warn!(target = "session", label, error = %err, "undecodable channel frame");
                    self.update(generation, |state| state.set_error(err));
                }
            },
            ChannelEvent::Error(reason) => {
                tracing::warn!(target = "session", label, %reason, "data channel error");
                self.update(generation, |state| {
                    state.set_error(SessionError::ChannelFailed {
                        label: label.to_string(),
                        reason,
                    })
                });
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Connectivity {
    Up,
    Down,
    Broken,
}

fn connected_to(state: &SessionState, code: &str, role: Role) -> bool {
    state
        .current_room
        .as_ref()
        .is_some_and(|room| room.code == code && room.role == role)
        && (state.is_websocket_connected || state.is_peer_connected)
}

fn report_send(outcome: SendOutcome) -> bool {
    match outcome {
        SendOutcome::Sent => true,
        SendOutcome::Queued => {
            tracing::debug!(target = "session", "channel not open; send deferred");
            false
        }
        SendOutcome::Failed(err) => {
            tracing::warn!(target = "session", error = %err, "send failed");
            false
        }
    }
}

async fn run_events(
    shared: Weak<SessionShared>,
    mut signals: mpsc::UnboundedReceiver<Stamped<SignalingEvent>>,
    mut peers: mpsc::UnboundedReceiver<Stamped<PeerEvent>>,
) {
    loop {
        tokio::select! {
            Some(stamped) = signals.recv() => {
                let Some(shared) = shared.upgrade() else { break };
                PeerSession { shared }.on_signaling(stamped).await;
            }
            Some(stamped) = peers.recv() => {
                let Some(shared) = shared.upgrade() else { break };
                PeerSession { shared }.on_peer(stamped).await;
            }
            else => break,
        }
    }
    tracing::trace!(target = "session", "event loop exited");
}
