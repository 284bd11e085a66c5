#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use peer_session::config::ChannelOptions;
use peer_session::events::{
    ChannelEvent, ChannelState, EventSink, IceConnectionState, PeerConnectionState, PeerEvent,
    SignalingState,
};
use peer_session::peer::{DataChannelHandle, LocalTrack, NegotiationOptions, PeerLink, SenderId};
use peer_session::protocol::SdpKind;
use peer_session::signaling::{Connector, SocketFrame, SocketPair};
use peer_session::{
    Frame, IceCandidate, PeerBackend, PeerSession, Role, SessionConfig, SessionDescription,
    SessionError, SessionState,
};
use serde_json::json;
use tokio::sync::{Semaphore, mpsc};
use url::Url;

pub const ROOM: &str = "AB12CD";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn config() -> SessionConfig {
    SessionConfig::builder()
        .signaling_url("ws://signal.test/ws/webrtc")
        .localhost_only()
        .build()
        .expect("config")
}

pub fn session(server: &FakeServer, backend: &FakeBackend) -> PeerSession {
    PeerSession::new(
        config(),
        Arc::new(backend.clone()),
        Arc::new(server.connector()),
    )
}

pub async fn wait_for<F>(session: &PeerSession, what: &str, predicate: F) -> SessionState
where
    F: FnMut(&SessionState) -> bool,
{
    wait_for_within(session, what, Duration::from_secs(5), predicate).await
}

pub async fn wait_for_within<F>(
    session: &PeerSession,
    what: &str,
    limit: Duration,
    predicate: F,
) -> SessionState
where
    F: FnMut(&SessionState) -> bool,
{
    let mut rx = session.subscribe();
    let state = tokio::time::timeout(limit, rx.wait_for(predicate))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}: {:?}", session.state()))
        .expect("session dropped")
        .clone();
    state
}

pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {what}");
}

// ---------------------------------------------------------------------------
// In-memory signaling server
// ---------------------------------------------------------------------------

struct Client {
    id: u64,
    role: String,
    tx: mpsc::UnboundedSender<SocketFrame>,
}

#[derive(Default)]
struct ServerState {
    rooms: HashMap<String, Vec<Client>>,
    received: Vec<(String, String)>,
    connects: usize,
    refuse: bool,
}

/// Relays every text frame to the other occupants of the room and announces
/// joins with `peer-joined`.
#[derive(Clone, Default)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
    hold: Arc<Mutex<Option<Arc<Semaphore>>>>,
    next_id: Arc<AtomicU64>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            server: self.clone(),
        }
    }

    pub fn refuse(&self, refuse: bool) {
        self.state.lock().refuse = refuse;
    }

    /// Parks every connect until [`FakeServer::release_connects`].
    pub fn hold_connects(&self) {
        *self.hold.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_connects(&self) {
        if let Some(gate) = self.hold.lock().take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    /// `type` of every frame received from clients holding `role`.
    pub fn received_kinds(&self, role: Role) -> Vec<String> {
        self.state
            .lock()
            .received
            .iter()
            .filter(|(from, _)| from == role.as_str())
            .filter_map(|(_, text)| {
                serde_json::from_str::<serde_json::Value>(text)
                    .ok()
                    .and_then(|v| v["type"].as_str().map(str::to_owned))
            })
            .collect()
    }

    pub fn received_texts(&self, role: Role) -> Vec<String> {
        self.state
            .lock()
            .received
            .iter()
            .filter(|(from, _)| from == role.as_str())
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn inject(&self, code: &str, role: Role, text: &str) {
        let state = self.state.lock();
        if let Some(clients) = state.rooms.get(code) {
            for client in clients.iter().filter(|c| c.role == role.as_str()) {
                let _ = client.tx.send(SocketFrame::Text(text.to_string()));
            }
        }
    }

    /// Closes the socket of every `role` client in `code` from the server side.
    pub fn drop_client(&self, code: &str, role: Role) {
        let mut state = self.state.lock();
        if let Some(clients) = state.rooms.get_mut(code) {
            clients.retain(|client| {
                if client.role == role.as_str() {
                    let _ = client.tx.send(SocketFrame::Closed {
                        code: Some(1006),
                        reason: "server dropped".into(),
                    });
                    false
                } else {
                    true
                }
            });
        }
    }

    fn join(&self, code: String, role: String) -> SocketPair {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, mut from_client) = mpsc::unbounded_channel::<String>();
        {
            let mut state = self.state.lock();
            let clients = state.rooms.entry(code.clone()).or_default();
            for other in clients.iter() {
                let _ = other.tx.send(SocketFrame::Text(
                    json!({"type": "peer-joined", "payload": {"role": role}}).to_string(),
                ));
                let _ = to_client.send(SocketFrame::Text(
                    json!({"type": "peer-joined", "payload": {"role": other.role}}).to_string(),
                ));
            }
            clients.push(Client {
                id,
                role: role.clone(),
                tx: to_client,
            });
        }

        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(text) = from_client.recv().await {
                let mut state = state.lock();
                state.received.push((role.clone(), text.clone()));
                if let Some(clients) = state.rooms.get(&code) {
                    for other in clients.iter().filter(|c| c.id != id) {
                        let _ = other.tx.send(SocketFrame::Text(text.clone()));
                    }
                }
            }
            if let Some(clients) = state.lock().rooms.get_mut(&code) {
                clients.retain(|c| c.id != id);
            }
        });

        SocketPair { outbound, inbound }
    }
}

pub struct FakeConnector {
    server: FakeServer,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, url: &Url) -> Result<SocketPair, SessionError> {
        let hold = self.server.hold.lock().clone();
        if let Some(gate) = hold {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        {
            let mut state = self.server.state.lock();
            state.connects += 1;
            if state.refuse {
                return Err(SessionError::TransportSetup("connection refused".into()));
            }
        }
        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
        let code = query.get("code").cloned().unwrap_or_default();
        let role = query.get("role").cloned().unwrap_or_default();
        Ok(self.server.join(code, role))
    }
}

// ---------------------------------------------------------------------------
// Scripted peer backend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Net {
    links: HashMap<u64, Weak<FakeLink>>,
    next_id: u64,
}

#[derive(Clone, Default)]
pub struct FakeBackend {
    net: Arc<Mutex<Net>>,
    created: Arc<AtomicUsize>,
    offer_gate: Arc<Mutex<Option<Arc<Semaphore>>>>,
    links: Arc<Mutex<Vec<Arc<FakeLink>>>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn links_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn link(&self, index: usize) -> Arc<FakeLink> {
        self.links.lock()[index].clone()
    }

    /// Every `create_offer` on links created afterwards takes one permit
    /// from the returned gate.
    pub fn hold_offers(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.offer_gate.lock() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl PeerBackend for FakeBackend {
    async fn create_link(
        &self,
        _config: &SessionConfig,
        sink: EventSink<PeerEvent>,
    ) -> Result<Arc<dyn PeerLink>, SessionError> {
        let id = {
            let mut net = self.net.lock();
            net.next_id += 1;
            net.next_id
        };
        let link = Arc::new(FakeLink {
            id,
            net: self.net.clone(),
            sink,
            offer_gate: self.offer_gate.lock().clone(),
            state: Mutex::new(LinkState::default()),
        });
        self.net.lock().links.insert(id, Arc::downgrade(&link));
        self.links.lock().push(link.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(link)
    }
}

#[derive(Default)]
struct LinkState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    signaling: Option<SignalingState>,
    peer: Option<u64>,
    channels: Vec<Arc<FakeChannel>>,
    connected: bool,
    closed: bool,
    calls: Vec<String>,
    candidates_sent: u32,
}

pub struct FakeLink {
    id: u64,
    net: Arc<Mutex<Net>>,
    sink: EventSink<PeerEvent>,
    offer_gate: Option<Arc<Semaphore>>,
    state: Mutex<LinkState>,
}

impl FakeLink {
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn channel(&self, label: &str) -> Option<Arc<FakeChannel>> {
        self.state
            .lock()
            .channels
            .iter()
            .find(|c| c.label == label)
            .cloned()
    }

    fn sdp(&self, kind: &str) -> String {
        format!("fake-{kind}:{}", self.id)
    }

    fn set_signaling(&self, next: SignalingState) {
        let changed = {
            let mut state = self.state.lock();
            let changed = state.signaling != Some(next);
            state.signaling = Some(next);
            changed
        };
        if changed {
            self.sink.emit(PeerEvent::SignalingState(next));
        }
    }

    fn ready(&self) -> bool {
        let state = self.state.lock();
        !state.closed
            && state.local.is_some()
            && state.remote.is_some()
            && state.signaling == Some(SignalingState::Stable)
    }

    fn try_connect(self: &Arc<Self>) {
        let peer_id = self.state.lock().peer;
        let Some(peer) = peer_id.and_then(|id| self.net.lock().links.get(&id).and_then(Weak::upgrade))
        else {
            return;
        };
        if !self.ready() || !peer.ready() {
            return;
        }
        let _pairing = self.net.lock();
        if self.state.lock().connected || peer.state.lock().connected {
            return;
        }
        self.state.lock().connected = true;
        peer.state.lock().connected = true;
        for link in [self, &peer] {
            link.sink
                .emit(PeerEvent::IceConnectionState(IceConnectionState::Checking));
            link.sink
                .emit(PeerEvent::IceConnectionState(IceConnectionState::Connected));
            link.sink
                .emit(PeerEvent::ConnectionState(PeerConnectionState::Connected));
        }
        Self::pair_channels(self, &peer);
        Self::pair_channels(&peer, self);
    }

    fn pair_channels(from: &Arc<FakeLink>, to: &Arc<FakeLink>) {
        let locals: Vec<Arc<FakeChannel>> = from
            .state
            .lock()
            .channels
            .iter()
            .filter(|c| c.local && c.peer.lock().is_none())
            .cloned()
            .collect();
        for local in locals {
            let remote = FakeChannel::new(&local.label, to.sink.clone(), false);
            *local.peer.lock() = Some(Arc::downgrade(&remote));
            *remote.peer.lock() = Some(Arc::downgrade(&local));
            to.state.lock().channels.push(remote.clone());
            to.sink.emit(PeerEvent::RemoteChannel(remote.clone()));
            local.open();
            remote.open();
        }
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    async fn create_offer(
        &self,
        options: NegotiationOptions,
    ) -> Result<SessionDescription, SessionError> {
        if let Some(gate) = &self.offer_gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        self.state
            .lock()
            .calls
            .push(format!("create_offer:{}", options.ice_restart));
        Ok(SessionDescription::offer(self.sdp("offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, SessionError> {
        if self.state.lock().remote.is_none() {
            return Err(SessionError::NegotiationFailed {
                stage: "create_answer",
                reason: "no remote offer".into(),
            });
        }
        self.state.lock().calls.push("create_answer".into());
        Ok(SessionDescription::answer(self.sdp("answer")))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), SessionError> {
        self.state.lock().calls.push(format!("local:{:?}", desc.kind));
        let next = match desc.kind {
            SdpKind::Offer => SignalingState::HaveLocalOffer,
            SdpKind::Rollback => {
                self.state.lock().local = None;
                self.set_signaling(SignalingState::Stable);
                return Ok(());
            }
            _ => SignalingState::Stable,
        };
        self.state.lock().local = Some(desc);
        self.set_signaling(next);

        let n = {
            let mut state = self.state.lock();
            state.candidates_sent += 1;
            state.candidates_sent
        };
        self.sink.emit(PeerEvent::LocalCandidate(IceCandidate::new(format!(
            "candidate:{} {n} udp 2130706431 127.0.0.1 {} typ host",
            self.id,
            40000 + n
        ))));
        let me = self.net.lock().links.get(&self.id).and_then(Weak::upgrade);
        if let Some(me) = me {
            me.try_connect();
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), SessionError> {
        let peer = desc
            .sdp
            .rsplit(':')
            .next()
            .and_then(|id| id.parse::<u64>().ok());
        let next = match desc.kind {
            SdpKind::Offer => SignalingState::HaveRemoteOffer,
            _ => SignalingState::Stable,
        };
        {
            let mut state = self.state.lock();
            state.calls.push(format!("remote:{:?}", desc.kind));
            state.peer = peer;
            state.remote = Some(desc);
        }
        self.set_signaling(next);
        let me = self.net.lock().links.get(&self.id).and_then(Weak::upgrade);
        if let Some(me) = me {
            me.try_connect();
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(SessionError::NegotiationFailed {
                stage: "add_ice_candidate",
                reason: "remote description not set".into(),
            });
        }
        state.calls.push(format!("candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        _options: ChannelOptions,
    ) -> Result<Arc<dyn DataChannelHandle>, SessionError> {
        let channel = FakeChannel::new(label, self.sink.clone(), true);
        self.state.lock().channels.push(channel.clone());
        Ok(channel)
    }

    async fn add_track(&self, _track: LocalTrack) -> Result<SenderId, SessionError> {
        self.state.lock().calls.push("add_track".into());
        Ok(SenderId(1))
    }

    async fn remove_track(&self, _sender: SenderId) -> Result<(), SessionError> {
        self.state.lock().calls.push("remove_track".into());
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling.unwrap_or(SignalingState::Stable)
    }

    async fn close(&self) {
        let channels = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.channels)
        };
        for channel in channels {
            *channel.state.lock() = ChannelState::Closed;
        }
    }
}

pub struct FakeChannel {
    label: String,
    local: bool,
    sink: EventSink<PeerEvent>,
    state: Mutex<ChannelState>,
    peer: Mutex<Option<Weak<FakeChannel>>>,
    sent: Mutex<Vec<Frame>>,
}

impl FakeChannel {
    fn new(label: &str, sink: EventSink<PeerEvent>, local: bool) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            local,
            sink,
            state: Mutex::new(ChannelState::Connecting),
            peer: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn open(&self) {
        *self.state.lock() = ChannelState::Open;
        self.sink.emit(PeerEvent::Channel {
            label: self.label.clone(),
            event: ChannelEvent::Open,
        });
    }

    pub fn sent(&self) -> Vec<Frame> {
        self.sent.lock().clone()
    }

    /// Reports a transport error without changing the ready state.
    pub fn fail(&self, reason: &str) {
        self.sink.emit(PeerEvent::Channel {
            label: self.label.clone(),
            event: ChannelEvent::Error(reason.to_string()),
        });
    }
}

#[async_trait]
impl DataChannelHandle for FakeChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn ready_state(&self) -> ChannelState {
        *self.state.lock()
    }

    fn send(&self, frame: Frame) -> Result<(), SessionError> {
        if *self.state.lock() != ChannelState::Open {
            return Err(SessionError::ChannelSendFailed {
                label: self.label.clone(),
            });
        }
        self.sent.lock().push(frame.clone());
        let peer = self.peer.lock().as_ref().and_then(Weak::upgrade);
        if let Some(peer) = peer {
            peer.sink.emit(PeerEvent::Channel {
                label: peer.label.clone(),
                event: ChannelEvent::Frame(frame),
            });
        }
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        0
    }

    async fn close(&self) {
        *self.state.lock() = ChannelState::Closed;
    }
}
