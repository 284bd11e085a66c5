use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::config::ChannelOptions;
use crate::error::SessionError;
use crate::events::ChannelState;
use crate::peer::{DataChannelHandle, PeerLink};
use crate::protocol::{ChannelMessage, Frame};

/// Item waiting for a channel to open.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    Message(ChannelMessage),
    Data(Bytes),
}

impl Outbound {
    fn into_frame(self) -> Frame {
        match self {
            Outbound::Message(message) => Frame::Text(message.to_json()),
            Outbound::Data(bytes) => Frame::Binary(bytes),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SendOutcome {
    Sent,
    /// Accepted; goes out once the channel opens.
    Queued,
    Failed(SessionError),
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent)
    }
}

/// Decoded inbound frame with the tag it routes under.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    Message { tag: String, message: ChannelMessage },
    Data { tag: String, bytes: Bytes },
}

struct LogicalChannel {
    handle: Option<Arc<dyn DataChannelHandle>>,
    ready: bool,
    pending: VecDeque<Outbound>,
}

impl LogicalChannel {
    fn new() -> Self {
        Self {
            handle: None,
            ready: false,
            pending: VecDeque::new(),
        }
    }
}

struct MuxState {
    channels: HashMap<String, LogicalChannel>,
    closed: bool,
}

/// Named data channels over one peer link, each with a FIFO of sends that
/// arrived before it opened. Messages and binary data share one queue so
/// interleaved submissions keep their order.
pub struct ChannelMultiplexer {
    primary: String,
    data_tag: String,
    state: Mutex<MuxState>,
}

impl ChannelMultiplexer {
    pub fn new(primary: impl Into<String>, data_tag: impl Into<String>) -> Self {
        let primary = primary.into();
        let mut channels = HashMap::new();
        channels.insert(primary.clone(), LogicalChannel::new());
        Self {
            primary,
            data_tag: data_tag.into(),
            state: Mutex::new(MuxState {
                channels,
                closed: false,
            }),
        }
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    /// Opens a channel from this side. Sends issued before the call
    /// completes are queued.
    pub async fn create_channel(
        &self,
        link: &dyn PeerLink,
        label: &str,
        options: ChannelOptions,
    ) -> Result<(), SessionError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(SessionError::ChannelCreateFailed {
                    label: label.to_string(),
                    reason: "multiplexer closed".into(),
                });
            }
            state
                .channels
                .entry(label.to_string())
                .or_insert_with(LogicalChannel::new);
        }
        let handle = link.create_data_channel(label, options).await?;
        tracing::debug!(target = "channel", label, "channel created");
        self.bind_channel(handle);
        Ok(())
    }

    /// Adopts a channel opened by the remote side.
    pub fn bind_channel(&self, handle: Arc<dyn DataChannelHandle>) {
        let label = handle.label();
        let already_open = handle.ready_state() == ChannelState::Open;
        {
            let mut state = self.state.lock();
            if state.closed {
                let stale = handle.clone();
                tokio::spawn(async move { stale.close().await });
                return;
            }
            let entry = state
                .channels
                .entry(label.clone())
                .or_insert_with(LogicalChannel::new);
            entry.handle = Some(handle);
            entry.ready = false;
        }
        tracing::debug!(target = "channel", label = %label, already_open, "channel bound");
        if already_open {
            self.handle_open(&label);
        }
    }

    pub fn send_message(&self, message: ChannelMessage) -> SendOutcome {
        let label = self.primary.clone();
        self.send_on(&label, Outbound::Message(message))
    }

    pub fn send_data(&self, bytes: Bytes) -> SendOutcome {
        let label = self.primary.clone();
        self.send_on(&label, Outbound::Data(bytes))
    }

    pub fn send_on(&self, label: &str, item: Outbound) -> SendOutcome {
        let mut state = self.state.lock();
        if state.closed {
            return SendOutcome::Failed(SessionError::ChannelSendFailed {
                label: label.to_string(),
            });
        }
        let entry = state
            .channels
            .entry(label.to_string())
            .or_insert_with(LogicalChannel::new);
        if entry.ready {
            if let Some(handle) = entry.handle.as_ref() {
                return match handle.send(item.into_frame()) {
                    Ok(()) => SendOutcome::Sent,
                    Err(err) => {
                        tracing::warn!(target = "channel", label, error = %err, "send failed");
                        SendOutcome::Failed(err)
                    }
                };
            }
        }
        entry.pending.push_back(item);
        tracing::trace!(target = "channel", label, queued = entry.pending.len(), "channel not open; queued");
        SendOutcome::Queued
    }

    /// Drains the queue in submission order, then marks the channel ready.
    /// Returns how many queued items went out.
    pub fn handle_open(&self, label: &str) -> usize {
        let mut state = self.state.lock();
        let Some(entry) = state.channels.get_mut(label) else {
            return 0;
        };
        let Some(handle) = entry.handle.clone() else {
            return 0;
        };
        let mut flushed = 0usize;
        while let Some(item) = entry.pending.pop_front() {
            if let Err(err) = handle.send(item.clone().into_frame()) {
                tracing::warn!(
                    target = "channel",
                    label,
                    error = %err,
                    remaining = entry.pending.len() + 1,
                    "flush interrupted"
                );
                entry.pending.push_front(item);
                return flushed;
            }
            flushed += 1;
        }
        entry.ready = true;
        tracing::debug!(target = "channel", label, flushed, "channel open");
        flushed
    }

    /// Clears the queue and marks the channel not ready. The entry survives so
    /// a later bind can reopen it.
    pub fn handle_closed(&self, label: &str) -> usize {
        let mut state = self.state.lock();
        let Some(entry) = state.channels.get_mut(label) else {
            return 0;
        };
        let dropped = entry.pending.len();
        entry.pending.clear();
        entry.ready = false;
        tracing::debug!(target = "channel", label, dropped, "channel closed");
        dropped
    }

    /// Classifies one inbound frame: text is a JSON message tagged with its
    /// `channel` field or this channel's label; binary goes to the data tag.
    pub fn handle_frame(&self, label: &str, frame: Frame) -> Result<Inbound, SessionError> {
        match frame {
            Frame::Text(text) => {
                let message = ChannelMessage::decode(&text)?;
                let tag = message.tag(label).to_string();
                Ok(Inbound::Message { tag, message })
            }
            Frame::Binary(bytes) => Ok(Inbound::Data {
                tag: self.data_tag.clone(),
                bytes,
            }),
        }
    }

    pub fn state(&self, label: &str) -> ChannelState {
        let state = self.state.lock();
        if state.closed {
            return ChannelState::Closed;
        }
        match state.channels.get(label) {
            Some(LogicalChannel {
                handle: Some(handle),
                ..
            }) => handle.ready_state(),
            Some(_) => ChannelState::Connecting,
            None => ChannelState::Closed,
        }
    }

    pub fn primary_state(&self) -> ChannelState {
        self.state(&self.primary)
    }

    pub fn is_ready(&self, label: &str) -> bool {
        self.state
            .lock()
            .channels
            .get(label)
            .is_some_and(|entry| entry.ready)
    }

    pub fn pending(&self, label: &str) -> usize {
        self.state
            .lock()
            .channels
            .get(label)
            .map_or(0, |entry| entry.pending.len())
    }

    pub fn labels(&self) -> Vec<String> {
        self.state.lock().channels.keys().cloned().collect()
    }

    pub async fn buffered_amount(&self) -> usize {
        let handle = self
            .state
            .lock()
            .channels
            .get(&self.primary)
            .and_then(|entry| entry.handle.clone());
        match handle {
            Some(handle) => handle.buffered_amount().await,
            None => 0,
        }
    }

    /// Drops every queue and closes the underlying channels in the background.
    pub fn close(&self) {
        let handles: Vec<Arc<dyn DataChannelHandle>> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state
                .channels
                .values_mut()
                .filter_map(|entry| {
                    entry.pending.clear();
                    entry.ready = false;
                    entry.handle.take()
                })
                .collect()
        };
        if handles.is_empty() {
            return;
        }
        tokio::spawn(async move {
            for handle in handles {
                handle.close().await;
            }
        });
    }
}
