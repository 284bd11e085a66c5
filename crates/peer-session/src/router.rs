use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::RwLock;

use crate::protocol::ChannelMessage;

pub type MessageHandler = Arc<dyn Fn(&ChannelMessage) + Send + Sync>;
pub type DataHandler = Arc<dyn Fn(&Bytes) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HandlerKind {
    Message,
    Data,
}

struct Bucket<H> {
    tagged: HashMap<String, Vec<(HandlerId, H)>>,
    fallback: Vec<(HandlerId, H)>,
}

impl<H: Clone> Bucket<H> {
    fn new() -> Self {
        Self {
            tagged: HashMap::new(),
            fallback: Vec::new(),
        }
    }

    fn insert(&mut self, tag: Option<&str>, id: HandlerId, handler: H) {
        match tag {
            Some(tag) => self
                .tagged
                .entry(tag.to_string())
                .or_default()
                .push((id, handler)),
            None => self.fallback.push((id, handler)),
        }
    }

    fn remove(&mut self, tag: Option<&str>, id: HandlerId) -> bool {
        match tag {
            Some(tag) => {
                let Some(handlers) = self.tagged.get_mut(tag) else {
                    return false;
                };
                let before = handlers.len();
                handlers.retain(|(existing, _)| *existing != id);
                let removed = handlers.len() != before;
                if handlers.is_empty() {
                    self.tagged.remove(tag);
                }
                removed
            }
            None => {
                let before = self.fallback.len();
                self.fallback.retain(|(existing, _)| *existing != id);
                self.fallback.len() != before
            }
        }
    }

    /// Handlers for `tag`, or the fallback bucket when none are registered.
    fn resolve(&self, tag: &str) -> (Vec<H>, bool) {
        match self.tagged.get(tag) {
            Some(handlers) if !handlers.is_empty() => {
                (handlers.iter().map(|(_, h)| h.clone()).collect(), false)
            }
            _ => (self.fallback.iter().map(|(_, h)| h.clone()).collect(), true),
        }
    }

    fn count(&self, tag: &str) -> usize {
        self.tagged.get(tag).map_or(0, Vec::len)
    }
}

struct RouterState {
    messages: Bucket<MessageHandler>,
    data: Bucket<DataHandler>,
}

/// Maps logical channel tags to message and data handlers.
///
/// Dispatch runs without holding the registry lock, so handlers may register
/// or unregister other handlers. A panicking handler is logged and does not
/// stop the remaining handlers for the same event.
#[derive(Clone)]
pub struct MessageRouter {
    state: Arc<RwLock<RouterState>>,
    next_id: Arc<AtomicU64>,
}

/// Returned by every registration; `unregister` removes exactly that handler.
pub struct Registration {
    state: Weak<RwLock<RouterState>>,
    kind: HandlerKind,
    tag: Option<String>,
    id: HandlerId,
}

impl Registration {
    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Returns `false` if the handler was already gone.
    pub fn unregister(self) -> bool {
        let Some(state) = self.state.upgrade() else {
            return false;
        };
        let mut state = state.write();
        match self.kind {
            HandlerKind::Message => state.messages.remove(self.tag.as_deref(), self.id),
            HandlerKind::Data => state.data.remove(self.tag.as_deref(), self.id),
        }
    }
}

impl MessageRouter {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(RouterState {
                messages: Bucket::new(),
                data: Bucket::new(),
            })),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn registration(&self, kind: HandlerKind, tag: Option<&str>, id: HandlerId) -> Registration {
        Registration {
            state: Arc::downgrade(&self.state),
            kind,
            tag: tag.map(str::to_owned),
            id,
        }
    }

    fn allocate(&self) -> HandlerId {
        HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register_message_handler<F>(&self, tag: &str, handler: F) -> Registration
    where
        F: Fn(&ChannelMessage) + Send + Sync + 'static,
    {
        self.add_message(Some(tag), Arc::new(handler))
    }

    pub fn register_data_handler<F>(&self, tag: &str, handler: F) -> Registration
    where
        F: Fn(&Bytes) + Send + Sync + 'static,
    {
        self.add_data(Some(tag), Arc::new(handler))
    }

    /// Receives messages whose tag has no handler of its own.
    pub fn register_default_message_handler<F>(&self, handler: F) -> Registration
    where
        F: Fn(&ChannelMessage) + Send + Sync + 'static,
    {
        self.add_message(None, Arc::new(handler))
    }

    pub fn register_default_data_handler<F>(&self, handler: F) -> Registration
    where
        F: Fn(&Bytes) + Send + Sync + 'static,
    {
        self.add_data(None, Arc::new(handler))
    }

    fn add_message(&self, tag: Option<&str>, handler: MessageHandler) -> Registration {
        let id = self.allocate();
        self.state.write().messages.insert(tag, id, handler);
        tracing::trace!(target = "router", tag = ?tag, "message handler registered");
        self.registration(HandlerKind::Message, tag, id)
    }

    fn add_data(&self, tag: Option<&str>, handler: DataHandler) -> Registration {
        let id = self.allocate();
        self.state.write().data.insert(tag, id, handler);
        tracing::trace!(target = "router", tag = ?tag, "data handler registered");
        self.registration(HandlerKind::Data, tag, id)
    }

    /// Dispatches to every handler for `tag`. Returns how many ran to
    /// completion.
    pub fn route_message(&self, tag: &str, message: &ChannelMessage) -> usize {
        let (handlers, fallback) = self.state.read().messages.resolve(tag);
        if handlers.is_empty() {
            tracing::warn!(target = "router", tag, kind = %message.kind, "no handler for message; dropping");
            return 0;
        }
        if fallback {
            tracing::debug!(target = "router", tag, "routing message to default handlers");
        }
        handlers
            .iter()
            .filter(|handler| invoke(tag, || handler(message)))
            .count()
    }

    pub fn route_data(&self, tag: &str, bytes: &Bytes) -> usize {
        let (handlers, fallback) = self.state.read().data.resolve(tag);
        if handlers.is_empty() {
            tracing::warn!(target = "router", tag, len = bytes.len(), "no handler for data; dropping");
            return 0;
        }
        if fallback {
            tracing::debug!(target = "router", tag, "routing data to default handlers");
        }
        handlers
            .iter()
            .filter(|handler| invoke(tag, || handler(bytes)))
            .count()
    }

    pub fn has_handlers(&self, tag: &str) -> bool {
        let state = self.state.read();
        state.messages.count(tag) > 0 || state.data.count(tag) > 0
    }

    pub fn handler_count(&self, tag: &str) -> usize {
        let state = self.state.read();
        state.messages.count(tag) + state.data.count(tag)
    }

    /// Tags with at least one handler.
    pub fn channels(&self) -> Vec<String> {
        let state = self.state.read();
        let mut tags: Vec<String> = state
            .messages
            .tagged
            .keys()
            .chain(state.data.tagged.keys())
            .cloned()
            .collect();
        tags.sort();
        tags.dedup();
        tags
    }

    pub fn clear_channel(&self, tag: &str) {
        let mut state = self.state.write();
        state.messages.tagged.remove(tag);
        state.data.tagged.remove(tag);
    }

    pub fn clear(&self) {
        let mut state = self.state.write();
        state.messages = Bucket::new();
        state.data = Bucket::new();
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

fn invoke(tag: &str, call: impl FnOnce()) -> bool {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(()) => true,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(target = "router", tag, %reason, "handler panicked");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn message(kind: &str) -> ChannelMessage {
        ChannelMessage::new(kind, json!({}))
    }

    #[test]
    fn routes_to_every_handler_for_tag() {
        let router = MessageRouter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b"] {
            let seen = seen.clone();
            router.register_message_handler("chat", move |msg| {
                seen.lock().push(format!("{name}:{}", msg.kind));
            });
        }
        assert_eq!(router.route_message("chat", &message("text")), 2);
        assert_eq!(*seen.lock(), vec!["a:text", "b:text"]);
    }

    #[test]
    fn falls_back_to_default_bucket_then_drops() {
        let router = MessageRouter::new();
        assert_eq!(router.route_message("nobody", &message("x")), 0);

        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();
        router.register_default_data_handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(router.route_data("file-transfer", &Bytes::from_static(b"x")), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tagged_handlers_shadow_defaults() {
        let router = MessageRouter::new();
        let defaults = Arc::new(AtomicU64::new(0));
        let counter = defaults.clone();
        router.register_default_message_handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        router.register_message_handler("chat", |_| {});
        router.route_message("chat", &message("text"));
        assert_eq!(defaults.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unregister_prunes_empty_tags() {
        let router = MessageRouter::new();
        let first = router.register_message_handler("chat", |_| {});
        let second = router.register_data_handler("chat", |_| {});
        assert_eq!(router.handler_count("chat"), 2);

        assert!(first.unregister());
        assert!(router.has_handlers("chat"));
        assert!(second.unregister());
        assert!(!router.has_handlers("chat"));
        assert!(router.channels().is_empty());
    }

    #[test]
    fn panicking_handler_does_not_block_others() {
        let router = MessageRouter::new();
        let ran = Arc::new(AtomicU64::new(0));
        router.register_message_handler("chat", |_| panic!("handler bug"));
        let counter = ran.clone();
        router.register_message_handler("chat", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(router.route_message("chat", &message("text")), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handlers_may_unregister_during_dispatch() {
        let router = MessageRouter::new();
        let slot: Arc<Mutex<Option<Registration>>> = Arc::new(Mutex::new(None));
        let inner = slot.clone();
        let registration = router.register_message_handler("chat", move |_| {
            if let Some(registration) = inner.lock().take() {
                registration.unregister();
            }
        });
        *slot.lock() = Some(registration);
        assert_eq!(router.route_message("chat", &message("text")), 1);
        assert!(!router.has_handlers("chat"));
    }

    #[test]
    fn clear_channel_and_clear() {
        let router = MessageRouter::new();
        router.register_message_handler("chat", |_| {});
        router.register_data_handler("file-transfer", |_| {});
        assert_eq!(router.channels(), vec!["chat", "file-transfer"]);
        router.clear_channel("chat");
        assert_eq!(router.channels(), vec!["file-transfer"]);
        router.clear();
        assert!(router.channels().is_empty());
    }
}
