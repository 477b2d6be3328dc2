/// Fan-out of deduplicated messages to conversation and list observers
///
/// Visibility, with `me` the local identity:
/// - direct message: list observers only when `me` is the recipient (the
///   sender's list was already updated by its own local echo); conversation
///   observers on both sides
/// - group message: list and conversation observers always
use crate::conversation::{ConversationKey, MessageEnvelope};
use crate::error::{ChatError, Result};
use crate::recency::RecencyEntry;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, warn};

/// Receives every message of the conversations it subscribed to
pub trait ConversationObserver: Send + Sync {
    fn on_message(&self, envelope: &MessageEnvelope) -> Result<()>;
}

/// Receives list-visible messages of every conversation
pub trait ConversationListObserver: Send + Sync {
    /// `entry` is the refreshed recency entry when the session keeps one
    fn on_conversation_updated(
        &self,
        envelope: &MessageEnvelope,
        entry: Option<&RecencyEntry>,
    ) -> Result<()>;
}

impl<F> ConversationObserver for F
where
    F: Fn(&MessageEnvelope) -> Result<()> + Send + Sync,
{
    fn on_message(&self, envelope: &MessageEnvelope) -> Result<()> {
        self(envelope)
    }
}

impl<F> ConversationListObserver for F
where
    F: Fn(&MessageEnvelope, Option<&RecencyEntry>) -> Result<()> + Send + Sync,
{
    fn on_conversation_updated(
        &self,
        envelope: &MessageEnvelope,
        entry: Option<&RecencyEntry>,
    ) -> Result<()> {
        self(envelope, entry)
    }
}

type ConversationSlot = (u64, Arc<dyn ConversationObserver>);
type ListSlot = (u64, Arc<dyn ConversationListObserver>);

#[derive(Default)]
struct Registry {
    next_id: u64,
    conversations: HashMap<ConversationKey, Vec<ConversationSlot>>,
    lists: Vec<ListSlot>,
}

impl Registry {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn remove_conversation_slot(&mut self, key: &ConversationKey, id: u64) -> bool {
        let Some(slots) = self.conversations.get_mut(key) else {
            return false;
        };
        let before = slots.len();
        slots.retain(|(slot_id, _)| *slot_id != id);
        let removed = slots.len() != before;
        if slots.is_empty() {
            self.conversations.remove(key);
        }
        removed
    }

    fn remove_list_slot(&mut self, id: u64) -> bool {
        let before = self.lists.len();
        self.lists.retain(|(slot_id, _)| *slot_id != id);
        self.lists.len() != before
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

// Compare data pointers only; vtable pointers of the same type may differ.
fn same_observer<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}

#[derive(Debug, Clone)]
enum Target {
    Conversation(ConversationKey),
    List,
}

/// Registration handle; the observer is released when the handle is dropped
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    id: u64,
    target: Target,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the observer is still registered
    pub fn is_active(&self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let registry = lock(&registry);
        match &self.target {
            Target::Conversation(key) => registry
                .conversations
                .get(key)
                .map(|slots| slots.iter().any(|(id, _)| *id == self.id))
                .unwrap_or(false),
            Target::List => registry.lists.iter().any(|(id, _)| *id == self.id),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = lock(&registry);
            match &self.target {
                Target::Conversation(key) => {
                    registry.remove_conversation_slot(key, self.id);
                }
                Target::List => {
                    registry.remove_list_slot(self.id);
                }
            }
        }
    }
}

/// Result of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub conversation_notified: usize,
    pub list_notified: usize,
    pub failed: usize,
}

/// Stateless dispatcher over a registry of observers
#[derive(Clone)]
pub struct ConversationRouter {
    me: String,
    registry: Arc<Mutex<Registry>>,
}

impl ConversationRouter {
    pub fn new(me: impl Into<String>) -> Self {
        Self {
            me: me.into(),
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    pub fn local_user(&self) -> &str {
        &self.me
    }

    /// Whether the conversation list of `me` should hear about this message
    pub fn is_list_visible(&self, envelope: &MessageEnvelope) -> bool {
        envelope.is_group || envelope.recipient == self.me
    }

    pub fn subscribe_conversation(
        &self,
        key: &ConversationKey,
        observer: Arc<dyn ConversationObserver>,
    ) -> Subscription {
        let mut registry = lock(&self.registry);
        let id = registry.allocate_id();
        registry
            .conversations
            .entry(key.clone())
            .or_default()
            .push((id, observer));
        debug!("Observer {} subscribed to {}", id, key);
        Subscription {
            registry: Arc::downgrade(&self.registry),
            id,
            target: Target::Conversation(key.clone()),
        }
    }

    /// Remove every registration of `observer` for `key`
    pub fn unsubscribe_conversation(
        &self,
        key: &ConversationKey,
        observer: &Arc<dyn ConversationObserver>,
    ) -> bool {
        let mut registry = lock(&self.registry);
        let ids: Vec<u64> = registry
            .conversations
            .get(key)
            .map(|slots| {
                slots
                    .iter()
                    .filter(|(_, o)| same_observer(o, observer))
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default();
        ids.iter()
            .fold(false, |removed, id| registry.remove_conversation_slot(key, *id) || removed)
    }

    pub fn subscribe_conversation_list(
        &self,
        observer: Arc<dyn ConversationListObserver>,
    ) -> Subscription {
        let mut registry = lock(&self.registry);
        let id = registry.allocate_id();
        registry.lists.push((id, observer));
        debug!("List observer {} subscribed", id);
        Subscription {
            registry: Arc::downgrade(&self.registry),
            id,
            target: Target::List,
        }
    }

    /// Remove every list registration of `observer`
    pub fn unsubscribe_conversation_list(&self, observer: &Arc<dyn ConversationListObserver>) -> bool {
        let mut registry = lock(&self.registry);
        let before = registry.lists.len();
        registry.lists.retain(|(_, o)| !same_observer(o, observer));
        registry.lists.len() != before
    }

    pub fn conversation_observer_count(&self, key: &ConversationKey) -> usize {
        lock(&self.registry)
            .conversations
            .get(key)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn list_observer_count(&self) -> usize {
        lock(&self.registry).lists.len()
    }

    /// Fan one message out under the visibility rules.
    ///
    /// Observers are snapshotted and called with the registry unlocked, so a
    /// callback may subscribe or unsubscribe. A failing or panicking observer
    /// is logged and skipped; the rest still get the message.
    pub fn route_inbound(&self, envelope: &MessageEnvelope, entry: Option<&RecencyEntry>) -> Delivery {
        let (conversation, lists) = {
            let registry = lock(&self.registry);
            let conversation: Vec<ConversationSlot> = registry
                .conversations
                .get(&envelope.conversation_key)
                .cloned()
                .unwrap_or_default();
            let lists: Vec<ListSlot> = if self.is_list_visible(envelope) {
                registry.lists.clone()
            } else {
                Vec::new()
            };
            (conversation, lists)
        };

        let mut delivery = Delivery::default();

        for (id, observer) in conversation {
            match isolate(|| observer.on_message(envelope)) {
                Ok(()) => delivery.conversation_notified += 1,
                Err(e) => {
                    warn!("Conversation observer {} failed on {}: {}", id, envelope.conversation_key, e);
                    delivery.failed += 1;
                }
            }
        }

        for (id, observer) in lists {
            match isolate(|| observer.on_conversation_updated(envelope, entry)) {
                Ok(()) => delivery.list_notified += 1,
                Err(e) => {
                    warn!("List observer {} failed on {}: {}", id, envelope.conversation_key, e);
                    delivery.failed += 1;
                }
            }
        }

        debug!(
            "Routed message in {} to {} conversation / {} list observers",
            envelope.conversation_key, delivery.conversation_notified, delivery.list_notified
        );
        delivery
    }

    /// Drop every registration (session teardown)
    pub fn clear(&self) {
        let mut registry = lock(&self.registry);
        registry.conversations.clear();
        registry.lists.clear();
    }
}

fn isolate<F>(notify: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    match catch_unwind(AssertUnwindSafe(notify)) {
        Ok(result) => result,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(ChatError::Observer(format!("panicked: {}", reason)))
        }
    }
}
