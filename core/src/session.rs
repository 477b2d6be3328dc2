/// Chat session service: owns the caches for one authenticated session
///
/// Created on login, handed by reference (or clone) to whatever needs it,
/// and torn down with `logout`. All inbound traffic goes through one
/// dispatch task (`run_inbound`) so messages of a conversation are stored
/// and delivered strictly in arrival order.
use crate::config::SessionConfig;
use crate::conversation::{ConversationKey, MessageEnvelope};
use crate::dedup::{DedupKey, Deduplicator};
use crate::error::{ChatError, Result};
use crate::history::HistoryPaginator;
use crate::protocol::{ChatType, ExternalFrame, InboundFrame, OutboundFrame};
use crate::recency::{RecencyCache, RecencyEntry, RecencyUpdate};
use crate::router::{
    ConversationListObserver, ConversationObserver, ConversationRouter, Delivery, Subscription,
};
use crate::session_store::SessionStore;
use crate::transport::Transport;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const MAX_PENDING_ECHOES: usize = 256;
const ECHO_CLOCK_SKEW_SECS: i64 = 120;

/// What happened to one inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// New message: stored and routed
    Delivered(Delivery),
    /// Already seen; nothing happened
    Duplicate,
    /// Server copy of our own local echo: routed, but not stored twice
    EchoReconciled(Delivery),
    /// Not a chat frame; handed to `external_frames` subscribers
    Forwarded,
}

/// Display metadata for a user or group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub display_name: String,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone)]
struct PendingEcho {
    client_id: Uuid,
    key: ConversationKey,
    content: String,
}

/// Explicitly constructed session service (one per login)
#[derive(Clone)]
pub struct ChatSession {
    config: Arc<SessionConfig>,
    transport: Arc<dyn Transport>,
    dedup: Deduplicator,
    store: SessionStore,
    recency: RecencyCache,
    router: ConversationRouter,
    contacts: Arc<RwLock<HashMap<String, Contact>>>,
    pending: Arc<RwLock<VecDeque<PendingEcho>>>,
    external_tx: broadcast::Sender<ExternalFrame>,
}

impl ChatSession {
    pub fn new(config: SessionConfig, transport: Arc<dyn Transport>) -> Self {
        let (external_tx, _) = broadcast::channel(config.external_channel_capacity.max(1));
        info!("Starting chat session for {}", config.local_user);

        Self {
            dedup: Deduplicator::new(config.dedup_capacity),
            store: SessionStore::new(config.log_cap(false), config.log_cap(true)),
            recency: RecencyCache::new(config.preview_max_chars),
            router: ConversationRouter::new(config.local_user.clone()),
            contacts: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(RwLock::new(VecDeque::new())),
            config: Arc::new(config),
            transport,
            external_tx,
        }
    }

    pub fn local_user(&self) -> &str {
        &self.config.local_user
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // ─── Inbound ─────────────────────────────────────────────────────────────

    /// Bounded queue between the transport's reader and `run_inbound`
    pub fn inbound_channel(&self) -> (mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        mpsc::channel(self.config.inbound_queue.max(1))
    }

    /// Dispatch loop: consume raw frames in arrival order until the sender closes
    pub async fn run_inbound(&self, mut frames: mpsc::Receiver<Vec<u8>>) {
        info!("Inbound dispatch started for {}", self.local_user());
        let mut handled = 0usize;
        while let Some(raw) = frames.recv().await {
            self.handle_raw(&raw).await;
            handled += 1;
        }
        info!("Inbound channel closed after {} frames", handled);
    }

    /// Spawn `run_inbound` on the runtime
    pub fn spawn_inbound(&self, frames: mpsc::Receiver<Vec<u8>>) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move { session.run_inbound(frames).await })
    }

    /// Decode and handle one raw frame; malformed frames are logged and dropped
    pub async fn handle_raw(&self, raw: &[u8]) -> Option<IngestOutcome> {
        let frame = match InboundFrame::from_bytes(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping malformed frame ({} bytes): {}", raw.len(), e);
                return None;
            }
        };
        match self.handle_frame(frame).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!("Dropping frame: {}", e);
                None
            }
        }
    }

    /// Handle one decoded frame
    pub async fn handle_frame(&self, frame: InboundFrame) -> Result<IngestOutcome> {
        match frame {
            InboundFrame::DirectMessage(payload) => Ok(self.ingest(payload.into_envelope(false)?).await),
            InboundFrame::GroupMessage(payload) => Ok(self.ingest(payload.into_envelope(true)?).await),
            InboundFrame::External(frame) => {
                debug!("Forwarding {} frame", frame.frame_type);
                if self.external_tx.send(frame).is_err() {
                    debug!("No subscribers for external frames");
                }
                Ok(IngestOutcome::Forwarded)
            }
        }
    }

    /// Deduplicate, store and route one inbound message
    pub async fn ingest(&self, envelope: MessageEnvelope) -> IngestOutcome {
        if !self.dedup.admit_envelope(&envelope).await {
            debug!("Duplicate suppressed in {}", envelope.conversation_key);
            return IngestOutcome::Duplicate;
        }

        if envelope.is_from(self.local_user()) && self.take_pending_echo(&envelope).await {
            debug!("Server echo matched local echo in {}", envelope.conversation_key);
            let entry = if self.router.is_list_visible(&envelope) {
                self.recency.get(&envelope.conversation_key).await
            } else {
                None
            };
            return IngestOutcome::EchoReconciled(self.router.route_inbound(&envelope, entry.as_ref()));
        }

        let envelope = Arc::new(envelope);
        self.store.append(&envelope.conversation_key, envelope.clone()).await;

        // Recency follows every stored message; visibility only gates list observers
        let entry = self.refresh_recency(&envelope).await;

        IngestOutcome::Delivered(self.router.route_inbound(&envelope, Some(&entry)))
    }

    // ─── Outbound (local echo) ───────────────────────────────────────────────

    /// Send a direct message; the local echo is stored before the round trip
    pub async fn send_direct(&self, key: &ConversationKey, content: &str) -> Result<Arc<MessageEnvelope>> {
        if key.is_group() {
            return Err(ChatError::Conversation(format!("{} is not a direct chat", key)));
        }
        let peer = key
            .peer_of(self.local_user())
            .ok_or_else(|| ChatError::Conversation(format!("{} does not include {}", key, self.local_user())))?
            .to_string();

        let client_id = Uuid::new_v4();
        let envelope = MessageEnvelope::direct(self.local_user(), peer.clone(), content, Utc::now())
            .with_client_id(Some(client_id));
        let frame = OutboundFrame::SendDirect {
            recipient: peer,
            content: content.to_string(),
            client_id,
        };
        self.send_with_echo(envelope, frame).await
    }

    /// Send a group message; the local echo is stored before the round trip
    pub async fn send_group(&self, key: &ConversationKey, content: &str) -> Result<Arc<MessageEnvelope>> {
        if !key.is_group() {
            return Err(ChatError::Conversation(format!("{} is not a group chat", key)));
        }

        let client_id = Uuid::new_v4();
        let envelope = MessageEnvelope::group(self.local_user(), key.id.clone(), content, Utc::now())
            .with_client_id(Some(client_id));
        let frame = OutboundFrame::SendGroup {
            group_id: key.id.clone(),
            content: content.to_string(),
            client_id,
        };
        self.send_with_echo(envelope, frame).await
    }

    async fn send_with_echo(&self, envelope: MessageEnvelope, frame: OutboundFrame) -> Result<Arc<MessageEnvelope>> {
        if envelope.content.trim().is_empty() {
            return Err(ChatError::Conversation("refusing to send an empty message".to_string()));
        }
        if !self.transport.is_connected() {
            return Err(ChatError::TransportUnavailable("not connected".to_string()));
        }

        let envelope = Arc::new(envelope);
        let key = envelope.conversation_key.clone();

        self.store.append(&key, envelope.clone()).await;
        self.refresh_recency(&envelope).await;
        self.remember_pending_echo(&envelope, frame.client_id()).await;

        match self.transport.send(frame).await {
            Ok(()) => {
                debug!("Sent message to {}", key);
                Ok(envelope)
            }
            Err(e) => {
                error!("Send to {} failed: {}", key, e);
                self.drop_pending_echo(envelope.client_id).await;
                Err(match e {
                    e @ ChatError::TransportUnavailable(_) => e,
                    other => ChatError::TransportUnavailable(other.to_string()),
                })
            }
        }
    }

    async fn remember_pending_echo(&self, envelope: &MessageEnvelope, client_id: Uuid) {
        let mut pending = self.pending.write().await;
        pending.push_back(PendingEcho {
            client_id,
            key: envelope.conversation_key.clone(),
            content: envelope.content.clone(),
        });
        while pending.len() > MAX_PENDING_ECHOES {
            pending.pop_front();
        }
    }

    // A failed send never comes back from the server.
    async fn drop_pending_echo(&self, client_id: Option<Uuid>) {
        let Some(client_id) = client_id else {
            return;
        };
        self.pending.write().await.retain(|p| p.client_id != client_id);
    }

    // Match by client id when the server echoes it, else by conversation + content.
    async fn take_pending_echo(&self, envelope: &MessageEnvelope) -> bool {
        let mut pending = self.pending.write().await;
        let position = match envelope.client_id {
            Some(client_id) => pending.iter().position(|p| p.client_id == client_id),
            None => pending
                .iter()
                .position(|p| p.key == envelope.conversation_key && p.content == envelope.content),
        };
        position.and_then(|i| pending.remove(i)).is_some()
    }

    // ─── Recency ─────────────────────────────────────────────────────────────

    async fn refresh_recency(&self, envelope: &MessageEnvelope) -> RecencyEntry {
        let me = self.local_user();
        let title_id = if envelope.is_group {
            envelope.recipient.as_str()
        } else {
            envelope
                .conversation_key
                .peer_of(me)
                .unwrap_or(envelope.sender_id.as_str())
        };

        let (display_name, avatar, sender_name) = {
            let contacts = self.contacts.read().await;
            let title = contacts.get(title_id);
            (
                title
                    .map(|c| c.display_name.clone())
                    .unwrap_or_else(|| title_id.to_string()),
                title.and_then(|c| c.avatar.clone()),
                contacts
                    .get(&envelope.sender_id)
                    .map(|c| c.display_name.clone())
                    .unwrap_or_else(|| envelope.sender_id.clone()),
            )
        };

        self.recency
            .update(RecencyUpdate {
                key: envelope.conversation_key.clone(),
                display_name,
                sender_name,
                content: envelope.content.clone(),
                avatar,
                is_group: envelope.is_group,
                is_from_me: envelope.is_from(me),
                at: envelope.sent_at,
            })
            .await
    }

    /// Register display metadata for a user or group id
    pub async fn set_contact(&self, id: impl Into<String>, display_name: impl Into<String>, avatar: Option<String>) {
        self.contacts.write().await.insert(
            id.into(),
            Contact {
                display_name: display_name.into(),
                avatar,
            },
        );
    }

    pub async fn mark_read(&self, key: &ConversationKey) -> Option<RecencyEntry> {
        self.recency.mark_read(key).await
    }

    /// Conversation list, most recently updated first
    pub async fn conversations(&self) -> Vec<RecencyEntry> {
        self.recency.get_all().await
    }

    pub async fn conversation_entry(&self, key: &ConversationKey) -> Option<RecencyEntry> {
        self.recency.get(key).await
    }

    pub async fn total_unread(&self) -> u64 {
        self.recency.total_unread().await
    }

    /// Messages of one conversation in arrival order
    pub async fn messages(&self, key: &ConversationKey) -> Vec<Arc<MessageEnvelope>> {
        self.store.get(key).await
    }

    // ─── Observers ───────────────────────────────────────────────────────────

    pub fn subscribe_conversation(&self, key: &ConversationKey, observer: Arc<dyn ConversationObserver>) -> Subscription {
        self.router.subscribe_conversation(key, observer)
    }

    pub fn unsubscribe_conversation(&self, key: &ConversationKey, observer: &Arc<dyn ConversationObserver>) -> bool {
        self.router.unsubscribe_conversation(key, observer)
    }

    pub fn subscribe_conversation_list(&self, observer: Arc<dyn ConversationListObserver>) -> Subscription {
        self.router.subscribe_conversation_list(observer)
    }

    pub fn unsubscribe_conversation_list(&self, observer: &Arc<dyn ConversationListObserver>) -> bool {
        self.router.unsubscribe_conversation_list(observer)
    }

    /// Frames the core does not handle (friend lists, profiles, ...)
    pub fn external_frames(&self) -> broadcast::Receiver<ExternalFrame> {
        self.external_tx.subscribe()
    }

    // ─── History ─────────────────────────────────────────────────────────────

    /// Backward pager for one conversation
    pub fn history(&self, chat_type: ChatType, target_id: &str) -> HistoryPaginator {
        HistoryPaginator::new(
            self.transport.clone(),
            self.local_user(),
            chat_type,
            target_id,
            self.config.history_page_size,
        )
    }

    /// Seed the session log with what a pager has merged so far.
    ///
    /// Messages already seen live are skipped, whether they are known to the
    /// deduplicator or only present in the log (history items may carry no
    /// id, and local echoes are stamped by the client clock). The rest are
    /// marked seen so a late re-delivery is suppressed. Returns how many
    /// were added.
    pub async fn apply_history(&self, pager: &HistoryPaginator) -> usize {
        let key = pager.conversation_key();
        let live = self.store.get(&key).await;
        let mut older = Vec::new();
        for envelope in pager.envelopes().await {
            let dedup_key = DedupKey::for_envelope(&envelope);
            if self.dedup.contains(&dedup_key.key).await
                || live.iter().any(|stored| is_same_message(stored, &envelope))
            {
                continue;
            }
            self.dedup.admit(&dedup_key.key, &dedup_key.observed_id).await;
            older.push(Arc::new(envelope));
        }
        let added = self.store.prepend_history(&key, older).await;
        debug!("Seeded {} with {} history messages", key, added);
        added
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Tear the session down: every cache and registration is dropped
    pub async fn logout(&self) {
        self.store.clear().await;
        self.recency.clear().await;
        self.dedup.clear().await;
        self.pending.write().await.clear();
        self.contacts.write().await.clear();
        self.router.clear();
        info!("Session for {} cleared", self.local_user());
    }
}

/// Whether a fetched history message is a message already held in the log.
///
/// Ids decide when both sides have one. Otherwise sender and content must
/// match, with timestamps compared at whole-second precision (the history
/// format has no milliseconds). Local echoes get `ECHO_CLOCK_SKEW_SECS` of
/// slack for the distance between the client and server clocks.
fn is_same_message(stored: &MessageEnvelope, fetched: &MessageEnvelope) -> bool {
    if let (Some(a), Some(b)) = (&stored.message_id, &fetched.message_id) {
        return a == b;
    }
    if stored.sender_id != fetched.sender_id || stored.content != fetched.content {
        return false;
    }
    let slack = if stored.client_id.is_some() && stored.message_id.is_none() {
        ECHO_CLOCK_SKEW_SECS
    } else {
        0
    };
    (stored.sent_at.timestamp() - fetched.sent_at.timestamp()).abs() <= slack
}
