/// In-memory per-conversation message logs for one session
/// Bounded: each log keeps only its newest messages, nothing touches disk
use crate::conversation::{ConversationKey, MessageEnvelope};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Ordered, capped log of one conversation
#[derive(Debug, Clone)]
pub struct ConversationLog {
    cap: usize,
    messages: VecDeque<Arc<MessageEnvelope>>,
}

impl ConversationLog {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            messages: VecDeque::new(),
        }
    }

    /// Append at the tail, returning how many messages fell off the head
    pub fn push(&mut self, envelope: Arc<MessageEnvelope>) -> usize {
        self.messages.push_back(envelope);
        let mut evicted = 0;
        while self.messages.len() > self.cap {
            self.messages.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Insert older messages before the head, without evicting newer ones.
    /// `older` must be ascending; returns how many fit under the cap.
    pub fn prepend(&mut self, older: Vec<Arc<MessageEnvelope>>) -> usize {
        let room = self.cap.saturating_sub(self.messages.len());
        let skip = older.len().saturating_sub(room);
        let mut inserted = 0;
        for envelope in older.into_iter().skip(skip).rev() {
            self.messages.push_front(envelope);
            inserted += 1;
        }
        inserted
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Arc<MessageEnvelope>> {
        self.messages.back()
    }

    pub fn snapshot(&self) -> Vec<Arc<MessageEnvelope>> {
        self.messages.iter().cloned().collect()
    }
}

/// Session-scoped message store, keyed by conversation
#[derive(Clone)]
pub struct SessionStore {
    logs: Arc<RwLock<HashMap<ConversationKey, ConversationLog>>>,
    direct_cap: usize,
    group_cap: usize,
}

impl SessionStore {
    pub fn new(direct_cap: usize, group_cap: usize) -> Self {
        Self {
            logs: Arc::new(RwLock::new(HashMap::new())),
            direct_cap,
            group_cap,
        }
    }

    /// Append a message to its conversation's log, creating the log if absent
    pub async fn append(&self, key: &ConversationKey, envelope: Arc<MessageEnvelope>) {
        let cap = if key.is_group() { self.group_cap } else { self.direct_cap };
        let mut logs = self.logs.write().await;
        let evicted = logs
            .entry(key.clone())
            .or_insert_with(|| ConversationLog::new(cap))
            .push(envelope);
        if evicted > 0 {
            debug!("Log {} over cap, dropped {} oldest", key, evicted);
        }
    }

    /// Seed a conversation with older messages fetched from history
    pub async fn prepend_history(&self, key: &ConversationKey, older: Vec<Arc<MessageEnvelope>>) -> usize {
        if older.is_empty() {
            return 0;
        }
        let cap = if key.is_group() { self.group_cap } else { self.direct_cap };
        let mut logs = self.logs.write().await;
        logs.entry(key.clone())
            .or_insert_with(|| ConversationLog::new(cap))
            .prepend(older)
    }

    /// Snapshot of a conversation in append order (empty if unknown)
    pub async fn get(&self, key: &ConversationKey) -> Vec<Arc<MessageEnvelope>> {
        let logs = self.logs.read().await;
        logs.get(key).map(ConversationLog::snapshot).unwrap_or_default()
    }

    /// Most recent message of a conversation
    pub async fn last(&self, key: &ConversationKey) -> Option<Arc<MessageEnvelope>> {
        let logs = self.logs.read().await;
        logs.get(key).and_then(|log| log.last().cloned())
    }

    pub async fn len(&self, key: &ConversationKey) -> usize {
        let logs = self.logs.read().await;
        logs.get(key).map(ConversationLog::len).unwrap_or(0)
    }

    pub async fn keys(&self) -> Vec<ConversationKey> {
        self.logs.read().await.keys().cloned().collect()
    }

    /// Drop one conversation's log
    pub async fn remove(&self, key: &ConversationKey) -> bool {
        self.logs.write().await.remove(key).is_some()
    }

    /// Drop every log (logout)
    pub async fn clear(&self) {
        self.logs.write().await.clear();
    }
}
