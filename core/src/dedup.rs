/// Re-delivery suppression for inbound chat messages
///
/// The relay gives no delivery guarantees, so the same logical message can
/// arrive more than once (reconnect replays, multi-path relays). Each message
/// is reduced to a dedup key and remembered in a bounded LRU table.
use crate::conversation::MessageEnvelope;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Identity used to recognize a re-delivered message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub key: String,
    pub observed_id: String,
}

impl DedupKey {
    /// Derive the dedup key of an envelope.
    ///
    /// Uses the transport's message id scoped by conversation when present.
    /// Otherwise falls back to a hash of conversation, sender, second and
    /// content length, which can merge two distinct same-length messages sent
    /// by one sender within the same second.
    pub fn for_envelope(envelope: &MessageEnvelope) -> Self {
        match &envelope.message_id {
            Some(id) => Self {
                key: format!("{}#{}", envelope.conversation_key, id),
                observed_id: id.clone(),
            },
            None => {
                let mut hasher = Sha256::new();
                hasher.update(envelope.conversation_key.to_string().as_bytes());
                hasher.update([0u8]);
                hasher.update(envelope.sender_id.as_bytes());
                hasher.update([0u8]);
                hasher.update(envelope.sent_at.timestamp().to_be_bytes());
                hasher.update((envelope.content.len() as u64).to_be_bytes());
                let digest = format!("{:x}", hasher.finalize());
                Self {
                    key: format!("fp:{}", digest),
                    observed_id: digest,
                }
            }
        }
    }
}

/// One remembered sighting
#[derive(Debug, Clone)]
pub struct DedupRecord {
    pub dedup_key: String,
    pub last_seen_id: String,
    generation: u64,
}

#[derive(Debug)]
struct DedupTable {
    capacity: usize,
    records: HashMap<String, DedupRecord>,
    // (key, generation) in touch order; entries whose generation no longer
    // matches the record are stale and skipped on eviction.
    order: VecDeque<(String, u64)>,
    next_generation: u64,
}

impl DedupTable {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: HashMap::new(),
            order: VecDeque::new(),
            next_generation: 0,
        }
    }

    fn touch(&mut self, key: &str) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.order.push_back((key.to_string(), generation));
        generation
    }

    fn admit(&mut self, dedup_key: &str, observed_id: &str) -> bool {
        let generation = self.touch(dedup_key);

        let admitted = match self.records.get_mut(dedup_key) {
            Some(record) if record.last_seen_id == observed_id => {
                record.generation = generation;
                false
            }
            Some(record) => {
                record.last_seen_id = observed_id.to_string();
                record.generation = generation;
                true
            }
            None => {
                self.records.insert(
                    dedup_key.to_string(),
                    DedupRecord {
                        dedup_key: dedup_key.to_string(),
                        last_seen_id: observed_id.to_string(),
                        generation,
                    },
                );
                true
            }
        };

        self.evict();
        admitted
    }

    fn evict(&mut self) {
        while self.records.len() > self.capacity {
            let Some((key, generation)) = self.order.pop_front() else {
                break;
            };
            let live = self
                .records
                .get(&key)
                .map(|r| r.generation == generation)
                .unwrap_or(false);
            if live {
                self.records.remove(&key);
                debug!("Dedup cache full, evicted {}", key);
            }
        }

        if self.order.len() > self.capacity * 2 {
            let records = &self.records;
            self.order
                .retain(|(key, generation)| records.get(key).map(|r| r.generation) == Some(*generation));
        }
    }
}

/// Bounded LRU deduplicator, shared between the dispatch task and UI calls
#[derive(Clone)]
pub struct Deduplicator {
    table: Arc<RwLock<DedupTable>>,
}

impl Deduplicator {
    pub fn new(capacity: usize) -> Self {
        Self {
            table: Arc::new(RwLock::new(DedupTable::new(capacity))),
        }
    }

    /// True the first time a (key, id) pair is seen, false on every repeat
    pub async fn admit(&self, dedup_key: &str, observed_id: &str) -> bool {
        self.table.write().await.admit(dedup_key, observed_id)
    }

    /// Derive the envelope's dedup key and admit it
    pub async fn admit_envelope(&self, envelope: &MessageEnvelope) -> bool {
        let key = DedupKey::for_envelope(envelope);
        self.admit(&key.key, &key.observed_id).await
    }

    /// Whether a key is currently remembered
    pub async fn contains(&self, dedup_key: &str) -> bool {
        self.table.read().await.records.contains_key(dedup_key)
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Forget everything (logout)
    pub async fn clear(&self) {
        let mut table = self.table.write().await;
        table.records.clear();
        table.order.clear();
    }
}
