/// Conversation identity and the message envelope shared by every component
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// Kind of conversation thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

/// Canonical identifier for one direct or group chat thread.
///
/// Direct keys are built from both participants sorted ascending, so the
/// sender and the receiver of a message always compute the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey {
    pub kind: ConversationKind,
    pub id: String,
}

impl ConversationKey {
    /// Key for the direct chat between `a` and `b` (order of arguments is irrelevant)
    pub fn direct(a: &str, b: &str) -> Self {
        let (lo, hi) = match compare_ids(a, b) {
            Ordering::Greater => (b, a),
            _ => (a, b),
        };
        Self {
            kind: ConversationKind::Direct,
            id: format!("{}:{}", lo, hi),
        }
    }

    /// Key for a group chat
    pub fn group(group_id: &str) -> Self {
        Self {
            kind: ConversationKind::Group,
            id: group_id.to_string(),
        }
    }

    pub fn is_group(&self) -> bool {
        self.kind == ConversationKind::Group
    }

    /// Both participants of a direct key, lowest first
    pub fn participants(&self) -> Option<(&str, &str)> {
        match self.kind {
            ConversationKind::Direct => self.id.split_once(':'),
            ConversationKind::Group => None,
        }
    }

    /// The participant of a direct key that is not `me`
    pub fn peer_of(&self, me: &str) -> Option<&str> {
        let (lo, hi) = self.participants()?;
        if lo == me {
            Some(hi)
        } else if hi == me {
            Some(lo)
        } else {
            None
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ConversationKind::Direct => write!(f, "direct:{}", self.id),
            ConversationKind::Group => write!(f, "group:{}", self.id),
        }
    }
}

/// Build the canonical direct key for two participants
pub fn build_key(a: impl fmt::Display, b: impl fmt::Display) -> ConversationKey {
    ConversationKey::direct(&a.to_string(), &b.to_string())
}

// Numeric ids compare by value so "42" < "100"; anything else compares as text.
fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

/// One chat message as it travels through the core.
///
/// Built once from an inbound frame or a local echo and shared behind `Arc`
/// afterwards, so it is never mutated once it leaves its constructor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Server-assigned identifier, when the transport provides one
    pub message_id: Option<String>,
    /// Client-assigned identifier of a local send, echoed back by some servers
    pub client_id: Option<Uuid>,
    pub conversation_key: ConversationKey,
    pub sender_id: String,
    /// Recipient user id for direct chats, group id for group chats
    pub recipient: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub is_group: bool,
}

impl MessageEnvelope {
    pub fn direct(
        sender_id: impl Into<String>,
        recipient: impl Into<String>,
        content: impl Into<String>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        let sender_id = sender_id.into();
        let recipient = recipient.into();
        Self {
            message_id: None,
            client_id: None,
            conversation_key: ConversationKey::direct(&sender_id, &recipient),
            sender_id,
            recipient,
            content: content.into(),
            sent_at,
            is_group: false,
        }
    }

    pub fn group(
        sender_id: impl Into<String>,
        group_id: impl Into<String>,
        content: impl Into<String>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        let group_id = group_id.into();
        Self {
            message_id: None,
            client_id: None,
            conversation_key: ConversationKey::group(&group_id),
            sender_id: sender_id.into(),
            recipient: group_id,
            content: content.into(),
            sent_at,
            is_group: true,
        }
    }

    pub fn with_message_id(mut self, message_id: Option<String>) -> Self {
        self.message_id = message_id.filter(|id| !id.is_empty());
        self
    }

    pub fn with_client_id(mut self, client_id: Option<Uuid>) -> Self {
        self.client_id = client_id;
        self
    }

    pub fn is_from(&self, user: &str) -> bool {
        self.sender_id == user
    }
}
