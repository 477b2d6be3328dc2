/// Conversation list cache: latest preview and unread state per conversation
use crate::conversation::ConversationKey;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Appended to previews that were cut
pub const ELLIPSIS: &str = "...";

/// Summary of one conversation thread (for the list view)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecencyEntry {
    pub conversation_key: ConversationKey,
    /// Peer or group name shown in the list
    pub display_name: String,
    /// "Me: ..." or "<sender>: ...", cut to the preview limit
    pub preview_text: String,
    /// HH:MM for today, MM-DD otherwise
    pub formatted_time: String,
    pub has_unread: bool,
    pub unread_count: u32,
    pub is_group: bool,
    pub avatar: Option<String>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    touched: u64,
}

/// Everything needed to refresh an entry after a message
#[derive(Debug, Clone)]
pub struct RecencyUpdate {
    pub key: ConversationKey,
    pub display_name: String,
    pub sender_name: String,
    pub content: String,
    pub avatar: Option<String>,
    pub is_group: bool,
    pub is_from_me: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RecencyState {
    entries: HashMap<ConversationKey, RecencyEntry>,
    next_touch: u64,
}

/// Per-conversation recency cache for the session
#[derive(Clone)]
pub struct RecencyCache {
    state: Arc<RwLock<RecencyState>>,
    preview_max_chars: usize,
}

impl RecencyCache {
    pub fn new(preview_max_chars: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(RecencyState::default())),
            preview_max_chars,
        }
    }

    /// Record a new message for a conversation and return the refreshed entry
    pub async fn update(&self, update: RecencyUpdate) -> RecencyEntry {
        let prefix = if update.is_from_me {
            "Me: ".to_string()
        } else {
            format!("{}: ", update.sender_name)
        };
        let preview_text = truncate_preview(&format!("{}{}", prefix, update.content), self.preview_max_chars);
        let formatted_time = format_time(update.at, Utc::now());

        let mut state = self.state.write().await;
        let touched = state.next_touch;
        state.next_touch += 1;

        let entry = state
            .entries
            .entry(update.key.clone())
            .or_insert_with(|| RecencyEntry {
                conversation_key: update.key.clone(),
                display_name: update.display_name.clone(),
                preview_text: String::new(),
                formatted_time: String::new(),
                has_unread: false,
                unread_count: 0,
                is_group: update.is_group,
                avatar: None,
                updated_at: update.at,
                touched,
            });

        if !update.display_name.is_empty() {
            entry.display_name = update.display_name;
        }
        if update.avatar.is_some() {
            entry.avatar = update.avatar;
        }
        entry.preview_text = preview_text;
        entry.formatted_time = formatted_time;
        entry.updated_at = update.at;
        entry.is_group = update.is_group;
        entry.touched = touched;
        if !update.is_from_me {
            entry.unread_count = entry.unread_count.saturating_add(1);
            entry.has_unread = true;
        }

        entry.clone()
    }

    /// Clear unread state; the only operation that does so
    pub async fn mark_read(&self, key: &ConversationKey) -> Option<RecencyEntry> {
        let mut state = self.state.write().await;
        state.entries.get_mut(key).map(|entry| {
            entry.unread_count = 0;
            entry.has_unread = false;
            entry.clone()
        })
    }

    pub async fn get(&self, key: &ConversationKey) -> Option<RecencyEntry> {
        self.state.read().await.entries.get(key).cloned()
    }

    /// All entries, most recently updated first
    pub async fn get_all(&self) -> Vec<RecencyEntry> {
        let state = self.state.read().await;
        let mut entries: Vec<_> = state.entries.values().cloned().collect();
        entries.sort_by(|a, b| b.touched.cmp(&a.touched));
        entries
    }

    pub async fn total_unread(&self) -> u64 {
        let state = self.state.read().await;
        state.entries.values().map(|e| u64::from(e.unread_count)).sum()
    }

    /// Drop every entry (logout)
    pub async fn clear(&self) {
        self.state.write().await.entries.clear();
    }
}

/// Cut `text` to `max_chars` characters, appending the ellipsis when cut
pub fn truncate_preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str(ELLIPSIS);
    cut
}

/// List timestamp: clock time for today's messages, month-day otherwise
pub fn format_time(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let at = at.with_timezone(&Local);
    let now = now.with_timezone(&Local);
    if at.date_naive() == now.date_naive() {
        at.format("%H:%M").to_string()
    } else {
        at.format("%m-%d").to_string()
    }
}
