/// Backward history paging merged into one ordered, de-duplicated view
///
/// Each page is requested with the oldest timestamp merged so far as an
/// exclusive upper bound, so pages only ever move back in time. Overlap
/// returned by the server is absorbed by the merge.
use crate::conversation::{ConversationKey, MessageEnvelope};
use crate::error::{ChatError, Result};
use crate::protocol::{ChatType, HistoryItem, HistoryRequest, HistoryResponse};
use crate::transport::Transport;
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Fixed format of `timestampString` in history responses
pub const HISTORY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parse a history timestamp (local time); falls back to now when unparsable
pub fn parse_history_timestamp(raw: &str) -> DateTime<Utc> {
    match NaiveDateTime::parse_from_str(raw.trim(), HISTORY_TIME_FORMAT) {
        Ok(naive) => Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|local| local.with_timezone(&Utc))
            .unwrap_or_else(|| naive.and_utc()),
        Err(e) => {
            warn!("Unparsable history timestamp {:?} ({}), using now", raw, e);
            Utc::now()
        }
    }
}

/// Identity used to merge pages
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum MessageIdentity {
    Id(String),
    Composite {
        sender_id: String,
        timestamp_ms: i64,
        content: String,
    },
}

/// One message from a history page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryMessage {
    pub message_id: Option<String>,
    pub sender_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl HistoryMessage {
    pub fn from_item(item: HistoryItem) -> Self {
        Self {
            timestamp: parse_history_timestamp(&item.timestamp_string),
            message_id: item.message_id.filter(|id| !id.is_empty()),
            sender_id: item.sender_id,
            content: item.content,
        }
    }

    fn identity(&self) -> MessageIdentity {
        match &self.message_id {
            Some(id) => MessageIdentity::Id(id.clone()),
            None => MessageIdentity::Composite {
                sender_id: self.sender_id.clone(),
                timestamp_ms: self.timestamp.timestamp_millis(),
                content: self.content.clone(),
            },
        }
    }

    fn local_day(&self) -> NaiveDate {
        self.timestamp.with_timezone(&Local).date_naive()
    }
}

/// One decoded page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryPage {
    pub messages: Vec<HistoryMessage>,
    pub requested_limit: usize,
    pub earliest_timestamp: Option<DateTime<Utc>>,
}

impl HistoryPage {
    pub fn from_response(response: HistoryResponse, requested_limit: usize) -> Result<Self> {
        if !response.success {
            return Err(ChatError::History(
                response
                    .message
                    .unwrap_or_else(|| "server reported failure".to_string()),
            ));
        }
        let messages: Vec<HistoryMessage> =
            response.items.into_iter().map(HistoryMessage::from_item).collect();
        let earliest_timestamp = messages.iter().map(|m| m.timestamp).min();
        Ok(Self {
            messages,
            requested_limit,
            earliest_timestamp,
        })
    }

    /// A short page is taken to mean there is nothing older.
    /// Approximate: a backend that returns short pages mid-stream under-fetches.
    pub fn is_last(&self) -> bool {
        self.messages.len() < self.requested_limit
    }
}

/// Row of the merged view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineItem {
    DayMarker(NaiveDate),
    Message(HistoryMessage),
}

/// Union of every merged page, ascending by timestamp
#[derive(Debug, Clone, Default)]
pub struct MergedHistory {
    messages: Vec<HistoryMessage>,
    seen: HashSet<MessageIdentity>,
}

impl MergedHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a page, returning how many messages were new
    pub fn merge(&mut self, page: &HistoryPage) -> usize {
        let mut added = 0;
        for message in &page.messages {
            if self.seen.insert(message.identity()) {
                self.messages.push(message.clone());
                added += 1;
            }
        }
        // stable, so equal timestamps keep arrival order and re-merging is a no-op
        self.messages.sort_by_key(|m| m.timestamp);
        added
    }

    pub fn messages(&self) -> &[HistoryMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Oldest merged timestamp, the next backward cursor
    pub fn earliest(&self) -> Option<DateTime<Utc>> {
        self.messages.first().map(|m| m.timestamp)
    }

    /// Messages with a day marker before the first entry and at every day change
    pub fn timeline(&self) -> Vec<TimelineItem> {
        let mut items = Vec::with_capacity(self.messages.len() + 4);
        let mut current_day: Option<NaiveDate> = None;
        for message in &self.messages {
            let day = message.local_day();
            if current_day != Some(day) {
                items.push(TimelineItem::DayMarker(day));
                current_day = Some(day);
            }
            items.push(TimelineItem::Message(message.clone()));
        }
        items
    }
}

/// Fetch one page from the transport.
///
/// `before` is an exclusive upper bound; `None` asks for the most recent page.
pub async fn load_page(
    transport: &dyn Transport,
    chat_type: ChatType,
    target_id: &str,
    limit: usize,
    before: Option<DateTime<Utc>>,
) -> Result<HistoryPage> {
    let request = HistoryRequest {
        chat_type,
        target_id: target_id.to_string(),
        limit,
        before_timestamp: before.map(|t| t.timestamp_millis()),
    };
    debug!(
        "Requesting {:?} history of {} (limit {}, before {:?})",
        chat_type,
        target_id,
        limit,
        request.before_timestamp
    );
    let response = transport.request_history(request).await?;
    HistoryPage::from_response(response, limit)
}

/// Paginator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationState {
    Idle,
    Loading,
}

/// What a `load_more` call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A page was fetched and merged
    Loaded { added: usize, exhausted: bool },
    /// A request was already in flight; this call was dropped
    AlreadyLoading,
    /// An earlier short page ended the history; nothing was requested
    Exhausted,
}

#[derive(Debug, Default)]
struct PagerState {
    merged: MergedHistory,
    exhausted: bool,
    pages_loaded: usize,
    last_error: Option<String>,
}

// Clears the loading flag even if the load future is dropped mid-flight.
struct LoadingGuard<'a>(&'a AtomicBool);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Backward pager for one conversation
#[derive(Clone)]
pub struct HistoryPaginator {
    transport: Arc<dyn Transport>,
    local_user: String,
    chat_type: ChatType,
    target_id: String,
    limit: usize,
    loading: Arc<AtomicBool>,
    state: Arc<RwLock<PagerState>>,
}

impl HistoryPaginator {
    pub fn new(
        transport: Arc<dyn Transport>,
        local_user: impl Into<String>,
        chat_type: ChatType,
        target_id: impl Into<String>,
        limit: usize,
    ) -> Self {
        Self {
            transport,
            local_user: local_user.into(),
            chat_type,
            target_id: target_id.into(),
            limit: limit.max(1),
            loading: Arc::new(AtomicBool::new(false)),
            state: Arc::new(RwLock::new(PagerState::default())),
        }
    }

    pub fn state(&self) -> PaginationState {
        if self.loading.load(Ordering::SeqCst) {
            PaginationState::Loading
        } else {
            PaginationState::Idle
        }
    }

    pub fn conversation_key(&self) -> ConversationKey {
        match self.chat_type {
            ChatType::Private => ConversationKey::direct(&self.local_user, &self.target_id),
            ChatType::Group => ConversationKey::group(&self.target_id),
        }
    }

    /// Fetch the next older page and merge it.
    ///
    /// Dropped (not queued) while another load is in flight. An error leaves
    /// the merged view and cursor untouched, so the next call retries the
    /// same page.
    pub async fn load_more(&self) -> Result<LoadOutcome> {
        if self.state.read().await.exhausted {
            return Ok(LoadOutcome::Exhausted);
        }
        if self
            .loading
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("History of {} already loading, dropping request", self.target_id);
            return Ok(LoadOutcome::AlreadyLoading);
        }
        let _guard = LoadingGuard(self.loading.as_ref());

        let cursor = self.state.read().await.merged.earliest();
        let result = load_page(
            self.transport.as_ref(),
            self.chat_type,
            &self.target_id,
            self.limit,
            cursor,
        )
        .await;

        let mut state = self.state.write().await;
        match result {
            Ok(page) => {
                let added = state.merged.merge(&page);
                let exhausted = page.is_last();
                state.exhausted = exhausted;
                state.pages_loaded += 1;
                state.last_error = None;
                if exhausted {
                    info!(
                        "History of {} exhausted after {} pages ({} messages)",
                        self.target_id,
                        state.pages_loaded,
                        state.merged.len()
                    );
                }
                Ok(LoadOutcome::Loaded { added, exhausted })
            }
            Err(e) => {
                warn!("History load for {} failed: {}", self.target_id, e);
                state.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    pub async fn is_exhausted(&self) -> bool {
        self.state.read().await.exhausted
    }

    pub async fn last_error(&self) -> Option<String> {
        self.state.read().await.last_error.clone()
    }

    /// Cursor the next `load_more` will send
    pub async fn next_cursor(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.merged.earliest()
    }

    pub async fn timeline(&self) -> Vec<TimelineItem> {
        self.state.read().await.merged.timeline()
    }

    pub async fn messages(&self) -> Vec<HistoryMessage> {
        self.state.read().await.merged.messages().to_vec()
    }

    /// Merged history as envelopes, oldest first
    pub async fn envelopes(&self) -> Vec<MessageEnvelope> {
        let state = self.state.read().await;
        state
            .merged
            .messages()
            .iter()
            .map(|m| self.to_envelope(m))
            .collect()
    }

    fn to_envelope(&self, message: &HistoryMessage) -> MessageEnvelope {
        let envelope = match self.chat_type {
            ChatType::Group => MessageEnvelope::group(
                message.sender_id.clone(),
                self.target_id.clone(),
                message.content.clone(),
                message.timestamp,
            ),
            ChatType::Private => {
                let recipient = if message.sender_id == self.local_user {
                    self.target_id.clone()
                } else {
                    self.local_user.clone()
                };
                MessageEnvelope::direct(
                    message.sender_id.clone(),
                    recipient,
                    message.content.clone(),
                    message.timestamp,
                )
            }
        };
        envelope.with_message_id(message.message_id.clone())
    }
}
