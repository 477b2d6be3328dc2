/// ChatSync - client-side chat message distribution core
///
/// Deduplicates inbound chat frames, routes them to conversation and
/// conversation-list observers, and keeps the per-session caches (message
/// logs, recency entries, paged history) behind one explicitly constructed
/// `ChatSession`.

pub mod error;
pub mod config;
pub mod conversation;
pub mod protocol;
pub mod dedup;
pub mod session_store;
pub mod recency;
pub mod router;
pub mod transport;
pub mod history;
pub mod session;

pub use error::{ChatError, Result};
pub use config::SessionConfig;
pub use conversation::{build_key, ConversationKey, ConversationKind, MessageEnvelope};
pub use history::{HistoryPaginator, LoadOutcome, PaginationState, TimelineItem};
pub use recency::RecencyEntry;
pub use router::{ConversationListObserver, ConversationObserver, Delivery, Subscription};
pub use session::{ChatSession, IngestOutcome};
pub use transport::{OfflineTransport, Transport};
