/// Configuration management
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_DEDUP_CAPACITY: usize = 1000;
pub const DEFAULT_DIRECT_LOG_CAP: usize = 500;
pub const DEFAULT_GROUP_LOG_CAP: usize = 1000;
pub const DEFAULT_PREVIEW_MAX_CHARS: usize = 30;
pub const DEFAULT_HISTORY_PAGE_SIZE: usize = 20;

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Identity of the logged-in user ("me")
    pub local_user: String,

    /// Max dedup records kept before the oldest is evicted
    pub dedup_capacity: usize,

    /// Per-conversation log cap for direct chats
    pub direct_log_cap: usize,

    /// Per-conversation log cap for group chats
    pub group_log_cap: usize,

    /// Preview length (in characters) before the ellipsis is appended
    pub preview_max_chars: usize,

    /// Messages requested per history page
    pub history_page_size: usize,

    /// Bound of the inbound frame queue between the reader and the dispatch task
    pub inbound_queue: usize,

    /// Capacity of the broadcast channel carrying non-chat frames
    pub external_channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            local_user: String::new(),
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            direct_log_cap: DEFAULT_DIRECT_LOG_CAP,
            group_log_cap: DEFAULT_GROUP_LOG_CAP,
            preview_max_chars: DEFAULT_PREVIEW_MAX_CHARS,
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
            inbound_queue: 256,
            external_channel_capacity: 64,
        }
    }
}

impl SessionConfig {
    /// Config for `local_user` with every other setting at its default
    pub fn for_user(local_user: impl Into<String>) -> Self {
        Self {
            local_user: local_user.into(),
            ..Default::default()
        }
    }

    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 {
            return Err(ChatError::Config(format!(
                "Usage: {} <user-id> [--page-size <n>] [--dedup-capacity <n>] [--queue <n>]",
                args.first().map(String::as_str).unwrap_or("chatsync")
            )));
        }

        let local_user = args[1].trim().to_string();
        if local_user.is_empty() || local_user.starts_with("--") {
            return Err(ChatError::Config("user id must be the first argument".to_string()));
        }

        let mut config = Self::for_user(local_user);

        let mut i = 2;
        while i < args.len() {
            match args[i].as_str() {
                "--page-size" => {
                    config.history_page_size = parse_count(args.get(i + 1), "--page-size")?;
                    i += 2;
                }
                "--dedup-capacity" => {
                    config.dedup_capacity = parse_count(args.get(i + 1), "--dedup-capacity")?;
                    i += 2;
                }
                "--queue" => {
                    config.inbound_queue = parse_count(args.get(i + 1), "--queue")?;
                    i += 2;
                }
                other => {
                    return Err(ChatError::Config(format!("Unknown argument: {}", other)));
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Some(n) = env_count("CHATSYNC_PAGE_SIZE") {
            config.history_page_size = n;
        }
        if let Some(n) = env_count("CHATSYNC_DEDUP_CAPACITY") {
            config.dedup_capacity = n;
        }
        if let Some(n) = env_count("CHATSYNC_QUEUE") {
            config.inbound_queue = n;
        }

        Ok(config)
    }

    /// Log cap for a conversation kind
    pub fn log_cap(&self, is_group: bool) -> usize {
        if is_group {
            self.group_log_cap
        } else {
            self.direct_log_cap
        }
    }
}

fn parse_count(value: Option<&String>, flag: &str) -> Result<usize> {
    let raw = value.ok_or_else(|| ChatError::Config(format!("{} requires a number", flag)))?;
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ChatError::Config(format!(
            "{} must be a positive number, got {:?}",
            flag, raw
        ))),
    }
}

fn env_count(var: &str) -> Option<usize> {
    std::env::var(var)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|n| *n > 0)
}
