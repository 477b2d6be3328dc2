/// Error types for the chat session core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("History request failed: {0}")]
    History(String),

    #[error("Invalid conversation: {0}")]
    Conversation(String),

    #[error("Observer error: {0}")]
    Observer(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ChatError>;
