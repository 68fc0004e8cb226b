use thiserror::Error;

/// Result type local to cohort-store.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupt record at '{path}': {reason}")]
    Corrupt { path: String, reason: String },

    #[error("unsupported codec: {0}")]
    CodecUnsupported(&'static str),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("conversation for '{entity}' rejected append: {reason}")]
    ConversationOrder { entity: String, reason: String },

    #[error(transparent)]
    Core(#[from] cohort_core::error::Error),
}
