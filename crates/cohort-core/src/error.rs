use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building or checking core values.
#[derive(Debug, Error)]
pub enum Error {
    /// A `RunConfig` or store location that cannot be used.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A value could not be canonicalized for content addressing.
    #[error("cannot hash value: {0}")]
    Hash(String),

    /// A checkpoint whose task sets disagree with its own request.
    #[error("inconsistent checkpoint: {0}")]
    Checkpoint(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Hash(e.to_string())
    }
}
