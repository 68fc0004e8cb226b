use thiserror::Error;

pub type Result<T> = std::result::Result<T, StudyError>;

#[derive(Debug, Error)]
pub enum StudyError {
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid study: {0}")]
    Invalid(String),

    #[error(transparent)]
    Core(#[from] cohort_core::error::Error),
}
