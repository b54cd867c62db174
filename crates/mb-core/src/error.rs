use thiserror::Error;

#[derive(Error, Debug)]
pub enum MbError {
    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("category not found: {0}")]
    CategoryNotFound(String),

    /// Rejection message is user-facing and surfaced verbatim over HTTP.
    #[error("表情包已存在: 与现有表情包 {0} 重复")]
    Duplicate(String),

    #[error("unsupported image format")]
    InvalidFormat,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type MbResult<T> = Result<T, MbError>;
