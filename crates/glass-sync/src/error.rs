use crate::storage::StorageError;
use glass_core::wire::FrameError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server rejected request: {0}")]
    Rejected(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("not in a session")]
    NoSession,
}
