//! Error types for relayq.

use thiserror::Error;

use crate::model::queue::Status;

#[derive(Debug, Error)]
pub enum Error {
    #[error("queue record not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: Status, to: Status },

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("payload serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt record {id}: {reason}")]
    CorruptRecord { id: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("dispatch loop is already running")]
    AlreadyRunning,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Storage-layer faults the dispatch loop backs off and retries on.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_) | Error::Serialization(_) | Error::CorruptRecord { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
