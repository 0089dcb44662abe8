//! Queue store: the storage seam the engine composes.
//!
//! Every mutation the engine performs is a `conditional_transition`: an
//! update that only lands on records still matching the filter at the moment
//! of the write. That single primitive is what keeps concurrent consumers
//! from claiming the same record; there is no lock table or lease.

pub mod memory;

pub use memory::MemoryStore;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::queue::{QueueRecord, Status};

/// Durable storage for queue records.
///
/// Implementations: [`MemoryStore`] for tests and dry runs, and
/// [`crate::db::Db`] for Postgres.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert unless a record with the same id exists. Returns `false` on a
    /// uniqueness conflict, which is not an error.
    async fn insert_if_absent(&self, record: &QueueRecord) -> Result<bool>;

    /// Fetch a record by id.
    async fn get(&self, id: &str) -> Result<Option<QueueRecord>>;

    /// Records matching `filter`, ordered by priority (desc) then
    /// `created_at` (asc), at most `limit` of them.
    async fn find(&self, filter: &Filter, limit: usize) -> Result<Vec<QueueRecord>>;

    /// Apply `update` to every record still matching `filter`, atomically per
    /// record. Returns how many records changed.
    async fn conditional_transition(&self, filter: &Filter, update: &Update) -> Result<u64>;

    /// Record count per status. Statuses with no records may be absent.
    async fn count_by_status(&self) -> Result<HashMap<Status, u64>>;
}

#[async_trait]
impl<T: QueueStore + ?Sized> QueueStore for Arc<T> {
    async fn insert_if_absent(&self, record: &QueueRecord) -> Result<bool> {
        (**self).insert_if_absent(record).await
    }

    async fn get(&self, id: &str) -> Result<Option<QueueRecord>> {
        (**self).get(id).await
    }

    async fn find(&self, filter: &Filter, limit: usize) -> Result<Vec<QueueRecord>> {
        (**self).find(filter, limit).await
    }

    async fn conditional_transition(&self, filter: &Filter, update: &Update) -> Result<u64> {
        (**self).conditional_transition(filter, update).await
    }

    async fn count_by_status(&self) -> Result<HashMap<Status, u64>> {
        (**self).count_by_status().await
    }
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Predicate over queue records. Unset fields match everything; set fields
/// are ANDed together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub id: Option<String>,
    /// Match any of these statuses. Empty matches all.
    pub statuses: Vec<Status>,
    /// Readiness at this instant: `Pending`, or `Scheduled` and due.
    pub ready_at: Option<DateTime<Utc>>,
    pub retry_count_below: Option<u32>,
    pub retry_count_at_least: Option<u32>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn ready(now: DateTime<Utc>) -> Self {
        Self {
            ready_at: Some(now),
            ..Self::default()
        }
    }

    pub fn status(mut self, status: Status) -> Self {
        self.statuses = vec![status];
        self
    }

    pub fn statuses(mut self, statuses: &[Status]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    pub fn retry_count_below(mut self, n: u32) -> Self {
        self.retry_count_below = Some(n);
        self
    }

    pub fn retry_count_at_least(mut self, n: u32) -> Self {
        self.retry_count_at_least = Some(n);
        self
    }

    pub fn matches(&self, record: &QueueRecord) -> bool {
        if self.id.as_ref().is_some_and(|id| *id != record.id) {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&record.status) {
            return false;
        }
        if self.ready_at.is_some_and(|now| !record.is_ready(now)) {
            return false;
        }
        if self.retry_count_below.is_some_and(|n| record.retry_count >= n) {
            return false;
        }
        if self
            .retry_count_at_least
            .is_some_and(|n| record.retry_count < n)
        {
            return false;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Update
// ---------------------------------------------------------------------------

/// What to do with `error_message` during a transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ErrorMessage {
    #[default]
    Keep,
    Set(String),
    Clear,
}

/// A status transition plus the bookkeeping that goes with it.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub status: Status,
    pub updated_at: DateTime<Utc>,
    /// Overwrite `processed_at` when set.
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: ErrorMessage,
    pub increment_retry_count: bool,
}

impl Update {
    pub fn to(status: Status, now: DateTime<Utc>) -> Self {
        Self {
            status,
            updated_at: now,
            processed_at: None,
            error_message: ErrorMessage::Keep,
            increment_retry_count: false,
        }
    }

    pub fn processed_at(mut self, at: DateTime<Utc>) -> Self {
        self.processed_at = Some(at);
        self
    }

    pub fn error_message(mut self, change: ErrorMessage) -> Self {
        self.error_message = change;
        self
    }

    pub fn increment_retry_count(mut self) -> Self {
        self.increment_retry_count = true;
        self
    }

    pub fn apply(&self, record: &mut QueueRecord) {
        record.status = self.status;
        record.updated_at = self.updated_at;
        if let Some(at) = self.processed_at {
            record.processed_at = Some(at);
        }
        match &self.error_message {
            ErrorMessage::Keep => {}
            ErrorMessage::Set(message) => record.error_message = Some(message.clone()),
            ErrorMessage::Clear => record.error_message = None,
        }
        if self.increment_retry_count {
            record.retry_count += 1;
        }
    }
}
