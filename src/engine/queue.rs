//! The queue engine. The public API for enqueueing, claiming, and
//! reporting outcomes.
//!
//! `Queue` owns the store handle and enforces the state machine. It holds no
//! state of its own, so any number of `Queue`s (in one process or many) can
//! share the same store; all coordination happens in the store's
//! conditional transitions.

use std::collections::HashSet;

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::queue::*;
use crate::store::{ErrorMessage, Filter, QueueStore, Update};
use crate::telemetry::metrics;

/// Validate a state transition, returning an error if disallowed.
fn validate_transition(from: Status, to: Status) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition { from, to })
    }
}

/// Durable work queue over a [`QueueStore`].
pub struct Queue<S> {
    store: S,
}

impl<S: QueueStore> Queue<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Enqueue gate
    // -----------------------------------------------------------------------

    /// Store a new record unless one with the same id already exists.
    ///
    /// Idempotent: repeated calls with the same id store exactly one record
    /// and report `Duplicate` after the first. A duplicate never touches the
    /// stored record.
    pub async fn enqueue(&self, new: NewRecord) -> Result<EnqueueResult> {
        let record = new.into_record(Utc::now());

        let result = if self.store.insert_if_absent(&record).await? {
            info!(
                record_id = %record.id,
                status = %record.status,
                priority = %record.priority,
                "record queued"
            );
            EnqueueResult::Queued
        } else {
            debug!(record_id = %record.id, "duplicate record, skipped");
            EnqueueResult::Duplicate
        };

        let label = match result {
            EnqueueResult::Queued => "queued",
            EnqueueResult::Duplicate => "duplicate",
        };
        metrics::records_enqueued().add(1, &[KeyValue::new("result", label)]);

        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Readback
    // -----------------------------------------------------------------------

    /// Get a record by id.
    pub async fn get(&self, id: &str) -> Result<QueueRecord> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// List records in claim order, optionally restricted to one status.
    pub async fn list(&self, status: Option<Status>, limit: usize) -> Result<Vec<QueueRecord>> {
        let filter = match status {
            Some(status) => Filter::all().status(status),
            None => Filter::all(),
        };
        self.store.find(&filter, limit).await
    }

    /// Failed records whose retry budget is spent.
    pub async fn dead_letters(&self, max_retries: u32, limit: usize) -> Result<Vec<QueueRecord>> {
        let filter = Filter::all()
            .status(Status::Failed)
            .retry_count_at_least(max_retries);
        self.store.find(&filter, limit).await
    }

    // -----------------------------------------------------------------------
    // Claim
    // -----------------------------------------------------------------------

    /// Claim up to `limit` ready records, moving each to `Processing`.
    ///
    /// Candidates are scanned in priority/FIFO order and claimed one at a
    /// time with a transition conditioned on the status seen during the
    /// scan. A candidate another consumer got to first fails that condition
    /// and is skipped, so concurrent claims never return the same record.
    pub async fn claim(&self, limit: usize) -> Result<Vec<QueueRecord>> {
        let mut claimed = Vec::with_capacity(limit);
        let mut lost: HashSet<String> = HashSet::new();

        while claimed.len() < limit {
            let now = Utc::now();
            let wanted = limit - claimed.len();

            // Over-fetch by the number of lost candidates in case they are
            // ready again, then drop them.
            let candidates: Vec<QueueRecord> = self
                .store
                .find(&Filter::ready(now), wanted + lost.len())
                .await?
                .into_iter()
                .filter(|c| !lost.contains(&c.id))
                .collect();

            if candidates.is_empty() {
                break;
            }

            for mut candidate in candidates {
                if claimed.len() == limit {
                    break;
                }

                let from = candidate.status;
                validate_transition(from, Status::Processing)?;

                let filter = Filter::by_id(candidate.id.as_str()).status(from);
                let update = Update::to(Status::Processing, now);

                if self.store.conditional_transition(&filter, &update).await? == 0 {
                    debug!(record_id = %candidate.id, "claim lost to another consumer");
                    lost.insert(candidate.id);
                    continue;
                }

                update.apply(&mut candidate);
                record_transition(from, Status::Processing, 1);
                claimed.push(candidate);
            }
        }

        metrics::claim_batch_size().record(claimed.len() as u64, &[]);
        if !claimed.is_empty() {
            debug!(count = claimed.len(), limit, "claimed batch");
        }

        Ok(claimed)
    }

    // -----------------------------------------------------------------------
    // Outcomes
    // -----------------------------------------------------------------------

    /// `Processing` → `Completed`, stamping `processed_at`.
    ///
    /// Returns `false` (with a warning) if the record is missing or no longer
    /// `Processing`, e.g. it was cancelled mid-delivery.
    pub async fn mark_completed(&self, id: &str) -> Result<bool> {
        let now = Utc::now();
        let update = Update::to(Status::Completed, now).processed_at(now);
        self.transition(id, &[Status::Processing], update).await
    }

    /// `Processing` → `Failed`, counting the failure and keeping the reason.
    pub async fn mark_failed(&self, id: &str, error_message: &str) -> Result<bool> {
        let update = Update::to(Status::Failed, Utc::now())
            .error_message(ErrorMessage::Set(error_message.to_string()))
            .increment_retry_count();
        self.transition(id, &[Status::Processing], update).await
    }

    /// Move every `Failed` record with `retry_count < max_retries` back to
    /// `Pending`, clearing its error. Returns how many were requeued.
    ///
    /// Records at or above the budget stay `Failed` for dead-letter review.
    pub async fn retry_eligible(&self, max_retries: u32) -> Result<u64> {
        let filter = Filter::all()
            .status(Status::Failed)
            .retry_count_below(max_retries);
        let update = Update::to(Status::Pending, Utc::now()).error_message(ErrorMessage::Clear);

        let requeued = self.store.conditional_transition(&filter, &update).await?;
        if requeued > 0 {
            info!(requeued, max_retries, "failed records requeued");
            record_transition(Status::Failed, Status::Pending, requeued);
        }
        Ok(requeued)
    }

    /// Retract a record that has not reached a terminal state.
    pub async fn cancel(&self, id: &str) -> Result<bool> {
        let update = Update::to(Status::Cancelled, Utc::now());
        self.transition(id, &Status::CANCELLABLE, update).await
    }

    async fn transition(&self, id: &str, from: &[Status], update: Update) -> Result<bool> {
        for status in from {
            validate_transition(*status, update.status)?;
        }

        let filter = Filter::by_id(id).statuses(from);
        if self.store.conditional_transition(&filter, &update).await? > 0 {
            debug!(record_id = id, to = %update.status, "record transitioned");
            match from {
                [single] => record_transition(*single, update.status, 1),
                _ => {
                    metrics::state_transitions().add(
                        1,
                        &[
                            KeyValue::new("from", "active"),
                            KeyValue::new("to", update.status.as_str()),
                        ],
                    );
                }
            }
            return Ok(true);
        }

        match self.store.get(id).await? {
            None => warn!(record_id = id, to = %update.status, "record not found, transition skipped"),
            Some(record) => warn!(
                record_id = id,
                status = %record.status,
                to = %update.status,
                "record not in a state that allows this transition, skipped"
            ),
        }
        Ok(false)
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    /// Count of records per status, plus a total. Read-only.
    pub async fn status_counts(&self) -> Result<StatusCounts> {
        let grouped = self.store.count_by_status().await?;
        Ok(StatusCounts::from_grouped(&grouped))
    }
}

fn record_transition(from: Status, to: Status, count: u64) {
    metrics::state_transitions().add(
        count,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}
