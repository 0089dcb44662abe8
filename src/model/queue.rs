//! Queue record data model.
//!
//! A queue record is one collected item waiting to be delivered to the sink.
//! Its identity is a deterministic dedup key chosen by the producer; the
//! engine never invents ids.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Error;

// ---------------------------------------------------------------------------
// Queue Record
// ---------------------------------------------------------------------------

/// The persisted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueRecord {
    /// Dedup key, unique across the store. Immutable once created.
    pub id: String,

    /// Producer-defined content. Stored and returned unchanged.
    pub payload: Payload,

    /// Current lifecycle state.
    pub status: Status,

    /// Higher values are claimed first among ready records.
    pub priority: Priority,

    /// Not ready before this instant. `None` means ready immediately.
    pub scheduled_at: Option<DateTime<Utc>>,

    /// Total failed delivery attempts. Never reset.
    pub retry_count: u32,

    /// Last failure reason, cleared when the record re-enters `Pending`.
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set only on `Completed`.
    pub processed_at: Option<DateTime<Utc>>,
}

impl QueueRecord {
    /// Is this record eligible to be claimed at `now`?
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            Status::Pending => true,
            Status::Scheduled => self.scheduled_at.is_none_or(|at| at <= now),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// What a collector found. The queue engine does not interpret it.
///
/// Decoding never fails: any JSON value becomes a `Payload`. Known fields
/// that are missing decode as empty, and a non-object value is kept under
/// `extra["value"]`, so a record written by another producer cannot stall
/// a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "serde_json::Value")]
pub struct Payload {
    pub title: String,
    /// Canonical URL of the source item.
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Source platform the collector scraped (e.g. "hackernews").
    pub platform: String,
    /// Any additional producer fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Payload {
    pub fn new(
        platform: impl Into<String>,
        title: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            summary: None,
            category: None,
            platform: platform.into(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        let mut fields = match value {
            serde_json::Value::Object(fields) => fields,
            other => {
                let mut extra = serde_json::Map::new();
                extra.insert("value".to_string(), other);
                return Self {
                    extra,
                    ..Self::new("", "", "")
                };
            }
        };

        let mut text = |key: &str| match fields.remove(key) {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) => Some(s),
            Some(other) => Some(other.to_string()),
        };

        Self {
            title: text("title").unwrap_or_default(),
            url: text("url").unwrap_or_default(),
            summary: text("summary"),
            category: text("category"),
            platform: text("platform").unwrap_or_default(),
            extra: fields,
        }
    }
}

// ---------------------------------------------------------------------------
// Dedup ids
// ---------------------------------------------------------------------------

/// Dedup key for an item with a stable id on its source platform.
pub fn source_id(platform: &str, source_item_id: &str) -> String {
    format!("{platform}_{source_item_id}")
}

/// Dedup key for an item with no stable source id: hex SHA-256 of its URL.
pub fn url_id(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of a queue record.
///
/// ```text
/// Pending ───┐
///            ├──> Processing ──> Completed
/// Scheduled ─┘        │
///                     └──> Failed ──> Pending (retry)
///
/// any non-terminal ──> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Ready to be claimed.
    Pending,
    /// Ready once `scheduled_at` has passed.
    Scheduled,
    /// Claimed by exactly one consumer, delivery in flight.
    Processing,
    /// Delivered. Terminal.
    Completed,
    /// Delivery failed; may be retried while under the retry budget.
    Failed,
    /// Retracted by a producer. Terminal.
    Cancelled,
}

impl Status {
    pub const ALL: [Status; 6] = [
        Status::Pending,
        Status::Scheduled,
        Status::Processing,
        Status::Completed,
        Status::Failed,
        Status::Cancelled,
    ];

    /// Statuses a record can be cancelled from.
    pub const CANCELLABLE: [Status; 4] = [
        Status::Pending,
        Status::Scheduled,
        Status::Processing,
        Status::Failed,
    ];

    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Scheduled, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Pending)
                | (Pending, Cancelled)
                | (Scheduled, Cancelled)
                | (Processing, Cancelled)
                | (Failed, Cancelled)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Scheduled => "scheduled",
            Status::Processing => "processing",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.to_ascii_lowercase();
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == lowered)
            .ok_or_else(|| Error::Other(format!("unknown status: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Claim priority. Higher = claimed earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i16);

impl Priority {
    pub const LOW: Priority = Priority(1);
    pub const NORMAL: Priority = Priority(5);
    pub const HIGH: Priority = Priority(10);
    pub const URGENT: Priority = Priority(20);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::LOW),
            "normal" => Ok(Priority::NORMAL),
            "high" => Ok(Priority::HIGH),
            "urgent" => Ok(Priority::URGENT),
            other => other
                .parse::<i16>()
                .map(Priority)
                .map_err(|_| Error::Other(format!("invalid priority: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Enqueue
// ---------------------------------------------------------------------------

/// Builder for records handed to the enqueue gate.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub(crate) id: String,
    pub(crate) payload: Payload,
    pub(crate) priority: Priority,
    pub(crate) scheduled_at: Option<DateTime<Utc>>,
}

impl NewRecord {
    pub fn new(id: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: id.into(),
            payload,
            priority: Priority::NORMAL,
            scheduled_at: None,
        }
    }

    /// Key the record by `platform_sourceid`.
    pub fn from_source(source_item_id: &str, payload: Payload) -> Self {
        let id = source_id(&payload.platform, source_item_id);
        Self::new(id, payload)
    }

    /// Key the record by a hash of its URL.
    pub fn from_url(payload: Payload) -> Self {
        let id = url_id(&payload.url);
        Self::new(id, payload)
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Materialize the stored record. A future `scheduled_at` starts the
    /// record in `Scheduled`; anything else starts `Pending`.
    pub(crate) fn into_record(self, now: DateTime<Utc>) -> QueueRecord {
        let status = match self.scheduled_at {
            Some(at) if at > now => Status::Scheduled,
            _ => Status::Pending,
        };
        QueueRecord {
            id: self.id,
            payload: self.payload,
            status,
            priority: self.priority,
            scheduled_at: self.scheduled_at,
            retry_count: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
        }
    }
}

/// What happened when a record was enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// A new record was stored.
    Queued,
    /// A record with the same id already exists; nothing was written.
    Duplicate,
}

// ---------------------------------------------------------------------------
// Status counts
// ---------------------------------------------------------------------------

/// Number of records per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub scheduled: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total: u64,
}

impl StatusCounts {
    /// Build from a grouped count, treating unseen statuses as zero.
    pub fn from_grouped(grouped: &HashMap<Status, u64>) -> Self {
        let get = |status| grouped.get(&status).copied().unwrap_or(0);
        let mut counts = Self {
            pending: get(Status::Pending),
            scheduled: get(Status::Scheduled),
            processing: get(Status::Processing),
            completed: get(Status::Completed),
            failed: get(Status::Failed),
            cancelled: get(Status::Cancelled),
            total: 0,
        };
        counts.total = Status::ALL.into_iter().map(|s| counts.get(s)).sum();
        counts
    }

    pub fn get(&self, status: Status) -> u64 {
        match status {
            Status::Pending => self.pending,
            Status::Scheduled => self.scheduled,
            Status::Processing => self.processing,
            Status::Completed => self.completed,
            Status::Failed => self.failed,
            Status::Cancelled => self.cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(status: Status, scheduled_at: Option<DateTime<Utc>>) -> QueueRecord {
        let payload = Payload::new("hn", "t", "https://x");
        let mut record = NewRecord::new("hn_1", payload).into_record(Utc::now());
        record.status = status;
        record.scheduled_at = scheduled_at;
        record
    }

    #[test]
    fn processing_is_the_only_way_to_completed_or_failed() {
        for from in Status::ALL {
            let allowed = from == Status::Processing;
            assert_eq!(from.can_transition_to(Status::Completed), allowed, "{from}");
            assert_eq!(from.can_transition_to(Status::Failed), allowed, "{from}");
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in [Status::Completed, Status::Cancelled] {
            assert!(from.is_terminal());
            for to in Status::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn readiness() {
        let now = Utc::now();
        assert!(record(Status::Pending, None).is_ready(now));
        assert!(record(Status::Scheduled, Some(now - Duration::seconds(1))).is_ready(now));
        assert!(record(Status::Scheduled, Some(now)).is_ready(now));
        assert!(!record(Status::Scheduled, Some(now + Duration::seconds(60))).is_ready(now));
        assert!(!record(Status::Failed, None).is_ready(now));
        assert!(!record(Status::Processing, None).is_ready(now));
    }

    #[test]
    fn future_schedule_starts_scheduled() {
        let now = Utc::now();
        let payload = Payload::new("hn", "t", "https://x");
        let later = NewRecord::new("a", payload.clone())
            .scheduled_at(now + Duration::minutes(5))
            .into_record(now);
        assert_eq!(later.status, Status::Scheduled);

        let past = NewRecord::new("b", payload)
            .scheduled_at(now - Duration::minutes(5))
            .into_record(now);
        assert_eq!(past.status, Status::Pending);
    }

    #[test]
    fn dedup_ids() {
        assert_eq!(source_id("reddit", "abc123"), "reddit_abc123");
        let a = url_id("https://example.com/post/1");
        assert_eq!(a.len(), 64);
        assert_eq!(a, url_id("https://example.com/post/1"));
        assert_ne!(a, url_id("https://example.com/post/2"));

        let record = NewRecord::from_source("42", Payload::new("hackernews", "t", "https://x"));
        assert_eq!(record.id(), "hackernews_42");
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in Status::ALL {
            assert_eq!(status.to_string().parse::<Status>().unwrap(), status);
        }
        assert!("dead".parse::<Status>().is_err());
    }

    #[test]
    fn priority_names_and_numbers() {
        assert_eq!("high".parse::<Priority>().unwrap(), Priority::HIGH);
        assert_eq!("7".parse::<Priority>().unwrap(), Priority(7));
        assert!("soon".parse::<Priority>().is_err());
        assert_eq!(Priority::default(), Priority::NORMAL);
    }

    #[test]
    fn counts_default_missing_statuses_to_zero() {
        let mut grouped = HashMap::new();
        grouped.insert(Status::Pending, 3);
        grouped.insert(Status::Failed, 2);
        let counts = StatusCounts::from_grouped(&grouped);
        assert_eq!(counts.pending, 3);
        assert_eq!(counts.failed, 2);
        assert_eq!(counts.completed, 0);
        assert_eq!(counts.total, 5);
    }

    #[test]
    fn payload_keeps_unknown_fields() {
        let json = serde_json::json!({
            "title": "Rust 2.0",
            "url": "https://example.com",
            "platform": "hn",
            "score": 412
        });
        let payload: Payload = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(payload.extra.get("score"), Some(&serde_json::json!(412)));
        assert_eq!(serde_json::to_value(&payload).unwrap(), json);
    }

    #[test]
    fn payload_from_another_producer_still_decodes() {
        let partial: Payload = serde_json::from_value(serde_json::json!({
            "headline": "no title here",
            "title": 42,
            "summary": null
        }))
        .unwrap();
        assert_eq!(partial.title, "42");
        assert_eq!(partial.url, "");
        assert_eq!(partial.platform, "");
        assert_eq!(partial.summary, None);
        assert_eq!(
            partial.extra.get("headline"),
            Some(&serde_json::json!("no title here"))
        );

        let scalar: Payload = serde_json::from_value(serde_json::json!("just text")).unwrap();
        assert_eq!(scalar.extra.get("value"), Some(&serde_json::json!("just text")));
    }
}
