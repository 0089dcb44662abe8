//! In-memory queue store.
//!
//! All primitives run under one mutex, so each call is atomic with respect
//! to every other call on the same store. Insertion order breaks ties
//! between records created in the same instant.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Filter, QueueStore, Update};
use crate::error::Result;
use crate::model::queue::{QueueRecord, Status};

#[derive(Default)]
struct Inner {
    records: HashMap<String, Entry>,
    next_seq: u64,
}

struct Entry {
    seq: u64,
    record: QueueRecord,
}

/// Queue store backed by a `HashMap`. Contents are lost on drop.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn insert_if_absent(&self, record: &QueueRecord) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.records.contains_key(&record.id) {
            return Ok(false);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.records.insert(
            record.id.clone(),
            Entry {
                seq,
                record: record.clone(),
            },
        );
        Ok(true)
    }

    async fn get(&self, id: &str) -> Result<Option<QueueRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.records.get(id).map(|entry| entry.record.clone()))
    }

    async fn find(&self, filter: &Filter, limit: usize) -> Result<Vec<QueueRecord>> {
        let inner = self.inner.lock().await;
        let mut matched: Vec<&Entry> = inner
            .records
            .values()
            .filter(|entry| filter.matches(&entry.record))
            .collect();

        matched.sort_by(|a, b| {
            b.record
                .priority
                .cmp(&a.record.priority)
                .then(a.record.created_at.cmp(&b.record.created_at))
                .then(a.seq.cmp(&b.seq))
        });

        Ok(matched
            .into_iter()
            .take(limit)
            .map(|entry| entry.record.clone())
            .collect())
    }

    async fn conditional_transition(&self, filter: &Filter, update: &Update) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut changed = 0;
        for entry in inner.records.values_mut() {
            if filter.matches(&entry.record) {
                update.apply(&mut entry.record);
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn count_by_status(&self) -> Result<HashMap<Status, u64>> {
        let inner = self.inner.lock().await;
        let mut counts = HashMap::new();
        for entry in inner.records.values() {
            *counts.entry(entry.record.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::queue::{NewRecord, Payload, Priority};
    use chrono::Utc;

    fn new_record(id: &str, priority: Priority) -> QueueRecord {
        NewRecord::new(id, Payload::new("hn", id, "https://example.com"))
            .priority(priority)
            .into_record(Utc::now())
    }

    #[tokio::test]
    async fn insert_if_absent_rejects_second_insert() {
        let store = MemoryStore::new();
        assert!(store.insert_if_absent(&new_record("a", Priority::NORMAL)).await.unwrap());
        assert!(!store.insert_if_absent(&new_record("a", Priority::HIGH)).await.unwrap());
        assert_eq!(store.len().await, 1);
        let stored = store.get("a").await.unwrap().unwrap();
        assert_eq!(stored.priority, Priority::NORMAL);
    }

    #[tokio::test]
    async fn find_orders_by_priority_then_insertion() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for (id, priority) in [("a", Priority::LOW), ("b", Priority::HIGH), ("c", Priority::HIGH)] {
            let record = NewRecord::new(id, Payload::new("hn", id, "https://x"))
                .priority(priority)
                .into_record(now);
            store.insert_if_absent(&record).await.unwrap();
        }

        let ids: Vec<String> = store
            .find(&Filter::all(), 10)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, ["b", "c", "a"]);
    }

    #[tokio::test]
    async fn transition_only_touches_matching_records() {
        let store = MemoryStore::new();
        store.insert_if_absent(&new_record("a", Priority::NORMAL)).await.unwrap();
        store.insert_if_absent(&new_record("b", Priority::NORMAL)).await.unwrap();

        let filter = Filter::by_id("a").status(Status::Pending);
        let update = Update::to(Status::Processing, Utc::now());
        assert_eq!(store.conditional_transition(&filter, &update).await.unwrap(), 1);
        // Same filter no longer matches.
        assert_eq!(store.conditional_transition(&filter, &update).await.unwrap(), 0);

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.get(&Status::Processing), Some(&1));
        assert_eq!(counts.get(&Status::Pending), Some(&1));
    }
}
