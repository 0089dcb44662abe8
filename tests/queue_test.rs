//! Queue engine behavior against the in-memory store.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use relayq::engine::Queue;
use relayq::error::Error;
use relayq::model::queue::{EnqueueResult, NewRecord, Payload, Priority, Status};
use relayq::store::MemoryStore;

fn queue() -> Queue<MemoryStore> {
    Queue::new(MemoryStore::new())
}

fn item(id: &str) -> NewRecord {
    NewRecord::new(id, Payload::new("hn", format!("title {id}"), format!("https://example.com/{id}")))
}

async fn enqueue_all(queue: &Queue<impl relayq::store::QueueStore>, ids: &[&str]) {
    for id in ids {
        assert_eq!(queue.enqueue(item(id)).await.unwrap(), EnqueueResult::Queued);
    }
}

fn ids(records: &[relayq::model::queue::QueueRecord]) -> Vec<&str> {
    records.iter().map(|r| r.id.as_str()).collect()
}

// ---------------------------------------------------------------------------
// Enqueue gate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn enqueue_is_idempotent() {
    let queue = queue();

    let first = queue
        .enqueue(item("X_1").priority(Priority::NORMAL))
        .await
        .unwrap();
    let second = queue
        .enqueue(item("X_1").priority(Priority::HIGH))
        .await
        .unwrap();

    assert_eq!(first, EnqueueResult::Queued);
    assert_eq!(second, EnqueueResult::Duplicate);

    let stored = queue.get("X_1").await.unwrap();
    assert_eq!(stored.priority, Priority::NORMAL);
    assert_eq!(stored.status, Status::Pending);
    assert_eq!(queue.status_counts().await.unwrap().total, 1);
}

#[tokio::test]
async fn enqueue_with_future_schedule_is_not_claimable() {
    let queue = queue();
    queue
        .enqueue(item("later").scheduled_at(Utc::now() + Duration::hours(1)))
        .await
        .unwrap();
    queue
        .enqueue(item("due").scheduled_at(Utc::now() - Duration::seconds(1)))
        .await
        .unwrap();

    assert_eq!(queue.get("later").await.unwrap().status, Status::Scheduled);
    assert_eq!(queue.get("due").await.unwrap().status, Status::Pending);

    let claimed = queue.claim(10).await.unwrap();
    assert_eq!(ids(&claimed), vec!["due"]);
    assert_eq!(queue.get("later").await.unwrap().status, Status::Scheduled);
}

#[tokio::test]
async fn source_and_url_ids_dedup() {
    let queue = queue();
    let payload = Payload::new("github", "repo", "https://github.com/a/b");

    let by_source = NewRecord::from_source("123", payload.clone());
    assert_eq!(by_source.id(), "github_123");
    assert_eq!(queue.enqueue(by_source).await.unwrap(), EnqueueResult::Queued);
    assert_eq!(
        queue
            .enqueue(NewRecord::from_source("123", payload.clone()))
            .await
            .unwrap(),
        EnqueueResult::Duplicate
    );

    assert_eq!(
        queue.enqueue(NewRecord::from_url(payload.clone())).await.unwrap(),
        EnqueueResult::Queued
    );
    assert_eq!(
        queue.enqueue(NewRecord::from_url(payload)).await.unwrap(),
        EnqueueResult::Duplicate
    );
}

#[tokio::test]
async fn get_missing_record_is_not_found() {
    let queue = queue();
    assert!(matches!(queue.get("nope").await, Err(Error::NotFound(id)) if id == "nope"));
}

// ---------------------------------------------------------------------------
// Claim
// ---------------------------------------------------------------------------

#[tokio::test]
async fn claim_takes_oldest_first_within_priority() {
    let queue = queue();
    enqueue_all(&queue, &["a", "b", "c"]).await;

    let claimed = queue.claim(2).await.unwrap();
    assert_eq!(ids(&claimed), vec!["a", "b"]);
    assert!(claimed.iter().all(|r| r.status == Status::Processing));

    assert_eq!(queue.get("a").await.unwrap().status, Status::Processing);
    assert_eq!(queue.get("c").await.unwrap().status, Status::Pending);
}

#[tokio::test]
async fn claim_prefers_higher_priority() {
    let queue = queue();
    queue.enqueue(item("low").priority(Priority::LOW)).await.unwrap();
    queue.enqueue(item("high_1").priority(Priority::HIGH)).await.unwrap();
    queue.enqueue(item("urgent").priority(Priority::URGENT)).await.unwrap();
    queue.enqueue(item("high_2").priority(Priority::HIGH)).await.unwrap();

    let first = queue.claim(1).await.unwrap();
    assert_eq!(ids(&first), vec!["urgent"]);

    let rest = queue.claim(10).await.unwrap();
    assert_eq!(ids(&rest), vec!["high_1", "high_2", "low"]);
}

#[tokio::test]
async fn claim_on_empty_queue_returns_nothing() {
    let queue = queue();
    assert!(queue.claim(5).await.unwrap().is_empty());
    assert!(queue.claim(0).await.unwrap().is_empty());
}

#[tokio::test]
async fn claimed_records_are_not_claimed_again() {
    let queue = queue();
    enqueue_all(&queue, &["a", "b"]).await;

    let first = queue.claim(1).await.unwrap();
    let second = queue.claim(5).await.unwrap();
    assert_eq!(ids(&first), vec!["a"]);
    assert_eq!(ids(&second), vec!["b"]);
    assert!(queue.claim(5).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_overlap() {
    let store = Arc::new(MemoryStore::new());
    let producer = Queue::new(Arc::clone(&store));
    for i in 0..200 {
        producer.enqueue(item(&format!("item_{i}"))).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let queue = Queue::new(Arc::clone(&store));
        handles.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            loop {
                let batch = queue.claim(7).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                mine.extend(batch.into_iter().map(|r| r.id));
            }
            mine
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for id in handle.await.unwrap() {
            total += 1;
            assert!(seen.insert(id.clone()), "{id} was claimed twice");
        }
    }
    assert_eq!(total, 200);
    assert_eq!(producer.status_counts().await.unwrap().processing, 200);
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn mark_completed_stamps_processed_at() {
    let queue = queue();
    enqueue_all(&queue, &["a"]).await;
    queue.claim(1).await.unwrap();

    assert!(queue.mark_completed("a").await.unwrap());
    let record = queue.get("a").await.unwrap();
    assert_eq!(record.status, Status::Completed);
    assert!(record.processed_at.is_some());
}

#[tokio::test]
async fn outcomes_outside_processing_are_skipped() {
    let queue = queue();
    enqueue_all(&queue, &["a"]).await;

    // Never claimed: cannot skip Processing.
    assert!(!queue.mark_completed("a").await.unwrap());
    assert!(!queue.mark_failed("a", "boom").await.unwrap());
    assert_eq!(queue.get("a").await.unwrap().status, Status::Pending);

    // Missing record.
    assert!(!queue.mark_completed("missing").await.unwrap());

    // Already terminal.
    queue.claim(1).await.unwrap();
    assert!(queue.mark_completed("a").await.unwrap());
    assert!(!queue.mark_completed("a").await.unwrap());
    assert!(!queue.mark_failed("a", "late").await.unwrap());
    assert_eq!(queue.get("a").await.unwrap().status, Status::Completed);
}

#[tokio::test]
async fn failed_record_with_budget_is_retried() {
    let queue = queue();
    enqueue_all(&queue, &["X_1"]).await;
    queue.claim(1).await.unwrap();

    assert!(queue.mark_failed("X_1", "timeout").await.unwrap());
    let failed = queue.get("X_1").await.unwrap();
    assert_eq!(failed.status, Status::Failed);
    assert_eq!(failed.retry_count, 1);
    assert_eq!(failed.error_message.as_deref(), Some("timeout"));

    assert_eq!(queue.retry_eligible(3).await.unwrap(), 1);
    let retried = queue.get("X_1").await.unwrap();
    assert_eq!(retried.status, Status::Pending);
    assert_eq!(retried.error_message, None);
    assert_eq!(retried.retry_count, 1);
}

#[tokio::test]
async fn retry_budget_is_bounded() {
    let queue = queue();
    enqueue_all(&queue, &["X_1"]).await;

    for attempt in 1..=3 {
        assert_eq!(ids(&queue.claim(1).await.unwrap()), vec!["X_1"]);
        queue.mark_failed("X_1", "timeout").await.unwrap();
        let requeued = queue.retry_eligible(3).await.unwrap();
        if attempt < 3 {
            assert_eq!(requeued, 1, "attempt {attempt} should be requeued");
        } else {
            assert_eq!(requeued, 0);
        }
    }

    // Further sweeps never bring it back.
    assert_eq!(queue.retry_eligible(3).await.unwrap(), 0);
    let record = queue.get("X_1").await.unwrap();
    assert_eq!(record.status, Status::Failed);
    assert_eq!(record.retry_count, 3);

    let dead = queue.dead_letters(3, 10).await.unwrap();
    assert_eq!(ids(&dead), vec!["X_1"]);
}

#[tokio::test]
async fn cancel_retracts_unfinished_records_only() {
    let queue = queue();
    enqueue_all(&queue, &["pending", "done"]).await;
    queue
        .enqueue(item("scheduled").scheduled_at(Utc::now() + Duration::hours(1)))
        .await
        .unwrap();

    assert!(queue.cancel("pending").await.unwrap());
    assert!(queue.cancel("scheduled").await.unwrap());
    assert_eq!(queue.get("pending").await.unwrap().status, Status::Cancelled);

    let claimed = queue.claim(1).await.unwrap();
    assert_eq!(ids(&claimed), vec!["done"]);
    queue.mark_completed("done").await.unwrap();

    assert!(!queue.cancel("done").await.unwrap());
    assert!(!queue.cancel("pending").await.unwrap());
    assert_eq!(queue.get("done").await.unwrap().status, Status::Completed);
}

#[tokio::test]
async fn cancelled_while_processing_ignores_late_outcome() {
    let queue = queue();
    enqueue_all(&queue, &["a"]).await;
    queue.claim(1).await.unwrap();

    assert!(queue.cancel("a").await.unwrap());
    assert!(!queue.mark_completed("a").await.unwrap());
    assert_eq!(queue.get("a").await.unwrap().status, Status::Cancelled);
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_counts_default_to_zero() {
    let counts = queue().status_counts().await.unwrap();
    assert_eq!(counts, Default::default());
    assert_eq!(counts.total, 0);
}

#[tokio::test]
async fn status_counts_partition_all_records() {
    let queue = queue();
    enqueue_all(&queue, &["a", "b", "c", "d", "e"]).await;
    queue
        .enqueue(item("later").scheduled_at(Utc::now() + Duration::hours(1)))
        .await
        .unwrap();

    queue.claim(3).await.unwrap();
    queue.mark_completed("a").await.unwrap();
    queue.mark_failed("b", "boom").await.unwrap();
    queue.cancel("e").await.unwrap();

    let counts = queue.status_counts().await.unwrap();
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.scheduled, 1);
    assert_eq!(counts.processing, 1);
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.cancelled, 1);
    assert_eq!(counts.total, 6);
    assert_eq!(
        Status::ALL.into_iter().map(|s| counts.get(s)).sum::<u64>(),
        counts.total
    );
}

#[tokio::test]
async fn list_filters_by_status_in_claim_order() {
    let queue = queue();
    enqueue_all(&queue, &["a", "b", "c"]).await;
    queue.enqueue(item("urgent").priority(Priority::URGENT)).await.unwrap();
    queue.claim(1).await.unwrap();

    let pending = queue.list(Some(Status::Pending), 10).await.unwrap();
    assert_eq!(ids(&pending), vec!["a", "b", "c"]);

    let all = queue.list(None, 2).await.unwrap();
    assert_eq!(ids(&all), vec!["urgent", "a"]);
}
