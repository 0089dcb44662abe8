//! Queue record persistence on Postgres.
//!
//! Each primitive is one statement. Transitions are a single
//! `UPDATE ... WHERE <filter>`: Postgres re-checks the WHERE clause against
//! the latest row version after waiting on a concurrent writer, so a claim
//! that lost the race affects zero rows.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder};

use super::Db;
use crate::error::{Error, Result};
use crate::model::queue::{Payload, Priority, QueueRecord, Status};
use crate::store::{ErrorMessage, Filter, QueueStore, Update};

const COLUMNS: &str = "id, payload, status, priority, scheduled_at, retry_count, error_message, created_at, updated_at, processed_at";

#[async_trait]
impl QueueStore for Db {
    async fn insert_if_absent(&self, record: &QueueRecord) -> Result<bool> {
        let payload = serde_json::to_value(&record.payload)?;

        let inserted: Option<(String,)> = sqlx::query_as(
            "INSERT INTO queue_records (id, payload, status, priority, scheduled_at, retry_count, error_message, created_at, updated_at, processed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (id) DO NOTHING
             RETURNING id",
        )
        .bind(&record.id)
        .bind(payload)
        .bind(record.status.as_str())
        .bind(record.priority.0)
        .bind(record.scheduled_at)
        .bind(record.retry_count as i32)
        .bind(&record.error_message)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.processed_at)
        .fetch_optional(self.pool())
        .await?;

        Ok(inserted.is_some())
    }

    async fn get(&self, id: &str) -> Result<Option<QueueRecord>> {
        let row: Option<QueueRecordRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM queue_records WHERE id = $1"))
                .bind(id)
                .fetch_optional(self.pool())
                .await?;

        row.map(QueueRecordRow::try_into_record).transpose()
    }

    async fn find(&self, filter: &Filter, limit: usize) -> Result<Vec<QueueRecord>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {COLUMNS} FROM queue_records"));
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY priority DESC, created_at ASC, id ASC LIMIT ")
            .push_bind(limit as i64);

        let rows: Vec<QueueRecordRow> = qb.build_query_as().fetch_all(self.pool()).await?;
        rows.into_iter()
            .map(QueueRecordRow::try_into_record)
            .collect()
    }

    async fn conditional_transition(&self, filter: &Filter, update: &Update) -> Result<u64> {
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE queue_records SET status = ");
        qb.push_bind(update.status.as_str())
            .push(", updated_at = ")
            .push_bind(update.updated_at);

        if let Some(at) = update.processed_at {
            qb.push(", processed_at = ").push_bind(at);
        }
        match &update.error_message {
            ErrorMessage::Keep => {}
            ErrorMessage::Set(message) => {
                qb.push(", error_message = ").push_bind(message.clone());
            }
            ErrorMessage::Clear => {
                qb.push(", error_message = NULL");
            }
        }
        if update.increment_retry_count {
            qb.push(", retry_count = retry_count + 1");
        }

        push_filter(&mut qb, filter);

        let rows_affected = qb.build().execute(self.pool()).await?.rows_affected();
        Ok(rows_affected)
    }

    async fn count_by_status(&self) -> Result<HashMap<Status, u64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM queue_records GROUP BY status")
                .fetch_all(self.pool())
                .await?;

        let mut counts = HashMap::new();
        for (status, count) in rows {
            let status: Status = status.parse().map_err(|_| Error::CorruptRecord {
                id: "*".to_string(),
                reason: format!("unknown status {status:?} in aggregate"),
            })?;
            counts.insert(status, count as u64);
        }
        Ok(counts)
    }
}

/// Append `filter` as a WHERE clause.
fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &Filter) {
    qb.push(" WHERE TRUE");

    if let Some(id) = &filter.id {
        qb.push(" AND id = ").push_bind(id.clone());
    }
    if !filter.statuses.is_empty() {
        let statuses: Vec<String> = filter.statuses.iter().map(|s| s.to_string()).collect();
        qb.push(" AND status = ANY(").push_bind(statuses).push(")");
    }
    if let Some(now) = filter.ready_at {
        qb.push(" AND (status = 'pending' OR (status = 'scheduled' AND (scheduled_at IS NULL OR scheduled_at <= ")
            .push_bind(now)
            .push(")))");
    }
    if let Some(n) = filter.retry_count_below {
        qb.push(" AND retry_count < ").push_bind(n as i32);
    }
    if let Some(n) = filter.retry_count_at_least {
        qb.push(" AND retry_count >= ").push_bind(n as i32);
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct QueueRecordRow {
    id: String,
    payload: serde_json::Value,
    status: String,
    priority: i16,
    scheduled_at: Option<DateTime<Utc>>,
    retry_count: i32,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl QueueRecordRow {
    fn try_into_record(self) -> Result<QueueRecord> {
        let status: Status = self.status.parse().map_err(|_| Error::CorruptRecord {
            id: self.id.clone(),
            reason: format!("unknown status {:?}", self.status),
        })?;
        let payload = Payload::from(self.payload);

        Ok(QueueRecord {
            id: self.id,
            payload,
            status,
            priority: Priority(self.priority),
            scheduled_at: self.scheduled_at,
            retry_count: self.retry_count.max(0) as u32,
            error_message: self.error_message,
            created_at: self.created_at,
            updated_at: self.updated_at,
            processed_at: self.processed_at,
        })
    }
}
