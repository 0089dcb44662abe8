//! Delivery targets.
//!
//! The dispatch loop treats the sink as an opaque delivery function: it
//! hands over a payload and learns only success or a failure reason.
//! Message formatting and channel resolution belong to the sink.

pub mod webhook;

pub use webhook::WebhookSink;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::queue::{Payload, QueueRecord};

/// Why a delivery attempt failed. The `Display` text is what gets stored as
/// the record's `error_message`.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("sink rejected delivery ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("sink transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The sink panicked mid-delivery.
    #[error("sink panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Other(String),
}

/// The external notification channel records are delivered to.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn deliver(&self, payload: &Payload) -> Result<(), DeliveryError>;
}

/// Operator-facing channel that hears about failed deliveries.
///
/// Best-effort: a failure here is logged by the caller and never escalated.
#[async_trait]
pub trait ErrorChannel: Send + Sync {
    async fn report(&self, record: &QueueRecord, error: &DeliveryError)
    -> Result<(), DeliveryError>;
}

/// Error channel that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorChannel;

#[async_trait]
impl ErrorChannel for LogErrorChannel {
    async fn report(
        &self,
        record: &QueueRecord,
        error: &DeliveryError,
    ) -> Result<(), DeliveryError> {
        tracing::error!(
            record_id = %record.id,
            platform = %record.payload.platform,
            retry_count = record.retry_count,
            %error,
            "delivery failed"
        );
        Ok(())
    }
}

/// One-line operator message for a failed delivery.
pub fn failure_message(record: &QueueRecord, error: &DeliveryError) -> String {
    format!(
        "delivery failed for {} [{}] \"{}\" (failures so far: {}): {error}",
        record.id,
        record.payload.platform,
        record.payload.title,
        record.retry_count + 1,
    )
}
