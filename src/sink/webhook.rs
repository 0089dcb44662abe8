//! HTTP webhook sink.
//!
//! Posts the payload JSON as-is. Chat services that accept incoming
//! webhooks (or a small relay in front of them) do the formatting.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;

use super::{DeliveryError, ErrorChannel, Sink, failure_message};
use crate::error::{Error, Result};
use crate::model::queue::{Payload, QueueRecord};

/// Longest response body kept in a rejection message.
const MAX_BODY_CHARS: usize = 512;

pub struct WebhookSink {
    client: reqwest::Client,
    url: SecretString,
}

impl WebhookSink {
    pub fn new(url: SecretString, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("cannot build webhook client: {e}")))?;
        Ok(Self { client, url })
    }

    async fn post(&self, body: &serde_json::Value) -> std::result::Result<(), DeliveryError> {
        let resp = self
            .client
            .post(self.url.expose_secret())
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let body = resp
            .text()
            .await
            .unwrap_or_default()
            .chars()
            .take(MAX_BODY_CHARS)
            .collect::<String>();
        Err(DeliveryError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl Sink for WebhookSink {
    async fn deliver(&self, payload: &Payload) -> std::result::Result<(), DeliveryError> {
        let body = serde_json::to_value(payload)
            .map_err(|e| DeliveryError::Other(format!("cannot encode payload: {e}")))?;
        self.post(&body).await
    }
}

#[async_trait]
impl ErrorChannel for WebhookSink {
    async fn report(
        &self,
        record: &QueueRecord,
        error: &DeliveryError,
    ) -> std::result::Result<(), DeliveryError> {
        self.post(&json!({ "content": failure_message(record, error) }))
            .await
    }
}
