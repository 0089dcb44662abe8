//! Delivery span helpers.

use tracing::Span;

/// Start a span covering one record's delivery attempt.
///
/// `delivery.result` is declared empty; fill it with [`record_result`].
pub fn start_delivery_span(record_id: &str, platform: &str, consumer_id: &str) -> Span {
    tracing::info_span!(
        "relayq.deliver",
        "record.id" = record_id,
        "record.platform" = platform,
        "consumer.id" = consumer_id,
        "delivery.result" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::debug!(from = from, to = to, "state_transition");
    });
}

/// Record the outcome ("delivered" | "failed") on a delivery span.
pub fn record_result(span: &Span, result: &str) {
    span.record("delivery.result", result);
}
