//! Metric instrument factories.
//!
//! Instruments come from the globally-registered `MeterProvider`; with no
//! provider installed they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("relayq")
}

/// Counter: enqueue attempts.
/// Labels: `result` ("queued" | "duplicate").
pub fn records_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("relayq.records.enqueued")
        .with_description("Number of enqueue attempts")
        .build()
}

/// Counter: queue record state transitions.
/// Labels: `from`, `to`.
pub fn state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("relayq.records.state_transitions")
        .with_description("Number of queue record state transitions")
        .build()
}

/// Counter: delivery attempts against the sink.
/// Labels: `result` ("delivered" | "failed").
pub fn deliveries() -> Counter<u64> {
    meter()
        .u64_counter("relayq.deliveries")
        .with_description("Number of delivery attempts")
        .build()
}

/// Counter: dispatch loop iterations that failed outside per-item delivery.
pub fn loop_errors() -> Counter<u64> {
    meter()
        .u64_counter("relayq.dispatch.loop_errors")
        .with_description("Dispatch loop errors outside per-item isolation")
        .build()
}

/// Histogram: records claimed per batch.
pub fn claim_batch_size() -> Histogram<u64> {
    meter()
        .u64_histogram("relayq.claim.batch_size")
        .with_description("Records claimed per claim call")
        .build()
}

/// Histogram: sink delivery latency in milliseconds.
pub fn delivery_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("relayq.delivery.duration_ms")
        .with_description("Sink delivery duration in milliseconds")
        .with_unit("ms")
        .build()
}
