//! # relayq
//!
//! Durable work queue and dispatch engine for notification delivery.
//!
//! Producers enqueue records (deduplicated by id), consumers claim them in
//! priority/FIFO order with an atomic conditional transition, and a dispatch
//! loop delivers each claimed record to an external sink and reports the
//! outcome. Backed by Postgres (sqlx) or an in-memory store, with
//! OpenTelemetry observability.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod sink;
pub mod store;
pub mod telemetry;
