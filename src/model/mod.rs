//! Core data model.

pub mod queue;
