//! Queue engine: the enqueue/claim/outcome API and the dispatch loop that
//! drives it.

pub mod dispatch;
pub mod queue;

pub use dispatch::{BatchReport, DispatchConfig, DispatchLoop, LoopState};
pub use queue::Queue;
