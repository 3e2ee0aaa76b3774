//! Execution substrate: the per-delivery state machine, the consumer loop
//! with graceful shutdown, batch mode, and the bounded worker pool they share.

pub mod batch;
pub mod consumer;
pub mod pool;
pub mod runner;

#[cfg(test)]
mod testing;

pub use batch::{BatchReport, FileReport, FileStatus, run_batch};
pub use consumer::{Consumer, ConsumerStats};
pub use pool::WorkerPool;
pub use runner::{DeliveryOutcome, DeliveryReport, DeliveryState, Runner};
