//! Ops Engine: task orchestration runtime with a periodic scheduler and
//! bounded artifact retention.

pub mod artifact;
pub mod config;
pub mod error;
pub mod executor;
pub mod retention;
pub mod scheduler;
pub mod store;
pub mod task;
