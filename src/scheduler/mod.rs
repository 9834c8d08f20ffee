//! Batch scheduling for continuous batching.
//!
//! This module handles:
//! - Priority-then-arrival admission under batch and prefill budgets
//! - Cancellation, timeouts and step budgets at tick start
//! - Cache pressure: refuse admission, evict or preempt

pub mod batch;

pub use batch::{Scheduler, SchedulerOutputs};
