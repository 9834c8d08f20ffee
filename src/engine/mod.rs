//! Inference engine.
//!
//! This module contains:
//! - Engine for the tick loop
//! - Sampler for token sampling
//! - Handles and submitters for callers on other threads
//! - Step and request metrics

pub mod handle;
pub mod llm;
pub mod metrics;
pub mod sampler;

pub use handle::{RequestHandle, RequestUpdate, Submitter};
pub use llm::{Engine, GenerationOutput, GenerationRequest, StepOutput};
pub use metrics::{RequestMetrics, StepMetrics};
pub use sampler::Sampler;
