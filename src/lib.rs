//! nano-infer: a CPU-only transformer inference engine in Rust.
//!
//! This crate implements the hot path of batched decoder inference:
//! - Runtime-dispatched SIMD kernels for tiled matmul and attention scores
//! - Q8/Q4 block quantization of weights
//! - A per-sequence KV cache with overflow and memory-pressure policies
//! - A continuous-batching scheduler driving a Llama-style model
//!
//! ## Example
//!
//! ```
//! use nano_infer::{Engine, EngineConfig, GenerationRequest, ModelConfig, synthetic_descriptors};
//!
//! let model_config = ModelConfig::tiny();
//! let weights = synthetic_descriptors(&model_config, None, 0).unwrap();
//! let mut engine = Engine::from_descriptors(model_config, weights, EngineConfig::default()).unwrap();
//!
//! let output = engine
//!     .generate(GenerationRequest::new(vec![1, 2, 3]).temperature(0.0).max_tokens(4))
//!     .unwrap();
//! assert_eq!(output.output_token_ids.len(), 4);
//! ```

pub mod config;
pub mod error;

pub mod core;
pub mod engine;
pub mod kernels;
pub mod model;
pub mod quant;
pub mod scheduler;

pub use config::{
    CacheConfig, EngineConfig, KernelConfig, ModelConfig, OverflowPolicy, PressurePolicy,
    SamplingConfig, SchedulerConfig,
};
pub use crate::core::kv_cache::{KvCacheManager, KvLayout};
pub use crate::core::sequence::{FinishReason, RequestId, RequestState};
pub use crate::core::tensor::{DType, Tensor, TensorDescriptor};
pub use engine::{
    Engine, GenerationOutput, GenerationRequest, RequestHandle, RequestUpdate, Sampler,
    StepMetrics, StepOutput, Submitter,
};
pub use error::{Error, ErrorKind, Result};
pub use kernels::{KernelDispatcher, SimdLevel};
pub use model::{CausalLm, Transformer, synthetic_descriptors};
pub use quant::{QuantEncoding, QuantizedBlock, QuantizedMatrix};
pub use scheduler::{Scheduler, SchedulerOutputs};
