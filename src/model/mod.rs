//! Llama-style model built on the dispatched kernels.
//!
//! This module contains:
//! - Weight decoding and lookup ([`ModelWeights`])
//! - Components (RMSNorm, RoPE, grouped-query attention, SwiGLU)
//! - The batched [`Transformer`] and the [`CausalLm`] seam the engine drives

pub mod attention;
pub mod decoder;
pub mod linear;
pub mod loader;
pub mod mlp;
pub mod norm;
pub mod rope;
pub mod transformer;

pub use linear::Linear;
pub use loader::{ModelWeights, synthetic_descriptors};
pub use transformer::{BatchEntry, CausalLm, Transformer};
