//! Core data structures.
//!
//! - [`tensor`]: host tensors and load descriptors
//! - [`sequence`]: inference requests and their lifecycle
//! - [`kv_cache`]: per-sequence key/value storage

pub mod kv_cache;
pub mod sequence;
pub mod tensor;
