//! Model weight loading.
//!
//! Weights arrive as already-parsed [`TensorDescriptor`]s; this module decodes
//! them into [`Tensor`]s and looks them up by name.
//!
//! ## Tensor names
//!
//! ```text
//! embed_tokens                           [vocab × hidden]
//! layers.{i}.input_layernorm             [hidden]
//! layers.{i}.self_attn.{q,k,v,o}_proj    [out × in]
//! layers.{i}.post_attention_layernorm    [hidden]
//! layers.{i}.mlp.{gate,up,down}_proj     [out × in]
//! norm                                   [hidden]
//! lm_head                                [vocab × hidden]   (optional, tied to embed_tokens)
//! ```

use std::collections::HashMap;

use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::ModelConfig;
use crate::core::tensor::{Tensor, TensorDescriptor};
use crate::error::{Error, Result};
use crate::quant::{QuantEncoding, QuantizedMatrix};

/// Decoded weights keyed by tensor name.
#[derive(Debug, Default)]
pub struct ModelWeights {
    tensors: HashMap<String, Tensor>,
}

impl ModelWeights {
    /// Decode every descriptor.
    ///
    /// # Errors
    ///
    /// * [`Error::ModelLoad`] for duplicate names.
    /// * Any decode error of [`Tensor::from_descriptor`], with the tensor
    ///   name attached for shape errors.
    pub fn from_descriptors(descriptors: Vec<TensorDescriptor>) -> Result<Self> {
        let mut tensors = HashMap::with_capacity(descriptors.len());
        let mut total_bytes = 0usize;
        for desc in descriptors {
            let tensor = Tensor::from_descriptor(&desc).map_err(|e| match e {
                Error::ShapeMismatch { .. } => {
                    Error::ModelLoad(format!("tensor {}: {e}", desc.name))
                }
                other => other,
            })?;
            total_bytes += tensor.size_bytes();
            if tensors.insert(desc.name.clone(), tensor).is_some() {
                return Err(Error::ModelLoad(format!("duplicate tensor {}", desc.name)));
            }
        }
        info!(
            "loaded {} tensors ({:.2} MiB)",
            tensors.len(),
            total_bytes as f64 / (1024.0 * 1024.0)
        );
        Ok(Self { tensors })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<&Tensor> {
        self.tensors
            .get(name)
            .ok_or_else(|| Error::ModelLoad(format!("missing tensor {name}")))
    }

    /// Remove a tensor, checking its shape.
    pub fn take(&mut self, name: &str, shape: &[usize]) -> Result<Tensor> {
        let tensor = self
            .tensors
            .remove(name)
            .ok_or_else(|| Error::ModelLoad(format!("missing tensor {name}")))?;
        let matches = tensor.shape() == shape
            || (shape.len() == 1 && tensor.shape() == [1, shape[0]]);
        if !matches {
            return Err(Error::ModelLoad(format!(
                "tensor {name} has shape {:?}, expected {shape:?}",
                tensor.shape()
            )));
        }
        Ok(tensor)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

/// Seeded random weights in the layout [`ModelWeights`] expects.
///
/// Linear projections are quantized with `encoding` when given; the embedding
/// is stored as F16 and norms as F32. The LM head is left out so it ties to
/// the embedding.
pub fn synthetic_descriptors(
    config: &ModelConfig,
    encoding: Option<QuantEncoding>,
    seed: u64,
) -> Result<Vec<TensorDescriptor>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let hidden = config.hidden_size;
    let inter = config.intermediate_size;
    let q_width = config.num_attention_heads * config.head_dim();
    let kv_width = config.num_key_value_heads * config.head_dim();

    let mut random = |rows: usize, cols: usize| -> Vec<f32> {
        let bound = 1.0 / (cols as f32).sqrt();
        (0..rows * cols).map(|_| rng.gen_range(-bound..bound)).collect()
    };

    let mut out = Vec::new();
    let linear = |name: String, rows: usize, cols: usize, values: Vec<f32>| -> Result<TensorDescriptor> {
        Ok(match encoding {
            Some(enc) => {
                let q = QuantizedMatrix::quantize(&values, rows, cols, enc)?;
                TensorDescriptor::from_quantized(name, &q)
            }
            None => TensorDescriptor::from_f32(name, vec![rows, cols], &values),
        })
    };

    out.push(TensorDescriptor::from_f16(
        "embed_tokens",
        vec![config.vocab_size, hidden],
        &random(config.vocab_size, hidden),
    ));
    for i in 0..config.num_hidden_layers {
        let p = format!("layers.{i}");
        out.push(TensorDescriptor::from_f32(
            format!("{p}.input_layernorm"),
            vec![hidden],
            &vec![1.0; hidden],
        ));
        out.push(linear(format!("{p}.self_attn.q_proj"), q_width, hidden, random(q_width, hidden))?);
        out.push(linear(format!("{p}.self_attn.k_proj"), kv_width, hidden, random(kv_width, hidden))?);
        out.push(linear(format!("{p}.self_attn.v_proj"), kv_width, hidden, random(kv_width, hidden))?);
        out.push(linear(format!("{p}.self_attn.o_proj"), hidden, q_width, random(hidden, q_width))?);
        out.push(TensorDescriptor::from_f32(
            format!("{p}.post_attention_layernorm"),
            vec![hidden],
            &vec![1.0; hidden],
        ));
        out.push(linear(format!("{p}.mlp.gate_proj"), inter, hidden, random(inter, hidden))?);
        out.push(linear(format!("{p}.mlp.up_proj"), inter, hidden, random(inter, hidden))?);
        out.push(linear(format!("{p}.mlp.down_proj"), hidden, inter, random(hidden, inter))?);
    }
    out.push(TensorDescriptor::from_f32("norm", vec![hidden], &vec![1.0; hidden]));
    Ok(out)
}
