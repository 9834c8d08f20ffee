//! Bias-free linear projection over dense or quantized weights.

use crate::core::tensor::{Tensor, TensorData};
use crate::error::{Error, Result};
use crate::kernels::KernelDispatcher;
use crate::quant::QuantizedMatrix;

/// Weight storage of a linear layer.
#[derive(Debug, Clone)]
pub enum Weight {
    /// Transposed to `[in × out]` so the forward pass is a plain tiled GEMM.
    Dense(Vec<f32>),
    /// `[out × in]` blocks, dequantized one row at a time per call.
    Quantized(QuantizedMatrix),
}

/// `y = x · Wᵀ` for a weight stored as `[out_features × in_features]`.
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Weight,
    in_features: usize,
    out_features: usize,
}

impl Linear {
    /// Build from a `[out × in]` tensor.
    ///
    /// # Arguments
    ///
    /// * `weight` - Weight tensor, F32 or quantized
    /// * `dequantize` - Expand quantized weights once now instead of per call
    pub fn from_tensor(weight: Tensor, dequantize: bool) -> Result<Self> {
        let (out_features, in_features) = weight.dims2()?;
        let weight = match weight.data() {
            TensorData::Quantized(m) if !dequantize => Weight::Quantized(m.clone()),
            _ => Weight::Dense(weight.transpose2()?.to_f32_vec()?),
        };
        Ok(Self {
            weight,
            in_features,
            out_features,
        })
    }

    /// Project `m` rows of `x [m × in]` to `[m × out]`.
    pub fn forward(&self, kernels: &KernelDispatcher, x: &[f32], m: usize) -> Result<Vec<f32>> {
        if x.len() != m * self.in_features {
            return Err(Error::shape("linear", &[m, self.in_features], &[x.len()]));
        }
        let mut out = vec![0.0f32; m * self.out_features];
        match &self.weight {
            Weight::Dense(w_t) => {
                kernels.matmul_into(x, w_t, m, self.in_features, self.out_features, &mut out)?
            }
            Weight::Quantized(q) => q.matmul_transposed(kernels, x, m, &mut out)?,
        }
        Ok(out)
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self.weight, Weight::Quantized(_))
    }
}
