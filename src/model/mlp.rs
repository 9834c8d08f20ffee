//! SwiGLU feed-forward network.
//!
//! Reference: <https://arxiv.org/abs/2002.05202>

use crate::error::Result;
use crate::kernels::KernelDispatcher;

use super::linear::Linear;

/// SiLU (Sigmoid Linear Unit) activation: `silu(x) = x * sigmoid(x)`.
pub fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// MLP with SwiGLU activation.
///
/// Formula: `output = down_proj(silu(gate_proj(x)) * up_proj(x))`
#[derive(Debug, Clone)]
pub struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    pub fn new(gate_proj: Linear, up_proj: Linear, down_proj: Linear) -> Self {
        Self {
            gate_proj,
            up_proj,
            down_proj,
        }
    }

    pub fn hidden_size(&self) -> usize {
        self.gate_proj.in_features()
    }

    pub fn intermediate_size(&self) -> usize {
        self.gate_proj.out_features()
    }

    /// Forward pass over `m` rows of `x [m × hidden]`.
    pub fn forward(&self, kernels: &KernelDispatcher, x: &[f32], m: usize) -> Result<Vec<f32>> {
        let mut gate = self.gate_proj.forward(kernels, x, m)?;
        let up = self.up_proj.forward(kernels, x, m)?;
        for (g, u) in gate.iter_mut().zip(&up) {
            *g = silu(*g) * u;
        }
        self.down_proj.forward(kernels, &gate, m)
    }
}
