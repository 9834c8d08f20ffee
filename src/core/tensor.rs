//! Host tensors and the descriptors they are loaded from.

use half::f16;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::kernels::KernelDispatcher;
use crate::quant::{QuantEncoding, QuantizedMatrix};

/// Element encoding of a tensor or descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    F32,
    F16,
    Q8,
    Q4,
}

impl DType {
    /// Block encoding for quantized dtypes.
    pub fn quant_encoding(&self) -> Option<QuantEncoding> {
        match self {
            Self::Q8 => Some(QuantEncoding::Q8),
            Self::Q4 => Some(QuantEncoding::Q4),
            Self::F32 | Self::F16 => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::Q8 => "q8",
            Self::Q4 => "q4",
        }
    }
}

impl From<QuantEncoding> for DType {
    fn from(encoding: QuantEncoding) -> Self {
        match encoding {
            QuantEncoding::Q8 => Self::Q8,
            QuantEncoding::Q4 => Self::Q4,
        }
    }
}

/// A named tensor as delivered by the model-loading collaborator.
///
/// `data` is little-endian for float dtypes and packed codes for quantized
/// ones; `scales` holds one entry per block and is empty otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorDescriptor {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub data: Vec<u8>,
    #[serde(default)]
    pub scales: Vec<f32>,
}

impl TensorDescriptor {
    pub fn from_f32(name: impl Into<String>, shape: Vec<usize>, values: &[f32]) -> Self {
        Self {
            name: name.into(),
            shape,
            dtype: DType::F32,
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            scales: Vec::new(),
        }
    }

    pub fn from_f16(name: impl Into<String>, shape: Vec<usize>, values: &[f32]) -> Self {
        Self {
            name: name.into(),
            shape,
            dtype: DType::F16,
            data: values
                .iter()
                .flat_map(|&v| f16::from_f32(v).to_le_bytes())
                .collect(),
            scales: Vec::new(),
        }
    }

    pub fn from_quantized(name: impl Into<String>, matrix: &QuantizedMatrix) -> Self {
        Self {
            name: name.into(),
            shape: vec![matrix.rows(), matrix.cols()],
            dtype: matrix.encoding().into(),
            data: matrix.data().to_vec(),
            scales: matrix.scales().to_vec(),
        }
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Tensor storage.
#[derive(Debug, Clone)]
pub enum TensorData {
    F32(Vec<f32>),
    Quantized(QuantizedMatrix),
}

/// An owned, row-major host tensor.
///
/// F16 descriptors are widened to F32 at load; quantized descriptors stay
/// quantized until [`Tensor::dequantize`].
#[derive(Debug, Clone)]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
}

impl Tensor {
    /// Wrap a buffer, checking it matches the shape.
    pub fn from_vec(data: Vec<f32>, shape: Vec<usize>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if data.len() != numel {
            return Err(Error::shape("tensor", &shape, &[data.len()]));
        }
        Ok(Self {
            shape,
            data: TensorData::F32(data),
        })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let numel = shape.iter().product();
        Self {
            shape,
            data: TensorData::F32(vec![0.0; numel]),
        }
    }

    pub fn from_quantized(matrix: QuantizedMatrix) -> Self {
        Self {
            shape: vec![matrix.rows(), matrix.cols()],
            data: TensorData::Quantized(matrix),
        }
    }

    /// Decode a descriptor.
    ///
    /// # Errors
    ///
    /// * [`Error::ShapeMismatch`] if the byte count disagrees with the shape.
    /// * [`Error::UnsupportedQuantization`] for corrupt quantized payloads.
    pub fn from_descriptor(desc: &TensorDescriptor) -> Result<Self> {
        let numel = desc.numel();
        match desc.dtype {
            DType::F32 => {
                if desc.data.len() != numel * 4 {
                    return Err(Error::shape("f32 tensor bytes", &[numel * 4], &[desc.data.len()]));
                }
                let values = desc
                    .data
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect();
                Self::from_vec(values, desc.shape.clone())
            }
            DType::F16 => {
                if desc.data.len() != numel * 2 {
                    return Err(Error::shape("f16 tensor bytes", &[numel * 2], &[desc.data.len()]));
                }
                let values = desc
                    .data
                    .chunks_exact(2)
                    .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
                    .collect();
                Self::from_vec(values, desc.shape.clone())
            }
            DType::Q8 | DType::Q4 => {
                let encoding = desc.dtype.quant_encoding().ok_or_else(|| {
                    Error::UnsupportedQuantization(desc.dtype.as_str().to_string())
                })?;
                let (rows, cols) = match desc.shape.as_slice() {
                    [cols] => (1, *cols),
                    [rows, cols] => (*rows, *cols),
                    other => {
                        return Err(Error::UnsupportedQuantization(format!(
                            "quantized tensor {} must be 1-D or 2-D, got {other:?}",
                            desc.name
                        )));
                    }
                };
                let matrix = QuantizedMatrix::from_raw(
                    encoding,
                    rows,
                    cols,
                    desc.data.clone(),
                    desc.scales.clone(),
                )?;
                Ok(Self {
                    shape: desc.shape.clone(),
                    data: TensorData::Quantized(matrix),
                })
            }
        }
    }

    // ========== Getters ==========

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        match &self.data {
            TensorData::F32(_) => DType::F32,
            TensorData::Quantized(m) => m.encoding().into(),
        }
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// `(rows, cols)` of a 2-D tensor.
    pub fn dims2(&self) -> Result<(usize, usize)> {
        match self.shape.as_slice() {
            [rows, cols] => Ok((*rows, *cols)),
            other => Err(Error::shape("dims2", &[2], &[other.len()])),
        }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Some(v),
            TensorData::Quantized(_) => None,
        }
    }

    pub fn as_quantized(&self) -> Option<&QuantizedMatrix> {
        match &self.data {
            TensorData::Quantized(m) => Some(m),
            TensorData::F32(_) => None,
        }
    }

    /// Bytes held by the buffer.
    pub fn size_bytes(&self) -> usize {
        match &self.data {
            TensorData::F32(v) => v.len() * std::mem::size_of::<f32>(),
            TensorData::Quantized(m) => m.size_bytes(),
        }
    }

    // ========== Conversions ==========

    /// Convert to an F32 tensor, dequantizing if needed.
    pub fn dequantize(self) -> Result<Self> {
        match self.data {
            TensorData::F32(_) => Ok(self),
            TensorData::Quantized(m) => Self::from_vec(m.dequantize()?, self.shape),
        }
    }

    /// Row-major F32 copy of the contents.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        match &self.data {
            TensorData::F32(v) => Ok(v.clone()),
            TensorData::Quantized(m) => m.dequantize(),
        }
    }

    /// Copy of a 2-D F32 tensor with rows and columns swapped.
    pub fn transpose2(&self) -> Result<Self> {
        let (rows, cols) = self.dims2()?;
        let src = self.to_f32_vec()?;
        let mut out = vec![0.0f32; rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                out[c * rows + r] = src[r * cols + c];
            }
        }
        Self::from_vec(out, vec![cols, rows])
    }

    // ========== Ops ==========

    /// `self [m × k] · rhs [k × n]` for F32 tensors.
    pub fn matmul(&self, rhs: &Tensor, kernels: &KernelDispatcher) -> Result<Tensor> {
        let (m, k) = self.dims2()?;
        let (k2, n) = rhs.dims2()?;
        if k != k2 {
            return Err(Error::shape("matmul", &[k, n], &[k2, n]));
        }
        let (a, b) = match (self.as_f32(), rhs.as_f32()) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                return Err(Error::UnsupportedQuantization(
                    "matmul operands must be dequantized".into(),
                ));
            }
        };
        let c = kernels.matmul(a, b, m, k, n)?;
        Self::from_vec(c, vec![m, n])
    }
}
