//! Tensor metadata and payload types.
//!
//! The scheduler never interprets tensor contents beyond shape tensors; a
//! payload is a reference-counted byte buffer tagged with the memory space
//! it lives in. Device residency is modelled logically so the data-plane
//! helpers can honour the pinned-staging and stream-sync contract without
//! a hardware dependency.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// Boolean, one byte per element.
    Bool,
    /// Unsigned 8-bit integer.
    Uint8,
    /// Unsigned 16-bit integer.
    Uint16,
    /// Unsigned 32-bit integer.
    Uint32,
    /// Unsigned 64-bit integer.
    Uint64,
    /// Signed 8-bit integer.
    Int8,
    /// Signed 16-bit integer.
    Int16,
    /// Signed 32-bit integer.
    Int32,
    /// Signed 64-bit integer.
    Int64,
    /// IEEE 754 half precision, carried as two opaque bytes.
    Fp16,
    /// IEEE 754 single precision.
    Fp32,
    /// IEEE 754 double precision.
    Fp64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_of(&self) -> usize {
        match self {
            Self::Bool | Self::Uint8 | Self::Int8 => 1,
            Self::Uint16 | Self::Int16 | Self::Fp16 => 2,
            Self::Uint32 | Self::Int32 | Self::Fp32 => 4,
            Self::Uint64 | Self::Int64 | Self::Fp64 => 8,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "BOOL",
            Self::Uint8 => "UINT8",
            Self::Uint16 => "UINT16",
            Self::Uint32 => "UINT32",
            Self::Uint64 => "UINT64",
            Self::Int8 => "INT8",
            Self::Int16 => "INT16",
            Self::Int32 => "INT32",
            Self::Int64 => "INT64",
            Self::Fp16 => "FP16",
            Self::Fp32 => "FP32",
            Self::Fp64 => "FP64",
        };
        write!(f, "{name}")
    }
}

/// Memory space a tensor payload lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryKind {
    /// Ordinary pageable host memory.
    Host,
    /// Page-locked host memory eligible for asynchronous DMA.
    Pinned,
    /// Accelerator memory on the given device ordinal.
    Device(u32),
}

impl MemoryKind {
    /// Whether the payload resides on an accelerator.
    pub fn is_device(&self) -> bool {
        matches!(self, Self::Device(_))
    }
}

/// A tensor payload: shared bytes tagged with their memory space.
#[derive(Debug, Clone)]
pub struct TensorData {
    bytes: Arc<Vec<u8>>,
    kind: MemoryKind,
}

impl TensorData {
    /// Wrap a byte buffer living in the given memory space.
    pub fn new(bytes: Vec<u8>, kind: MemoryKind) -> Self {
        Self {
            bytes: Arc::new(bytes),
            kind,
        }
    }

    /// Wrap a byte buffer in ordinary host memory.
    pub fn host(bytes: Vec<u8>) -> Self {
        Self::new(bytes, MemoryKind::Host)
    }

    /// Payload size in bytes.
    pub fn byte_size(&self) -> usize {
        self.bytes.len()
    }

    /// Raw bytes of the payload.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Memory space the payload lives in.
    pub fn kind(&self) -> MemoryKind {
        self.kind
    }
}

/// Number of elements implied by a shape (empty shape = scalar = 1).
pub fn element_count(shape: &[i64]) -> u64 {
    shape.iter().map(|&d| d.max(0) as u64).product()
}

/// A named input tensor carried by a request.
#[derive(Debug, Clone)]
pub struct InputTensor {
    /// Tensor name, matched against the model schema.
    pub name: String,
    /// Element type.
    pub dtype: DType,
    /// Full shape as provided by the client, including any batch dimension.
    pub shape: Vec<i64>,
    /// Payload locator.
    pub data: TensorData,
}

impl InputTensor {
    /// Create an input tensor.
    pub fn new(
        name: impl Into<String>,
        dtype: DType,
        shape: Vec<i64>,
        data: TensorData,
    ) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
            data,
        }
    }

    /// Number of elements implied by the shape.
    pub fn element_count(&self) -> u64 {
        element_count(&self.shape)
    }

    /// Byte size implied by dtype and shape.
    pub fn expected_byte_size(&self) -> usize {
        self.element_count() as usize * self.dtype.size_of()
    }
}

/// A named output tensor produced by the executor.
#[derive(Debug, Clone)]
pub struct OutputTensor {
    /// Tensor name.
    pub name: String,
    /// Element type.
    pub dtype: DType,
    /// Shape, including the batch dimension for batched outputs.
    pub shape: Vec<i64>,
    /// Payload.
    pub data: TensorData,
}

impl OutputTensor {
    /// Create an output tensor.
    pub fn new(
        name: impl Into<String>,
        dtype: DType,
        shape: Vec<i64>,
        data: TensorData,
    ) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(DType::Bool.size_of(), 1);
        assert_eq!(DType::Fp16.size_of(), 2);
        assert_eq!(DType::Int32.size_of(), 4);
        assert_eq!(DType::Fp64.size_of(), 8);
    }

    #[test]
    fn test_element_count() {
        assert_eq!(element_count(&[]), 1);
        assert_eq!(element_count(&[4]), 4);
        assert_eq!(element_count(&[2, 3, 4]), 24);
        assert_eq!(element_count(&[2, 0]), 0);
    }

    #[test]
    fn test_expected_byte_size() {
        let input = InputTensor::new(
            "x",
            DType::Fp32,
            vec![2, 3],
            TensorData::host(vec![0u8; 24]),
        );
        assert_eq!(input.expected_byte_size(), 24);
        assert_eq!(input.data.byte_size(), 24);
    }

    #[test]
    fn test_memory_kind() {
        assert!(!MemoryKind::Host.is_device());
        assert!(!MemoryKind::Pinned.is_device());
        assert!(MemoryKind::Device(0).is_device());
    }
}
