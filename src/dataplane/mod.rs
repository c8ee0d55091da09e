//! Data-plane helpers for batch construction.
//!
//! The runner relies on these to pack per-request inputs into one
//! contiguous buffer before execution and to scatter batched outputs
//! back into per-request slices afterwards. Copies that cross a device
//! boundary are staged through pinned host memory once they are large
//! enough to benefit, and every staged copy is recorded on a
//! [`TransferStream`] so the caller can synchronise exactly once before
//! touching the data.
//!
//! Device memory is modelled logically (payloads are byte buffers tagged
//! with a [`MemoryKind`]); the staging and stream-sync contract is what
//! matters to the scheduler, not the DMA itself.

use tracing::debug;

use crate::core::request::InferenceRequest;
use crate::core::tensor::{DType, InputTensor, MemoryKind, OutputTensor, TensorData};
use crate::error::{Error, Result};

/// Byte size above which a device-crossing copy is staged through
/// pinned memory and issued asynchronously.
pub const PINNED_STAGING_THRESHOLD: usize = 64 * 1024;

/// Records asynchronous copies issued while building or finalising a
/// batch so the runner can synchronise once before using the data.
#[derive(Debug, Default)]
pub struct TransferStream {
    pending: usize,
    total_issued: usize,
}

impl TransferStream {
    /// Create an idle stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one asynchronous copy in flight.
    pub fn record_async_copy(&mut self) {
        self.pending += 1;
        self.total_issued += 1;
    }

    /// Number of copies not yet settled.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Total asynchronous copies issued over the stream's lifetime.
    pub fn total_issued(&self) -> usize {
        self.total_issued
    }

    /// Settle every pending copy. Idempotent.
    pub fn synchronize(&mut self) {
        if self.pending > 0 {
            debug!(copies = self.pending, "synchronizing transfer stream");
            self.pending = 0;
        }
    }
}

/// A scoped pinned-memory staging allocation.
///
/// Owned by the in-flight batch and released after the stream
/// synchronises; no global pool is required for correctness.
#[derive(Debug)]
pub struct PinnedBuffer {
    bytes: Vec<u8>,
}

impl PinnedBuffer {
    /// Allocate a pinned staging buffer of the given size.
    pub fn new(len: usize) -> Self {
        Self {
            bytes: vec![0u8; len],
        }
    }

    /// Buffer length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn fill_from(&mut self, src: &[u8]) {
        self.bytes[..src.len()].copy_from_slice(src);
    }

    fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

/// One model input gathered into a contiguous buffer.
#[derive(Debug)]
pub struct GatheredInput {
    /// Input name.
    pub name: String,
    /// Element type.
    pub dtype: DType,
    /// Batched shape (leading dims summed across requests).
    pub shape: Vec<i64>,
    /// The contiguous payload in the executor-requested memory space.
    pub data: TensorData,
    /// Byte size each request contributed, in batch order.
    pub per_request_sizes: Vec<usize>,
    /// Whether any copy into the buffer was issued asynchronously.
    pub async_copy: bool,
    /// Staging allocations kept alive until after the stream sync.
    staging: Vec<PinnedBuffer>,
}

impl GatheredInput {
    /// Byte offset of the given request's slice within the buffer.
    pub fn offset_of(&self, index: usize) -> usize {
        self.per_request_sizes[..index].iter().sum()
    }

    /// The given request's slice of the contiguous buffer.
    pub fn slice_of(&self, index: usize) -> &[u8] {
        let offset = self.offset_of(index);
        &self.data.as_slice()[offset..offset + self.per_request_sizes[index]]
    }

    /// Number of staging buffers held by this input.
    pub fn staging_count(&self) -> usize {
        self.staging.len()
    }
}

// Copy one request slice toward `dst`, staging through pinned memory
// when the route crosses a device boundary and the slice is large.
// Returns true if the copy was issued asynchronously.
fn copy_slice(
    src: &TensorData,
    dst_kind: MemoryKind,
    dst: &mut [u8],
    stream: &mut TransferStream,
    staging: &mut Vec<PinnedBuffer>,
) -> bool {
    let crosses_device = src.kind().is_device() != dst_kind.is_device();
    let already_pinned =
        src.kind() == MemoryKind::Pinned || dst_kind == MemoryKind::Pinned;
    let staged = crosses_device
        && !already_pinned
        && src.byte_size() >= PINNED_STAGING_THRESHOLD;

    if staged {
        let mut pinned = PinnedBuffer::new(src.byte_size());
        pinned.fill_from(src.as_slice());
        dst.copy_from_slice(pinned.as_slice());
        staging.push(pinned);
        stream.record_async_copy();
        true
    } else {
        dst.copy_from_slice(src.as_slice());
        false
    }
}

/// Pack one named input from every request into a contiguous buffer.
///
/// The destination holds `sum(expected_byte_size[i])` bytes in
/// `dst_kind`. A request whose payload bytes disagree with its declared
/// shape (or which lacks the input entirely) gets an entry in the
/// returned failure list and a zero-filled slice; the batch itself
/// proceeds.
///
/// # Errors
///
/// Returns [`Error::Internal`] when no request in the batch carries the
/// input at all.
pub fn gather_input(
    name: &str,
    requests: &[InferenceRequest],
    batchable: bool,
    dst_kind: MemoryKind,
    stream: &mut TransferStream,
) -> Result<(GatheredInput, Vec<(usize, Error)>)> {
    let template = requests
        .iter()
        .find_map(|request| request.input(name))
        .ok_or_else(|| {
            Error::Internal(format!("no request in batch carries input '{name}'"))
        })?;
    let dtype = template.dtype;
    let element_shape: Vec<i64> = if batchable {
        template.shape.iter().skip(1).copied().collect()
    } else {
        template.shape.clone()
    };

    // Every request occupies its declared rows even when its payload is
    // rejected, so the buffer layout stays consistent with the batch's
    // leading dimension and the scatter pass can stride uniformly.
    let row_bytes =
        crate::core::tensor::element_count(&element_shape) as usize * dtype.size_of();
    let mut failures: Vec<(usize, Error)> = Vec::new();
    let mut per_request_sizes = Vec::with_capacity(requests.len());
    let mut batched_rows: usize = 0;
    for (index, request) in requests.iter().enumerate() {
        let rows = if batchable { request.batch_dim() } else { 1 };
        batched_rows += rows;
        match request.input(name) {
            Some(input) => per_request_sizes.push(input.expected_byte_size()),
            None => {
                failures.push((
                    index,
                    Error::Validation(format!("input '{name}' is missing")),
                ));
                per_request_sizes.push(rows * row_bytes);
            }
        }
    }

    let total: usize = per_request_sizes.iter().sum();
    let mut buffer = vec![0u8; total];
    let mut staging = Vec::new();
    let mut async_copy = false;

    let mut offset = 0;
    for (index, request) in requests.iter().enumerate() {
        let expected = per_request_sizes[index];
        let Some(input) = request.input(name) else {
            offset += expected;
            continue;
        };
        if input.data.byte_size() != expected {
            failures.push((
                index,
                Error::Validation(format!(
                    "input '{name}' carries {} bytes, expected {expected}",
                    input.data.byte_size()
                )),
            ));
            offset += expected;
            continue;
        }
        let dst = &mut buffer[offset..offset + expected];
        if copy_slice(&input.data, dst_kind, dst, stream, &mut staging) {
            async_copy = true;
        }
        offset += expected;
    }

    let shape = if batchable {
        let mut shape = Vec::with_capacity(element_shape.len() + 1);
        shape.push(batched_rows as i64);
        shape.extend_from_slice(&element_shape);
        shape
    } else {
        element_shape
    };

    Ok((
        GatheredInput {
            name: name.to_string(),
            dtype,
            shape,
            data: TensorData::new(buffer, dst_kind),
            per_request_sizes,
            async_copy,
            staging,
        },
        failures,
    ))
}

/// Stride a batched output tensor into per-request slices.
///
/// `batch_dims` gives each request's leading dimension in batch order;
/// their sum must equal the output's leading dimension. Staging
/// allocations go into `staging`, owned by the in-flight batch; the
/// caller synchronises the stream once after every output is scattered
/// and only then releases them.
///
/// # Errors
///
/// Returns [`Error::Internal`] when the output shape cannot be divided
/// across the batch.
pub fn scatter_output(
    output: &OutputTensor,
    batch_dims: &[usize],
    dst_kind: MemoryKind,
    stream: &mut TransferStream,
    staging: &mut Vec<PinnedBuffer>,
) -> Result<Vec<OutputTensor>> {
    let total_rows: usize = batch_dims.iter().sum();
    let leading = output.shape.first().copied().unwrap_or(0);
    if leading != total_rows as i64 {
        return Err(Error::Internal(format!(
            "output '{}' has leading dimension {}, batch expects {}",
            output.name, leading, total_rows
        )));
    }
    let total_bytes = output.data.byte_size();
    if total_rows == 0 || total_bytes % total_rows != 0 {
        return Err(Error::Internal(format!(
            "output '{}' has {} bytes, not divisible across {} rows",
            output.name, total_bytes, total_rows
        )));
    }
    let row_bytes = total_bytes / total_rows;

    let mut slices = Vec::with_capacity(batch_dims.len());
    let mut row_offset = 0;
    for &dim in batch_dims {
        let start = row_offset * row_bytes;
        let len = dim * row_bytes;
        let src = TensorData::new(
            output.data.as_slice()[start..start + len].to_vec(),
            output.data.kind(),
        );
        let mut dst = vec![0u8; len];
        copy_slice(&src, dst_kind, &mut dst, stream, staging);

        let mut shape = output.shape.clone();
        shape[0] = dim as i64;
        slices.push(OutputTensor::new(
            output.name.clone(),
            output.dtype,
            shape,
            TensorData::new(dst, dst_kind),
        ));
        row_offset += dim;
    }

    Ok(slices)
}

/// Read the contents of a shape tensor.
///
/// It is the caller's responsibility to call this only for INT32/INT64
/// tensors; validation enforces that for declared shape tensors.
///
/// # Errors
///
/// Returns [`Error::Validation`] for a non-integer dtype or a payload
/// whose length is not a multiple of the element size.
pub fn peek_shape_tensor(input: &InputTensor) -> Result<Vec<i64>> {
    let bytes = input.data.as_slice();
    match input.dtype {
        DType::Int32 => {
            if bytes.len() % 4 != 0 {
                return Err(Error::Validation(format!(
                    "shape tensor '{}' has truncated INT32 payload",
                    input.name
                )));
            }
            Ok(bytes
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as i64)
                .collect())
        }
        DType::Int64 => {
            if bytes.len() % 8 != 0 {
                return Err(Error::Validation(format!(
                    "shape tensor '{}' has truncated INT64 payload",
                    input.name
                )));
            }
            Ok(bytes
                .chunks_exact(8)
                .map(|c| {
                    i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
                })
                .collect())
        }
        other => Err(Error::Validation(format!(
            "shape tensor '{}' has non-integer dtype {other}",
            input.name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::request::{InferenceRequest, ResponseSender};

    fn request_with_payload(values: &[f32], batch: i64) -> InferenceRequest {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let per_row = values.len() as i64 / batch;
        let (sink, _rx) = ResponseSender::channel();
        let mut request = InferenceRequest::new(
            "corr",
            vec![InputTensor::new(
                "data",
                DType::Fp32,
                vec![batch, per_row],
                TensorData::host(bytes),
            )],
            Vec::new(),
            sink,
        );
        request.set_batch_dim(batch as usize);
        request
    }

    #[test]
    fn test_gather_concatenates_in_order() {
        let requests = vec![
            request_with_payload(&[1.0, 2.0], 1),
            request_with_payload(&[3.0, 4.0], 1),
        ];
        let mut stream = TransferStream::new();
        let (gathered, failures) =
            gather_input("data", &requests, true, MemoryKind::Host, &mut stream).unwrap();

        assert!(failures.is_empty());
        assert_eq!(gathered.shape, vec![2, 2]);
        assert_eq!(gathered.per_request_sizes, vec![8, 8]);
        assert_eq!(gathered.offset_of(1), 8);
        let expected: Vec<u8> = [1.0f32, 2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        assert_eq!(gathered.slice_of(0), &expected[..]);
    }

    #[test]
    fn test_byte_mismatch_isolates_request() {
        let good = request_with_payload(&[1.0, 2.0], 1);
        let (sink, _rx) = ResponseSender::channel();
        let bad = InferenceRequest::new(
            "corr",
            vec![InputTensor::new(
                "data",
                DType::Fp32,
                vec![1, 2],
                TensorData::host(vec![0u8; 3]),
            )],
            Vec::new(),
            sink,
        );
        let requests = vec![good, bad];
        let mut stream = TransferStream::new();
        let (gathered, failures) =
            gather_input("data", &requests, true, MemoryKind::Host, &mut stream).unwrap();

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, 1);
        // The failed slice stays zero-filled.
        assert_eq!(gathered.slice_of(1), &[0u8; 8]);
    }

    #[test]
    fn test_scatter_splits_rows() {
        let data: Vec<u8> = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let output = OutputTensor::new("y", DType::Fp32, vec![3, 2], TensorData::host(data));
        let mut stream = TransferStream::new();
        let mut staging = Vec::new();
        let slices =
            scatter_output(&output, &[1, 2], MemoryKind::Host, &mut stream, &mut staging).unwrap();

        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].shape, vec![1, 2]);
        assert_eq!(slices[1].shape, vec![2, 2]);
        assert_eq!(slices[0].data.byte_size(), 8);
        assert_eq!(slices[1].data.byte_size(), 16);
        assert_eq!(&slices[1].data.as_slice()[..4], 3.0f32.to_le_bytes());
    }

    #[test]
    fn test_scatter_rejects_bad_leading_dim() {
        let output = OutputTensor::new(
            "y",
            DType::Fp32,
            vec![2, 2],
            TensorData::host(vec![0u8; 16]),
        );
        let mut stream = TransferStream::new();
        let mut staging = Vec::new();
        assert!(
            scatter_output(&output, &[1, 2], MemoryKind::Host, &mut stream, &mut staging).is_err()
        );
    }

    #[test]
    fn test_large_device_copy_is_staged() {
        let len = PINNED_STAGING_THRESHOLD;
        let (sink, _rx) = ResponseSender::channel();
        let mut request = InferenceRequest::new(
            "corr",
            vec![InputTensor::new(
                "data",
                DType::Uint8,
                vec![1, len as i64],
                TensorData::new(vec![7u8; len], MemoryKind::Device(0)),
            )],
            Vec::new(),
            sink,
        );
        request.set_batch_dim(1);

        let mut stream = TransferStream::new();
        let (gathered, failures) = gather_input(
            "data",
            &[request],
            true,
            MemoryKind::Host,
            &mut stream,
        )
        .unwrap();

        assert!(failures.is_empty());
        assert!(gathered.async_copy);
        assert_eq!(gathered.staging_count(), 1);
        assert_eq!(stream.pending(), 1);
        stream.synchronize();
        assert_eq!(stream.pending(), 0);
        stream.synchronize();
        assert_eq!(stream.total_issued(), 1);
        assert_eq!(gathered.data.as_slice()[0], 7);
    }

    #[test]
    fn test_small_device_copy_is_synchronous() {
        let (sink, _rx) = ResponseSender::channel();
        let request = InferenceRequest::new(
            "corr",
            vec![InputTensor::new(
                "data",
                DType::Uint8,
                vec![1, 4],
                TensorData::new(vec![1, 2, 3, 4], MemoryKind::Device(0)),
            )],
            Vec::new(),
            sink,
        );
        let mut stream = TransferStream::new();
        let (gathered, _) =
            gather_input("data", &[request], true, MemoryKind::Host, &mut stream).unwrap();
        assert!(!gathered.async_copy);
        assert_eq!(stream.pending(), 0);
    }

    #[test]
    fn test_peek_shape_tensor_int32() {
        let bytes: Vec<u8> = [4i32, 2].iter().flat_map(|v| v.to_le_bytes()).collect();
        let input = InputTensor::new("S", DType::Int32, vec![2], TensorData::host(bytes));
        assert_eq!(peek_shape_tensor(&input).unwrap(), vec![4, 2]);
    }

    #[test]
    fn test_peek_shape_tensor_rejects_float() {
        let input = InputTensor::new(
            "S",
            DType::Fp32,
            vec![1],
            TensorData::host(vec![0u8; 4]),
        );
        assert!(peek_shape_tensor(&input).is_err());
    }
}
