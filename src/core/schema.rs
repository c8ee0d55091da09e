//! Model input schema and enqueue-time validation.
//!
//! Every request is checked against the schema before it enters the
//! queue: unknown or missing inputs, dtype mismatches, shape mismatches,
//! and payload byte counts inconsistent with the declared shape are all
//! rejected here, so runners and executors only ever see well-formed
//! batches.

use crate::core::request::InferenceRequest;
use crate::core::tensor::DType;
use crate::dataplane::peek_shape_tensor;
use crate::error::{Error, Result};

/// Declaration of one model input.
#[derive(Debug, Clone)]
pub struct InputSpec {
    /// Input name.
    pub name: String,
    /// Required element type.
    pub dtype: DType,
    /// Per-element dims, excluding the batch dimension (-1 = wildcard).
    pub dims: Vec<i64>,
    /// Whether the input is a shape tensor (values participate in
    /// batch-equality checks and must be 1-D Int32/Int64).
    pub is_shape_tensor: bool,
    /// Whether the input may be omitted.
    pub optional: bool,
}

impl InputSpec {
    /// Declare a required, non-shape input.
    pub fn new(name: impl Into<String>, dtype: DType, dims: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            dtype,
            dims,
            is_shape_tensor: false,
            optional: false,
        }
    }

    /// Mark the input as a shape tensor.
    pub fn shape_tensor(mut self) -> Self {
        self.is_shape_tensor = true;
        self
    }

    /// Mark the input as optional.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// The input schema a scheduler validates requests against.
#[derive(Debug, Clone, Default)]
pub struct ModelSchema {
    inputs: Vec<InputSpec>,
    max_batch_size: usize,
}

impl ModelSchema {
    /// Create a schema. `max_batch_size == 0` means the model does not
    /// support batching and request shapes carry no batch dimension.
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            inputs: Vec::new(),
            max_batch_size,
        }
    }

    /// Add an input declaration.
    pub fn with_input(mut self, spec: InputSpec) -> Self {
        self.inputs.push(spec);
        self
    }

    /// Declared inputs.
    pub fn inputs(&self) -> &[InputSpec] {
        &self.inputs
    }

    /// Look up an input declaration by name.
    pub fn input(&self, name: &str) -> Option<&InputSpec> {
        self.inputs.iter().find(|spec| spec.name == name)
    }

    /// Maximum batch size (0 = batching unsupported).
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Whether request shapes carry a leading batch dimension.
    pub fn supports_batching(&self) -> bool {
        self.max_batch_size > 0
    }

    /// Validate a request, returning its batch dimension.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] describing the first problem found.
    pub fn validate(&self, request: &InferenceRequest) -> Result<usize> {
        for spec in &self.inputs {
            if !spec.optional && request.input(&spec.name).is_none() {
                return Err(Error::Validation(format!(
                    "required input '{}' is missing",
                    spec.name
                )));
            }
        }

        let mut batch_dim: Option<usize> = None;
        for input in request.inputs() {
            let spec = self.input(&input.name).ok_or_else(|| {
                Error::Validation(format!("unknown input '{}'", input.name))
            })?;

            if input.dtype != spec.dtype {
                return Err(Error::Validation(format!(
                    "input '{}' has dtype {}, expected {}",
                    input.name, input.dtype, spec.dtype
                )));
            }

            let element_dims = if self.supports_batching() {
                let (leading, rest) = split_batch_dim(&input.shape, &input.name)?;
                if leading > self.max_batch_size {
                    return Err(Error::Validation(format!(
                        "input '{}' has batch dimension {} exceeding max batch size {}",
                        input.name, leading, self.max_batch_size
                    )));
                }
                match batch_dim {
                    None => batch_dim = Some(leading),
                    Some(previous) if previous != leading => {
                        return Err(Error::Validation(format!(
                            "input '{}' has batch dimension {}, other inputs have {}",
                            input.name, leading, previous
                        )));
                    }
                    Some(_) => {}
                }
                rest
            } else {
                &input.shape[..]
            };

            check_dims(&input.name, element_dims, &spec.dims)?;

            let expected = input.expected_byte_size();
            let actual = input.data.byte_size();
            if expected != actual {
                return Err(Error::Validation(format!(
                    "input '{}' carries {} bytes, shape {:?} with dtype {} implies {}",
                    input.name, actual, input.shape, input.dtype, expected
                )));
            }

            if spec.is_shape_tensor {
                check_shape_tensor(input)?;
            }
        }

        Ok(batch_dim.unwrap_or(1))
    }
}

fn split_batch_dim<'a>(shape: &'a [i64], name: &str) -> Result<(usize, &'a [i64])> {
    match shape.split_first() {
        Some((&leading, rest)) if leading >= 1 => Ok((leading as usize, rest)),
        Some((&leading, _)) => Err(Error::Validation(format!(
            "input '{name}' has invalid batch dimension {leading}"
        ))),
        None => Err(Error::Validation(format!(
            "input '{name}' has an empty shape but the model is batchable"
        ))),
    }
}

fn check_dims(name: &str, actual: &[i64], expected: &[i64]) -> Result<()> {
    let rank_matches = actual.len() == expected.len();
    let dims_match = rank_matches
        && actual
            .iter()
            .zip(expected)
            .all(|(&a, &e)| e == -1 || a == e);
    if dims_match {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "input '{name}' has shape {actual:?}, expected {expected:?}"
        )))
    }
}

fn check_shape_tensor(input: &crate::core::tensor::InputTensor) -> Result<()> {
    if !matches!(input.dtype, DType::Int32 | DType::Int64) {
        return Err(Error::Validation(format!(
            "shape tensor '{}' must be INT32 or INT64, got {}",
            input.name, input.dtype
        )));
    }
    // Parse now so dispatched work can always peek the values.
    peek_shape_tensor(input)?;
    Ok(())
}
