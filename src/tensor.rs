//! Dense multi-dimensional numeric arrays with column-major linearisation.
//!
//! A [`Tensor`] pairs a non-empty shape vector with a flat buffer whose
//! length equals the product of the shape. A scalar has shape `[1]`. The
//! sentinel [`NA`] marks a missing real value; callers test for it with
//! [`is_na`] rather than relying on incidental NaNs elsewhere in the engine.

use crate::error::{EngineError, Result};

/// Sentinel for a missing value in a tensor buffer.
pub const NA: f64 = f64::NAN;

#[inline]
pub fn is_na(x: f64) -> bool {
    x.is_nan()
}

#[inline]
pub fn checks_integer(x: f64) -> bool {
    !is_na(x) && x.fract() == 0.0
}

/// Maps a multi-index into a column-major flat offset.
pub fn col_major_index(shape: &[usize], index: &[usize]) -> usize {
    debug_assert_eq!(shape.len(), index.len());
    let mut offset = 0;
    let mut stride = 1;
    for (dim, &i) in shape.iter().zip(index) {
        offset += i * stride;
        stride *= dim;
    }
    offset
}

#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self> {
        if shape.is_empty() || shape.iter().any(|&d| d == 0) {
            return Err(EngineError::Dimension(format!(
                "shape must be non-empty with positive extents, got {:?}",
                shape
            )));
        }
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(EngineError::Dimension(format!(
                "shape {:?} implies {} values, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Tensor { shape, data })
    }

    pub fn scalar(value: f64) -> Self {
        Tensor {
            shape: vec![1],
            data: vec![value],
        }
    }

    pub fn vector(data: Vec<f64>) -> Self {
        let n = data.len();
        Tensor {
            shape: vec![n],
            data,
        }
    }

    pub fn matrix(nrows: usize, ncols: usize, data: Vec<f64>) -> Result<Self> {
        Tensor::new(vec![nrows, ncols], data)
    }

    pub fn filled(shape: Vec<usize>, value: f64) -> Result<Self> {
        let len: usize = shape.iter().product();
        Tensor::new(shape, vec![value; len])
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.data
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn is_scalar(&self) -> bool {
        self.data.len() == 1
    }

    pub fn is_vector(&self) -> bool {
        self.shape.iter().filter(|&&d| d > 1).count() <= 1
    }

    pub fn is_matrix(&self) -> bool {
        self.shape.len() == 2
    }

    /// The non-unit dimensions, dropping leading/trailing size-1 axes, as
    /// the BUGS-style `drop` operation does when comparing shapes.
    pub fn dropped_shape(&self) -> Vec<usize> {
        let dropped: Vec<usize> = self.shape.iter().copied().filter(|&d| d != 1).collect();
        if dropped.is_empty() {
            vec![1]
        } else {
            dropped
        }
    }

    pub fn scalar_view(&self) -> Result<f64> {
        if !self.is_scalar() {
            return Err(EngineError::Dimension(
                "expected a scalar tensor".to_string(),
            ));
        }
        Ok(self.data[0])
    }

    pub fn is_discrete(&self) -> bool {
        self.data.iter().all(|&x| checks_integer(x))
    }

    pub fn has_na(&self) -> bool {
        self.data.iter().any(|&x| is_na(x))
    }

    pub fn as_view(&self) -> TensorView<'_> {
        TensorView {
            shape: &self.shape,
            data: &self.data,
        }
    }
}

/// A non-owning view over a tensor, used on hot paths where copying the
/// backing buffer would dominate the cost of a single density evaluation.
#[derive(Clone, Copy, Debug)]
pub struct TensorView<'a> {
    shape: &'a [usize],
    data: &'a [f64],
}

impl<'a> TensorView<'a> {
    pub fn new(shape: &'a [usize], data: &'a [f64]) -> Self {
        TensorView { shape, data }
    }

    pub fn shape(&self) -> &[usize] {
        self.shape
    }

    pub fn values(&self) -> &[f64] {
        self.data
    }

    pub fn is_scalar(&self) -> bool {
        self.data.len() == 1
    }

    pub fn scalar_view(&self) -> Result<f64> {
        if !self.is_scalar() {
            return Err(EngineError::Dimension(
                "expected a scalar tensor view".to_string(),
            ));
        }
        Ok(self.data[0])
    }

    pub fn to_owned(&self) -> Tensor {
        Tensor {
            shape: self.shape.to_vec(),
            data: self.data.to_vec(),
        }
    }
}
