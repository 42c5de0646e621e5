use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::dtype::{DType, WithDType};
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::symbolic::SymbolicTensor;

// Tensor — Host-side concrete value
//
// This is the value a Variable stores, a stateless scope collects, and an
// eager operation consumes. It is deliberately small: dense row-major data
// on the host, a shape, and a dtype. Heavy kernels belong to math backends
// that plug in through `ops::Operation`.
//
// MEMORY MODEL:
//
//   Elements are held as f64 behind an Arc and quantized to `dtype` when the
//   tensor is built, so an F16 tensor only ever holds F16-representable
//   values. Tensors are immutable: cloning is O(1), and every arithmetic op
//   returns a fresh tensor. Variable mutation swaps whole tensors.

/// Unique identifier for a tensor value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorId(u64);

impl TensorId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        TensorId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Dense host tensor with a fixed shape and dtype.
#[derive(Clone)]
pub struct Tensor {
    id: TensorId,
    shape: Shape,
    dtype: DType,
    data: Arc<Vec<f64>>,
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(id={:?}, shape={}, dtype={})",
            self.id, self.shape, self.dtype
        )
    }
}

impl Tensor {
    // Constructors

    /// Build from f64 values, quantizing each to `dtype`.
    pub fn from_f64_slice(data: &[f64], shape: impl Into<Shape>, dtype: DType) -> Result<Self> {
        Self::from_vec(data.to_vec(), shape.into(), dtype)
    }

    /// Build from a typed slice; the dtype comes from `T`.
    pub fn from_slice<T: WithDType>(data: &[T], shape: impl Into<Shape>) -> Result<Self> {
        let values = data.iter().map(|v| WithDType::to_f64(*v)).collect();
        Self::from_vec(values, shape.into(), T::DTYPE)
    }

    fn from_vec(mut data: Vec<f64>, shape: Shape, dtype: DType) -> Result<Self> {
        if data.len() != shape.elem_count() {
            return Err(Error::msg(format!(
                "element count mismatch: shape {shape} requires {} elements, got {}",
                shape.elem_count(),
                data.len()
            )));
        }
        if dtype != DType::F64 {
            data.iter_mut().for_each(|v| *v = dtype.quantize(*v));
        }
        Ok(Tensor {
            id: TensorId::new(),
            shape,
            dtype,
            data: Arc::new(data),
        })
    }

    /// Tensor with every element set to `value`.
    pub fn full(shape: impl Into<Shape>, value: f64, dtype: DType) -> Self {
        let shape = shape.into();
        let n = shape.elem_count();
        Tensor {
            id: TensorId::new(),
            shape,
            dtype,
            data: Arc::new(vec![dtype.quantize(value); n]),
        }
    }

    pub fn zeros(shape: impl Into<Shape>, dtype: DType) -> Self {
        Self::full(shape, 0.0, dtype)
    }

    pub fn ones(shape: impl Into<Shape>, dtype: DType) -> Self {
        Self::full(shape, 1.0, dtype)
    }

    pub fn scalar(value: f64, dtype: DType) -> Self {
        Self::full((), value, dtype)
    }

    // Accessors

    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Copy of the elements in row-major order.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.data.as_ref().clone()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// The single element of a one-element tensor.
    pub fn to_scalar(&self) -> Result<f64> {
        match self.data.as_slice() {
            [v] => Ok(*v),
            _ => Err(Error::msg(format!(
                "not a scalar: tensor has shape {}",
                self.shape
            ))),
        }
    }

    /// The descriptor of this tensor, for symbolic shape inference.
    pub fn spec(&self) -> SymbolicTensor {
        SymbolicTensor::new(&self.shape, self.dtype).with_records_history(false)
    }

    // Conversions

    /// Cast to another dtype. Returns a cheap clone if the dtype is unchanged.
    pub fn to_dtype(&self, dtype: DType) -> Tensor {
        if dtype == self.dtype {
            return self.clone();
        }
        Tensor {
            id: TensorId::new(),
            shape: self.shape.clone(),
            dtype,
            data: Arc::new(self.data.iter().map(|&v| dtype.quantize(v)).collect()),
        }
    }

    /// Same data, different shape with the same element count.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Tensor> {
        let shape = shape.into();
        if shape.elem_count() != self.elem_count() {
            return Err(Error::msg(format!(
                "cannot reshape {} elements into {shape}",
                self.elem_count()
            )));
        }
        Ok(Tensor {
            id: TensorId::new(),
            shape,
            dtype: self.dtype,
            data: Arc::clone(&self.data),
        })
    }

    // Arithmetic

    fn binary(&self, rhs: &Tensor, f: impl Fn(f64, f64) -> f64) -> Result<Tensor> {
        if self.dtype != rhs.dtype {
            return Err(Error::DTypeMismatch {
                expected: self.dtype,
                got: rhs.dtype,
            });
        }
        let out_shape = Shape::broadcast_shape(&self.shape, &rhs.shape)?;
        let data = if self.shape == rhs.shape {
            self.data
                .iter()
                .zip(rhs.data.iter())
                .map(|(&a, &b)| f(a, b))
                .collect()
        } else {
            let ls = self.shape.broadcast_strides(&out_shape);
            let rs = rhs.shape.broadcast_strides(&out_shape);
            let out_strides = out_shape.stride_contiguous();
            (0..out_shape.elem_count())
                .map(|flat| {
                    let (mut li, mut ri, mut rem) = (0, 0, flat);
                    for d in 0..out_strides.len() {
                        let idx = rem / out_strides[d];
                        rem %= out_strides[d];
                        li += idx * ls[d];
                        ri += idx * rs[d];
                    }
                    f(self.data[li], rhs.data[ri])
                })
                .collect()
        };
        Self::from_vec(data, out_shape, self.dtype)
    }

    pub fn add(&self, rhs: &Tensor) -> Result<Tensor> {
        self.binary(rhs, |a, b| a + b)
    }

    pub fn sub(&self, rhs: &Tensor) -> Result<Tensor> {
        self.binary(rhs, |a, b| a - b)
    }

    pub fn mul(&self, rhs: &Tensor) -> Result<Tensor> {
        self.binary(rhs, |a, b| a * b)
    }

    pub fn div(&self, rhs: &Tensor) -> Result<Tensor> {
        self.binary(rhs, |a, b| a / b)
    }

    /// Plain 2-D matrix product: [m, k] @ [k, n] → [m, n].
    pub fn matmul(&self, rhs: &Tensor) -> Result<Tensor> {
        let (&[m, k1], &[k2, n]) = (self.dims(), rhs.dims()) else {
            return Err(Error::msg(format!(
                "matmul expects 2-D operands, got {} and {}",
                self.shape, rhs.shape
            )));
        };
        if k1 != k2 {
            return Err(Error::ShapeMismatch {
                expected: Shape::from((k1, n)),
                got: rhs.shape.clone(),
            });
        }
        if self.dtype != rhs.dtype {
            return Err(Error::DTypeMismatch {
                expected: self.dtype,
                got: rhs.dtype,
            });
        }
        let mut out = vec![0.0; m * n];
        for i in 0..m {
            for p in 0..k1 {
                let a = self.data[i * k1 + p];
                for j in 0..n {
                    out[i * n + j] += a * rhs.data[p * n + j];
                }
            }
        }
        Self::from_vec(out, Shape::from((m, n)), self.dtype)
    }

    /// Same shape and every element within `tol`.
    pub fn allclose(&self, other: &Tensor, tol: f64) -> bool {
        self.shape == other.shape
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| (a - b).abs() <= tol)
    }
}
