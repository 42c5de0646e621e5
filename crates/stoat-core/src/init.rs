// init — Variable initializers
//
// A variable starts from either a concrete value or a generator that is
// called with the variable's (shape, dtype) when the value is first needed.
// Generators are what make deferred initialization possible: a variable
// created inside a stateless scope keeps its generator and stays pending.
//
// AVAILABLE GENERATORS:
//
//   zeros()                        — all zeros
//   ones()                         — all ones
//   constant(v)                    — all elements = v
//   uniform(low, high, seed)       — U(low, high)
//   normal(mean, std, seed)        — N(mean, std)
//   glorot_uniform(seed)           — U(-l, l), l = sqrt(6 / (fan_in + fan_out))
//
// A seeded generator is deterministic: every call draws the same values.
// Unseeded generators draw from the thread RNG.

use std::fmt;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rand_distr::{Distribution, Normal, Uniform};

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Signature of a generator initializer.
pub type GeneratorFn = dyn Fn(&Shape, DType) -> Result<Tensor> + Send + Sync;

/// Where a variable's first value comes from.
#[derive(Clone)]
pub enum Initializer {
    /// A concrete value, used as-is (cast to the variable dtype).
    Value(Tensor),
    /// Called with the variable's shape and dtype on first use.
    Generator(Arc<GeneratorFn>),
}

impl Initializer {
    pub fn generator<F>(f: F) -> Self
    where
        F: Fn(&Shape, DType) -> Result<Tensor> + Send + Sync + 'static,
    {
        Initializer::Generator(Arc::new(f))
    }

    pub fn is_generator(&self) -> bool {
        matches!(self, Initializer::Generator(_))
    }

    /// Produce a value of exactly `shape` and `dtype`.
    pub(crate) fn produce(&self, shape: &Shape, dtype: DType) -> Result<Tensor> {
        let value = match self {
            Initializer::Value(t) => t.clone(),
            Initializer::Generator(f) => f(shape, dtype)?,
        };
        if value.shape() != shape {
            return Err(Error::ShapeMismatch {
                expected: shape.clone(),
                got: value.shape().clone(),
            });
        }
        Ok(value.to_dtype(dtype))
    }
}

impl fmt::Debug for Initializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Initializer::Value(t) => write!(f, "Value({t:?})"),
            Initializer::Generator(_) => write!(f, "Generator"),
        }
    }
}

impl From<Tensor> for Initializer {
    fn from(t: Tensor) -> Self {
        Initializer::Value(t)
    }
}

impl From<&Tensor> for Initializer {
    fn from(t: &Tensor) -> Self {
        Initializer::Value(t.clone())
    }
}

pub fn zeros() -> Initializer {
    constant(0.0)
}

pub fn ones() -> Initializer {
    constant(1.0)
}

pub fn constant(value: f64) -> Initializer {
    Initializer::generator(move |shape, dtype| Ok(Tensor::full(shape, value, dtype)))
}

fn rng_for(seed: Option<u64>) -> Box<dyn RngCore> {
    match seed {
        Some(s) => Box::new(StdRng::seed_from_u64(s)),
        None => Box::new(rand::thread_rng()),
    }
}

fn sample<D: Distribution<f64>>(
    dist: &D,
    seed: Option<u64>,
    shape: &Shape,
    dtype: DType,
) -> Result<Tensor> {
    let mut rng = rng_for(seed);
    let data: Vec<f64> = (0..shape.elem_count())
        .map(|_| dist.sample(&mut *rng))
        .collect();
    Tensor::from_f64_slice(&data, shape, dtype)
}

/// Uniform U(low, high). Fails on an empty range when first called.
pub fn uniform(low: f64, high: f64, seed: Option<u64>) -> Initializer {
    Initializer::generator(move |shape, dtype| {
        if !(low < high) {
            return Err(Error::msg(format!(
                "uniform initializer needs low < high, got [{low}, {high})"
            )));
        }
        sample(&Uniform::new(low, high), seed, shape, dtype)
    })
}

/// Normal N(mean, std).
pub fn normal(mean: f64, std: f64, seed: Option<u64>) -> Initializer {
    Initializer::generator(move |shape, dtype| {
        let dist = Normal::new(mean, std)
            .map_err(|e| Error::msg(format!("normal initializer: {e}")))?;
        sample(&dist, seed, shape, dtype)
    })
}

/// (fan_in, fan_out), convolution-style for rank > 2.
fn compute_fans(shape: &Shape) -> (f64, f64) {
    let dims = shape.dims();
    match dims.len() {
        0 => (1.0, 1.0),
        1 => (dims[0] as f64, dims[0] as f64),
        2 => (dims[0] as f64, dims[1] as f64),
        _ => {
            let receptive: usize = dims[..dims.len() - 2].iter().product();
            let fan_in = dims[dims.len() - 2] * receptive;
            let fan_out = dims[dims.len() - 1] * receptive;
            (fan_in as f64, fan_out as f64)
        }
    }
}

/// Glorot/Xavier uniform, for [in, out] kernels.
pub fn glorot_uniform(seed: Option<u64>) -> Initializer {
    Initializer::generator(move |shape, dtype| {
        let (fan_in, fan_out) = compute_fans(shape);
        let limit = (6.0 / (fan_in + fan_out).max(1.0)).sqrt();
        sample(&Uniform::new(-limit, limit), seed, shape, dtype)
    })
}
