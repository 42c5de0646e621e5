// Symbolic tensors — shape/dtype placeholders for static inference
//
// A SymbolicTensor stands in for a real tensor while a graph is being built.
// It carries everything an operation needs to compute the shape and dtype of
// its output (see `ops::Operation::compute_output_spec`) and nothing else:
// no data, no device, no storage.
//
// COMPONENTS:
//
//   SymDim          — a dimension that is either a known size or unknown
//   SymbolicShape   — ordered SymDims; the shape-inference rules live here
//   SymbolicTensor  — immutable {shape, dtype, sparse, records_history, name}
//
// Unknown dims typically come from a batch axis that is only fixed when real
// data flows. They propagate through broadcasting: [?, 3] + [1, 3] → [?, 3].

use std::fmt;

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::shape::Shape;

/// A single dimension of a symbolic shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymDim {
    /// Known size.
    Fixed(usize),
    /// Not known until real data flows through.
    Unknown,
}

impl SymDim {
    pub fn is_fixed(&self) -> bool {
        matches!(self, SymDim::Fixed(_))
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, SymDim::Unknown)
    }

    /// The concrete size, if known.
    pub fn size(&self) -> Option<usize> {
        match self {
            SymDim::Fixed(n) => Some(*n),
            SymDim::Unknown => None,
        }
    }

    /// Whether a concrete size is compatible with this dimension.
    pub fn matches(&self, value: usize) -> bool {
        match self {
            SymDim::Fixed(n) => *n == value,
            SymDim::Unknown => true,
        }
    }
}

impl fmt::Display for SymDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymDim::Fixed(n) => write!(f, "{n}"),
            SymDim::Unknown => write!(f, "?"),
        }
    }
}

impl From<usize> for SymDim {
    fn from(n: usize) -> Self {
        SymDim::Fixed(n)
    }
}

impl From<Option<usize>> for SymDim {
    fn from(n: Option<usize>) -> Self {
        n.map_or(SymDim::Unknown, SymDim::Fixed)
    }
}

/// A shape whose dimensions may be unknown.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct SymbolicShape {
    dims: Vec<SymDim>,
}

impl SymbolicShape {
    pub fn new(dims: Vec<SymDim>) -> Self {
        Self { dims }
    }

    /// Build from signed sizes, `None` meaning unknown.
    ///
    /// Fails with [`Error::Shape`] on any negative entry.
    pub fn try_from_signed(dims: &[Option<i64>]) -> Result<Self> {
        let dims = dims
            .iter()
            .enumerate()
            .map(|(i, d)| match d {
                None => Ok(SymDim::Unknown),
                Some(n) if *n >= 0 => Ok(SymDim::Fixed(*n as usize)),
                Some(n) => Err(Error::shape(format!(
                    "dimension {i} is {n}; sizes must be non-negative or unknown"
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { dims })
    }

    pub fn from_shape(shape: &Shape) -> Self {
        Self {
            dims: shape.dims().iter().map(|&d| SymDim::Fixed(d)).collect(),
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[SymDim] {
        &self.dims
    }

    /// True when no dimension is unknown.
    pub fn is_fully_defined(&self) -> bool {
        self.dims.iter().all(SymDim::is_fixed)
    }

    /// Convert to a concrete [`Shape`]. `what` names the owner in the error.
    pub fn to_shape(&self, what: &str) -> Result<Shape> {
        self.dims
            .iter()
            .map(SymDim::size)
            .collect::<Option<Vec<_>>>()
            .map(Shape::new)
            .ok_or_else(|| Error::UndefinedShape {
                name: what.to_string(),
                shape: self.to_string(),
            })
    }

    /// Whether a concrete shape is an instance of this pattern.
    pub fn matches(&self, shape: &Shape) -> bool {
        self.rank() == shape.rank()
            && self
                .dims
                .iter()
                .zip(shape.dims())
                .all(|(pattern, &value)| pattern.matches(value))
    }

    /// Broadcast rule for elementwise operations.
    ///
    /// A fixed 1 yields the other side; two fixed dims must agree; any other
    /// pairing with an unknown yields unknown.
    pub fn broadcast(&self, other: &SymbolicShape) -> Result<SymbolicShape> {
        let rank = self.rank().max(other.rank());
        let pad = |s: &SymbolicShape, i: usize| -> SymDim {
            let lead = rank - s.rank();
            if i < lead {
                SymDim::Fixed(1)
            } else {
                s.dims[i - lead]
            }
        };

        let mut out = Vec::with_capacity(rank);
        for i in 0..rank {
            let (a, b) = (pad(self, i), pad(other, i));
            out.push(match (a, b) {
                (SymDim::Fixed(1), _) => b,
                (_, SymDim::Fixed(1)) => a,
                (SymDim::Fixed(x), SymDim::Fixed(y)) if x == y => a,
                (SymDim::Fixed(x), SymDim::Fixed(y)) => {
                    return Err(Error::shape(format!(
                        "cannot broadcast {self} with {other}: dim {i} is {x} vs {y}"
                    )))
                }
                _ => SymDim::Unknown,
            });
        }
        Ok(SymbolicShape::new(out))
    }

    /// Shape rule for (batched) matrix multiplication: [..., m, k] @ [..., k, n].
    pub fn matmul(&self, other: &SymbolicShape) -> Result<SymbolicShape> {
        if self.rank() < 2 || other.rank() < 2 {
            return Err(Error::shape(format!(
                "matmul needs rank >= 2 operands, got {self} and {other}"
            )));
        }
        let (lb, lm) = self.dims.split_at(self.rank() - 2);
        let (rb, rm) = other.dims.split_at(other.rank() - 2);
        if let (SymDim::Fixed(k1), SymDim::Fixed(k2)) = (lm[1], rm[0]) {
            if k1 != k2 {
                return Err(Error::shape(format!(
                    "matmul inner dimensions differ: {self} @ {other}"
                )));
            }
        }
        let batch = SymbolicShape::new(lb.to_vec()).broadcast(&SymbolicShape::new(rb.to_vec()))?;
        let mut dims = batch.dims;
        dims.push(lm[0]);
        dims.push(rm[1]);
        Ok(SymbolicShape::new(dims))
    }
}

impl fmt::Display for SymbolicShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

impl From<Vec<SymDim>> for SymbolicShape {
    fn from(dims: Vec<SymDim>) -> Self {
        Self::new(dims)
    }
}

impl From<Shape> for SymbolicShape {
    fn from(shape: Shape) -> Self {
        Self::from_shape(&shape)
    }
}

impl From<&Shape> for SymbolicShape {
    fn from(shape: &Shape) -> Self {
        Self::from_shape(shape)
    }
}

macro_rules! sym_shape_from_fixed {
    ($($t:ty),*) => {
        $(impl From<$t> for SymbolicShape {
            fn from(dims: $t) -> Self {
                Self::from_shape(&Shape::from(dims))
            }
        })*
    };
}

sym_shape_from_fixed!(usize, (usize, usize), (usize, usize, usize), Vec<usize>, &[usize]);

impl<const N: usize> From<[usize; N]> for SymbolicShape {
    fn from(dims: [usize; N]) -> Self {
        Self::from_shape(&Shape::from(dims))
    }
}

impl From<Vec<Option<usize>>> for SymbolicShape {
    fn from(dims: Vec<Option<usize>>) -> Self {
        Self::new(dims.into_iter().map(SymDim::from).collect())
    }
}

/// Shape/dtype placeholder used during graph construction.
///
/// Immutable; the builder-style `with_*` methods return a new value.
/// Equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolicTensor {
    shape: SymbolicShape,
    dtype: DType,
    sparse: bool,
    records_history: bool,
    name: Option<String>,
}

impl SymbolicTensor {
    pub fn new(shape: impl Into<SymbolicShape>, dtype: DType) -> Self {
        Self {
            shape: shape.into(),
            dtype,
            sparse: false,
            records_history: true,
            name: None,
        }
    }

    /// Build from signed sizes (`None` = unknown); negative sizes fail.
    pub fn try_from_dims(dims: &[Option<i64>], dtype: DType) -> Result<Self> {
        Ok(Self::new(SymbolicShape::try_from_signed(dims)?, dtype))
    }

    pub fn with_sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }

    pub fn with_records_history(mut self, records_history: bool) -> Self {
        self.records_history = records_history;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn shape(&self) -> &SymbolicShape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn is_sparse(&self) -> bool {
        self.sparse
    }

    pub fn records_history(&self) -> bool {
        self.records_history
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }
}

impl fmt::Display for SymbolicTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymbolicTensor(shape={}, dtype={}", self.shape, self.dtype)?;
        if self.sparse {
            write!(f, ", sparse")?;
        }
        if let Some(name) = &self.name {
            write!(f, ", name={name}")?;
        }
        write!(f, ")")
    }
}
