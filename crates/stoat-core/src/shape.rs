use std::fmt;

use crate::error::{Error, Result};

// Shape — Fully defined n-dimensional shape
//
// Variables require a Shape: every dimension is a concrete size. Shapes that
// may still contain unknown dimensions live in `symbolic::SymbolicShape`.
//
//   Scalar: Shape([])        — 0 dimensions, 1 element
//   Vector: Shape([5])       — 1 dimension, 5 elements
//   Matrix: Shape([3, 4])    — 2 dimensions, 12 elements

/// N-dimensional, fully defined shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a new shape from a vector of dimension sizes.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn is_scalar(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of elements. A scalar shape [] has 1 element, and any
    /// zero-sized dimension makes the count 0.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product::<usize>()
    }

    /// Contiguous row-major strides. For [2, 3, 4] this is [12, 4, 1].
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        let mut acc = 1;
        for i in (0..self.rank()).rev() {
            strides[i] = acc;
            acc *= self.0[i];
        }
        strides
    }

    /// Size of a specific dimension.
    pub fn dim(&self, d: usize) -> Result<usize> {
        self.0.get(d).copied().ok_or_else(|| {
            Error::shape(format!(
                "dimension {d} out of range for shape {self} of rank {}",
                self.rank()
            ))
        })
    }

    /// NumPy-style broadcast of two shapes.
    ///
    /// Shapes are aligned from the right; a dimension pair is compatible if
    /// equal or if either side is 1. Missing leading dims count as 1.
    pub fn broadcast_shape(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
        let l = lhs.dims();
        let r = rhs.dims();
        let rank = l.len().max(r.len());
        let mut out = vec![0usize; rank];

        for i in 0..rank {
            let ld = if i < l.len() { l[l.len() - 1 - i] } else { 1 };
            let rd = if i < r.len() { r[r.len() - 1 - i] } else { 1 };
            out[rank - 1 - i] = match (ld, rd) {
                (a, b) if a == b => a,
                (1, b) => b,
                (a, 1) => a,
                (a, b) => {
                    return Err(Error::shape(format!(
                        "shapes {lhs} and {rhs} are not broadcast-compatible ({a} vs {b})"
                    )))
                }
            };
        }
        Ok(Shape(out))
    }

    /// Strides that read this shape as if it had been broadcast to `target`.
    /// Broadcast dimensions (size 1 here, or missing) get stride 0.
    pub fn broadcast_strides(&self, target: &Shape) -> Vec<usize> {
        let own = self.stride_contiguous();
        let offset = target.rank() - self.rank();
        let mut out = vec![0usize; target.rank()];
        for (i, &d) in self.0.iter().enumerate() {
            if d == target.0[i + offset] {
                out[i + offset] = own[i];
            }
        }
        out
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

impl From<()> for Shape {
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(a: [usize; N]) -> Self {
        Shape(a.to_vec())
    }
}

impl From<&Shape> for Shape {
    fn from(s: &Shape) -> Self {
        s.clone()
    }
}
