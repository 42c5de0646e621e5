// Ops — Dual-mode operation dispatch
//
// An operation can run in two ways:
//
//   eager     — call() on concrete Tensors, producing a Tensor
//   symbolic  — compute_output_spec() on SymbolicTensors, producing only the
//               output shape/dtype (no data is touched)
//
// `dispatch` picks the mode: symbolic if any operand is symbolic or a
// symbolic scope is live on the stack, eager otherwise. Eager operands mixed
// into a symbolic call are replaced by their descriptors.
//
// Every op states its shape rule once in compute_output_spec, so a graph
// can be checked before any data flows:
//
//   let x = Operand::from(SymbolicTensor::new(vec![None, Some(3)], DType::F32));
//   let w = Operand::try_from(&kernel)?;             // [3, 4]
//   let y = ops::matmul(x, w)?;                       // Symbolic [?, 4]

use std::fmt;

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::scope::ScopeStack;
use crate::symbolic::SymbolicTensor;
use crate::tensor::Tensor;
use crate::variable::Variable;

/// Input or output of a dispatched operation.
#[derive(Debug, Clone)]
pub enum Operand {
    Eager(Tensor),
    Symbolic(SymbolicTensor),
}

impl Operand {
    pub fn is_symbolic(&self) -> bool {
        matches!(self, Operand::Symbolic(_))
    }

    /// Shape/dtype descriptor of either variant.
    pub fn spec(&self) -> SymbolicTensor {
        match self {
            Operand::Eager(t) => t.spec(),
            Operand::Symbolic(s) => s.clone(),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Operand::Eager(t) => t.dtype(),
            Operand::Symbolic(s) => s.dtype(),
        }
    }

    pub fn into_tensor(self) -> Result<Tensor> {
        match self {
            Operand::Eager(t) => Ok(t),
            Operand::Symbolic(s) => Err(Error::InvalidState(format!(
                "expected a concrete tensor, got symbolic {s}"
            ))),
        }
    }

    pub fn into_symbolic(self) -> SymbolicTensor {
        match self {
            Operand::Eager(t) => t.spec(),
            Operand::Symbolic(s) => s,
        }
    }

    /// A variable as an operand: its descriptor under a symbolic scope,
    /// otherwise its current value.
    pub fn from_variable_on(var: &Variable, stack: &ScopeStack) -> Result<Self> {
        if stack.in_symbolic_scope() {
            return Ok(Operand::Symbolic(var.spec()));
        }
        var.read_on(stack).map(Operand::Eager)
    }
}

impl From<Tensor> for Operand {
    fn from(t: Tensor) -> Self {
        Operand::Eager(t)
    }
}

impl From<&Tensor> for Operand {
    fn from(t: &Tensor) -> Self {
        Operand::Eager(t.clone())
    }
}

impl From<SymbolicTensor> for Operand {
    fn from(s: SymbolicTensor) -> Self {
        Operand::Symbolic(s)
    }
}

impl TryFrom<&Variable> for Operand {
    type Error = Error;

    fn try_from(var: &Variable) -> Result<Self> {
        Operand::from_variable_on(var, &ScopeStack::current())
    }
}

/// A computation with an eager kernel and a symbolic shape rule.
pub trait Operation {
    fn name(&self) -> &'static str;

    /// Run on concrete values.
    fn call(&self, inputs: &[Tensor]) -> Result<Tensor>;

    /// Shape/dtype of the output, without computing anything.
    fn compute_output_spec(&self, inputs: &[SymbolicTensor]) -> Result<SymbolicTensor>;
}

/// Dispatch on this thread's scope stack.
pub fn dispatch(op: &dyn Operation, inputs: &[Operand]) -> Result<Operand> {
    dispatch_on(&ScopeStack::current(), op, inputs)
}

pub fn dispatch_on(stack: &ScopeStack, op: &dyn Operation, inputs: &[Operand]) -> Result<Operand> {
    if stack.in_symbolic_scope() || inputs.iter().any(Operand::is_symbolic) {
        let specs: Vec<SymbolicTensor> = inputs.iter().map(Operand::spec).collect();
        let out = op.compute_output_spec(&specs)?;
        tracing::trace!(op = op.name(), out = %out, "symbolic dispatch");
        return Ok(Operand::Symbolic(out.with_records_history(true)));
    }
    let tensors = inputs
        .iter()
        .cloned()
        .map(Operand::into_tensor)
        .collect::<Result<Vec<_>>>()?;
    op.call(&tensors).map(Operand::Eager)
}

fn expect_arity<T>(op: &str, inputs: &[T], n: usize) -> Result<()> {
    if inputs.len() != n {
        crate::bail!("{op} expects {n} inputs, got {}", inputs.len());
    }
    Ok(())
}

fn same_dtype(lhs: &SymbolicTensor, rhs: &SymbolicTensor) -> Result<DType> {
    if lhs.dtype() != rhs.dtype() {
        return Err(Error::DTypeMismatch {
            expected: lhs.dtype(),
            got: rhs.dtype(),
        });
    }
    Ok(lhs.dtype())
}

// Built-in operations

/// Elementwise arithmetic with broadcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl Operation for BinaryOp {
    fn name(&self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Subtract => "subtract",
            BinaryOp::Multiply => "multiply",
            BinaryOp::Divide => "divide",
        }
    }

    fn call(&self, inputs: &[Tensor]) -> Result<Tensor> {
        expect_arity(self.name(), inputs, 2)?;
        let (lhs, rhs) = (&inputs[0], &inputs[1]);
        match self {
            BinaryOp::Add => lhs.add(rhs),
            BinaryOp::Subtract => lhs.sub(rhs),
            BinaryOp::Multiply => lhs.mul(rhs),
            BinaryOp::Divide => lhs.div(rhs),
        }
    }

    fn compute_output_spec(&self, inputs: &[SymbolicTensor]) -> Result<SymbolicTensor> {
        expect_arity(self.name(), inputs, 2)?;
        let (lhs, rhs) = (&inputs[0], &inputs[1]);
        let dtype = same_dtype(lhs, rhs)?;
        let shape = lhs.shape().broadcast(rhs.shape())?;
        Ok(SymbolicTensor::new(shape, dtype).with_sparse(lhs.is_sparse() && rhs.is_sparse()))
    }
}

/// Convert to another dtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cast {
    pub dtype: DType,
}

impl Operation for Cast {
    fn name(&self) -> &'static str {
        "cast"
    }

    fn call(&self, inputs: &[Tensor]) -> Result<Tensor> {
        expect_arity(self.name(), inputs, 1)?;
        Ok(inputs[0].to_dtype(self.dtype))
    }

    fn compute_output_spec(&self, inputs: &[SymbolicTensor]) -> Result<SymbolicTensor> {
        expect_arity(self.name(), inputs, 1)?;
        Ok(SymbolicTensor::new(inputs[0].shape().clone(), self.dtype)
            .with_sparse(inputs[0].is_sparse()))
    }
}

/// Matrix product. Eager execution supports 2-D operands; the shape rule
/// also covers batched [..., m, k] @ [..., k, n].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatMul;

impl Operation for MatMul {
    fn name(&self) -> &'static str {
        "matmul"
    }

    fn call(&self, inputs: &[Tensor]) -> Result<Tensor> {
        expect_arity(self.name(), inputs, 2)?;
        inputs[0].matmul(&inputs[1])
    }

    fn compute_output_spec(&self, inputs: &[SymbolicTensor]) -> Result<SymbolicTensor> {
        expect_arity(self.name(), inputs, 2)?;
        let dtype = same_dtype(&inputs[0], &inputs[1])?;
        Ok(SymbolicTensor::new(
            inputs[0].shape().matmul(inputs[1].shape())?,
            dtype,
        ))
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// Convenience wrappers

pub fn add(lhs: impl Into<Operand>, rhs: impl Into<Operand>) -> Result<Operand> {
    dispatch(&BinaryOp::Add, &[lhs.into(), rhs.into()])
}

pub fn subtract(lhs: impl Into<Operand>, rhs: impl Into<Operand>) -> Result<Operand> {
    dispatch(&BinaryOp::Subtract, &[lhs.into(), rhs.into()])
}

pub fn multiply(lhs: impl Into<Operand>, rhs: impl Into<Operand>) -> Result<Operand> {
    dispatch(&BinaryOp::Multiply, &[lhs.into(), rhs.into()])
}

pub fn divide(lhs: impl Into<Operand>, rhs: impl Into<Operand>) -> Result<Operand> {
    dispatch(&BinaryOp::Divide, &[lhs.into(), rhs.into()])
}

pub fn cast(x: impl Into<Operand>, dtype: DType) -> Result<Operand> {
    dispatch(&Cast { dtype }, &[x.into()])
}

pub fn matmul(lhs: impl Into<Operand>, rhs: impl Into<Operand>) -> Result<Operand> {
    dispatch(&MatMul, &[lhs.into(), rhs.into()])
}
