use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use crate::config;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::init::Initializer;
use crate::scope::ScopeStack;
use crate::shape::Shape;
use crate::symbolic::{SymbolicShape, SymbolicTensor};
use crate::tensor::Tensor;

// Variable — Mutable numeric state with scope-aware redirection
//
// A Variable owns a value that layers treat as a weight. Every read and
// write first asks the scope stack whether a stateless scope is live:
//
//   no stateless scope:  read/write act on the variable's own storage
//   stateless scope:     read prefers the scope's value, write is recorded
//                        in the scope, storage is never touched
//
// LIFECYCLE:
//
//   Empty ──assign──────────────────────────────┐
//   Pending(initializer) ──first eager read/write──> Initialized(value)
//   Pending ──touched under a stateless scope──> Pending (registered)
//
//   Initialized is terminal; assignment swaps the value, not the state.
//   Concrete initial values start Initialized unless created inside a
//   stateless scope. Generator initializers always start Pending.
//
// HANDLE SEMANTICS:
//
//   Variable is an Arc handle. Clones alias the same state, and VariableId
//   is what stateless scopes key their side tables on. Storage sits behind
//   an RwLock so a Variable is Send + Sync, but the core does not order
//   concurrent writers: callers sharing a variable across threads must
//   synchronize themselves.
//
// Every operation has a `*_on(&ScopeStack)` form. The plain form uses the
// calling thread's stack.

/// Identity of a variable; ordered by creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VariableId(u64);

impl VariableId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        VariableId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// How replicas' values are combined under distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Aggregation {
    #[default]
    Mean,
    Sum,
    OnlyFirstReplica,
}

impl FromStr for Aggregation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mean" => Ok(Aggregation::Mean),
            "sum" => Ok(Aggregation::Sum),
            "only_first_replica" => Ok(Aggregation::OnlyFirstReplica),
            _ => Err(Error::InvalidAggregation { got: s.to_string() }),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Aggregation::Mean => "mean",
            Aggregation::Sum => "sum",
            Aggregation::OnlyFirstReplica => "only_first_replica",
        };
        write!(f, "{s}")
    }
}

/// When replicas synchronize the variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Synchronization {
    #[default]
    Auto,
    OnRead,
    OnWrite,
    None,
}

enum VariableState {
    Empty,
    Pending(Initializer),
    Initialized(Tensor),
}

struct VariableInner {
    id: VariableId,
    name: String,
    path: String,
    dtype: DType,
    shape: Shape,
    trainable: AtomicBool,
    autocast: bool,
    aggregation: Aggregation,
    synchronization: Synchronization,
    state: RwLock<VariableState>,
}

/// A named, shaped, mutable value. See the module docs for the scope rules.
#[derive(Clone)]
pub struct Variable {
    inner: Arc<VariableInner>,
}

/// Non-owning handle kept by a scope stack for deferred initialization.
pub(crate) struct WeakVariable {
    id: VariableId,
    inner: Weak<VariableInner>,
}

impl WeakVariable {
    fn new(var: &Variable) -> Self {
        Self {
            id: var.id(),
            inner: Arc::downgrade(&var.inner),
        }
    }

    pub(crate) fn id(&self) -> VariableId {
        self.id
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    fn upgrade(&self) -> Option<Variable> {
        self.inner.upgrade().map(|inner| Variable { inner })
    }
}

/// Builder returned by [`Variable::builder`].
#[must_use]
pub struct VariableBuilder {
    initializer: Option<Initializer>,
    shape: Option<SymbolicShape>,
    dtype: Option<DType>,
    trainable: bool,
    autocast: bool,
    aggregation: Aggregation,
    synchronization: Synchronization,
    name: String,
}

impl VariableBuilder {
    fn with_initializer(initializer: Option<Initializer>) -> Self {
        Self {
            initializer,
            shape: None,
            dtype: None,
            trainable: true,
            autocast: true,
            aggregation: Aggregation::Mean,
            synchronization: Synchronization::Auto,
            name: "variable".to_string(),
        }
    }

    pub fn shape(mut self, shape: impl Into<SymbolicShape>) -> Self {
        self.shape = Some(shape.into());
        self
    }

    /// Shape given as plain sizes, e.g. `.dims(&[2, 2])`.
    pub fn dims(self, dims: &[usize]) -> Self {
        self.shape(Shape::from(dims))
    }

    pub fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn trainable(mut self, trainable: bool) -> Self {
        self.trainable = trainable;
        self
    }

    pub fn autocast(mut self, autocast: bool) -> Self {
        self.autocast = autocast;
        self
    }

    pub fn aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn synchronization(mut self, synchronization: Synchronization) -> Self {
        self.synchronization = synchronization;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Create the variable on this thread's scope stack.
    pub fn build(self) -> Result<Variable> {
        self.build_on(&ScopeStack::current())
    }

    /// Create the variable against an explicit scope stack.
    pub fn build_on(self, stack: &ScopeStack) -> Result<Variable> {
        validate_name(&self.name)?;

        let shape = match (&self.initializer, self.shape) {
            (Some(Initializer::Value(value)), Some(declared)) => {
                let declared = declared.to_shape(&self.name)?;
                if &declared != value.shape() {
                    return Err(Error::ShapeMismatch {
                        expected: declared,
                        got: value.shape().clone(),
                    });
                }
                declared
            }
            (Some(Initializer::Value(value)), None) => value.shape().clone(),
            (_, Some(declared)) => declared.to_shape(&self.name)?,
            (_, None) => return Err(Error::MissingShape { name: self.name }),
        };

        let dtype = match (&self.initializer, self.dtype) {
            (_, Some(dtype)) => dtype,
            (Some(Initializer::Value(value)), None) => value.dtype(),
            _ => config::floatx(),
        };

        let in_stateless = stack.in_stateless_scope();
        let state = match self.initializer {
            None => VariableState::Empty,
            Some(Initializer::Value(value)) if !in_stateless => {
                VariableState::Initialized(value.to_dtype(dtype))
            }
            Some(init) => VariableState::Pending(init),
        };

        let parent = stack.current_path();
        let path = if parent.is_empty() {
            self.name.clone()
        } else {
            format!("{parent}/{}", self.name)
        };

        let var = Variable {
            inner: Arc::new(VariableInner {
                id: VariableId::new(),
                name: self.name,
                path,
                dtype,
                shape,
                trainable: AtomicBool::new(self.trainable),
                autocast: self.autocast,
                aggregation: self.aggregation,
                synchronization: self.synchronization,
                state: RwLock::new(state),
            }),
        };
        tracing::debug!(path = %var.path(), shape = %var.shape(), dtype = %dtype, "created variable");
        if in_stateless && var.is_pending() {
            var.defer_in(stack);
        }
        Ok(var)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: "variable names must be non-empty",
        });
    }
    if name.contains('/') {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: "variable names cannot contain '/'",
        });
    }
    Ok(())
}

impl Variable {
    /// Start building a variable from a value or generator.
    pub fn builder(initializer: impl Into<Initializer>) -> VariableBuilder {
        VariableBuilder::with_initializer(Some(initializer.into()))
    }

    /// A variable with no initial value. Reads fail with
    /// [`Error::Uninitialized`] until something is assigned.
    pub fn uninitialized(shape: impl Into<SymbolicShape>, dtype: DType) -> VariableBuilder {
        VariableBuilder::with_initializer(None)
            .shape(shape)
            .dtype(dtype)
    }

    /// Shorthand for a trainable variable holding `value`.
    pub fn new(value: Tensor, name: &str) -> Result<Variable> {
        Self::builder(value).name(name).build()
    }

    // Accessors

    pub fn id(&self) -> VariableId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Scope path at creation joined with the name, e.g. `dense/kernel`.
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.inner.shape
    }

    pub fn trainable(&self) -> bool {
        self.inner.trainable.load(Ordering::Relaxed)
    }

    pub fn set_trainable(&self, trainable: bool) {
        self.inner.trainable.store(trainable, Ordering::Relaxed);
    }

    pub fn autocast(&self) -> bool {
        self.inner.autocast
    }

    pub fn aggregation(&self) -> Aggregation {
        self.inner.aggregation
    }

    pub fn synchronization(&self) -> Synchronization {
        self.inner.synchronization
    }

    pub fn elem_count(&self) -> usize {
        self.inner.shape.elem_count()
    }

    /// Whether storage holds a value.
    pub fn is_initialized(&self) -> bool {
        matches!(*self.state(), VariableState::Initialized(_))
    }

    /// Whether storage is still waiting on an initializer.
    pub fn is_pending(&self) -> bool {
        matches!(*self.state(), VariableState::Pending(_))
    }

    /// The descriptor of this variable, for symbolic graph construction.
    pub fn spec(&self) -> SymbolicTensor {
        SymbolicTensor::new(self.shape(), self.dtype()).with_name(self.path())
    }

    fn state(&self) -> RwLockReadGuard<'_, VariableState> {
        self.inner
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, VariableState> {
        self.inner
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // Reads

    /// Current value, autocast-adjusted. See the module docs for precedence.
    pub fn read(&self) -> Result<Tensor> {
        self.read_on(&ScopeStack::current())
    }

    /// Alias of [`read`](Self::read).
    pub fn value(&self) -> Result<Tensor> {
        self.read()
    }

    pub fn read_on(&self, stack: &ScopeStack) -> Result<Tensor> {
        let value = self.read_raw(stack)?;
        Ok(self.maybe_autocast(value, stack))
    }

    /// Current value in the declared dtype.
    fn read_raw(&self, stack: &ScopeStack) -> Result<Tensor> {
        if let Some(value) = stack.with_stateless(|s| s.get_current_value(self)).flatten() {
            tracing::trace!(path = %self.path(), "read from stateless scope");
            return Ok(value);
        }

        let init = match &*self.state() {
            VariableState::Initialized(value) => return Ok(value.clone()),
            VariableState::Empty => {
                return Err(Error::Uninitialized {
                    path: self.path().to_string(),
                })
            }
            VariableState::Pending(init) => init.clone(),
        };

        if stack.in_stateless_scope() {
            self.defer_in(stack);
            return init.produce(self.shape(), self.dtype());
        }
        self.materialize_with(&init)
    }

    fn maybe_autocast(&self, value: Tensor, stack: &ScopeStack) -> Tensor {
        if !self.inner.autocast || !self.dtype().is_float() {
            return value;
        }
        match stack.autocast_dtype().or_else(config::compute_dtype) {
            Some(target) if target.is_float() && target != self.dtype() => value.to_dtype(target),
            _ => value,
        }
    }

    // Initialization

    /// Run a pending initializer now. No-op if already initialized.
    ///
    /// Fails inside a stateless scope, which must not write storage.
    pub fn materialize(&self) -> Result<()> {
        self.materialize_on(&ScopeStack::current())
    }

    pub fn materialize_on(&self, stack: &ScopeStack) -> Result<()> {
        if stack.in_stateless_scope() {
            return Err(Error::InvalidState(format!(
                "cannot initialize '{}' inside a stateless scope",
                self.path()
            )));
        }
        let init = match &*self.state() {
            VariableState::Initialized(_) => return Ok(()),
            VariableState::Empty => {
                return Err(Error::Uninitialized {
                    path: self.path().to_string(),
                })
            }
            VariableState::Pending(init) => init.clone(),
        };
        self.materialize_with(&init).map(|_| ())
    }

    fn materialize_with(&self, init: &Initializer) -> Result<Tensor> {
        // The initializer runs without the lock held; it may be arbitrary code.
        let value = init.produce(self.shape(), self.dtype())?;
        let mut state = self.state_mut();
        match &*state {
            VariableState::Initialized(existing) => Ok(existing.clone()),
            _ => {
                tracing::debug!(path = %self.path(), "materialized variable");
                *state = VariableState::Initialized(value.clone());
                Ok(value)
            }
        }
    }

    /// Register with the live stateless scope and the stack's deferred list.
    fn defer_in(&self, stack: &ScopeStack) {
        if stack
            .with_stateless(|s| s.register_uninitialized_variable(self))
            .is_none()
        {
            return;
        }
        if stack.defer(WeakVariable::new(self)) {
            tracing::trace!(path = %self.path(), "deferring initialization");
        }
    }

    // Writes

    /// Replace the value. The shape must match exactly; the value is cast to
    /// the declared dtype. Recorded in the stateless scope when one is live.
    pub fn assign(&self, value: &Tensor) -> Result<()> {
        self.assign_on(value, &ScopeStack::current())
    }

    pub fn assign_on(&self, value: &Tensor, stack: &ScopeStack) -> Result<()> {
        self.check_shape(value)?;
        let value = value.to_dtype(self.dtype());
        if stack.in_stateless_scope() {
            tracing::trace!(path = %self.path(), "write recorded in stateless scope");
            stack.with_stateless(|s| s.add_update(self, value));
            return Ok(());
        }
        let mut state = self.state_mut();
        if !matches!(*state, VariableState::Initialized(_)) {
            tracing::debug!(path = %self.path(), "initialized by assignment");
        }
        *state = VariableState::Initialized(value);
        Ok(())
    }

    /// `assign(read() + delta)`; `delta` must have the variable's shape.
    pub fn assign_add(&self, delta: &Tensor) -> Result<()> {
        self.assign_add_on(delta, &ScopeStack::current())
    }

    pub fn assign_add_on(&self, delta: &Tensor, stack: &ScopeStack) -> Result<()> {
        self.check_shape(delta)?;
        let next = self.read_raw(stack)?.add(&delta.to_dtype(self.dtype()))?;
        self.assign_on(&next, stack)
    }

    /// `assign(read() - delta)`; `delta` must have the variable's shape.
    pub fn assign_sub(&self, delta: &Tensor) -> Result<()> {
        self.assign_sub_on(delta, &ScopeStack::current())
    }

    pub fn assign_sub_on(&self, delta: &Tensor, stack: &ScopeStack) -> Result<()> {
        self.check_shape(delta)?;
        let next = self.read_raw(stack)?.sub(&delta.to_dtype(self.dtype()))?;
        self.assign_on(&next, stack)
    }

    fn check_shape(&self, value: &Tensor) -> Result<()> {
        if value.shape() != self.shape() {
            return Err(Error::ShapeMismatch {
                expected: self.shape().clone(),
                got: value.shape().clone(),
            });
        }
        Ok(())
    }

    /// Storage value without consulting any scope. `None` unless initialized.
    pub(crate) fn stored_value(&self) -> Option<Tensor> {
        match &*self.state() {
            VariableState::Initialized(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Variable {}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Variable(path={}, shape={}, dtype={}, trainable={})",
            self.path(),
            self.shape(),
            self.dtype(),
            self.trainable()
        )
    }
}

/// Materialize every variable a stateless scope of this thread's stack left
/// pending.
pub fn initialize_all_variables() -> Result<()> {
    initialize_all_variables_on(&ScopeStack::current())
}

/// Materialize every variable a stateless scope of `stack` left pending.
///
/// Fails with [`Error::InvalidState`] while a stateless scope is live on
/// `stack`. Variables whose initializer fails stay registered.
pub fn initialize_all_variables_on(stack: &ScopeStack) -> Result<()> {
    if stack.in_stateless_scope() {
        return Err(Error::InvalidState(
            "cannot initialize variables inside a stateless scope".into(),
        ));
    }
    let mut deferred = stack.take_deferred().into_iter();
    let mut count = 0;
    while let Some(weak) = deferred.next() {
        let Some(var) = weak.upgrade() else {
            continue;
        };
        if let Err(err) = var.materialize_on(stack) {
            // keep the failed variable and the unvisited rest registered
            stack.defer(weak);
            deferred.filter(WeakVariable::is_alive).for_each(|rest| {
                stack.defer(rest);
            });
            return Err(err);
        }
        count += 1;
    }
    tracing::debug!(count, "initialized deferred variables");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init;
    use crate::scope::{Frame, NameScope};
    use crate::stateless::StatelessScope;

    fn ones22() -> Tensor {
        Tensor::ones((2, 2), DType::F32)
    }

    #[test]
    fn test_create_then_read_matches_declaration() -> Result<()> {
        let stack = ScopeStack::new();
        for (dims, dtype) in [
            (vec![1], DType::F32),
            (vec![2, 3], DType::F64),
            (vec![4, 1, 2], DType::I64),
        ] {
            let v = Variable::builder(init::zeros())
                .dims(&dims)
                .dtype(dtype)
                .build_on(&stack)?;
            let value = v.read_on(&stack)?;
            assert_eq!(value.dims(), dims.as_slice());
            assert_eq!(value.dtype(), dtype);
        }
        Ok(())
    }

    #[test]
    fn test_assign_scenario() -> Result<()> {
        let w = Variable::builder(Tensor::zeros((2, 2), DType::F32))
            .name("w")
            .build()?;
        w.assign(&ones22())?;
        assert!(w.read()?.allclose(&ones22(), 0.0));

        let err = w.assign(&Tensor::ones((3, 3), DType::F32)).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
        assert!(w.read()?.allclose(&ones22(), 0.0));
        Ok(())
    }

    #[test]
    fn test_assign_add_sub() -> Result<()> {
        let v = Variable::new(Tensor::full(3, 2.0, DType::F64), "acc")?;
        v.assign_add(&Tensor::full(3, 0.5, DType::F64))?;
        v.assign_sub(&Tensor::full(3, 1.0, DType::F32))?;
        assert_eq!(v.read()?.to_f64_vec(), vec![1.5, 1.5, 1.5]);
        assert!(matches!(
            v.assign_add(&Tensor::ones(1, DType::F64)),
            Err(Error::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_writes_cast_to_declared_dtype() -> Result<()> {
        let v = Variable::builder(init::zeros())
            .shape(2)
            .dtype(DType::F16)
            .build()?;
        v.assign(&Tensor::full(2, 1.0 / 3.0, DType::F64))?;
        let value = v.read()?;
        assert_eq!(value.dtype(), DType::F16);
        assert_eq!(value.to_f64_vec()[0], DType::F16.quantize(1.0 / 3.0));
        Ok(())
    }

    #[test]
    fn test_invalid_names() {
        for bad in ["a/b", ""] {
            let err = Variable::builder(init::zeros())
                .shape(1)
                .name(bad)
                .build()
                .unwrap_err();
            assert!(matches!(err, Error::InvalidName { .. }));
        }
    }

    #[test]
    fn test_aggregation_parse() {
        assert_eq!("sum".parse::<Aggregation>().unwrap(), Aggregation::Sum);
        assert_eq!(
            "only_first_replica".parse::<Aggregation>().unwrap(),
            Aggregation::OnlyFirstReplica
        );
        assert!(matches!(
            "median".parse::<Aggregation>(),
            Err(Error::InvalidAggregation { .. })
        ));
    }

    #[test]
    fn test_generator_needs_shape() {
        let err = Variable::builder(init::ones()).build().unwrap_err();
        assert!(matches!(err, Error::MissingShape { .. }));
    }

    #[test]
    fn test_unknown_dims_rejected() {
        let err = Variable::builder(init::ones())
            .shape(vec![None, Some(3)])
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::UndefinedShape { .. }));
    }

    #[test]
    fn test_value_shape_must_match_declared() {
        let err = Variable::builder(Tensor::zeros(3, DType::F32))
            .shape(4)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn test_generator_is_lazy() -> Result<()> {
        let v = Variable::builder(init::constant(5.0)).shape(2).build()?;
        assert!(v.is_pending());
        assert_eq!(v.read()?.to_f64_vec(), vec![5.0, 5.0]);
        assert!(v.is_initialized());
        Ok(())
    }

    #[test]
    fn test_uninitialized_read_fails_until_assigned() -> Result<()> {
        let v = Variable::uninitialized(Shape::from(2), DType::F32)
            .name("slot")
            .build()?;
        assert!(matches!(v.read(), Err(Error::Uninitialized { .. })));
        assert!(matches!(
            v.assign_add(&Tensor::ones(2, DType::F32)),
            Err(Error::Uninitialized { .. })
        ));
        v.assign(&Tensor::ones(2, DType::F32))?;
        assert_eq!(v.read()?.to_f64_vec(), vec![1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_path_from_name_scopes() -> Result<()> {
        let stack = ScopeStack::new();
        let _m = stack.enter(Frame::Name(NameScope::new("model")))?;
        let _d = stack.enter(Frame::Name(NameScope::new("dense")))?;
        let v = Variable::builder(init::zeros())
            .shape((2, 2))
            .name("kernel")
            .build_on(&stack)?;
        assert_eq!(v.path(), "model/dense/kernel");
        assert_eq!(v.name(), "kernel");
        Ok(())
    }

    #[test]
    fn test_stateless_override_and_assign() -> Result<()> {
        let stack = ScopeStack::new();
        let v = Variable::builder(Tensor::zeros((2, 2), DType::F32)).build_on(&stack)?;
        let x = Tensor::full((2, 2), 4.0, DType::F32);
        let y = Tensor::full((2, 2), 9.0, DType::F32);

        let guard = StatelessScope::new()
            .with_override(&v, x.clone())?
            .enter_on(&stack)?;
        assert!(v.read_on(&stack)?.allclose(&x, 0.0));
        v.assign_on(&y, &stack)?;
        assert!(v.read_on(&stack)?.allclose(&y, 0.0));
        let scope = guard.exit()?;

        assert!(scope.updated_value(&v).unwrap().allclose(&y, 0.0));
        assert_eq!(v.read_on(&stack)?.to_f64_vec(), vec![0.0; 4]);
        Ok(())
    }

    #[test]
    fn test_stateless_assign_add_uses_override() -> Result<()> {
        let stack = ScopeStack::new();
        let v = Variable::new(Tensor::zeros(2, DType::F32), "v")?;
        let guard = StatelessScope::new()
            .with_override(&v, Tensor::full(2, 10.0, DType::F32))?
            .enter_on(&stack)?;
        v.assign_add_on(&Tensor::ones(2, DType::F32), &stack)?;
        v.assign_add_on(&Tensor::ones(2, DType::F32), &stack)?;
        let scope = guard.exit()?;
        assert_eq!(scope.updated_value(&v).unwrap().to_f64_vec(), vec![12.0, 12.0]);
        assert_eq!(v.read_on(&stack)?.to_f64_vec(), vec![0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_pending_variable_stays_pending_in_stateless_scope() -> Result<()> {
        let stack = ScopeStack::new();
        let guard = StatelessScope::new().enter_on(&stack)?;
        let p = Variable::builder(init::constant(3.0))
            .shape(1)
            .name("p")
            .build_on(&stack)?;
        assert_eq!(p.read_on(&stack)?.to_f64_vec(), vec![3.0]);
        assert!(p.is_pending());
        assert!(guard.get_current_value(&p).is_none());
        let scope = guard.exit()?;
        assert!(scope.is_pending(&p));
        assert!(p.is_pending());
        assert!(!p.is_initialized());
        Ok(())
    }

    #[test]
    fn test_concrete_value_deferred_under_stateless_scope() -> Result<()> {
        let stack = ScopeStack::new();
        let guard = StatelessScope::new().enter_on(&stack)?;
        let v = Variable::builder(Tensor::ones(2, DType::F32)).build_on(&stack)?;
        assert!(v.is_pending());
        assert!(v.materialize_on(&stack).is_err());
        drop(guard);
        v.materialize_on(&stack)?;
        assert_eq!(v.read_on(&stack)?.to_f64_vec(), vec![1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_initialize_all_variables() -> Result<()> {
        let guard = StatelessScope::new().enter()?;
        let a = Variable::builder(init::ones()).shape(2).build()?;
        let b = Variable::builder(init::zeros()).shape(3).build()?;
        assert!(initialize_all_variables().is_err());
        drop(guard);
        initialize_all_variables()?;
        assert!(a.is_initialized() && b.is_initialized());
        Ok(())
    }

    #[test]
    fn test_deferred_list_belongs_to_its_stack() -> Result<()> {
        let stack = ScopeStack::new();
        let guard = StatelessScope::new().enter_on(&stack)?;
        let p = Variable::builder(init::ones()).shape(2).build_on(&stack)?;
        assert!(initialize_all_variables_on(&stack).is_err());
        drop(guard);

        // the thread's own stack never saw `p`
        initialize_all_variables()?;
        assert!(p.is_pending());
        assert_eq!(stack.deferred_count(), 1);

        initialize_all_variables_on(&stack)?;
        assert!(p.is_initialized());
        assert_eq!(stack.deferred_count(), 0);
        Ok(())
    }

    #[test]
    fn test_repeated_stateless_reads_register_once() -> Result<()> {
        let stack = ScopeStack::new();
        let p = Variable::builder(init::ones()).shape(2).build_on(&stack)?;
        for _ in 0..1000 {
            let guard = StatelessScope::new().enter_on(&stack)?;
            p.read_on(&stack)?;
            guard.exit()?;
        }
        assert!(p.is_pending());
        assert_eq!(stack.deferred_count(), 1);
        Ok(())
    }

    #[test]
    fn test_dropped_variables_leave_deferred_list() -> Result<()> {
        let stack = ScopeStack::new();
        let guard = StatelessScope::new().enter_on(&stack)?;
        let kept = Variable::builder(init::ones()).shape(1).build_on(&stack)?;
        for _ in 0..10 {
            Variable::builder(init::zeros()).shape(1).build_on(&stack)?;
        }
        assert_eq!(stack.deferred_count(), 1);
        drop(guard);
        initialize_all_variables_on(&stack)?;
        assert!(kept.is_initialized());
        Ok(())
    }

    #[test]
    fn test_empty_variable_not_deferred() -> Result<()> {
        let stack = ScopeStack::new();
        let guard = StatelessScope::new().enter_on(&stack)?;
        let v = Variable::uninitialized(2, DType::F32).build_on(&stack)?;
        assert_eq!(stack.deferred_count(), 0);
        drop(guard);
        initialize_all_variables_on(&stack)?;
        assert!(!v.is_initialized());
        Ok(())
    }

    #[test]
    fn test_autocast_on_read_only() -> Result<()> {
        let stack = ScopeStack::new();
        let v = Variable::builder(Tensor::full(2, 0.1, DType::F32)).build_on(&stack)?;
        let frozen = Variable::builder(Tensor::full(2, 0.1, DType::F32))
            .autocast(false)
            .build_on(&stack)?;
        let counter = Variable::builder(Tensor::zeros(1, DType::I64)).build_on(&stack)?;

        let guard = stack.enter(Frame::Autocast(DType::F16))?;
        assert_eq!(v.read_on(&stack)?.dtype(), DType::F16);
        assert_eq!(frozen.read_on(&stack)?.dtype(), DType::F32);
        assert_eq!(counter.read_on(&stack)?.dtype(), DType::I64);
        v.assign_on(&Tensor::full(2, 0.2, DType::F16), &stack)?;
        drop(guard);

        let stored = v.read_on(&stack)?;
        assert_eq!(stored.dtype(), DType::F32);
        assert_eq!(stored.to_f64_vec()[0], DType::F16.quantize(0.2) as f32 as f64);
        Ok(())
    }

    #[test]
    fn test_clones_alias_state() -> Result<()> {
        let v = Variable::new(Tensor::zeros(1, DType::F32), "v")?;
        let alias = v.clone();
        alias.assign(&Tensor::ones(1, DType::F32))?;
        assert_eq!(v.read()?.to_f64_vec(), vec![1.0]);
        assert_eq!(v, alias);
        Ok(())
    }
}
