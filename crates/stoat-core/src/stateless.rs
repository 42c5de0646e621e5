// StatelessScope — functional replay of stateful computation
//
// Inside a stateless scope no Variable's storage is touched:
//
//   read   → override value, or the scope's latest collected update, or the
//            variable's own storage / initializer output (storage untouched)
//   assign → recorded in `updates`, storage untouched
//   create → the new variable stays pending; its initializer is not run
//
// The caller supplies the overrides on entry and takes the collected updates
// back with `StatelessGuard::exit`. Dropping the guard instead discards them.
//
// Only one stateless scope may be live per stack (Error::NestedScope): a
// nested one would make it ambiguous which scope an update belongs to.
//
// Example:
//
//   let guard = StatelessScope::new().with_override(&w, w_new)?.enter()?;
//   let y = w.read()?.mul(&x)?;          // reads w_new
//   w.assign_add(&delta)?;               // recorded, w untouched
//   let scope = guard.exit()?;
//   let w_next = scope.updated_value(&w);

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::scope::{Frame, ScopeGuard, ScopeStack};
use crate::tensor::Tensor;
use crate::variable::{initialize_all_variables_on, Variable, VariableId};

/// Side table of variable values for one stateless execution.
#[derive(Debug, Default)]
pub struct StatelessScope {
    overrides: BTreeMap<VariableId, Tensor>,
    updates: BTreeMap<VariableId, Tensor>,
    pending: BTreeSet<VariableId>,
    collect_losses: bool,
    losses: Vec<Tensor>,
    initialize_variables: bool,
}

impl StatelessScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Substitute `value` for `var` while the scope is live.
    ///
    /// The value must have the variable's shape; it is cast to its dtype.
    pub fn with_override(mut self, var: &Variable, value: Tensor) -> Result<Self> {
        if value.shape() != var.shape() {
            return Err(Error::ShapeMismatch {
                expected: var.shape().clone(),
                got: value.shape().clone(),
            });
        }
        self.overrides.insert(var.id(), value.to_dtype(var.dtype()));
        Ok(self)
    }

    /// Add several overrides at once.
    pub fn with_overrides<'a>(
        self,
        overrides: impl IntoIterator<Item = (&'a Variable, Tensor)>,
    ) -> Result<Self> {
        overrides
            .into_iter()
            .try_fold(self, |scope, (var, value)| scope.with_override(var, value))
    }

    /// Keep losses reported through [`add_loss`](Self::add_loss).
    pub fn with_collect_losses(mut self, collect: bool) -> Self {
        self.collect_losses = collect;
        self
    }

    /// Materialize pending variables when the scope exits.
    pub fn with_initialize_variables(mut self, initialize: bool) -> Self {
        self.initialize_variables = initialize;
        self
    }

    /// Value the scope holds for `var`: the latest collected update wins over
    /// the entry override. `None` means "fall back to the variable itself".
    pub fn get_current_value(&self, var: &Variable) -> Option<Tensor> {
        let id = var.id();
        self.updates
            .get(&id)
            .or_else(|| self.overrides.get(&id))
            .cloned()
    }

    /// Record a write. Never touches the variable's storage.
    pub fn add_update(&mut self, var: &Variable, value: Tensor) {
        self.updates.insert(var.id(), value);
    }

    /// Note that a pending variable was met here and must stay pending.
    pub fn register_uninitialized_variable(&mut self, var: &Variable) {
        self.pending.insert(var.id());
    }

    pub fn add_loss(&mut self, loss: Tensor) {
        if self.collect_losses {
            self.losses.push(loss);
        }
    }

    pub fn updates(&self) -> &BTreeMap<VariableId, Tensor> {
        &self.updates
    }

    /// The collected update for `var`, if it was written in this scope.
    pub fn updated_value(&self, var: &Variable) -> Option<&Tensor> {
        self.updates.get(&var.id())
    }

    pub fn into_updates(self) -> BTreeMap<VariableId, Tensor> {
        self.updates
    }

    pub fn losses(&self) -> &[Tensor] {
        &self.losses
    }

    pub fn is_pending(&self, var: &Variable) -> bool {
        self.pending.contains(&var.id())
    }

    pub fn pending(&self) -> &BTreeSet<VariableId> {
        &self.pending
    }

    /// Push this scope on the current thread's stack.
    pub fn enter(self) -> Result<StatelessGuard> {
        self.enter_on(&ScopeStack::current())
    }

    /// Push this scope on an explicit stack.
    pub fn enter_on(self, stack: &ScopeStack) -> Result<StatelessGuard> {
        let initialize_variables = self.initialize_variables;
        let guard = stack.enter(Frame::Stateless(self))?;
        Ok(StatelessGuard {
            guard: Some(guard),
            initialize_variables,
        })
    }
}

/// Keeps a [`StatelessScope`] live on its stack.
#[derive(Debug)]
#[must_use = "the stateless scope is exited as soon as the guard is dropped"]
pub struct StatelessGuard {
    guard: Option<ScopeGuard>,
    initialize_variables: bool,
}

impl StatelessGuard {
    fn stack(&self) -> Option<&ScopeStack> {
        self.guard.as_ref().map(ScopeGuard::stack)
    }

    /// See [`StatelessScope::get_current_value`].
    pub fn get_current_value(&self, var: &Variable) -> Option<Tensor> {
        self.stack()?
            .with_stateless(|s| s.get_current_value(var))
            .flatten()
    }

    /// See [`StatelessScope::add_loss`].
    pub fn add_loss(&self, loss: Tensor) {
        if let Some(stack) = self.stack() {
            stack.with_stateless(|s| s.add_loss(loss));
        }
    }

    /// Pop the scope and hand back everything it collected.
    pub fn exit(mut self) -> Result<StatelessScope> {
        let stack = self.stack().cloned();
        let frame = self.guard.take().and_then(ScopeGuard::exit);
        let scope = match frame {
            Some(Frame::Stateless(scope)) => scope,
            _ => {
                return Err(Error::InvalidState(
                    "stateless scope was already released by an outer scope exit".into(),
                ))
            }
        };
        if let Some(stack) = stack.filter(|_| self.initialize_variables) {
            initialize_all_variables_on(&stack)?;
        }
        Ok(scope)
    }
}

impl Drop for StatelessGuard {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let stack = guard.stack().clone();
        drop(guard);
        if self.initialize_variables && !std::thread::panicking() {
            if let Err(err) = initialize_all_variables_on(&stack) {
                tracing::warn!(%err, "failed to initialize pending variables on scope exit");
            }
        }
    }
}

/// Report a loss to the stateless scope live on this thread, if any.
/// Returns false when there is no such scope.
pub fn add_loss(loss: Tensor) -> bool {
    ScopeStack::current()
        .with_stateless(|s| s.add_loss(loss))
        .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::init;

    #[test]
    fn test_override_then_update_precedence() -> Result<()> {
        let v = Variable::new(Tensor::zeros(2, DType::F32), "v")?;
        let x = Tensor::full(2, 3.0, DType::F32);
        let y = Tensor::full(2, 7.0, DType::F32);

        let mut scope = StatelessScope::new().with_override(&v, x.clone())?;
        assert!(scope.get_current_value(&v).unwrap().allclose(&x, 0.0));
        scope.add_update(&v, y.clone());
        assert!(scope.get_current_value(&v).unwrap().allclose(&y, 0.0));
        Ok(())
    }

    #[test]
    fn test_override_shape_checked_and_cast() -> Result<()> {
        let v = Variable::new(Tensor::zeros((2, 2), DType::F32), "v")?;
        let bad = StatelessScope::new().with_override(&v, Tensor::zeros(3, DType::F32));
        assert!(matches!(bad, Err(Error::ShapeMismatch { .. })));

        let scope = StatelessScope::new().with_override(&v, Tensor::ones((2, 2), DType::F64))?;
        assert_eq!(scope.get_current_value(&v).unwrap().dtype(), DType::F32);
        Ok(())
    }

    #[test]
    fn test_second_scope_is_rejected() -> Result<()> {
        let stack = ScopeStack::new();
        let _outer = StatelessScope::new().enter_on(&stack)?;
        let err = StatelessScope::new().enter_on(&stack).unwrap_err();
        assert!(matches!(err, Error::NestedScope { kind: "stateless" }));
        Ok(())
    }

    #[test]
    fn test_losses_only_when_collecting() -> Result<()> {
        let stack = ScopeStack::new();
        let guard = StatelessScope::new().enter_on(&stack)?;
        guard.add_loss(Tensor::scalar(1.0, DType::F32));
        assert!(guard.exit()?.losses().is_empty());

        let guard = StatelessScope::new()
            .with_collect_losses(true)
            .enter_on(&stack)?;
        guard.add_loss(Tensor::scalar(1.0, DType::F32));
        assert_eq!(guard.exit()?.losses().len(), 1);
        Ok(())
    }

    #[test]
    fn test_initialize_variables_on_exit() -> Result<()> {
        let guard = StatelessScope::new()
            .with_initialize_variables(true)
            .enter()?;
        let p = Variable::builder(init::ones()).shape(3).name("p").build()?;
        assert!(!p.is_initialized());
        guard.exit()?;
        assert!(p.is_initialized());
        Ok(())
    }

    #[test]
    fn test_initialize_variables_uses_own_stack() -> Result<()> {
        let stack = ScopeStack::new();
        let guard = StatelessScope::new()
            .with_initialize_variables(true)
            .enter_on(&stack)?;
        let p = Variable::builder(init::ones()).shape(3).build_on(&stack)?;
        guard.exit()?;
        assert!(p.is_initialized());

        let guard = StatelessScope::new()
            .with_initialize_variables(true)
            .enter_on(&stack)?;
        let q = Variable::builder(init::zeros()).shape(1).build_on(&stack)?;
        drop(guard);
        assert!(q.is_initialized());
        assert_eq!(stack.deferred_count(), 0);
        Ok(())
    }

    #[test]
    fn test_dropped_guard_discards_updates() -> Result<()> {
        let stack = ScopeStack::new();
        let v = Variable::new(Tensor::zeros(1, DType::F32), "v")?;
        {
            let _guard = StatelessScope::new().enter_on(&stack)?;
            v.assign_on(&Tensor::ones(1, DType::F32), &stack)?;
        }
        assert_eq!(stack.depth(), 0);
        assert_eq!(v.read_on(&stack)?.to_f64_vec(), vec![0.0]);
        Ok(())
    }
}
