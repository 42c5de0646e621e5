// Functional replay — run stateful code as a pure function of variable values
//
// stateless_call turns "read variables, compute, write variables" into
//
//   (values_in) → (output, values_out, losses)
//
// without touching any variable's storage. This is what a training step
// needs when it wants to evaluate candidate weights, or when the same layer
// runs against several sets of parameters.
//
//   let out = stateless_call(&layer.variables(), &candidates, || layer.forward(&x))?;
//   // out.updates[i] is the value variables[i] would hold after the call
//   out.apply()?;   // commit them for real, if wanted

use stoat_core::error::{Error, Result};
use stoat_core::stateless::StatelessScope;
use stoat_core::tensor::Tensor;
use stoat_core::variable::Variable;

/// Result of [`stateless_call`].
#[derive(Debug)]
pub struct StatelessOutput<T> {
    pub output: T,
    /// Post-call value of each supplied variable, in the order supplied.
    pub updates: Vec<Tensor>,
    /// Losses reported through `stoat::add_loss` during the call.
    pub losses: Vec<Tensor>,
    variables: Vec<Variable>,
}

impl<T> StatelessOutput<T> {
    /// Assign every update to its variable.
    pub fn apply(&self) -> Result<()> {
        for (var, value) in self.variables.iter().zip(&self.updates) {
            var.assign(value)?;
        }
        Ok(())
    }

    pub fn into_output(self) -> T {
        self.output
    }
}

/// Run `f` with `variables[i]` reading as `values[i]`.
///
/// Writes made by `f` are collected, not applied. If `f` fails the scope is
/// released and nothing is kept.
pub fn stateless_call<T>(
    variables: &[Variable],
    values: &[Tensor],
    f: impl FnOnce() -> Result<T>,
) -> Result<StatelessOutput<T>> {
    if variables.len() != values.len() {
        return Err(Error::msg(format!(
            "stateless_call got {} variables but {} values",
            variables.len(),
            values.len()
        )));
    }
    let guard = StatelessScope::new()
        .with_overrides(variables.iter().zip(values.iter().cloned()))?
        .with_collect_losses(true)
        .enter()?;
    let output = f()?;
    let scope = guard.exit()?;

    let updates = variables
        .iter()
        .zip(values)
        .map(|(var, supplied)| {
            scope
                .updated_value(var)
                .cloned()
                .unwrap_or_else(|| supplied.to_dtype(var.dtype()))
        })
        .collect();
    tracing::debug!(
        variables = variables.len(),
        updated = scope.updates().len(),
        "stateless call finished"
    );
    Ok(StatelessOutput {
        output,
        updates,
        losses: scope.losses().to_vec(),
        variables: variables.to_vec(),
    })
}
