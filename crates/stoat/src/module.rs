// Module trait — The interface every stateful layer implements
//
// A layer is a plain struct that owns Variables. The trait only asks it to
// list them; everything else (counting, freezing, saving, loading) is
// derived from that list.
//
// Composite layers concatenate the variables of their children. Because
// every Variable carries the full scope path it was created under
// ("encoder/dense/kernel"), state dicts need no extra naming convention.

use stoat_core::error::Result;
use stoat_core::serialize::{self, StateDict};
use stoat_core::variable::Variable;

/// Something that owns variables.
///
/// # Example
/// ```ignore
/// struct Scale { factor: Variable }
///
/// impl Module for Scale {
///     fn name(&self) -> &str { "scale" }
///     fn variables(&self) -> Vec<Variable> { vec![self.factor.clone()] }
/// }
/// ```
pub trait Module {
    fn name(&self) -> &str;

    /// Every variable owned by this module and its children.
    fn variables(&self) -> Vec<Variable>;

    /// Variables an optimizer should update.
    fn trainable_variables(&self) -> Vec<Variable> {
        self.variables()
            .into_iter()
            .filter(Variable::trainable)
            .collect()
    }

    fn non_trainable_variables(&self) -> Vec<Variable> {
        self.variables()
            .into_iter()
            .filter(|v| !v.trainable())
            .collect()
    }

    /// Total number of scalar parameters.
    fn num_parameters(&self) -> usize {
        self.variables().iter().map(Variable::elem_count).sum()
    }

    fn trainable_params_count(&self) -> usize {
        self.trainable_variables()
            .iter()
            .map(Variable::elem_count)
            .sum()
    }

    /// Mark every variable as frozen (or unfrozen).
    fn set_trainable(&self, trainable: bool) {
        for v in self.variables() {
            v.set_trainable(trainable);
        }
    }

    fn state_dict(&self) -> Result<StateDict> {
        serialize::save_variables(&self.variables())
    }

    fn load_state_dict(&self, dict: &StateDict) -> Result<()> {
        serialize::load_variables(&self.variables(), dict)
    }
}
