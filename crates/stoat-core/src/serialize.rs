// Serialize — Capturing and restoring variable state
//
// Variables are saved and restored by path. A StateDict is an ordered map
// path → VariableRecord, so two dicts built from the same variables compare
// and iterate identically regardless of creation order.
//
// Only metadata goes into the JSON manifest (path, dtype, shape); the values
// stay in memory. Writing them to disk is left to whichever container format
// the caller prefers.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::scope::ScopeStack;
use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::variable::Variable;

/// Saved state of one variable.
#[derive(Debug, Clone)]
pub struct VariableRecord {
    pub path: String,
    pub dtype: DType,
    pub shape: Shape,
    pub value: Tensor,
}

/// Something whose state can be captured and put back.
///
/// The `_on` forms take an explicit scope stack; the plain forms use the
/// current thread's.
pub trait Serializable {
    fn describe_on(&self, stack: &ScopeStack) -> Result<VariableRecord>;
    fn restore_on(&self, value: &Tensor, stack: &ScopeStack) -> Result<()>;

    fn describe(&self) -> Result<VariableRecord> {
        self.describe_on(&ScopeStack::current())
    }

    fn restore(&self, value: &Tensor) -> Result<()> {
        self.restore_on(value, &ScopeStack::current())
    }
}

impl Serializable for Variable {
    /// Captures storage. Scope overrides and autocast are not applied.
    ///
    /// A pending initializer is run first, which fails inside a stateless
    /// scope; initialized variables can be described anywhere.
    fn describe_on(&self, stack: &ScopeStack) -> Result<VariableRecord> {
        let value = match self.stored_value() {
            Some(value) => value,
            None => {
                self.materialize_on(stack)?;
                self.stored_value().ok_or_else(|| Error::Uninitialized {
                    path: self.path().to_string(),
                })?
            }
        };
        Ok(VariableRecord {
            path: self.path().to_string(),
            dtype: self.dtype(),
            shape: self.shape().clone(),
            value,
        })
    }

    fn restore_on(&self, value: &Tensor, stack: &ScopeStack) -> Result<()> {
        self.assign_on(value, stack)
    }
}

/// Records keyed by variable path.
#[derive(Debug, Clone, Default)]
pub struct StateDict {
    records: BTreeMap<String, VariableRecord>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: VariableRecord) -> Option<VariableRecord> {
        self.records.insert(record.path.clone(), record)
    }

    pub fn get(&self, path: &str) -> Option<&VariableRecord> {
        self.records.get(path)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &VariableRecord> {
        self.records.values()
    }

    /// Metadata of every record:
    /// `{"variables": [{"path", "dtype", "shape"}, ...]}` in path order.
    pub fn manifest(&self) -> Value {
        let variables: Vec<Value> = self
            .records
            .values()
            .map(|r| {
                json!({
                    "path": r.path,
                    "dtype": r.dtype.to_string(),
                    "shape": r.shape.dims(),
                })
            })
            .collect();
        json!({ "variables": variables })
    }
}

/// Capture every variable. A repeated path keeps the last variable seen.
pub fn save_variables<'a, S>(variables: impl IntoIterator<Item = &'a S>) -> Result<StateDict>
where
    S: Serializable + 'a,
{
    save_variables_on(variables, &ScopeStack::current())
}

pub fn save_variables_on<'a, S>(
    variables: impl IntoIterator<Item = &'a S>,
    stack: &ScopeStack,
) -> Result<StateDict>
where
    S: Serializable + 'a,
{
    let mut dict = StateDict::new();
    for var in variables {
        let record = var.describe_on(stack)?;
        if let Some(prev) = dict.insert(record) {
            tracing::warn!(path = %prev.path, "duplicate variable path in state dict");
        }
    }
    tracing::debug!(count = dict.len(), "saved variables");
    Ok(dict)
}

/// Restore every variable from `dict` by path.
///
/// All paths are checked before anything is written, so a missing entry
/// leaves every variable untouched.
pub fn load_variables(variables: &[Variable], dict: &StateDict) -> Result<()> {
    load_variables_on(variables, dict, &ScopeStack::current())
}

pub fn load_variables_on(variables: &[Variable], dict: &StateDict, stack: &ScopeStack) -> Result<()> {
    let mut plan = Vec::with_capacity(variables.len());
    for var in variables {
        let record = dict.get(var.path()).ok_or_else(|| Error::MissingEntry {
            path: var.path().to_string(),
        })?;
        if &record.shape != var.shape() {
            return Err(Error::ShapeMismatch {
                expected: var.shape().clone(),
                got: record.shape.clone(),
            });
        }
        plan.push((var, &record.value));
    }
    for (var, value) in plan {
        var.restore_on(value, stack)?;
    }
    tracing::debug!(count = variables.len(), "loaded variables");
    Ok(())
}
