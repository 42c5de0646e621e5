//! # Stoat
//!
//! Stateful variables that can be replayed statelessly.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use stoat::prelude::*;
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `stoat-core` | Variable, scope stack, stateless scope, symbolic tensors, ops, serialization |
//! | `stoat` | Facade: `Module` trait, `stateless_call`, prelude |
//!
//! ## Modules
//!
//! - [`module`] — `Module` trait for layers that own variables
//! - [`functional`] — `stateless_call` and `StatelessOutput`
//! - [`ops`] — eager/symbolic operation dispatch
//! - [`init`] — variable initializers
//! - [`config`] — floatx and compute dtype

/// Re-export core types.
pub use stoat_core::{
    add_loss, autocast_scope, current_path, device_scope, in_stateless_scope, in_symbolic_scope,
    initialize_all_variables, initialize_all_variables_on, load_variables, load_variables_on,
    name_scope, save_variables, save_variables_on, symbolic_scope, with_name_scope, Aggregation, CallerId, Config, DType, Device, DeviceKind, Error, Frame,
    Initializer, NameScope, Operand, Operation, Result, ScopeGuard, ScopeStack, Serializable,
    Shape, StateDict, StatelessGuard, StatelessScope, SymDim, SymbolicShape, SymbolicTensor,
    Synchronization, Tensor, Variable, VariableBuilder, VariableId, VariableRecord, WithDType,
};

pub use stoat_core::{config, init, ops};

/// Module trait for layers that own variables.
pub mod module;

/// Functional replay of stateful code.
pub mod functional;

pub use functional::{stateless_call, StatelessOutput};
pub use module::Module;

/// Convenience prelude: `use stoat::prelude::*;`
pub mod prelude {
    pub use crate::functional::{stateless_call, StatelessOutput};
    pub use crate::module::Module;
    pub use stoat_core::init;
    pub use stoat_core::ops;
    pub use stoat_core::{
        autocast_scope, name_scope, symbolic_scope, DType, Error, NameScope, Operand, Result,
        Shape, StatelessScope, SymbolicTensor, Tensor, Variable,
    };
}
