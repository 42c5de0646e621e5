//! # stoat-core
//!
//! Stateful variables and the scope machinery around them.
//!
//! This crate provides:
//! - [`Variable`] — named, shaped, mutable state with lazy initialization
//! - [`ScopeStack`] — per-thread stack of name, stateless, device, autocast
//!   and symbolic frames
//! - [`StatelessScope`] — runs stateful code functionally: reads come from
//!   overrides, writes are collected instead of applied
//! - [`SymbolicTensor`] — shape/dtype placeholder for static inference
//! - [`ops`] — operations that run eagerly or symbolically
//! - [`serialize`] — save/restore variables by path
// - DType: supported numeric types
// - Shape / SymbolicShape: concrete and partially-known shapes
// - Tensor: small host tensor used as the concrete variable value
// - config: process-wide floatx / compute dtype

pub mod config;
pub mod dtype;
pub mod error;
pub mod init;
pub mod ops;
pub mod scope;
pub mod serialize;
pub mod shape;
pub mod stateless;
pub mod symbolic;
pub mod tensor;
pub mod variable;

pub use config::Config;
pub use dtype::{DType, WithDType};
pub use error::{Error, Result};
pub use init::Initializer;
pub use ops::{Operand, Operation};
pub use scope::{
    autocast_scope, current_path, device_scope, in_stateless_scope, in_symbolic_scope,
    name_scope, symbolic_scope, with_name_scope, CallerId, Device, DeviceKind, Frame, NameScope,
    ScopeGuard, ScopeStack,
};
pub use serialize::{
    load_variables, load_variables_on, save_variables, save_variables_on, Serializable, StateDict,
    VariableRecord,
};
pub use shape::Shape;
pub use stateless::{add_loss, StatelessGuard, StatelessScope};
pub use symbolic::{SymDim, SymbolicShape, SymbolicTensor};
pub use tensor::{Tensor, TensorId};
pub use variable::{
    initialize_all_variables, initialize_all_variables_on, Aggregation, Synchronization, Variable,
    VariableBuilder, VariableId,
};
