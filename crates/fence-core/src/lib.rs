//! fence-core: shared types and the workflow operation-mode validator.
//!
//! Everything in this crate is free of I/O: record types, the decision
//! table that guards the current-execution pointer, and configuration.

pub mod config;
pub mod dynamicconfig;
pub mod types;
pub mod validator;

pub use config::FenceConfig;
pub use types::*;
pub use validator::{
    ConflictResolveMode, CreateMode, ModeRule, ModeStateError, Operation, Participant, StateSet,
    UpdateMode, Violation, mode_rule, validate_conflict_resolve, validate_create, validate_update,
};
