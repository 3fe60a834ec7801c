//! fencegrid-persistence: fenced, transactional storage for FenceGrid.
//!
//! Backed by [redb](https://docs.rs/redb). Every guarded write runs inside
//! one write transaction that first checks the caller still owns its
//! history shard (`range_id` fencing), then asks the operation-mode
//! validator whether the workflow states it is about to persist are legal,
//! and only then touches rows.
//!
//! # Architecture
//!
//! Records are JSON-serialized into redb's `&[u8]` value columns. Execution
//! tables are keyed by `(shard_id, domain_id, workflow_id[, run_id])`
//! tuples so a shard's rows sort together.
//!
//! The `Store` is `Clone` + `Send` + `Sync` (backed by `Arc<Vec<Database>>`)
//! and can be shared across async tasks.

pub mod context;
pub mod domain;
pub mod error;
pub mod execution;
pub mod shard;
pub mod store;
pub mod tables;

pub use context::OpContext;
pub use domain::{DomainFilter, DomainKey};
pub use error::{PersistenceError, PersistenceResult};
pub use execution::{
    ConflictResolveExecutionRequest, CreateExecutionRequest, PreviousRun, UpdateExecutionRequest,
    WriteOutcome,
};
pub use store::{Store, Tx};
