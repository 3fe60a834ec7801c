//! fencegrid-membership: who owns which history shard.
//!
//! A [`ServiceResolver`] maps a key (a shard id rendered as a string) to the
//! host that currently owns it, and tells listeners when the ring changes.
//! The [`ShardLeaseManager`] turns that ownership into persisted fencing
//! tokens: it bumps a shard's `range_id` only while the resolver names this
//! host, and drops the lease once ownership moves away.
//!
//! # Architecture
//!
//! ```text
//! Monitor (one per process)
//!   └── ServiceResolver per service ("history", ...)
//!       ├── lookup(key) → owning HostInfo (rendezvous hashing)
//!       └── listeners ← ChangedEvent on every membership change
//!
//! ShardLeaseManager
//!   ├── acquire(shard) → Store::acquire_shard when this host owns it
//!   └── on_membership_change → release shards owned elsewhere
//! ```

pub mod lease;
pub mod membership;
pub mod resolver;

pub use lease::{LeaseError, ShardLeaseManager};
pub use membership::{StaticMonitor, StaticResolver};
pub use resolver::{ChangedEvent, HostInfo, MembershipError, Monitor, ServiceResolver};
