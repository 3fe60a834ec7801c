//! redb table definitions for the FenceGrid store.
//!
//! Structured values are JSON in `&[u8]` columns. Execution tables use
//! tuple keys led by the shard id so one shard's rows stay contiguous.

use redb::TableDefinition;

/// Shard ownership rows keyed by shard id.
pub const SHARDS: TableDefinition<u32, &[u8]> = TableDefinition::new("shards");

/// Domain rows keyed by domain id.
pub const DOMAINS: TableDefinition<&str, &[u8]> = TableDefinition::new("domains");

/// Unique secondary index: domain name -> domain id.
pub const DOMAIN_NAMES: TableDefinition<&str, &str> = TableDefinition::new("domain_names");

/// Singleton domain metadata counter.
pub const DOMAIN_METADATA: TableDefinition<&str, u64> = TableDefinition::new("domain_metadata");

/// Key of the single row in [`DOMAIN_METADATA`].
pub const NOTIFICATION_VERSION_KEY: &str = "notification_version";

/// Execution rows keyed by `(shard_id, domain_id, workflow_id, run_id)`.
pub const EXECUTIONS: TableDefinition<(u32, &str, &str, &str), &[u8]> =
    TableDefinition::new("executions");

/// Current-execution pointers keyed by `(shard_id, domain_id, workflow_id)`.
pub const CURRENT_EXECUTIONS: TableDefinition<(u32, &str, &str), &[u8]> =
    TableDefinition::new("current_executions");
