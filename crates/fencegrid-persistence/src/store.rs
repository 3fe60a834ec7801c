//! Store: redb-backed persistence for FenceGrid.
//!
//! History shards are spread over `num_db_shards` physical databases:
//! shard `s` lives in database `s % num_db_shards`, domain rows and the
//! domain metadata counter live in database 0. Every guarded operation runs
//! inside one redb write transaction, which is the exclusive lock on the
//! rows it touches; the transaction either commits whole or not at all.

use std::path::Path;
use std::sync::Arc;

use fence_core::ShardId;
use fence_core::dynamicconfig::Collection;
use redb::{Database, ReadTransaction, ReadableDatabase, ReadableTable, WriteTransaction};
use tracing::{debug, warn};

use crate::context::OpContext;
use crate::error::{PersistenceError, PersistenceResult};
use crate::tables::*;

/// Convert any `Display` error into a `PersistenceError` variant via a
/// closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::PersistenceError::$variant(e.to_string())
    };
}
pub(crate) use map_err;

/// Database index that holds domain rows and the metadata counter.
const DEFAULT_DB_SHARD: usize = 0;

/// Thread-safe store handle. Cloning shares the underlying databases.
#[derive(Clone)]
pub struct Store {
    dbs: Arc<Vec<Database>>,
    dynamic: Collection,
}

impl Store {
    /// Open (or create) `num_db_shards` persistent databases under `dir`.
    pub fn open(dir: &Path, num_db_shards: u32) -> PersistenceResult<Self> {
        if num_db_shards == 0 {
            return Err(PersistenceError::InvalidArgument(
                "num_db_shards must be at least 1".to_string(),
            ));
        }
        std::fs::create_dir_all(dir).map_err(map_err!(Open))?;
        let dbs = (0..num_db_shards)
            .map(|i| {
                let path = dir.join(format!("fencegrid-{i}.redb"));
                Database::create(&path).map_err(map_err!(Open))
            })
            .collect::<PersistenceResult<Vec<_>>>()?;
        let store = Self::from_databases(dbs)?;
        debug!(?dir, num_db_shards, "store opened");
        Ok(store)
    }

    /// Create an ephemeral single-database store (for testing).
    pub fn open_in_memory() -> PersistenceResult<Self> {
        Self::open_in_memory_sharded(1)
    }

    /// Create an ephemeral store split over `num_db_shards` databases.
    pub fn open_in_memory_sharded(num_db_shards: u32) -> PersistenceResult<Self> {
        let dbs = (0..num_db_shards.max(1))
            .map(|_| {
                Database::builder()
                    .create_with_backend(redb::backends::InMemoryBackend::new())
                    .map_err(map_err!(Open))
            })
            .collect::<PersistenceResult<Vec<_>>>()?;
        let store = Self::from_databases(dbs)?;
        debug!(num_db_shards, "in-memory store opened");
        Ok(store)
    }

    /// Replace the dynamic config source (defaults to all-defaults).
    pub fn with_dynamic_config(mut self, dynamic: Collection) -> Self {
        self.dynamic = dynamic;
        self
    }

    pub fn dynamic_config(&self) -> &Collection {
        &self.dynamic
    }

    pub fn num_db_shards(&self) -> usize {
        self.dbs.len()
    }

    /// Physical database index holding the given history shard.
    pub fn db_shard_for(&self, shard_id: ShardId) -> usize {
        shard_id as usize % self.dbs.len()
    }

    fn from_databases(dbs: Vec<Database>) -> PersistenceResult<Self> {
        let store = Self {
            dbs: Arc::new(dbs),
            dynamic: Collection::nop(),
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Create all tables if they don't exist yet and seed the metadata row.
    fn ensure_tables(&self) -> PersistenceResult<()> {
        for (index, db) in self.dbs.iter().enumerate() {
            let txn = db.begin_write().map_err(map_err!(Transaction))?;
            // Opening a table in a write transaction creates it if absent.
            txn.open_table(SHARDS).map_err(map_err!(Table))?;
            txn.open_table(EXECUTIONS).map_err(map_err!(Table))?;
            txn.open_table(CURRENT_EXECUTIONS).map_err(map_err!(Table))?;
            if index == DEFAULT_DB_SHARD {
                txn.open_table(DOMAINS).map_err(map_err!(Table))?;
                txn.open_table(DOMAIN_NAMES).map_err(map_err!(Table))?;
                let mut meta = txn.open_table(DOMAIN_METADATA).map_err(map_err!(Table))?;
                let seeded = meta
                    .get(NOTIFICATION_VERSION_KEY)
                    .map_err(map_err!(Read))?
                    .is_some();
                if !seeded {
                    meta.insert(NOTIFICATION_VERSION_KEY, 0u64)
                        .map_err(map_err!(Write))?;
                }
            }
            txn.commit().map_err(map_err!(Transaction))?;
        }
        Ok(())
    }

    // ── Transactions ───────────────────────────────────────────────

    /// Run `op` inside one write transaction on the database owning
    /// `shard_id`.
    pub fn transact_shard<T>(
        &self,
        ctx: &OpContext,
        shard_id: ShardId,
        op: impl FnOnce(&Tx<'_>) -> PersistenceResult<T>,
    ) -> PersistenceResult<T> {
        self.transact(ctx, self.db_shard_for(shard_id), op)
    }

    /// Run `op` inside one write transaction on the domain database.
    pub fn transact_domain<T>(
        &self,
        ctx: &OpContext,
        op: impl FnOnce(&Tx<'_>) -> PersistenceResult<T>,
    ) -> PersistenceResult<T> {
        self.transact(ctx, DEFAULT_DB_SHARD, op)
    }

    fn transact<T>(
        &self,
        ctx: &OpContext,
        db_shard: usize,
        op: impl FnOnce(&Tx<'_>) -> PersistenceResult<T>,
    ) -> PersistenceResult<T> {
        ctx.check()?;
        let txn = self.dbs[db_shard]
            .begin_write()
            .map_err(map_err!(Transaction))?;

        let outcome = op(&Tx { txn: &txn }).and_then(|value| {
            // Last chance to observe cancellation; the commit is the
            // durability point.
            ctx.check()?;
            Ok(value)
        });

        match outcome {
            Ok(value) => {
                txn.commit().map_err(map_err!(Transaction))?;
                Ok(value)
            }
            Err(err) => {
                if let Err(abort_err) = txn.abort() {
                    warn!(error = %abort_err, "failed to abort transaction");
                }
                debug!(db_shard, error = %err, "transaction rolled back");
                Err(err)
            }
        }
    }

    pub(crate) fn begin_read_shard(&self, shard_id: ShardId) -> PersistenceResult<ReadTransaction> {
        self.dbs[self.db_shard_for(shard_id)]
            .begin_read()
            .map_err(map_err!(Transaction))
    }

    pub(crate) fn begin_read_domain(&self) -> PersistenceResult<ReadTransaction> {
        self.dbs[DEFAULT_DB_SHARD]
            .begin_read()
            .map_err(map_err!(Transaction))
    }
}

/// Handle to one open write transaction.
///
/// Methods mirror the storage driver's row operations. Reads made through
/// a `Tx` see the transaction's own writes and are serialized against every
/// other writer on the same database.
pub struct Tx<'a> {
    pub(crate) txn: &'a WriteTransaction,
}

pub(crate) fn encode<T: serde::Serialize>(value: &T) -> PersistenceResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> PersistenceResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}
