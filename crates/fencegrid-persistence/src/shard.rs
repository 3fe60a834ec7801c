//! Fencing token store.
//!
//! Each history shard row carries a `range_id` that only ever grows. A host
//! proves it still owns a shard by presenting the `range_id` it acquired;
//! the comparison runs inside the same write transaction as the guarded
//! write, so a stale owner can never interleave a write after a newer owner
//! took over.

use fence_core::{RangeId, ShardId, ShardRecord};
use redb::ReadableTable;
use tracing::{debug, info, warn};

use crate::context::OpContext;
use crate::error::{PersistenceError, PersistenceResult};
use crate::store::{Store, Tx, decode, encode, map_err};
use crate::tables::SHARDS;

impl Tx<'_> {
    /// Insert a new shard row. Fails with `AlreadyExists` if present.
    pub fn insert_shard(&self, row: &ShardRecord) -> PersistenceResult<()> {
        let value = encode(row)?;
        let mut table = self.txn.open_table(SHARDS).map_err(map_err!(Table))?;
        if table.get(row.shard_id).map_err(map_err!(Read))?.is_some() {
            return Err(PersistenceError::already_exists(format!(
                "shard {}",
                row.shard_id
            )));
        }
        table
            .insert(row.shard_id, value.as_slice())
            .map_err(map_err!(Write))?;
        debug!(shard_id = row.shard_id, range_id = row.range_id, "shard inserted");
        Ok(())
    }

    /// Read a shard row.
    pub fn select_shard(&self, shard_id: ShardId) -> PersistenceResult<ShardRecord> {
        let table = self.txn.open_table(SHARDS).map_err(map_err!(Table))?;
        let row = match table.get(shard_id).map_err(map_err!(Read))? {
            Some(guard) => decode(guard.value())?,
            None => return Err(PersistenceError::NotFound(format!("shard {shard_id}"))),
        };
        Ok(row)
    }

    /// Overwrite an existing shard row without any token comparison.
    /// Callers lock and compare first.
    pub fn update_shard(&self, row: &ShardRecord) -> PersistenceResult<()> {
        let value = encode(row)?;
        let mut table = self.txn.open_table(SHARDS).map_err(map_err!(Table))?;
        if table.get(row.shard_id).map_err(map_err!(Read))?.is_none() {
            return Err(PersistenceError::NotFound(format!("shard {}", row.shard_id)));
        }
        table
            .insert(row.shard_id, value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    /// Shared lock: observe the stored `range_id` for a compare-before-write.
    pub fn read_lock_shard(&self, shard_id: ShardId) -> PersistenceResult<RangeId> {
        Ok(self.select_shard(shard_id)?.range_id)
    }

    /// Exclusive lock: read the `range_id` ahead of an ownership transfer.
    ///
    /// redb admits a single writer per database, so holding this `Tx`
    /// already excludes every other writer of the row.
    pub fn write_lock_shard(&self, shard_id: ShardId) -> PersistenceResult<RangeId> {
        Ok(self.select_shard(shard_id)?.range_id)
    }

    /// Fail with `Fenced` unless the stored token equals `expected`.
    pub fn assert_shard_owner(&self, shard_id: ShardId, expected: RangeId) -> PersistenceResult<()> {
        let actual = self.read_lock_shard(shard_id)?;
        if actual != expected {
            warn!(shard_id, expected, actual, "shard ownership lost");
            return Err(PersistenceError::Fenced {
                shard_id,
                expected,
                actual,
            });
        }
        Ok(())
    }
}

impl Store {
    /// Bootstrap shard rows `0..count` at `range_id` 0, skipping rows that
    /// already exist. Returns how many rows were created.
    pub fn create_shards(&self, ctx: &OpContext, count: u32) -> PersistenceResult<u32> {
        let mut created = 0;
        for shard_id in 0..count {
            let inserted = self.transact_shard(ctx, shard_id, |tx| {
                match tx.insert_shard(&ShardRecord::bootstrap(shard_id)) {
                    Ok(()) => Ok(true),
                    Err(PersistenceError::AlreadyExists { .. }) => Ok(false),
                    Err(e) => Err(e),
                }
            })?;
            if inserted {
                created += 1;
            }
        }
        info!(count, created, "shards bootstrapped");
        Ok(created)
    }

    /// Non-locking read of a shard row.
    pub fn get_shard(&self, shard_id: ShardId) -> PersistenceResult<ShardRecord> {
        let txn = self.begin_read_shard(shard_id)?;
        let table = txn.open_table(SHARDS).map_err(map_err!(Table))?;
        match table.get(shard_id).map_err(map_err!(Read))? {
            Some(guard) => decode(guard.value()),
            None => Err(PersistenceError::NotFound(format!("shard {shard_id}"))),
        }
    }

    /// Take ownership of a shard: exclusively lock the row, advance its
    /// `range_id` by one, and return the new record. A missing row is
    /// created at `range_id` 1.
    pub fn acquire_shard(&self, ctx: &OpContext, shard_id: ShardId) -> PersistenceResult<ShardRecord> {
        let record = self.transact_shard(ctx, shard_id, |tx| {
            match tx.write_lock_shard(shard_id) {
                Ok(_) => {
                    let mut row = tx.select_shard(shard_id)?;
                    row.range_id += 1;
                    tx.update_shard(&row)?;
                    Ok(row)
                }
                Err(PersistenceError::NotFound(_)) => {
                    let row = ShardRecord {
                        range_id: 1,
                        ..ShardRecord::bootstrap(shard_id)
                    };
                    tx.insert_shard(&row)?;
                    Ok(row)
                }
                Err(e) => Err(e),
            }
        })?;
        info!(shard_id, range_id = record.range_id, "shard acquired");
        Ok(record)
    }

    /// Persist a shard checkpoint or ownership change, provided the stored
    /// token still equals `previous_range_id`. The new token may not go
    /// backwards.
    pub fn update_shard(
        &self,
        ctx: &OpContext,
        row: &ShardRecord,
        previous_range_id: RangeId,
    ) -> PersistenceResult<()> {
        if row.range_id < previous_range_id {
            return Err(PersistenceError::InvalidArgument(format!(
                "shard {} range id would move backwards from {} to {}",
                row.shard_id, previous_range_id, row.range_id
            )));
        }
        self.transact_shard(ctx, row.shard_id, |tx| {
            let actual = tx.write_lock_shard(row.shard_id)?;
            if actual != previous_range_id {
                warn!(
                    shard_id = row.shard_id,
                    expected = previous_range_id,
                    actual,
                    "shard update fenced"
                );
                return Err(PersistenceError::Fenced {
                    shard_id: row.shard_id,
                    expected: previous_range_id,
                    actual,
                });
            }
            tx.update_shard(row)
        })?;
        debug!(shard_id = row.shard_id, range_id = row.range_id, "shard updated");
        Ok(())
    }

    /// `acquireOrVerify` for callers that only need the check: succeed iff
    /// the stored token equals `range_id`.
    pub fn verify_shard_owner(
        &self,
        ctx: &OpContext,
        shard_id: ShardId,
        range_id: RangeId,
    ) -> PersistenceResult<()> {
        self.transact_shard(ctx, shard_id, |tx| tx.assert_shard_owner(shard_id, range_id))
    }
}
