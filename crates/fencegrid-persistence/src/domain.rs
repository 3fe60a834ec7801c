//! Domain rows and the domain metadata versioner.
//!
//! Domain configuration changes are broadcast cluster-wide in
//! `notification_version` order. A mutation that listeners must observe
//! locks the counter, writes its domain row, and advances the counter by
//! exactly one, all in one transaction on the domain database.

use std::ops::Bound;

use fence_core::dynamicconfig::{Filters, Key};
use fence_core::{DomainRecord, NotificationVersion};
use redb::ReadableTable;
use tracing::{debug, info, warn};

use crate::context::OpContext;
use crate::error::{PersistenceError, PersistenceResult};
use crate::store::{Store, Tx, decode, encode, map_err};
use crate::tables::{DOMAIN_METADATA, DOMAIN_NAMES, DOMAINS, NOTIFICATION_VERSION_KEY};

/// Unique lookup key of a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainKey {
    Id(String),
    Name(String),
}

impl std::fmt::Display for DomainKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DomainKey::Id(id) => write!(f, "domain id {id}"),
            DomainKey::Name(name) => write!(f, "domain name {name}"),
        }
    }
}

/// Selection over the domains table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainFilter {
    Key(DomainKey),
    /// Up to `page_size` rows ordered by id, strictly after
    /// `greater_than_id` when given.
    Page {
        page_size: usize,
        greater_than_id: Option<String>,
    },
}

impl Tx<'_> {
    /// Insert a domain row. Both the id and the name must be unused.
    pub fn insert_domain(&self, row: &DomainRecord) -> PersistenceResult<()> {
        let value = encode(row)?;
        let mut domains = self.txn.open_table(DOMAINS).map_err(map_err!(Table))?;
        let mut names = self.txn.open_table(DOMAIN_NAMES).map_err(map_err!(Table))?;

        if domains.get(row.id.as_str()).map_err(map_err!(Read))?.is_some() {
            return Err(PersistenceError::already_exists(format!("domain id {}", row.id)));
        }
        if names.get(row.name.as_str()).map_err(map_err!(Read))?.is_some() {
            return Err(PersistenceError::already_exists(format!(
                "domain name {}",
                row.name
            )));
        }
        domains
            .insert(row.id.as_str(), value.as_slice())
            .map_err(map_err!(Write))?;
        names
            .insert(row.name.as_str(), row.id.as_str())
            .map_err(map_err!(Write))?;
        debug!(id = %row.id, name = %row.name, "domain inserted");
        Ok(())
    }

    /// Replace the domain row with the same id. A rename keeps the name
    /// index unique.
    pub fn update_domain(&self, row: &DomainRecord) -> PersistenceResult<()> {
        let value = encode(row)?;
        let mut domains = self.txn.open_table(DOMAINS).map_err(map_err!(Table))?;
        let mut names = self.txn.open_table(DOMAIN_NAMES).map_err(map_err!(Table))?;

        let existing: DomainRecord = match domains.get(row.id.as_str()).map_err(map_err!(Read))? {
            Some(guard) => decode(guard.value())?,
            None => return Err(PersistenceError::NotFound(format!("domain id {}", row.id))),
        };

        if existing.name != row.name {
            let taken = names
                .get(row.name.as_str())
                .map_err(map_err!(Read))?
                .is_some();
            if taken {
                return Err(PersistenceError::already_exists(format!(
                    "domain name {}",
                    row.name
                )));
            }
            names
                .remove(existing.name.as_str())
                .map_err(map_err!(Write))?;
            names
                .insert(row.name.as_str(), row.id.as_str())
                .map_err(map_err!(Write))?;
        }
        domains
            .insert(row.id.as_str(), value.as_slice())
            .map_err(map_err!(Write))?;
        debug!(id = %row.id, name = %row.name, "domain updated");
        Ok(())
    }

    /// Read one domain by key, or a page of domains.
    pub fn select_domain(&self, filter: &DomainFilter) -> PersistenceResult<Vec<DomainRecord>> {
        let domains = self.txn.open_table(DOMAINS).map_err(map_err!(Table))?;
        let names = self.txn.open_table(DOMAIN_NAMES).map_err(map_err!(Table))?;
        select_from(&domains, &names, filter)
    }

    /// Delete a domain by id or name. Returns whether it existed.
    pub fn delete_domain(&self, key: &DomainKey) -> PersistenceResult<bool> {
        let mut domains = self.txn.open_table(DOMAINS).map_err(map_err!(Table))?;
        let mut names = self.txn.open_table(DOMAIN_NAMES).map_err(map_err!(Table))?;

        let id = match key {
            DomainKey::Id(id) => id.clone(),
            DomainKey::Name(name) => match names.get(name.as_str()).map_err(map_err!(Read))? {
                Some(guard) => guard.value().to_string(),
                None => return Ok(false),
            },
        };
        let removed = domains.remove(id.as_str()).map_err(map_err!(Write))?;
        let row: DomainRecord = match removed {
            Some(guard) => decode(guard.value())?,
            None => return Ok(false),
        };
        names.remove(row.name.as_str()).map_err(map_err!(Write))?;
        debug!(id = %row.id, name = %row.name, "domain deleted");
        Ok(true)
    }

    /// Exclusive lock on the metadata counter; returns its value.
    pub fn lock_domain_metadata(&self) -> PersistenceResult<NotificationVersion> {
        let table = self.txn.open_table(DOMAIN_METADATA).map_err(map_err!(Table))?;
        let version = match table.get(NOTIFICATION_VERSION_KEY).map_err(map_err!(Read))? {
            Some(guard) => guard.value(),
            None => return Err(PersistenceError::NotFound("domain metadata".to_string())),
        };
        Ok(version)
    }

    /// Advance the counter from `expected` to `expected + 1`.
    pub fn update_domain_metadata(
        &self,
        expected: NotificationVersion,
    ) -> PersistenceResult<NotificationVersion> {
        let actual = self.lock_domain_metadata()?;
        if actual != expected {
            warn!(expected, actual, "domain metadata version conflict");
            return Err(PersistenceError::VersionConflict { expected, actual });
        }
        let next = expected + 1;
        let mut table = self.txn.open_table(DOMAIN_METADATA).map_err(map_err!(Table))?;
        table
            .insert(NOTIFICATION_VERSION_KEY, next)
            .map_err(map_err!(Write))?;
        Ok(next)
    }
}

fn select_from(
    domains: &impl ReadableTable<&'static str, &'static [u8]>,
    names: &impl ReadableTable<&'static str, &'static str>,
    filter: &DomainFilter,
) -> PersistenceResult<Vec<DomainRecord>> {
    match filter {
        DomainFilter::Key(key) => {
            let id = match key {
                DomainKey::Id(id) => id.clone(),
                DomainKey::Name(name) => match names.get(name.as_str()).map_err(map_err!(Read))? {
                    Some(guard) => guard.value().to_string(),
                    None => return Err(PersistenceError::NotFound(key.to_string())),
                },
            };
            match domains.get(id.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Ok(vec![decode(guard.value())?]),
                None => Err(PersistenceError::NotFound(key.to_string())),
            }
        }
        DomainFilter::Page {
            page_size,
            greater_than_id,
        } => {
            if *page_size == 0 {
                return Err(PersistenceError::InvalidArgument(
                    "domain page size must be positive".to_string(),
                ));
            }
            let range = match greater_than_id {
                Some(after) => domains
                    .range::<&str>((Bound::Excluded(after.as_str()), Bound::Unbounded))
                    .map_err(map_err!(Read))?,
                None => domains.iter().map_err(map_err!(Read))?,
            };
            let mut rows = Vec::new();
            for entry in range.take(*page_size) {
                let (_, value) = entry.map_err(map_err!(Read))?;
                rows.push(decode(value.value())?);
            }
            Ok(rows)
        }
    }
}

impl Store {
    /// Non-locking read of the notification version.
    pub fn domain_metadata(&self) -> PersistenceResult<NotificationVersion> {
        let txn = self.begin_read_domain()?;
        let table = txn.open_table(DOMAIN_METADATA).map_err(map_err!(Table))?;
        let version = match table.get(NOTIFICATION_VERSION_KEY).map_err(map_err!(Read))? {
            Some(guard) => guard.value(),
            None => return Err(PersistenceError::NotFound("domain metadata".to_string())),
        };
        Ok(version)
    }

    /// Lock the counter and advance it from `expected` by one.
    pub fn bump_domain_metadata(
        &self,
        ctx: &OpContext,
        expected: NotificationVersion,
    ) -> PersistenceResult<NotificationVersion> {
        self.transact_domain(ctx, |tx| {
            tx.lock_domain_metadata()?;
            tx.update_domain_metadata(expected)
        })
    }

    /// Register a domain. Global domains advance the notification version
    /// so listeners replicate them. Returns the version the domain was
    /// registered at.
    pub fn create_domain(
        &self,
        ctx: &OpContext,
        row: &DomainRecord,
    ) -> PersistenceResult<NotificationVersion> {
        let version = self.transact_domain(ctx, |tx| {
            let version = tx.lock_domain_metadata()?;
            tx.insert_domain(row)?;
            if row.is_global {
                tx.update_domain_metadata(version)?;
            }
            Ok(version)
        })?;
        info!(id = %row.id, name = %row.name, is_global = row.is_global, version, "domain registered");
        Ok(version)
    }

    /// Apply a domain config change observed at `expected_version`. Fails
    /// with `VersionConflict` when another mutation landed in between.
    /// Returns the new notification version.
    pub fn update_domain(
        &self,
        ctx: &OpContext,
        row: &DomainRecord,
        expected_version: NotificationVersion,
    ) -> PersistenceResult<NotificationVersion> {
        let next = self.transact_domain(ctx, |tx| {
            let current = tx.lock_domain_metadata()?;
            if current != expected_version {
                return Err(PersistenceError::VersionConflict {
                    expected: expected_version,
                    actual: current,
                });
            }
            tx.update_domain(row)?;
            tx.update_domain_metadata(current)
        })?;
        info!(id = %row.id, name = %row.name, version = next, "domain updated");
        Ok(next)
    }

    /// Delete a domain. Deletion is not versioned.
    pub fn delete_domain(&self, ctx: &OpContext, key: &DomainKey) -> PersistenceResult<bool> {
        let existed = self.transact_domain(ctx, |tx| tx.delete_domain(key))?;
        if existed {
            info!(%key, "domain deleted");
        }
        Ok(existed)
    }

    /// Non-locking lookup of one domain.
    pub fn get_domain(&self, key: &DomainKey) -> PersistenceResult<DomainRecord> {
        let mut rows = self.select_domains(&DomainFilter::Key(key.clone()))?;
        rows.pop()
            .ok_or_else(|| PersistenceError::NotFound(key.to_string()))
    }

    /// Non-locking page of domains ordered by id. The page size is clamped
    /// to the `DomainPageSizeLimit` knob.
    pub fn list_domains(
        &self,
        page_size: usize,
        greater_than_id: Option<&str>,
    ) -> PersistenceResult<Vec<DomainRecord>> {
        let limit = self
            .dynamic_config()
            .int(Key::DomainPageSizeLimit, &Filters::new())
            .max(1) as usize;
        self.select_domains(&DomainFilter::Page {
            page_size: page_size.min(limit),
            greater_than_id: greater_than_id.map(str::to_string),
        })
    }

    fn select_domains(&self, filter: &DomainFilter) -> PersistenceResult<Vec<DomainRecord>> {
        let txn = self.begin_read_domain()?;
        let domains = txn.open_table(DOMAINS).map_err(map_err!(Table))?;
        let names = txn.open_table(DOMAIN_NAMES).map_err(map_err!(Table))?;
        select_from(&domains, &names, filter)
    }
}
