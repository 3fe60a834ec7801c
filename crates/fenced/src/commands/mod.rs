pub mod domain;
pub mod init;
pub mod serve;
pub mod shard;

use fence_core::dynamicconfig::{Filters, Key};
use fence_core::FenceConfig;
use fencegrid_persistence::{OpContext, Store};
use tracing::debug;

/// Loaded config plus the store it points at.
pub struct Env {
    pub config: FenceConfig,
    pub store: Store,
}

impl Env {
    pub fn open(config: FenceConfig) -> anyhow::Result<Self> {
        let persistence = &config.persistence;
        let store = Store::open(&persistence.data_dir, persistence.num_db_shards)?;
        debug!(data_dir = ?persistence.data_dir, "store ready");
        Ok(Self { config, store })
    }

    /// Context bounded by the `PersistenceTransactionTimeout` knob.
    pub fn ctx(&self) -> OpContext {
        let timeout = self
            .store
            .dynamic_config()
            .duration(Key::PersistenceTransactionTimeout, &Filters::new());
        OpContext::background().with_timeout(timeout)
    }
}
