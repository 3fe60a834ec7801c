//! Shard leases: membership-driven acquisition of fencing tokens.
//!
//! A lease is the `range_id` this host obtained from
//! [`Store::acquire_shard`]. Persistence writes present it and are fenced
//! once another host acquires the shard. The manager only acquires shards
//! the resolver assigns to this host, so two hosts with the same ring view
//! never race on the same shard. Membership events both release shards
//! that moved away and acquire shards that moved here.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use fence_core::dynamicconfig::{Filter, Filters, Key};
use fence_core::{RangeId, ShardId};
use fencegrid_persistence::{OpContext, PersistenceError, Store};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, info, warn};

use crate::resolver::{ChangedEvent, HostInfo, MembershipError, ServiceResolver};

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error(transparent)]
    Membership(#[from] MembershipError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

pub struct ShardLeaseManager {
    store: Store,
    resolver: Arc<dyn ServiceResolver>,
    me: HostInfo,
    leases: Mutex<BTreeMap<ShardId, RangeId>>,
}

impl ShardLeaseManager {
    pub fn new(store: Store, resolver: Arc<dyn ServiceResolver>, me: HostInfo) -> Self {
        Self {
            store,
            resolver,
            me,
            leases: Mutex::new(BTreeMap::new()),
        }
    }

    /// Whether the ring currently assigns `shard_id` to this host.
    pub fn owns(&self, shard_id: ShardId) -> Result<bool, MembershipError> {
        Ok(self.resolver.lookup(&shard_id.to_string())?.identity == self.me.identity)
    }

    /// Acquire `shard_id` if this host owns it, returning the new fencing
    /// token. Returns `None` when the shard belongs elsewhere.
    pub fn acquire(&self, ctx: &OpContext, shard_id: ShardId) -> Result<Option<RangeId>, LeaseError> {
        if !self.owns(shard_id)? {
            debug!(shard_id, host = %self.me, "shard owned elsewhere, not acquiring");
            return Ok(None);
        }
        let record = self.store.acquire_shard(ctx, shard_id)?;
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(shard_id, record.range_id);
        info!(shard_id, range_id = record.range_id, host = %self.me, "shard lease acquired");
        Ok(Some(record.range_id))
    }

    /// Acquire every shard in `0..num_shards` owned by this host.
    pub fn acquire_owned(
        &self,
        ctx: &OpContext,
        num_shards: u32,
    ) -> Result<Vec<ShardId>, LeaseError> {
        let mut acquired = Vec::new();
        for shard_id in 0..num_shards {
            if self.acquire(ctx, shard_id)?.is_some() {
                acquired.push(shard_id);
            }
        }
        Ok(acquired)
    }

    /// Acquire shards in `0..num_shards` that this host owns but holds no
    /// lease for. Held shards are skipped so their tokens stay valid.
    pub fn acquire_newly_owned(
        &self,
        ctx: &OpContext,
        num_shards: u32,
    ) -> Result<Vec<ShardId>, LeaseError> {
        let held = self.held_shards();
        let mut acquired = Vec::new();
        for shard_id in (0..num_shards).filter(|s| !held.contains(s)) {
            if self.acquire(ctx, shard_id)?.is_some() {
                acquired.push(shard_id);
            }
        }
        Ok(acquired)
    }

    /// Token held for `shard_id`, if any.
    pub fn range_id(&self, shard_id: ShardId) -> Option<RangeId> {
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&shard_id)
            .copied()
    }

    pub fn held_shards(&self) -> Vec<ShardId> {
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Drop leases for shards the ring no longer assigns to this host.
    /// Returns the released shard ids.
    ///
    /// A shard whose `ReleaseShardOnMembershipChange` knob is off is kept
    /// until its next write is fenced.
    pub fn on_membership_change(&self, event: &ChangedEvent) -> Vec<ShardId> {
        let dynamic = self.store.dynamic_config();
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        let mut released = Vec::new();

        for shard_id in leases.keys().copied().collect::<Vec<_>>() {
            let filters = Filters::from([(Filter::ShardId, shard_id.to_string())]);
            if !dynamic.boolean(Key::ReleaseShardOnMembershipChange, &filters) {
                continue;
            }
            match self.owns(shard_id) {
                Ok(true) => {}
                Ok(false) => {
                    leases.remove(&shard_id);
                    released.push(shard_id);
                }
                Err(e) => {
                    warn!(shard_id, error = %e, "ownership lookup failed, keeping lease");
                }
            }
        }

        if !released.is_empty() {
            info!(
                ?released,
                added = event.hosts_added.len(),
                removed = event.hosts_removed.len(),
                "shard leases released on membership change"
            );
        }
        released
    }

    /// Register a membership listener named after this host.
    pub fn subscribe(&self) -> Result<UnboundedReceiver<ChangedEvent>, MembershipError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.resolver.add_listener(&self.listener_name(), tx)?;
        Ok(rx)
    }

    /// Remove the listener registered by [`subscribe`](Self::subscribe),
    /// which closes the channel and ends [`run`](Self::run).
    pub fn unsubscribe(&self) -> Result<(), MembershipError> {
        self.resolver.remove_listener(&self.listener_name())
    }

    /// Process membership events until the channel closes: release shards
    /// that moved away, then acquire the ones in `0..num_shards` that moved
    /// here.
    pub async fn run(
        self: Arc<Self>,
        mut events: UnboundedReceiver<ChangedEvent>,
        num_shards: u32,
    ) {
        while let Some(event) = events.recv().await {
            self.on_membership_change(&event);

            let timeout = self
                .store
                .dynamic_config()
                .duration(Key::PersistenceTransactionTimeout, &Filters::new());
            let ctx = OpContext::background().with_timeout(timeout);
            match self.acquire_newly_owned(&ctx, num_shards) {
                Ok(acquired) if !acquired.is_empty() => {
                    info!(?acquired, host = %self.me, "shard leases acquired on membership change");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, host = %self.me, "acquiring newly owned shards failed"),
            }
        }
        debug!(host = %self.me, "membership listener closed");
    }

    fn listener_name(&self) -> String {
        format!("shard-lease-{}", self.me.identity)
    }
}
