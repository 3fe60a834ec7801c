//! Static membership: a ring whose members are set by the embedder.
//!
//! Ownership is resolved with rendezvous (highest random weight) hashing:
//! every host scores `hash(key, identity)` and the highest score owns the
//! key. Adding or removing a host only moves the keys that host wins or
//! loses, which keeps shard handoffs small.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use fence_core::config::MembershipConfig;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use crate::resolver::{ChangedEvent, HostInfo, MembershipError, Monitor, ServiceResolver};

/// Resolver over an explicitly managed host list.
pub struct StaticResolver {
    service: String,
    hosts: RwLock<Vec<HostInfo>>,
    listeners: Mutex<HashMap<String, UnboundedSender<ChangedEvent>>>,
}

impl StaticResolver {
    pub fn new(service: impl Into<String>, hosts: Vec<HostInfo>) -> Self {
        Self {
            service: service.into(),
            hosts: RwLock::new(dedup(hosts)),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Replace the ring and notify listeners of the difference.
    ///
    /// Returns the computed event; nothing is sent when it is empty.
    pub fn set_members(&self, hosts: Vec<HostInfo>) -> ChangedEvent {
        let hosts = dedup(hosts);
        let event = {
            let mut current = self.hosts.write().unwrap_or_else(PoisonError::into_inner);
            let event = diff(&current, &hosts);
            *current = hosts;
            event
        };

        if !event.is_empty() {
            info!(
                service = %self.service,
                added = event.hosts_added.len(),
                updated = event.hosts_updated.len(),
                removed = event.hosts_removed.len(),
                "membership changed"
            );
            self.notify(&event);
        }
        event
    }

    fn notify(&self, event: &ChangedEvent) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|name, tx| {
            let delivered = tx.send(event.clone()).is_ok();
            if !delivered {
                debug!(service = %self.service, listener = %name, "dropping closed listener");
            }
            delivered
        });
    }
}

impl ServiceResolver for StaticResolver {
    fn lookup(&self, key: &str) -> Result<HostInfo, MembershipError> {
        let hosts = self.hosts.read().unwrap_or_else(PoisonError::into_inner);
        hosts
            .iter()
            .max_by(|a, b| {
                rendezvous_score(key, a)
                    .cmp(&rendezvous_score(key, b))
                    .then_with(|| a.identity.cmp(&b.identity))
            })
            .cloned()
            .ok_or(MembershipError::InsufficientHosts)
    }

    fn add_listener(
        &self,
        name: &str,
        notify: UnboundedSender<ChangedEvent>,
    ) -> Result<(), MembershipError> {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        if listeners.contains_key(name) {
            return Err(MembershipError::DuplicateListener(name.to_string()));
        }
        listeners.insert(name.to_string(), notify);
        debug!(service = %self.service, listener = %name, "listener added");
        Ok(())
    }

    fn remove_listener(&self, name: &str) -> Result<(), MembershipError> {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        match listeners.remove(name) {
            Some(_) => Ok(()),
            None => Err(MembershipError::UnknownListener(name.to_string())),
        }
    }

    fn member_count(&self) -> usize {
        self.hosts.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn members(&self) -> Vec<HostInfo> {
        self.hosts.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// First eight bytes of `sha256(key 0x00 identity)`, big-endian. Every
/// host and every build must agree on this value.
fn rendezvous_score(key: &str, host: &HostInfo) -> u64 {
    let digest = Sha256::new()
        .chain_update(key.as_bytes())
        .chain_update([0u8])
        .chain_update(host.identity.as_bytes())
        .finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Sort by identity and keep the first entry per identity.
fn dedup(mut hosts: Vec<HostInfo>) -> Vec<HostInfo> {
    hosts.sort_by(|a, b| a.identity.cmp(&b.identity));
    hosts.dedup_by(|a, b| a.identity == b.identity);
    hosts
}

fn diff(old: &[HostInfo], new: &[HostInfo]) -> ChangedEvent {
    let old_by_id: HashMap<&str, &HostInfo> =
        old.iter().map(|h| (h.identity.as_str(), h)).collect();
    let new_by_id: HashMap<&str, &HostInfo> =
        new.iter().map(|h| (h.identity.as_str(), h)).collect();

    let mut event = ChangedEvent::default();
    for host in new {
        match old_by_id.get(host.identity.as_str()) {
            None => event.hosts_added.push(host.clone()),
            Some(prev) if *prev != host => event.hosts_updated.push(host.clone()),
            Some(_) => {}
        }
    }
    event.hosts_removed = old
        .iter()
        .filter(|h| !new_by_id.contains_key(h.identity.as_str()))
        .cloned()
        .collect();
    event
}

/// Monitor over a fixed set of [`StaticResolver`]s.
pub struct StaticMonitor {
    me: HostInfo,
    resolvers: HashMap<String, Arc<StaticResolver>>,
}

impl StaticMonitor {
    pub fn new(me: HostInfo) -> Self {
        Self {
            me,
            resolvers: HashMap::new(),
        }
    }

    /// Add a service ring. This host is always a member.
    pub fn with_service(mut self, service: &str, peers: Vec<HostInfo>) -> Self {
        let mut hosts = peers;
        hosts.push(self.me.clone());
        self.resolvers.insert(
            service.to_string(),
            Arc::new(StaticResolver::new(service, hosts)),
        );
        self
    }

    /// Single-service monitor built from the `[membership]` config section.
    pub fn from_config(config: &MembershipConfig) -> Self {
        let peers = config.peers.iter().map(HostInfo::new).collect();
        Self::new(HostInfo::new(config.self_address.as_str())).with_service(&config.service, peers)
    }

    /// Concrete resolver handle, for embedders that drive membership.
    pub fn static_resolver(&self, service: &str) -> Option<Arc<StaticResolver>> {
        self.resolvers.get(service).cloned()
    }
}

impl Monitor for StaticMonitor {
    fn who_am_i(&self) -> Result<HostInfo, MembershipError> {
        Ok(self.me.clone())
    }

    fn get_resolver(&self, service: &str) -> Result<Arc<dyn ServiceResolver>, MembershipError> {
        self.resolvers
            .get(service)
            .map(|r| Arc::clone(r) as Arc<dyn ServiceResolver>)
            .ok_or_else(|| MembershipError::UnknownService(service.to_string()))
    }

    fn get_reachable_members(&self) -> Result<Vec<String>, MembershipError> {
        let members: BTreeSet<String> = self
            .resolvers
            .values()
            .flat_map(|r| r.members())
            .map(|h| h.identity)
            .collect();
        Ok(members.into_iter().collect())
    }
}
