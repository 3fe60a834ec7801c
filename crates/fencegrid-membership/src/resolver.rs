//! Membership vocabulary shared by every resolver implementation.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

/// One member of a service ring.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostInfo {
    /// Stable identity used for hashing, usually `host:port`.
    pub identity: String,
    pub address: String,
}

impl HostInfo {
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            identity: address.clone(),
            address,
        }
    }
}

impl fmt::Display for HostInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identity)
    }
}

/// Delta between two consecutive views of a ring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangedEvent {
    pub hosts_added: Vec<HostInfo>,
    pub hosts_updated: Vec<HostInfo>,
    pub hosts_removed: Vec<HostInfo>,
}

impl ChangedEvent {
    pub fn is_empty(&self) -> bool {
        self.hosts_added.is_empty() && self.hosts_updated.is_empty() && self.hosts_removed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MembershipError {
    #[error("no members available for lookup")]
    InsufficientHosts,

    #[error("unknown service {0}")]
    UnknownService(String),

    #[error("listener {0} already registered")]
    DuplicateListener(String),

    #[error("listener {0} not registered")]
    UnknownListener(String),

    #[error("membership state unavailable: {0}")]
    Unavailable(String),
}

/// Key-to-host resolution for one service.
pub trait ServiceResolver: Send + Sync {
    /// The host owning `key`.
    fn lookup(&self, key: &str) -> Result<HostInfo, MembershipError>;

    /// Receive a [`ChangedEvent`] on `notify` after every ring change.
    fn add_listener(
        &self,
        name: &str,
        notify: UnboundedSender<ChangedEvent>,
    ) -> Result<(), MembershipError>;

    fn remove_listener(&self, name: &str) -> Result<(), MembershipError>;

    fn member_count(&self) -> usize;

    fn members(&self) -> Vec<HostInfo>;
}

/// Process-wide view over every service ring.
pub trait Monitor: Send + Sync {
    /// The host this process runs as.
    fn who_am_i(&self) -> Result<HostInfo, MembershipError>;

    fn lookup(&self, service: &str, key: &str) -> Result<HostInfo, MembershipError> {
        self.get_resolver(service)?.lookup(key)
    }

    fn get_resolver(&self, service: &str) -> Result<Arc<dyn ServiceResolver>, MembershipError>;

    fn add_listener(
        &self,
        service: &str,
        name: &str,
        notify: UnboundedSender<ChangedEvent>,
    ) -> Result<(), MembershipError> {
        self.get_resolver(service)?.add_listener(name, notify)
    }

    fn remove_listener(&self, service: &str, name: &str) -> Result<(), MembershipError> {
        self.get_resolver(service)?.remove_listener(name)
    }

    /// Identities of every host reachable in any ring, sorted.
    fn get_reachable_members(&self) -> Result<Vec<String>, MembershipError>;
}
