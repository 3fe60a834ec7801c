//! Dynamic configuration knobs.
//!
//! A [`Client`] answers typed lookups for a [`Key`], optionally narrowed by
//! filters (for example a domain name). [`Collection`] wraps a client and
//! falls back to each key's default whenever the client has no value.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Knobs read at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    /// Upper bound on the page size of a domain listing.
    DomainPageSizeLimit,
    /// Deadline applied to each persistence transaction.
    PersistenceTransactionTimeout,
    /// Whether a shard lease is released as soon as ownership moves away.
    ReleaseShardOnMembershipChange,
}

impl Key {
    pub fn name(&self) -> &'static str {
        match self {
            Key::DomainPageSizeLimit => "persistence.domainPageSizeLimit",
            Key::PersistenceTransactionTimeout => "persistence.transactionTimeout",
            Key::ReleaseShardOnMembershipChange => "history.releaseShardOnMembershipChange",
        }
    }

    pub fn default_value(&self) -> Value {
        match self {
            Key::DomainPageSizeLimit => Value::Int(200),
            Key::PersistenceTransactionTimeout => Value::Duration(Duration::from_secs(10)),
            Key::ReleaseShardOnMembershipChange => Value::Bool(true),
        }
    }
}

/// Filter dimension narrowing a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Filter {
    DomainName,
    ShardId,
}

pub type Filters = HashMap<Filter, String>;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Str(String),
    Duration(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unable to find key")]
    NotFound,

    #[error("value for {0} has the wrong type")]
    TypeMismatch(&'static str),

    #[error("{0}")]
    Unsupported(String),
}

/// Source of dynamic configuration values.
pub trait Client: Send + Sync {
    fn get_value(&self, key: Key, filters: &Filters) -> Result<Value, ConfigError>;

    fn update_value(&self, key: Key, value: Value) -> Result<(), ConfigError>;

    fn get_int_value(&self, key: Key, filters: &Filters) -> Result<i64, ConfigError> {
        match self.get_value(key, filters)? {
            Value::Int(v) => Ok(v),
            _ => Err(ConfigError::TypeMismatch(key.name())),
        }
    }

    fn get_bool_value(&self, key: Key, filters: &Filters) -> Result<bool, ConfigError> {
        match self.get_value(key, filters)? {
            Value::Bool(v) => Ok(v),
            _ => Err(ConfigError::TypeMismatch(key.name())),
        }
    }

    fn get_duration_value(&self, key: Key, filters: &Filters) -> Result<Duration, ConfigError> {
        match self.get_value(key, filters)? {
            Value::Duration(v) => Ok(v),
            _ => Err(ConfigError::TypeMismatch(key.name())),
        }
    }
}

/// Client with no backing source: every lookup is `NotFound`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopClient;

impl Client for NopClient {
    fn get_value(&self, _key: Key, _filters: &Filters) -> Result<Value, ConfigError> {
        Err(ConfigError::NotFound)
    }

    fn update_value(&self, _key: Key, _value: Value) -> Result<(), ConfigError> {
        Err(ConfigError::Unsupported("unable to update key".to_string()))
    }
}

/// Process-local client holding overrides in memory. Filters are ignored.
#[derive(Debug, Default)]
pub struct InMemoryClient {
    values: RwLock<HashMap<Key, Value>>,
}

impl Client for InMemoryClient {
    fn get_value(&self, key: Key, _filters: &Filters) -> Result<Value, ConfigError> {
        let values = self
            .values
            .read()
            .map_err(|e| ConfigError::Unsupported(e.to_string()))?;
        values.get(&key).cloned().ok_or(ConfigError::NotFound)
    }

    fn update_value(&self, key: Key, value: Value) -> Result<(), ConfigError> {
        let mut values = self
            .values
            .write()
            .map_err(|e| ConfigError::Unsupported(e.to_string()))?;
        values.insert(key, value);
        Ok(())
    }
}

/// Typed accessors with default fallback.
#[derive(Clone)]
pub struct Collection {
    client: Arc<dyn Client>,
}

impl Collection {
    pub fn new(client: Arc<dyn Client>) -> Self {
        Self { client }
    }

    /// Collection over [`NopClient`]: every knob reads its default.
    pub fn nop() -> Self {
        Self::new(Arc::new(NopClient))
    }

    pub fn int(&self, key: Key, filters: &Filters) -> i64 {
        let fallback = match key.default_value() {
            Value::Int(v) => v,
            _ => 0,
        };
        self.resolve(key, self.client.get_int_value(key, filters), fallback)
    }

    pub fn boolean(&self, key: Key, filters: &Filters) -> bool {
        let fallback = matches!(key.default_value(), Value::Bool(true));
        self.resolve(key, self.client.get_bool_value(key, filters), fallback)
    }

    pub fn duration(&self, key: Key, filters: &Filters) -> Duration {
        let fallback = match key.default_value() {
            Value::Duration(v) => v,
            _ => Duration::ZERO,
        };
        self.resolve(key, self.client.get_duration_value(key, filters), fallback)
    }

    fn resolve<T>(&self, key: Key, result: Result<T, ConfigError>, fallback: T) -> T {
        match result {
            Ok(v) => v,
            Err(ConfigError::NotFound) => fallback,
            Err(e) => {
                warn!(key = key.name(), error = %e, "dynamic config lookup failed, using default");
                fallback
            }
        }
    }
}

impl Default for Collection {
    fn default() -> Self {
        Self::nop()
    }
}
