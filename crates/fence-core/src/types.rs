//! Shared types used across FenceGrid crates.
//!
//! These describe the persisted records the consistency guard reasons
//! about: shards (fencing tokens), domains, and workflow executions.

use serde::{Deserialize, Serialize};

/// History shard identifier (the partition key of shard-owned state).
pub type ShardId = u32;

/// Monotonically increasing shard fencing token.
pub type RangeId = i64;

/// Global domain-configuration notification counter.
pub type NotificationVersion = u64;

/// Encoding tag for opaque payload columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    #[default]
    Json,
    ThriftRw,
    Proto,
    Unknown,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::ThriftRw => "thriftrw",
            Encoding::Proto => "proto",
            Encoding::Unknown => "unknown",
        }
    }
}

// ── Shard ─────────────────────────────────────────────────────────

/// Persisted ownership record of one history shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRecord {
    pub shard_id: ShardId,
    /// Fencing token; only ever increases.
    pub range_id: RangeId,
    /// Opaque shard checkpoint state.
    pub data: Vec<u8>,
    pub encoding: Encoding,
}

impl ShardRecord {
    /// A freshly bootstrapped shard with an empty checkpoint.
    pub fn bootstrap(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            range_id: 0,
            data: Vec::new(),
            encoding: Encoding::Json,
        }
    }
}

// ── Domain ────────────────────────────────────────────────────────

/// Persisted domain registration. `id` and `name` are both unique keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRecord {
    pub id: String,
    pub name: String,
    pub is_global: bool,
    pub data: Vec<u8>,
    pub encoding: Encoding,
}

// ── Workflow execution ────────────────────────────────────────────

/// Lifecycle state of a workflow execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Created,
    Running,
    Completed,
    /// Shadow record that must never hold the current pointer.
    Zombie,
}

impl WorkflowState {
    pub const ALL: [WorkflowState; 4] = [
        WorkflowState::Created,
        WorkflowState::Running,
        WorkflowState::Completed,
        WorkflowState::Zombie,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Created => "created",
            WorkflowState::Running => "running",
            WorkflowState::Completed => "completed",
            WorkflowState::Zombie => "zombie",
        }
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a completed execution closed. `None` for every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CloseStatus {
    #[default]
    None,
    Completed,
    Failed,
    Canceled,
    Terminated,
    ContinuedAsNew,
    TimedOut,
}

/// One workflow execution record, the unit the mode validator reasons about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
    /// Request that created this run; used to recognise re-issued creates.
    pub create_request_id: String,
    pub state: WorkflowState,
    pub close_status: CloseStatus,
    /// Failover version of the last write to this run.
    pub last_write_version: i64,
    /// Opaque execution payload.
    pub data: Vec<u8>,
    pub encoding: Encoding,
}

impl WorkflowExecution {
    /// Build a record with an empty payload in the given state.
    ///
    /// A `Completed` record gets `CloseStatus::Completed`; use
    /// [`WorkflowExecution::with_close_status`] for other outcomes.
    pub fn new(
        domain_id: impl Into<String>,
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
        state: WorkflowState,
    ) -> Self {
        let run_id = run_id.into();
        let close_status = match state {
            WorkflowState::Completed => CloseStatus::Completed,
            _ => CloseStatus::None,
        };
        Self {
            domain_id: domain_id.into(),
            workflow_id: workflow_id.into(),
            create_request_id: format!("req-{run_id}"),
            run_id,
            state,
            close_status,
            last_write_version: 0,
            data: Vec::new(),
            encoding: Encoding::Json,
        }
    }

    pub fn with_close_status(mut self, close_status: CloseStatus) -> Self {
        self.close_status = close_status;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.create_request_id = request_id.into();
        self
    }

    pub fn with_last_write_version(mut self, version: i64) -> Self {
        self.last_write_version = version;
        self
    }

    /// Whether `(domain_id, workflow_id)` matches another record.
    pub fn same_workflow(&self, other: &WorkflowExecution) -> bool {
        self.domain_id == other.domain_id && self.workflow_id == other.workflow_id
    }

    /// Check that the close status is set exactly when the run is completed.
    pub fn check_close_status(&self) -> Result<(), String> {
        match (self.state, self.close_status) {
            (WorkflowState::Completed, CloseStatus::None) => Err(format!(
                "run {} is completed but has no close status",
                self.run_id
            )),
            (WorkflowState::Completed, _) | (_, CloseStatus::None) => Ok(()),
            (state, status) => Err(format!(
                "run {} is {state} but carries close status {status:?}",
                self.run_id
            )),
        }
    }
}

/// The current-execution pointer of one workflow identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentExecution {
    pub run_id: String,
    pub create_request_id: String,
    pub state: WorkflowState,
    pub close_status: CloseStatus,
    pub last_write_version: i64,
}

impl From<&WorkflowExecution> for CurrentExecution {
    fn from(execution: &WorkflowExecution) -> Self {
        Self {
            run_id: execution.run_id.clone(),
            create_request_id: execution.create_request_id.clone(),
            state: execution.state,
            close_status: execution.close_status,
            last_write_version: execution.last_write_version,
        }
    }
}
