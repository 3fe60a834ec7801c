//! Workflow operation-mode validator.
//!
//! Decides, before any write is issued, whether the states of the
//! execution records taking part in a create, update, or conflict-resolve
//! operation are compatible with the requested mode. The decision is a
//! table: every `(operation, shape)` pair maps to one allowed-state set per
//! participant, and a request is accepted iff every present participant's
//! state is in its set.
//!
//! Nothing here performs I/O or holds state; all functions are total over
//! the finite mode/state domain.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::WorkflowState;

// ── Modes ─────────────────────────────────────────────────────────

/// How a create installs the new run relative to the current pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateMode {
    /// No current run may exist for the workflow identity.
    BrandNew,
    /// The current run exists, is completed, and is being replaced.
    WorkflowIdReuse,
    /// The current run continues as the new run.
    ContinueAsNew,
    /// The new run is a shadow record and never claims the pointer.
    Zombie,
}

impl CreateMode {
    pub const ALL: [CreateMode; 4] = [
        CreateMode::BrandNew,
        CreateMode::WorkflowIdReuse,
        CreateMode::ContinueAsNew,
        CreateMode::Zombie,
    ];
}

/// How an update treats the current pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    UpdateCurrent,
    BypassCurrent,
    IgnoreCurrent,
}

impl UpdateMode {
    pub const ALL: [UpdateMode; 3] = [
        UpdateMode::UpdateCurrent,
        UpdateMode::BypassCurrent,
        UpdateMode::IgnoreCurrent,
    ];
}

/// How a conflict-resolve (history reset) treats the current pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolveMode {
    UpdateCurrent,
    BypassCurrent,
}

impl ConflictResolveMode {
    pub const ALL: [ConflictResolveMode; 2] = [
        ConflictResolveMode::UpdateCurrent,
        ConflictResolveMode::BypassCurrent,
    ];
}

/// An operation family together with its mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "family", content = "mode", rename_all = "snake_case")]
pub enum Operation {
    Create(CreateMode),
    Update(UpdateMode),
    ConflictResolve(ConflictResolveMode),
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create(mode) => write!(f, "create/{mode:?}"),
            Operation::Update(mode) => write!(f, "update/{mode:?}"),
            Operation::ConflictResolve(mode) => write!(f, "conflict-resolve/{mode:?}"),
        }
    }
}

/// Role of an execution record inside an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Participant {
    /// Run being reset by a conflict-resolve.
    Reset,
    /// Mutation of the run the current pointer names.
    Current,
    /// Run being created.
    New,
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Participant::Reset => "reset",
            Participant::Current => "current",
            Participant::New => "new",
        })
    }
}

// ── State sets ────────────────────────────────────────────────────

/// A set of workflow states, stored as a bitmask.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateSet(u8);

impl StateSet {
    pub const NONE: StateSet = StateSet(0);
    pub const ANY: StateSet = StateSet(0b1111);
    /// States that may hold the current pointer.
    pub const LIVE: StateSet = StateSet::of(&[WorkflowState::Created, WorkflowState::Running]);
    /// States that can no longer claim currency.
    pub const TERMINAL: StateSet =
        StateSet::of(&[WorkflowState::Completed, WorkflowState::Zombie]);
    pub const NON_ZOMBIE: StateSet = StateSet::of(&[
        WorkflowState::Created,
        WorkflowState::Running,
        WorkflowState::Completed,
    ]);
    pub const ZOMBIE: StateSet = StateSet::of(&[WorkflowState::Zombie]);
    pub const RUNNING_OR_COMPLETED: StateSet =
        StateSet::of(&[WorkflowState::Running, WorkflowState::Completed]);

    pub const fn of(states: &[WorkflowState]) -> StateSet {
        let mut bits = 0u8;
        let mut i = 0;
        while i < states.len() {
            bits |= StateSet::bit(states[i]);
            i += 1;
        }
        StateSet(bits)
    }

    const fn bit(state: WorkflowState) -> u8 {
        match state {
            WorkflowState::Created => 1,
            WorkflowState::Running => 1 << 1,
            WorkflowState::Completed => 1 << 2,
            WorkflowState::Zombie => 1 << 3,
        }
    }

    pub const fn contains(self, state: WorkflowState) -> bool {
        self.0 & StateSet::bit(state) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = WorkflowState> {
        WorkflowState::ALL.into_iter().filter(move |s| self.contains(*s))
    }
}

impl fmt::Debug for StateSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for StateSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|s| s.as_str()).collect();
        write!(f, "{{{}}}", names.join(", "))
    }
}

// ── Decision table ────────────────────────────────────────────────

/// Allowed states for each participant of one `(operation, shape)` pair.
///
/// Sets for participants the operation family never carries are `NONE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeRule {
    pub reset: StateSet,
    pub current: StateSet,
    pub new: StateSet,
}

impl ModeRule {
    const UNUSED: ModeRule = ModeRule {
        reset: StateSet::NONE,
        current: StateSet::NONE,
        new: StateSet::NONE,
    };

    pub fn allowed(&self, participant: Participant) -> StateSet {
        match participant {
            Participant::Reset => self.reset,
            Participant::Current => self.current,
            Participant::New => self.new,
        }
    }
}

/// Look up the rule for an operation. `with_new` is whether the request
/// carries a new run; only `Update(UpdateCurrent)` changes shape on it.
pub fn mode_rule(operation: Operation, with_new: bool) -> ModeRule {
    use StateSet as S;
    match operation {
        Operation::Create(
            CreateMode::BrandNew | CreateMode::WorkflowIdReuse | CreateMode::ContinueAsNew,
        ) => ModeRule {
            new: S::LIVE,
            ..ModeRule::UNUSED
        },
        Operation::Create(CreateMode::Zombie) => ModeRule {
            new: S::ZOMBIE,
            ..ModeRule::UNUSED
        },

        Operation::Update(UpdateMode::UpdateCurrent) if with_new => ModeRule {
            current: S::TERMINAL,
            new: S::LIVE,
            ..ModeRule::UNUSED
        },
        Operation::Update(UpdateMode::UpdateCurrent) => ModeRule {
            current: S::NON_ZOMBIE,
            ..ModeRule::UNUSED
        },
        Operation::Update(UpdateMode::BypassCurrent) => ModeRule {
            current: S::TERMINAL,
            new: S::LIVE,
            ..ModeRule::UNUSED
        },
        // Ignoring the pointer is only safe when no second run is written.
        Operation::Update(UpdateMode::IgnoreCurrent) => ModeRule {
            current: S::ANY,
            new: S::NONE,
            ..ModeRule::UNUSED
        },

        Operation::ConflictResolve(ConflictResolveMode::UpdateCurrent) => ModeRule {
            reset: S::NON_ZOMBIE,
            current: S::TERMINAL,
            new: S::LIVE,
        },
        // A bypass reset may attach only a shadow run and never mutates
        // the current run.
        Operation::ConflictResolve(ConflictResolveMode::BypassCurrent) => ModeRule {
            reset: S::RUNNING_OR_COMPLETED,
            current: S::NONE,
            new: S::ZOMBIE,
        },
    }
}

// ── Errors ────────────────────────────────────────────────────────

/// One participant whose state is outside the set its rule allows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub participant: Participant,
    pub state: WorkflowState,
    pub allowed: StateSet,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} run is {} (allowed: {})",
            self.participant, self.state, self.allowed
        )
    }
}

/// Rejection of an operation whose participant states break the mode rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid mode state for {operation}: {}", render(.violations))]
pub struct ModeStateError {
    pub operation: Operation,
    /// Every violated participant rule; never empty.
    pub violations: Vec<Violation>,
}

impl ModeStateError {
    /// Whether the given participant is among the violations.
    pub fn violated(&self, participant: Participant) -> bool {
        self.violations.iter().any(|v| v.participant == participant)
    }
}

fn render(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// ── Entry points ──────────────────────────────────────────────────

/// Validate a create of a single new run.
pub fn validate_create(mode: CreateMode, new: WorkflowState) -> Result<(), ModeStateError> {
    check(Operation::Create(mode), &[(Participant::New, Some(new))])
}

/// Validate an update of the current run, optionally creating a new run.
pub fn validate_update(
    mode: UpdateMode,
    current: WorkflowState,
    new: Option<WorkflowState>,
) -> Result<(), ModeStateError> {
    check(
        Operation::Update(mode),
        &[(Participant::Current, Some(current)), (Participant::New, new)],
    )
}

/// Validate a conflict-resolve of the reset run, optionally with a new run
/// and a mutation of the current run.
pub fn validate_conflict_resolve(
    mode: ConflictResolveMode,
    reset: WorkflowState,
    new: Option<WorkflowState>,
    current: Option<WorkflowState>,
) -> Result<(), ModeStateError> {
    check(
        Operation::ConflictResolve(mode),
        &[
            (Participant::Reset, Some(reset)),
            (Participant::New, new),
            (Participant::Current, current),
        ],
    )
}

fn check(
    operation: Operation,
    participants: &[(Participant, Option<WorkflowState>)],
) -> Result<(), ModeStateError> {
    let with_new = participants
        .iter()
        .any(|(p, state)| *p == Participant::New && state.is_some());
    let rule = mode_rule(operation, with_new);

    let violations: Vec<Violation> = participants
        .iter()
        .filter_map(|(participant, state)| {
            let state = (*state)?;
            let allowed = rule.allowed(*participant);
            (!allowed.contains(state)).then_some(Violation {
                participant: *participant,
                state,
                allowed,
            })
        })
        .collect();

    if violations.is_empty() {
        Ok(())
    } else {
        Err(ModeStateError {
            operation,
            violations,
        })
    }
}
