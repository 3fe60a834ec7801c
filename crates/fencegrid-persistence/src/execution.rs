//! Workflow execution writes guarded by fencing and the mode validator.
//!
//! Every entry point runs the same sequence inside one write transaction
//! on the shard's database:
//!
//! 1. compare the presented `range_id` with the stored one (`Fenced`),
//! 2. ask the mode validator to approve the participant states,
//! 3. check the current-execution pointer is where the mode expects it,
//! 4. write the execution rows and move the pointer, then commit.
//!
//! Any failure aborts the transaction, so a rejected request leaves no
//! trace in storage.

use fence_core::{
    ConflictResolveMode, CreateMode, CurrentExecution, RangeId, ShardId, UpdateMode,
    WorkflowExecution, WorkflowState, validate_conflict_resolve, validate_create,
    validate_update,
};
use redb::ReadableTable;
use tracing::debug;

use crate::context::OpContext;
use crate::error::{PersistenceError, PersistenceResult};
use crate::store::{Store, Tx, decode, encode, map_err};
use crate::tables::{CURRENT_EXECUTIONS, EXECUTIONS};

/// The run a create expects to find as current (reuse / continue-as-new).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousRun {
    pub run_id: String,
    pub last_write_version: i64,
}

#[derive(Debug, Clone)]
pub struct CreateExecutionRequest {
    pub shard_id: ShardId,
    pub range_id: RangeId,
    pub mode: CreateMode,
    /// Required for `WorkflowIdReuse` and `ContinueAsNew`.
    pub previous: Option<PreviousRun>,
    pub new: WorkflowExecution,
}

#[derive(Debug, Clone)]
pub struct UpdateExecutionRequest {
    pub shard_id: ShardId,
    pub range_id: RangeId,
    pub mode: UpdateMode,
    /// Mutation of the run being updated.
    pub current: WorkflowExecution,
    /// Run started by this update (continue-as-new).
    pub new: Option<WorkflowExecution>,
}

#[derive(Debug, Clone)]
pub struct ConflictResolveExecutionRequest {
    pub shard_id: ShardId,
    pub range_id: RangeId,
    pub mode: ConflictResolveMode,
    /// Run whose history branch is being reset.
    pub reset: WorkflowExecution,
    pub new: Option<WorkflowExecution>,
    /// Mutation of the run currently holding the pointer, when it is not
    /// the reset run.
    pub current: Option<WorkflowExecution>,
}

/// What a successful write did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// An identical earlier request already committed; nothing was written.
    AlreadyApplied,
}

// ── Row operations ─────────────────────────────────────────────────

impl Tx<'_> {
    pub fn select_execution(
        &self,
        shard_id: ShardId,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> PersistenceResult<Option<WorkflowExecution>> {
        let table = self.txn.open_table(EXECUTIONS).map_err(map_err!(Table))?;
        let row = match table
            .get((shard_id, domain_id, workflow_id, run_id))
            .map_err(map_err!(Read))?
        {
            Some(guard) => Some(decode(guard.value())?),
            None => None,
        };
        Ok(row)
    }

    /// Insert a new execution row; the run id must be unused.
    pub fn insert_execution(
        &self,
        shard_id: ShardId,
        execution: &WorkflowExecution,
    ) -> PersistenceResult<()> {
        let key = execution_key(shard_id, execution);
        let value = encode(execution)?;
        let mut table = self.txn.open_table(EXECUTIONS).map_err(map_err!(Table))?;
        if table.get(key).map_err(map_err!(Read))?.is_some() {
            return Err(PersistenceError::already_exists(format!(
                "execution {}/{}/{}",
                execution.domain_id, execution.workflow_id, execution.run_id
            )));
        }
        table.insert(key, value.as_slice()).map_err(map_err!(Write))?;
        debug!(
            shard_id,
            workflow_id = %execution.workflow_id,
            run_id = %execution.run_id,
            state = %execution.state,
            "execution inserted"
        );
        Ok(())
    }

    /// Overwrite an existing execution row.
    pub fn update_execution(
        &self,
        shard_id: ShardId,
        execution: &WorkflowExecution,
    ) -> PersistenceResult<()> {
        let key = execution_key(shard_id, execution);
        let value = encode(execution)?;
        let mut table = self.txn.open_table(EXECUTIONS).map_err(map_err!(Table))?;
        if table.get(key).map_err(map_err!(Read))?.is_none() {
            return Err(PersistenceError::NotFound(format!(
                "execution {}/{}/{}",
                execution.domain_id, execution.workflow_id, execution.run_id
            )));
        }
        table.insert(key, value.as_slice()).map_err(map_err!(Write))?;
        debug!(
            shard_id,
            workflow_id = %execution.workflow_id,
            run_id = %execution.run_id,
            state = %execution.state,
            "execution updated"
        );
        Ok(())
    }

    /// Read the current pointer of a workflow under the transaction's
    /// exclusive lock.
    pub fn lock_current_execution(
        &self,
        shard_id: ShardId,
        domain_id: &str,
        workflow_id: &str,
    ) -> PersistenceResult<Option<CurrentExecution>> {
        let table = self
            .txn
            .open_table(CURRENT_EXECUTIONS)
            .map_err(map_err!(Table))?;
        let current = match table
            .get((shard_id, domain_id, workflow_id))
            .map_err(map_err!(Read))?
        {
            Some(guard) => Some(decode(guard.value())?),
            None => None,
        };
        Ok(current)
    }

    /// Point the workflow's current pointer at `execution`. A zombie run is
    /// never allowed to hold the pointer.
    pub fn put_current_execution(
        &self,
        shard_id: ShardId,
        execution: &WorkflowExecution,
    ) -> PersistenceResult<()> {
        if execution.state == WorkflowState::Zombie {
            return Err(PersistenceError::InvalidArgument(format!(
                "zombie run {} cannot become current",
                execution.run_id
            )));
        }
        let value = encode(&CurrentExecution::from(execution))?;
        let mut table = self
            .txn
            .open_table(CURRENT_EXECUTIONS)
            .map_err(map_err!(Table))?;
        table
            .insert(
                (
                    shard_id,
                    execution.domain_id.as_str(),
                    execution.workflow_id.as_str(),
                ),
                value.as_slice(),
            )
            .map_err(map_err!(Write))?;
        debug!(
            shard_id,
            workflow_id = %execution.workflow_id,
            run_id = %execution.run_id,
            "current pointer moved"
        );
        Ok(())
    }
}

fn execution_key(shard_id: ShardId, e: &WorkflowExecution) -> (u32, &str, &str, &str) {
    (
        shard_id,
        e.domain_id.as_str(),
        e.workflow_id.as_str(),
        e.run_id.as_str(),
    )
}

// ── Request checks ────────────────────────────────────────────────

/// Shape checks every participant must pass before touching storage.
fn check_participants<'a>(
    participants: impl IntoIterator<Item = &'a WorkflowExecution>,
) -> PersistenceResult<()> {
    let participants: Vec<&WorkflowExecution> = participants.into_iter().collect();
    for execution in &participants {
        execution
            .check_close_status()
            .map_err(PersistenceError::InvalidArgument)?;
    }
    let Some((head, rest)) = participants.split_first() else {
        return Ok(());
    };
    for execution in rest {
        if !head.same_workflow(execution) {
            return Err(PersistenceError::InvalidArgument(format!(
                "run {} belongs to {}/{}, expected {}/{}",
                execution.run_id,
                execution.domain_id,
                execution.workflow_id,
                head.domain_id,
                head.workflow_id
            )));
        }
    }
    for (i, a) in participants.iter().enumerate() {
        if participants[i + 1..].iter().any(|b| a.run_id == b.run_id) {
            return Err(PersistenceError::InvalidArgument(format!(
                "run {} appears twice in one request",
                a.run_id
            )));
        }
    }
    Ok(())
}

/// Whether every row in `rows` is already stored exactly as given, i.e. an
/// off-pointer write has committed before.
fn rows_already_written<'a>(
    tx: &Tx<'_>,
    shard_id: ShardId,
    rows: impl IntoIterator<Item = &'a WorkflowExecution>,
) -> PersistenceResult<bool> {
    for row in rows {
        let stored =
            tx.select_execution(shard_id, &row.domain_id, &row.workflow_id, &row.run_id)?;
        if stored.as_ref() != Some(row) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Whether `pointer` already names `execution` as written by the same
/// request, i.e. this request is a re-issue of a committed one.
fn written_by_same_request(pointer: &CurrentExecution, execution: &WorkflowExecution) -> bool {
    pointer.run_id == execution.run_id && pointer.create_request_id == execution.create_request_id
}

fn condition_failed(
    workflow_id: &str,
    pointer: Option<&CurrentExecution>,
    expected: &str,
) -> PersistenceError {
    let found = pointer.map_or("none", |p| p.run_id.as_str());
    PersistenceError::CurrentConditionFailed(format!(
        "workflow {workflow_id}: current run is {found}, expected {expected}"
    ))
}

// ── Facade ────────────────────────────────────────────────────────

impl Store {
    /// Create a workflow run.
    pub fn create_execution(
        &self,
        ctx: &OpContext,
        req: &CreateExecutionRequest,
    ) -> PersistenceResult<WriteOutcome> {
        check_participants([&req.new])?;
        let new = &req.new;

        self.transact_shard(ctx, req.shard_id, |tx| {
            tx.assert_shard_owner(req.shard_id, req.range_id)?;
            validate_create(req.mode, new.state)?;

            let pointer =
                tx.lock_current_execution(req.shard_id, &new.domain_id, &new.workflow_id)?;

            match req.mode {
                CreateMode::BrandNew => {
                    if let Some(pointer) = pointer {
                        if written_by_same_request(&pointer, new) {
                            return Ok(WriteOutcome::AlreadyApplied);
                        }
                        return Err(PersistenceError::AlreadyExists {
                            what: format!("current run of workflow {}", new.workflow_id),
                            current: Some(pointer),
                        });
                    }
                }
                CreateMode::WorkflowIdReuse | CreateMode::ContinueAsNew => {
                    let previous = req.previous.as_ref().ok_or_else(|| {
                        PersistenceError::InvalidArgument(format!(
                            "{:?} create requires the previous run",
                            req.mode
                        ))
                    })?;
                    let Some(pointer) = pointer else {
                        return Err(condition_failed(&new.workflow_id, None, &previous.run_id));
                    };
                    if written_by_same_request(&pointer, new) {
                        return Ok(WriteOutcome::AlreadyApplied);
                    }
                    if pointer.run_id != previous.run_id {
                        return Err(condition_failed(
                            &new.workflow_id,
                            Some(&pointer),
                            &previous.run_id,
                        ));
                    }
                    if req.mode == CreateMode::WorkflowIdReuse {
                        if pointer.last_write_version != previous.last_write_version {
                            return Err(PersistenceError::CurrentConditionFailed(format!(
                                "workflow {}: current last write version is {}, expected {}",
                                new.workflow_id,
                                pointer.last_write_version,
                                previous.last_write_version
                            )));
                        }
                        if pointer.state != WorkflowState::Completed {
                            return Err(PersistenceError::CurrentConditionFailed(format!(
                                "workflow {}: current run {} is {}, not completed",
                                new.workflow_id, pointer.run_id, pointer.state
                            )));
                        }
                    }
                }
                CreateMode::Zombie => {
                    if let Some(pointer) = &pointer {
                        if pointer.run_id == new.run_id {
                            return Err(PersistenceError::CurrentConditionFailed(format!(
                                "workflow {}: zombie run {} is the current run",
                                new.workflow_id, new.run_id
                            )));
                        }
                    }
                    if rows_already_written(tx, req.shard_id, [new])? {
                        return Ok(WriteOutcome::AlreadyApplied);
                    }
                }
            }

            tx.insert_execution(req.shard_id, new)?;
            if req.mode != CreateMode::Zombie {
                tx.put_current_execution(req.shard_id, new)?;
            }
            Ok(WriteOutcome::Applied)
        })
    }

    /// Update a run, optionally starting a new run in the same commit.
    pub fn update_execution(
        &self,
        ctx: &OpContext,
        req: &UpdateExecutionRequest,
    ) -> PersistenceResult<WriteOutcome> {
        check_participants(std::iter::once(&req.current).chain(req.new.as_ref()))?;
        let current = &req.current;
        let new = req.new.as_ref();

        self.transact_shard(ctx, req.shard_id, |tx| {
            tx.assert_shard_owner(req.shard_id, req.range_id)?;
            validate_update(req.mode, current.state, new.map(|n| n.state))?;

            let pointer = tx.lock_current_execution(
                req.shard_id,
                &current.domain_id,
                &current.workflow_id,
            )?;

            match req.mode {
                UpdateMode::UpdateCurrent => {
                    let on_current = pointer
                        .as_ref()
                        .is_some_and(|p| p.run_id == current.run_id);
                    if !on_current {
                        let reissued = match (pointer.as_ref(), new) {
                            (Some(p), Some(n)) => written_by_same_request(p, n),
                            _ => false,
                        };
                        if reissued {
                            return Ok(WriteOutcome::AlreadyApplied);
                        }
                        return Err(condition_failed(
                            &current.workflow_id,
                            pointer.as_ref(),
                            &current.run_id,
                        ));
                    }
                }
                UpdateMode::BypassCurrent => {
                    let touches_pointer = pointer.as_ref().is_some_and(|p| {
                        p.run_id == current.run_id || new.is_some_and(|n| n.run_id == p.run_id)
                    });
                    if touches_pointer {
                        return Err(PersistenceError::CurrentConditionFailed(format!(
                            "workflow {}: bypass update names the current run",
                            current.workflow_id
                        )));
                    }
                    // Only the insert of a new run fails on replay.
                    if new.is_some()
                        && rows_already_written(
                            tx,
                            req.shard_id,
                            std::iter::once(current).chain(new),
                        )?
                    {
                        return Ok(WriteOutcome::AlreadyApplied);
                    }
                }
                UpdateMode::IgnoreCurrent => {}
            }

            tx.update_execution(req.shard_id, current)?;
            if let Some(new) = new {
                tx.insert_execution(req.shard_id, new)?;
            }
            if req.mode == UpdateMode::UpdateCurrent {
                tx.put_current_execution(req.shard_id, new.unwrap_or(current))?;
            }
            Ok(WriteOutcome::Applied)
        })
    }

    /// Rewrite a run after a history branch reset, optionally closing the
    /// current run and starting a new one in the same commit.
    pub fn conflict_resolve_execution(
        &self,
        ctx: &OpContext,
        req: &ConflictResolveExecutionRequest,
    ) -> PersistenceResult<WriteOutcome> {
        check_participants(
            std::iter::once(&req.reset)
                .chain(req.new.as_ref())
                .chain(req.current.as_ref()),
        )?;
        let reset = &req.reset;
        let new = req.new.as_ref();
        let current = req.current.as_ref();

        self.transact_shard(ctx, req.shard_id, |tx| {
            tx.assert_shard_owner(req.shard_id, req.range_id)?;
            validate_conflict_resolve(
                req.mode,
                reset.state,
                new.map(|n| n.state),
                current.map(|c| c.state),
            )?;

            let pointer =
                tx.lock_current_execution(req.shard_id, &reset.domain_id, &reset.workflow_id)?;

            match req.mode {
                ConflictResolveMode::UpdateCurrent => {
                    let expected = current.unwrap_or(reset);
                    let target = new.unwrap_or(reset);
                    let Some(pointer) = pointer else {
                        return Err(condition_failed(&reset.workflow_id, None, &expected.run_id));
                    };
                    if pointer.run_id != expected.run_id {
                        if written_by_same_request(&pointer, target) {
                            return Ok(WriteOutcome::AlreadyApplied);
                        }
                        return Err(condition_failed(
                            &reset.workflow_id,
                            Some(&pointer),
                            &expected.run_id,
                        ));
                    }
                }
                ConflictResolveMode::BypassCurrent => {
                    let touches_pointer = pointer.as_ref().is_some_and(|p| {
                        p.run_id == reset.run_id || new.is_some_and(|n| n.run_id == p.run_id)
                    });
                    if touches_pointer {
                        return Err(PersistenceError::CurrentConditionFailed(format!(
                            "workflow {}: bypass reset names the current run",
                            reset.workflow_id
                        )));
                    }
                    if new.is_some()
                        && rows_already_written(
                            tx,
                            req.shard_id,
                            std::iter::once(reset).chain(new),
                        )?
                    {
                        return Ok(WriteOutcome::AlreadyApplied);
                    }
                }
            }

            tx.update_execution(req.shard_id, reset)?;
            if let Some(current) = current {
                tx.update_execution(req.shard_id, current)?;
            }
            if let Some(new) = new {
                tx.insert_execution(req.shard_id, new)?;
            }
            if req.mode == ConflictResolveMode::UpdateCurrent {
                tx.put_current_execution(req.shard_id, new.unwrap_or(reset))?;
            }
            Ok(WriteOutcome::Applied)
        })
    }

    /// Non-locking read of one execution row.
    pub fn get_execution(
        &self,
        shard_id: ShardId,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> PersistenceResult<WorkflowExecution> {
        let txn = self.begin_read_shard(shard_id)?;
        let table = txn.open_table(EXECUTIONS).map_err(map_err!(Table))?;
        match table
            .get((shard_id, domain_id, workflow_id, run_id))
            .map_err(map_err!(Read))?
        {
            Some(guard) => decode(guard.value()),
            None => Err(PersistenceError::NotFound(format!(
                "execution {domain_id}/{workflow_id}/{run_id}"
            ))),
        }
    }

    /// Non-locking read of a workflow's current pointer.
    pub fn get_current_execution(
        &self,
        shard_id: ShardId,
        domain_id: &str,
        workflow_id: &str,
    ) -> PersistenceResult<CurrentExecution> {
        let txn = self.begin_read_shard(shard_id)?;
        let table = txn
            .open_table(CURRENT_EXECUTIONS)
            .map_err(map_err!(Table))?;
        match table
            .get((shard_id, domain_id, workflow_id))
            .map_err(map_err!(Read))?
        {
            Some(guard) => decode(guard.value()),
            None => Err(PersistenceError::NotFound(format!(
                "current execution of {domain_id}/{workflow_id}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fence_core::{CloseStatus, Participant};

    const SHARD: ShardId = 1;

    struct Fixture {
        store: Store,
        ctx: OpContext,
        range_id: RangeId,
    }

    fn fixture() -> Fixture {
        let store = Store::open_in_memory().unwrap();
        let ctx = OpContext::background();
        let range_id = store.acquire_shard(&ctx, SHARD).unwrap().range_id;
        Fixture {
            store,
            ctx,
            range_id,
        }
    }

    fn run(run_id: &str, state: WorkflowState) -> WorkflowExecution {
        WorkflowExecution::new("dom", "wf", run_id, state)
    }

    impl Fixture {
        fn create(&self, mode: CreateMode, new: WorkflowExecution) -> PersistenceResult<WriteOutcome> {
            self.create_after(mode, None, new)
        }

        fn create_after(
            &self,
            mode: CreateMode,
            previous: Option<PreviousRun>,
            new: WorkflowExecution,
        ) -> PersistenceResult<WriteOutcome> {
            self.store.create_execution(
                &self.ctx,
                &CreateExecutionRequest {
                    shard_id: SHARD,
                    range_id: self.range_id,
                    mode,
                    previous,
                    new,
                },
            )
        }

        fn update(
            &self,
            mode: UpdateMode,
            current: WorkflowExecution,
            new: Option<WorkflowExecution>,
        ) -> PersistenceResult<WriteOutcome> {
            self.store.update_execution(
                &self.ctx,
                &UpdateExecutionRequest {
                    shard_id: SHARD,
                    range_id: self.range_id,
                    mode,
                    current,
                    new,
                },
            )
        }

        fn resolve(
            &self,
            mode: ConflictResolveMode,
            reset: WorkflowExecution,
            new: Option<WorkflowExecution>,
            current: Option<WorkflowExecution>,
        ) -> PersistenceResult<WriteOutcome> {
            self.store.conflict_resolve_execution(
                &self.ctx,
                &ConflictResolveExecutionRequest {
                    shard_id: SHARD,
                    range_id: self.range_id,
                    mode,
                    reset,
                    new,
                    current,
                },
            )
        }

        fn pointer(&self) -> Option<CurrentExecution> {
            match self.store.get_current_execution(SHARD, "dom", "wf") {
                Ok(p) => Some(p),
                Err(PersistenceError::NotFound(_)) => None,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    }

    // ── Create ─────────────────────────────────────────────────────

    #[test]
    fn brand_new_installs_pointer() {
        let f = fixture();
        assert_eq!(
            f.create(CreateMode::BrandNew, run("r1", WorkflowState::Running))
                .unwrap(),
            WriteOutcome::Applied
        );
        let pointer = f.pointer().unwrap();
        assert_eq!(pointer.run_id, "r1");
        assert_eq!(pointer.state, WorkflowState::Running);
        assert_eq!(
            f.store.get_execution(SHARD, "dom", "wf", "r1").unwrap().state,
            WorkflowState::Running
        );
    }

    #[test]
    fn brand_new_with_terminal_state_is_rejected_without_writes() {
        let f = fixture();
        let err = f
            .create(CreateMode::BrandNew, run("r1", WorkflowState::Completed))
            .unwrap_err();
        assert!(matches!(err, PersistenceError::InvalidModeState(_)));
        assert!(f.pointer().is_none());
        assert!(f.store.get_execution(SHARD, "dom", "wf", "r1").is_err());
    }

    #[test]
    fn brand_new_race_loses_with_already_exists() {
        let f = fixture();
        f.create(CreateMode::BrandNew, run("r1", WorkflowState::Running))
            .unwrap();
        let err = f
            .create(CreateMode::BrandNew, run("r2", WorkflowState::Running))
            .unwrap_err();
        match err {
            PersistenceError::AlreadyExists { current, .. } => {
                assert_eq!(current.unwrap().run_id, "r1");
            }
            other => panic!("expected AlreadyExists, got {other}"),
        }
        assert_eq!(f.pointer().unwrap().run_id, "r1");
    }

    #[test]
    fn reissued_create_is_already_applied() {
        let f = fixture();
        let new = run("r1", WorkflowState::Created);
        f.create(CreateMode::BrandNew, new.clone()).unwrap();
        assert_eq!(
            f.create(CreateMode::BrandNew, new).unwrap(),
            WriteOutcome::AlreadyApplied
        );
        assert_eq!(f.pointer().unwrap().run_id, "r1");
    }

    #[test]
    fn create_over_own_run_with_other_request_is_rejected() {
        let f = fixture();
        f.create(CreateMode::BrandNew, run("r1", WorkflowState::Running))
            .unwrap();
        let err = f
            .create(
                CreateMode::BrandNew,
                run("r1", WorkflowState::Running).with_request_id("req-other"),
            )
            .unwrap_err();
        assert!(matches!(err, PersistenceError::AlreadyExists { .. }));

        f.update(
            UpdateMode::UpdateCurrent,
            run("r1", WorkflowState::Completed),
            None,
        )
        .unwrap();
        let previous = PreviousRun {
            run_id: "r1".to_string(),
            last_write_version: 0,
        };
        f.create_after(
            CreateMode::ContinueAsNew,
            Some(previous.clone()),
            run("r2", WorkflowState::Running),
        )
        .unwrap();

        // Same run id, different request: the pointer has moved past r1.
        assert!(matches!(
            f.create_after(
                CreateMode::ContinueAsNew,
                Some(previous),
                run("r2", WorkflowState::Running).with_request_id("req-other"),
            ),
            Err(PersistenceError::CurrentConditionFailed(_))
        ));
        let pointer = f.pointer().unwrap();
        assert_eq!(pointer.run_id, "r2");
        assert_eq!(pointer.create_request_id, "req-r2");
    }

    #[test]
    fn workflow_id_reuse_requires_completed_previous() {
        let f = fixture();
        f.create(CreateMode::BrandNew, run("r1", WorkflowState::Running))
            .unwrap();
        let previous = PreviousRun {
            run_id: "r1".to_string(),
            last_write_version: 0,
        };

        let err = f
            .create_after(
                CreateMode::WorkflowIdReuse,
                Some(previous.clone()),
                run("r2", WorkflowState::Running),
            )
            .unwrap_err();
        assert!(matches!(err, PersistenceError::CurrentConditionFailed(_)));

        f.update(
            UpdateMode::UpdateCurrent,
            run("r1", WorkflowState::Completed),
            None,
        )
        .unwrap();
        f.create_after(
            CreateMode::WorkflowIdReuse,
            Some(previous),
            run("r2", WorkflowState::Running),
        )
        .unwrap();
        assert_eq!(f.pointer().unwrap().run_id, "r2");
    }

    #[test]
    fn workflow_id_reuse_checks_previous_identity() {
        let f = fixture();
        f.create(CreateMode::BrandNew, run("r1", WorkflowState::Running))
            .unwrap();
        f.update(
            UpdateMode::UpdateCurrent,
            run("r1", WorkflowState::Completed),
            None,
        )
        .unwrap();

        let wrong_run = PreviousRun {
            run_id: "r0".to_string(),
            last_write_version: 0,
        };
        assert!(matches!(
            f.create_after(
                CreateMode::WorkflowIdReuse,
                Some(wrong_run),
                run("r2", WorkflowState::Running)
            ),
            Err(PersistenceError::CurrentConditionFailed(_))
        ));

        let wrong_version = PreviousRun {
            run_id: "r1".to_string(),
            last_write_version: 9,
        };
        assert!(matches!(
            f.create_after(
                CreateMode::WorkflowIdReuse,
                Some(wrong_version),
                run("r2", WorkflowState::Running)
            ),
            Err(PersistenceError::CurrentConditionFailed(_))
        ));

        assert!(matches!(
            f.create(CreateMode::ContinueAsNew, run("r2", WorkflowState::Running)),
            Err(PersistenceError::InvalidArgument(_))
        ));
    }

    #[test]
    fn workflow_id_reuse_matches_last_write_version() {
        let f = fixture();
        f.create(
            CreateMode::BrandNew,
            run("r1", WorkflowState::Running).with_last_write_version(7),
        )
        .unwrap();
        f.update(
            UpdateMode::UpdateCurrent,
            run("r1", WorkflowState::Completed).with_last_write_version(7),
            None,
        )
        .unwrap();
        assert_eq!(f.pointer().unwrap().last_write_version, 7);

        let stale = PreviousRun {
            run_id: "r1".to_string(),
            last_write_version: 6,
        };
        assert!(matches!(
            f.create_after(
                CreateMode::WorkflowIdReuse,
                Some(stale),
                run("r2", WorkflowState::Running)
            ),
            Err(PersistenceError::CurrentConditionFailed(_))
        ));

        let matching = PreviousRun {
            run_id: "r1".to_string(),
            last_write_version: 7,
        };
        f.create_after(
            CreateMode::WorkflowIdReuse,
            Some(matching),
            run("r2", WorkflowState::Running),
        )
        .unwrap();
        assert_eq!(f.pointer().unwrap().run_id, "r2");
    }

    #[test]
    fn zombie_create_leaves_pointer_alone() {
        let f = fixture();
        f.create(CreateMode::BrandNew, run("r1", WorkflowState::Running))
            .unwrap();

        assert!(matches!(
            f.create(CreateMode::Zombie, run("z1", WorkflowState::Running)),
            Err(PersistenceError::InvalidModeState(_))
        ));
        f.create(CreateMode::Zombie, run("z1", WorkflowState::Zombie))
            .unwrap();
        assert_eq!(
            f.create(CreateMode::Zombie, run("z1", WorkflowState::Zombie))
                .unwrap(),
            WriteOutcome::AlreadyApplied
        );
        assert_eq!(f.pointer().unwrap().run_id, "r1");
        assert_eq!(
            f.store.get_execution(SHARD, "dom", "wf", "z1").unwrap().state,
            WorkflowState::Zombie
        );
    }

    // ── Update ─────────────────────────────────────────────────────

    #[test]
    fn continue_as_new_through_update_moves_pointer() {
        let f = fixture();
        f.create(CreateMode::BrandNew, run("r1", WorkflowState::Running))
            .unwrap();

        let closed = run("r1", WorkflowState::Completed)
            .with_close_status(CloseStatus::ContinuedAsNew);
        f.update(
            UpdateMode::UpdateCurrent,
            closed.clone(),
            Some(run("r2", WorkflowState::Running)),
        )
        .unwrap();
        assert_eq!(f.pointer().unwrap().run_id, "r2");

        // Re-issue after commit is recognised, not duplicated.
        assert_eq!(
            f.update(
                UpdateMode::UpdateCurrent,
                closed,
                Some(run("r2", WorkflowState::Running))
            )
            .unwrap(),
            WriteOutcome::AlreadyApplied
        );
        assert_eq!(f.pointer().unwrap().run_id, "r2");
    }

    #[test]
    fn update_current_with_live_outgoing_run_rejected() {
        let f = fixture();
        f.create(CreateMode::BrandNew, run("r1", WorkflowState::Running))
            .unwrap();
        let err = f
            .update(
                UpdateMode::UpdateCurrent,
                run("r1", WorkflowState::Running),
                Some(run("r2", WorkflowState::Running)),
            )
            .unwrap_err();
        match err {
            PersistenceError::InvalidModeState(e) => assert!(e.violated(Participant::Current)),
            other => panic!("expected InvalidModeState, got {other}"),
        }
        assert!(f.store.get_execution(SHARD, "dom", "wf", "r2").is_err());
    }

    #[test]
    fn update_current_on_non_current_run_fails_condition() {
        let f = fixture();
        f.create(CreateMode::BrandNew, run("r1", WorkflowState::Running))
            .unwrap();
        f.create(CreateMode::Zombie, run("z1", WorkflowState::Zombie))
            .unwrap();
        assert!(matches!(
            f.update(
                UpdateMode::UpdateCurrent,
                run("z1", WorkflowState::Completed),
                None
            ),
            Err(PersistenceError::CurrentConditionFailed(_))
        ));
    }

    #[test]
    fn bypass_update_requires_non_current_run() {
        let f = fixture();
        f.create(CreateMode::BrandNew, run("r1", WorkflowState::Running))
            .unwrap();
        f.create(CreateMode::Zombie, run("z1", WorkflowState::Zombie))
            .unwrap();

        f.update(
            UpdateMode::BypassCurrent,
            run("z1", WorkflowState::Zombie),
            None,
        )
        .unwrap();
        assert!(matches!(
            f.update(
                UpdateMode::BypassCurrent,
                run("r1", WorkflowState::Completed),
                None
            ),
            Err(PersistenceError::CurrentConditionFailed(_))
        ));
        assert_eq!(f.pointer().unwrap().state, WorkflowState::Running);
    }

    #[test]
    fn reissued_bypass_update_is_already_applied() {
        let f = fixture();
        f.create(CreateMode::BrandNew, run("r1", WorkflowState::Running))
            .unwrap();
        f.create(CreateMode::Zombie, run("z1", WorkflowState::Zombie))
            .unwrap();

        let bypass = || {
            f.update(
                UpdateMode::BypassCurrent,
                run("z1", WorkflowState::Zombie),
                Some(run("z2", WorkflowState::Created)),
            )
        };
        assert_eq!(bypass().unwrap(), WriteOutcome::Applied);
        assert_eq!(bypass().unwrap(), WriteOutcome::AlreadyApplied);
        assert_eq!(f.pointer().unwrap().run_id, "r1");

        // A different payload for the same new run is still a collision.
        let mut changed = run("z2", WorkflowState::Created);
        changed.data = b"{\"events\":3}".to_vec();
        assert!(matches!(
            f.update(
                UpdateMode::BypassCurrent,
                run("z1", WorkflowState::Zombie),
                Some(changed),
            ),
            Err(PersistenceError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn ignore_current_updates_row_only() {
        let f = fixture();
        f.create(CreateMode::BrandNew, run("r1", WorkflowState::Running))
            .unwrap();
        f.create(CreateMode::Zombie, run("z1", WorkflowState::Zombie))
            .unwrap();

        let mut touched = run("z1", WorkflowState::Zombie);
        touched.data = b"{\"events\":12}".to_vec();
        f.update(UpdateMode::IgnoreCurrent, touched.clone(), None)
            .unwrap();
        assert_eq!(
            f.store.get_execution(SHARD, "dom", "wf", "z1").unwrap(),
            touched
        );

        assert!(matches!(
            f.update(
                UpdateMode::IgnoreCurrent,
                run("z1", WorkflowState::Zombie),
                Some(run("z2", WorkflowState::Zombie))
            ),
            Err(PersistenceError::InvalidModeState(_))
        ));
    }

    #[test]
    fn update_of_missing_run_is_not_found() {
        let f = fixture();
        assert!(matches!(
            f.update(
                UpdateMode::IgnoreCurrent,
                run("ghost", WorkflowState::Running),
                None
            ),
            Err(PersistenceError::NotFound(_))
        ));
    }

    // ── Conflict resolve ───────────────────────────────────────────

    #[test]
    fn reset_with_new_run_moves_pointer() {
        let f = fixture();
        f.create(CreateMode::BrandNew, run("r1", WorkflowState::Running))
            .unwrap();
        f.resolve(
            ConflictResolveMode::UpdateCurrent,
            run("r1", WorkflowState::Completed).with_close_status(CloseStatus::Terminated),
            Some(run("r2", WorkflowState::Running)),
            None,
        )
        .unwrap();
        assert_eq!(f.pointer().unwrap().run_id, "r2");
    }

    #[test]
    fn reset_of_older_run_closes_current() {
        let f = fixture();
        f.create(CreateMode::BrandNew, run("r1", WorkflowState::Running))
            .unwrap();
        f.update(
            UpdateMode::UpdateCurrent,
            run("r1", WorkflowState::Completed),
            Some(run("r2", WorkflowState::Running)),
        )
        .unwrap();

        // Reset r1 back to running; the current run r2 is closed as zombie.
        f.resolve(
            ConflictResolveMode::UpdateCurrent,
            run("r1", WorkflowState::Running),
            None,
            Some(run("r2", WorkflowState::Zombie)),
        )
        .unwrap();
        let pointer = f.pointer().unwrap();
        assert_eq!(pointer.run_id, "r1");
        assert_eq!(pointer.state, WorkflowState::Running);
        assert_eq!(
            f.store.get_execution(SHARD, "dom", "wf", "r2").unwrap().state,
            WorkflowState::Zombie
        );
    }

    #[test]
    fn bypass_reset_attaches_zombie_only() {
        let f = fixture();
        f.create(CreateMode::BrandNew, run("r1", WorkflowState::Running))
            .unwrap();
        f.create(CreateMode::Zombie, run("z1", WorkflowState::Zombie))
            .unwrap();

        // z1 is rebuilt as running outside the current pointer.
        f.resolve(
            ConflictResolveMode::BypassCurrent,
            run("z1", WorkflowState::Running),
            Some(run("z2", WorkflowState::Zombie)),
            None,
        )
        .unwrap();
        assert_eq!(f.pointer().unwrap().run_id, "r1");

        assert!(matches!(
            f.resolve(
                ConflictResolveMode::BypassCurrent,
                run("z1", WorkflowState::Running),
                Some(run("z3", WorkflowState::Running)),
                None,
            ),
            Err(PersistenceError::InvalidModeState(_))
        ));
    }

    #[test]
    fn reissued_bypass_reset_is_already_applied() {
        let f = fixture();
        f.create(CreateMode::BrandNew, run("r1", WorkflowState::Running))
            .unwrap();
        f.create(CreateMode::Zombie, run("z1", WorkflowState::Zombie))
            .unwrap();

        let reset = || {
            f.resolve(
                ConflictResolveMode::BypassCurrent,
                run("z1", WorkflowState::Running),
                Some(run("z2", WorkflowState::Zombie)),
                None,
            )
        };
        assert_eq!(reset().unwrap(), WriteOutcome::Applied);
        assert_eq!(reset().unwrap(), WriteOutcome::AlreadyApplied);
        assert_eq!(f.pointer().unwrap().run_id, "r1");
        assert_eq!(
            f.store.get_execution(SHARD, "dom", "wf", "z1").unwrap().state,
            WorkflowState::Running
        );
    }

    #[test]
    fn conjunctive_rejection_reports_every_participant() {
        let f = fixture();
        let err = f
            .resolve(
                ConflictResolveMode::UpdateCurrent,
                run("r1", WorkflowState::Zombie),
                Some(run("r2", WorkflowState::Completed)),
                Some(run("r3", WorkflowState::Running)),
            )
            .unwrap_err();
        let PersistenceError::InvalidModeState(e) = err else {
            panic!("expected InvalidModeState");
        };
        assert_eq!(e.violations.len(), 3);
    }

    // ── Fencing and request shape ──────────────────────────────────

    #[test]
    fn stale_range_id_is_fenced_and_writes_nothing() {
        let f = fixture();
        f.store.acquire_shard(&f.ctx, SHARD).unwrap();

        let err = f
            .create(CreateMode::BrandNew, run("r1", WorkflowState::Running))
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Fenced { .. }));
        assert!(f.pointer().is_none());
        assert!(f.store.get_execution(SHARD, "dom", "wf", "r1").is_err());
    }

    #[test]
    fn stale_range_id_fences_conflict_resolve() {
        let f = fixture();
        f.create(CreateMode::BrandNew, run("r1", WorkflowState::Running))
            .unwrap();
        f.store.acquire_shard(&f.ctx, SHARD).unwrap();

        let err = f
            .resolve(
                ConflictResolveMode::UpdateCurrent,
                run("r1", WorkflowState::Completed),
                Some(run("r2", WorkflowState::Running)),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Fenced { .. }));
        assert_eq!(f.pointer().unwrap().run_id, "r1");
        assert_eq!(
            f.store.get_execution(SHARD, "dom", "wf", "r1").unwrap().state,
            WorkflowState::Running
        );
        assert!(f.store.get_execution(SHARD, "dom", "wf", "r2").is_err());
    }

    #[test]
    fn mixed_workflows_in_one_request_rejected() {
        let f = fixture();
        let other = WorkflowExecution::new("dom", "other-wf", "r2", WorkflowState::Running);
        assert!(matches!(
            f.update(
                UpdateMode::UpdateCurrent,
                run("r1", WorkflowState::Completed),
                Some(other)
            ),
            Err(PersistenceError::InvalidArgument(_))
        ));
    }

    #[test]
    fn repeated_run_id_in_one_request_rejected() {
        let f = fixture();
        f.create(CreateMode::BrandNew, run("r1", WorkflowState::Running))
            .unwrap();
        assert!(matches!(
            f.resolve(
                ConflictResolveMode::UpdateCurrent,
                run("r0", WorkflowState::Running),
                Some(run("r1", WorkflowState::Running)),
                Some(run("r1", WorkflowState::Zombie)),
            ),
            Err(PersistenceError::InvalidArgument(_))
        ));
        assert_eq!(f.pointer().unwrap().state, WorkflowState::Running);
    }

    #[test]
    fn completed_without_close_status_rejected() {
        let f = fixture();
        let bad = run("r1", WorkflowState::Completed).with_close_status(CloseStatus::None);
        assert!(matches!(
            f.update(UpdateMode::IgnoreCurrent, bad, None),
            Err(PersistenceError::InvalidArgument(_))
        ));
    }

    #[test]
    fn cancelled_context_commits_nothing() {
        let f = fixture();
        let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
        cancel_tx.send(true).unwrap();
        let ctx = OpContext::background().with_cancel(cancel_rx);

        let err = f
            .store
            .create_execution(
                &ctx,
                &CreateExecutionRequest {
                    shard_id: SHARD,
                    range_id: f.range_id,
                    mode: CreateMode::BrandNew,
                    previous: None,
                    new: run("r1", WorkflowState::Running),
                },
            )
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Cancelled));
        assert!(f.pointer().is_none());
    }
}
