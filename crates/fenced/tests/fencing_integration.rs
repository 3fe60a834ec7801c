//! Fencing integration tests.
//!
//! Drives the full stack the daemon assembles: config on disk, a sharded
//! redb store, the static membership ring, and shard leases, then checks
//! that ownership handoffs fence the previous host's execution writes.

use std::sync::{Arc, Barrier};
use std::thread;

use fence_core::config::MembershipConfig;
use fence_core::{
    CloseStatus, CreateMode, DomainRecord, Encoding, FenceConfig, UpdateMode, WorkflowExecution,
    WorkflowState,
};
use fencegrid_membership::{HostInfo, Monitor, ShardLeaseManager, StaticMonitor};
use fencegrid_persistence::{
    CreateExecutionRequest, DomainKey, OpContext, PersistenceError, Store, UpdateExecutionRequest,
    WriteOutcome,
};

const NUM_SHARDS: u32 = 8;

fn open_store(dir: &std::path::Path) -> (FenceConfig, Store) {
    let mut config = FenceConfig::scaffold(dir, NUM_SHARDS);
    config.persistence.num_db_shards = 2;
    config.validate().unwrap();
    let store = Store::open(&config.persistence.data_dir, config.persistence.num_db_shards).unwrap();
    store
        .create_shards(&OpContext::background(), NUM_SHARDS)
        .unwrap();
    (config, store)
}

fn create_request(shard_id: u32, range_id: i64, run_id: &str) -> CreateExecutionRequest {
    CreateExecutionRequest {
        shard_id,
        range_id,
        mode: CreateMode::BrandNew,
        previous: None,
        new: WorkflowExecution::new("orders", "wf-1", run_id, WorkflowState::Running),
    }
}

#[test]
fn config_written_by_init_opens_the_same_store() {
    let dir = tempfile::tempdir().unwrap();
    let (config, store) = open_store(dir.path());
    let path = dir.path().join("fenced.toml");
    std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();
    drop(store);

    let loaded = FenceConfig::from_file(&path).unwrap();
    assert_eq!(loaded, config);
    let store = Store::open(&loaded.persistence.data_dir, loaded.persistence.num_db_shards).unwrap();
    for shard_id in 0..NUM_SHARDS {
        assert_eq!(store.get_shard(shard_id).unwrap().range_id, 0);
    }
}

#[test]
fn handoff_fences_previous_owner() {
    let dir = tempfile::tempdir().unwrap();
    let (_config, store) = open_store(dir.path());
    let ctx = OpContext::background();

    let monitor = StaticMonitor::new(HostInfo::new("host-a:7934"))
        .with_service("history", vec![HostInfo::new("host-b:7934")]);
    let ring = monitor.static_resolver("history").unwrap();
    let resolver = monitor.get_resolver("history").unwrap();

    let host_a = ShardLeaseManager::new(store.clone(), resolver.clone(), HostInfo::new("host-a:7934"));
    let host_b = ShardLeaseManager::new(store.clone(), resolver, HostInfo::new("host-b:7934"));

    let a_shards = host_a.acquire_owned(&ctx, NUM_SHARDS).unwrap();
    let b_shards = host_b.acquire_owned(&ctx, NUM_SHARDS).unwrap();
    assert_eq!(a_shards.len() + b_shards.len(), NUM_SHARDS as usize);
    assert!(a_shards.iter().all(|s| !b_shards.contains(s)));

    // Pick a shard host A owns and write through it.
    let shard = *a_shards.first().expect("host A owns at least one shard");
    let a_token = host_a.range_id(shard).unwrap();
    assert_eq!(
        store
            .create_execution(&ctx, &create_request(shard, a_token, "run-1"))
            .unwrap(),
        WriteOutcome::Applied
    );

    // Host A leaves; host B takes over every shard.
    let event = ring.set_members(vec![HostInfo::new("host-b:7934")]);
    assert_eq!(host_a.on_membership_change(&event), a_shards);
    let b_token = host_b.acquire(&ctx, shard).unwrap().unwrap();
    assert!(b_token > a_token);

    // A's in-flight update presents the stale token.
    let stale = UpdateExecutionRequest {
        shard_id: shard,
        range_id: a_token,
        mode: UpdateMode::UpdateCurrent,
        current: WorkflowExecution::new("orders", "wf-1", "run-1", WorkflowState::Completed),
        new: None,
    };
    let err = store.update_execution(&ctx, &stale).unwrap_err();
    assert!(matches!(err, PersistenceError::Fenced { .. }));
    assert_eq!(
        store
            .get_current_execution(shard, "orders", "wf-1")
            .unwrap()
            .state,
        WorkflowState::Running
    );

    // B continues the run with its own token.
    let owned = UpdateExecutionRequest {
        range_id: b_token,
        current: WorkflowExecution::new("orders", "wf-1", "run-1", WorkflowState::Completed)
            .with_close_status(CloseStatus::ContinuedAsNew),
        new: Some(WorkflowExecution::new(
            "orders",
            "wf-1",
            "run-2",
            WorkflowState::Running,
        )),
        ..stale
    };
    store.update_execution(&ctx, &owned).unwrap();
    // Re-issuing after a lost reply is recognised.
    assert_eq!(
        store.update_execution(&ctx, &owned).unwrap(),
        WriteOutcome::AlreadyApplied
    );
    assert_eq!(
        store
            .get_current_execution(shard, "orders", "wf-1")
            .unwrap()
            .run_id,
        "run-2"
    );
}

#[test]
fn shards_on_different_databases_are_independent() {
    let dir = tempfile::tempdir().unwrap();
    let (_config, store) = open_store(dir.path());
    let ctx = OpContext::background();
    assert_ne!(store.db_shard_for(2), store.db_shard_for(3));

    let t2 = store.acquire_shard(&ctx, 2).unwrap().range_id;
    let t3 = store.acquire_shard(&ctx, 3).unwrap().range_id;
    store
        .create_execution(&ctx, &create_request(2, t2, "run-a"))
        .unwrap();
    store
        .create_execution(&ctx, &create_request(3, t3, "run-b"))
        .unwrap();

    // Same workflow identity, different shards: separate pointers.
    assert_eq!(
        store.get_current_execution(2, "orders", "wf-1").unwrap().run_id,
        "run-a"
    );
    assert_eq!(
        store.get_current_execution(3, "orders", "wf-1").unwrap().run_id,
        "run-b"
    );
}

#[test]
fn concurrent_domain_updates_have_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let (_config, store) = open_store(dir.path());
    let ctx = OpContext::background();

    let domain = DomainRecord {
        id: "d-1".to_string(),
        name: "payments".to_string(),
        is_global: true,
        data: br#"{"retention_days":7}"#.to_vec(),
        encoding: Encoding::Json,
    };
    store.create_domain(&ctx, &domain).unwrap();
    let observed = store.domain_metadata().unwrap();
    assert_eq!(observed, 1);

    const WRITERS: usize = 6;
    let barrier = Arc::new(Barrier::new(WRITERS));
    let handles: Vec<_> = (0..WRITERS)
        .map(|i| {
            let store = store.clone();
            let barrier = barrier.clone();
            let mut row = domain.clone();
            row.data = format!("{{\"retention_days\":{i}}}").into_bytes();
            thread::spawn(move || {
                barrier.wait();
                store.update_domain(&OpContext::background(), &row, observed)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(PersistenceError::VersionConflict { .. })))
        .count();
    assert_eq!(winners, 1);
    assert_eq!(conflicts, WRITERS - 1);
    assert_eq!(store.domain_metadata().unwrap(), observed + 1);

    let stored = store.get_domain(&DomainKey::Name("payments".to_string())).unwrap();
    assert_ne!(stored.data, domain.data);
}

#[test]
fn monitor_from_scaffold_owns_every_shard() {
    let dir = tempfile::tempdir().unwrap();
    let (config, store) = open_store(dir.path());
    let membership: MembershipConfig = config.membership.clone().unwrap();
    let monitor = StaticMonitor::from_config(&membership);
    let me = monitor.who_am_i().unwrap();

    let manager = ShardLeaseManager::new(
        store,
        monitor.get_resolver(&membership.service).unwrap(),
        me,
    );
    let acquired = manager
        .acquire_owned(&OpContext::background(), NUM_SHARDS)
        .unwrap();
    assert_eq!(acquired, (0..NUM_SHARDS).collect::<Vec<_>>());
}
