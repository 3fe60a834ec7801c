use std::sync::Arc;

use fence_core::config::MembershipConfig;
use fencegrid_membership::{Monitor, ServiceResolver, ShardLeaseManager, StaticMonitor};
use tracing::info;

use super::Env;

/// Ring used when the config has no `[membership]` section: this host
/// alone, owning every shard.
fn standalone() -> MembershipConfig {
    MembershipConfig {
        service: "history".to_string(),
        self_address: "127.0.0.1:7934".to_string(),
        peers: Vec::new(),
    }
}

pub async fn run(env: Env) -> anyhow::Result<()> {
    let membership = env.config.membership.clone().unwrap_or_else(standalone);
    let monitor = StaticMonitor::from_config(&membership);
    let me = monitor.who_am_i()?;
    let resolver = monitor.get_resolver(&membership.service)?;
    info!(
        host = %me,
        service = %membership.service,
        members = resolver.member_count(),
        "FenceGrid daemon starting"
    );

    let manager = Arc::new(ShardLeaseManager::new(env.store.clone(), resolver, me));
    let num_shards = env.config.persistence.num_history_shards;
    let acquired = manager.acquire_owned(&env.ctx(), num_shards)?;
    info!(count = acquired.len(), shards = ?acquired, "holding shard leases");

    let events = manager.subscribe()?;
    let listener = tokio::spawn(manager.clone().run(events, num_shards));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    manager.unsubscribe()?;
    listener.await?;
    info!(released = manager.held_shards().len(), "FenceGrid daemon stopped");
    Ok(())
}
