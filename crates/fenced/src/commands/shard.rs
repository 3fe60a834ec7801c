use fence_core::ShardRecord;
use serde::Serialize;

use super::Env;

#[derive(Serialize)]
struct ShardView<'a> {
    shard_id: u32,
    range_id: i64,
    db_shard: usize,
    encoding: &'a str,
    data: String,
}

impl<'a> ShardView<'a> {
    fn new(env: &Env, row: &'a ShardRecord) -> Self {
        Self {
            shard_id: row.shard_id,
            range_id: row.range_id,
            db_shard: env.store.db_shard_for(row.shard_id),
            encoding: row.encoding.as_str(),
            data: String::from_utf8_lossy(&row.data).into_owned(),
        }
    }
}

pub fn show(env: &Env, shard_id: u32) -> anyhow::Result<()> {
    let row = env.store.get_shard(shard_id)?;
    println!("{}", serde_json::to_string_pretty(&ShardView::new(env, &row))?);
    Ok(())
}

pub fn acquire(env: &Env, shard_id: u32) -> anyhow::Result<()> {
    let shards = env.config.persistence.num_history_shards;
    if shard_id >= shards {
        anyhow::bail!("shard {shard_id} out of range (cluster has {shards} shards)");
    }
    let row = env.store.acquire_shard(&env.ctx(), shard_id)?;
    println!("✓ Shard {shard_id} acquired at range id {}", row.range_id);
    Ok(())
}
