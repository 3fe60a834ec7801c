use std::path::Path;

use fence_core::FenceConfig;
use fencegrid_persistence::{OpContext, Store};

pub fn run(config_path: &Path, data_dir: &Path, shards: u32, force: bool) -> anyhow::Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }

    let config = FenceConfig::scaffold(data_dir, shards);
    config.validate()?;
    std::fs::write(config_path, config.to_toml_string()?)?;
    println!("✓ Generated {}", config_path.display());

    let persistence = &config.persistence;
    let store = Store::open(&persistence.data_dir, persistence.num_db_shards)?;
    let created = store.create_shards(&OpContext::background(), persistence.num_history_shards)?;
    println!(
        "✓ Bootstrapped {created} of {} shards in {}",
        persistence.num_history_shards,
        persistence.data_dir.display()
    );
    Ok(())
}
