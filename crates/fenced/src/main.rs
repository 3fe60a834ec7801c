//! fenced: the FenceGrid admin daemon.
//!
//! Operates directly on the redb files named by `fenced.toml`:
//! - bootstrap history shard rows
//! - inspect and take over shards (fencing token bump)
//! - register, update, and list domains under the notification version
//! - hold shard leases for this host until interrupted
//!
//! # Usage
//!
//! ```text
//! fenced init --data-dir /var/lib/fencegrid --shards 16
//! fenced domain register payments --global
//! fenced serve
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fence_core::config::LogConfig;
use fence_core::FenceConfig;

mod commands;

const DEFAULT_LOG_FILTER: &str = "info,fenced=debug,fencegrid=debug";

#[derive(Parser)]
#[command(
    name = "fenced",
    about = "FenceGrid: fenced persistence for sharded workflow state",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, default_value = "fenced.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config and bootstrap shard rows.
    Init {
        /// Data directory for the redb files.
        #[arg(long, default_value = "/var/lib/fencegrid")]
        data_dir: PathBuf,

        /// Number of history shards.
        #[arg(long, default_value = "16")]
        shards: u32,

        /// Overwrite an existing config file.
        #[arg(long)]
        force: bool,
    },
    /// Inspect or take over history shards.
    Shard {
        #[command(subcommand)]
        action: ShardAction,
    },
    /// Manage domains.
    Domain {
        #[command(subcommand)]
        action: DomainAction,
    },
    /// Print the domain notification version.
    Metadata,
    /// Acquire the shards this host owns and hold them until Ctrl-C.
    Serve,
}

#[derive(Subcommand)]
enum ShardAction {
    /// Show a shard row.
    Show { shard_id: u32 },
    /// Advance a shard's range id, fencing out its previous owner.
    Acquire { shard_id: u32 },
}

#[derive(Subcommand)]
enum DomainAction {
    /// Register a new domain.
    Register {
        name: String,
        /// Domain id (defaults to the name).
        #[arg(long)]
        id: Option<String>,
        /// Replicate the domain cluster-wide.
        #[arg(long)]
        global: bool,
        /// Opaque domain config as a JSON document.
        #[arg(long, default_value = "{}")]
        data: String,
    },
    /// Show one domain.
    Describe {
        name: String,
        /// Treat the argument as a domain id rather than a name.
        #[arg(long)]
        by_id: bool,
    },
    /// List domains ordered by id.
    List {
        #[arg(long, default_value = "100")]
        page_size: usize,
        /// Only list ids strictly greater than this one.
        #[arg(long)]
        after: Option<String>,
    },
    /// Replace a domain's config.
    Update {
        name: String,
        #[arg(long)]
        data: String,
        /// Notification version the change was prepared against (defaults
        /// to the current one).
        #[arg(long)]
        expected_version: Option<u64>,
    },
    /// Delete a domain.
    Delete { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Command::Init { .. } => None,
        _ => Some(FenceConfig::from_file(&cli.config)?),
    };
    init_tracing(config.as_ref().map(|c| &c.log));

    let open = || match config.clone() {
        Some(config) => commands::Env::open(config),
        None => anyhow::bail!("no configuration loaded"),
    };

    match cli.command {
        Command::Init {
            data_dir,
            shards,
            force,
        } => commands::init::run(&cli.config, &data_dir, shards, force),
        Command::Shard { action } => {
            let env = open()?;
            match action {
                ShardAction::Show { shard_id } => commands::shard::show(&env, shard_id),
                ShardAction::Acquire { shard_id } => commands::shard::acquire(&env, shard_id),
            }
        }
        Command::Domain { action } => {
            let env = open()?;
            match action {
                DomainAction::Register {
                    name,
                    id,
                    global,
                    data,
                } => commands::domain::register(&env, &name, id, global, &data),
                DomainAction::Describe { name, by_id } => {
                    commands::domain::describe(&env, &name, by_id)
                }
                DomainAction::List { page_size, after } => {
                    commands::domain::list(&env, page_size, after.as_deref())
                }
                DomainAction::Update {
                    name,
                    data,
                    expected_version,
                } => commands::domain::update(&env, &name, &data, expected_version),
                DomainAction::Delete { name } => commands::domain::delete(&env, &name),
            }
        }
        Command::Metadata => commands::domain::metadata(&open()?),
        Command::Serve => commands::serve::run(open()?).await,
    }
}

/// `RUST_LOG` wins over the config's filter; `log.json` switches to JSON
/// lines.
fn init_tracing(log: Option<&LogConfig>) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directives = log
            .and_then(|l| l.filter.as_deref())
            .unwrap_or(DEFAULT_LOG_FILTER);
        tracing_subscriber::EnvFilter::new(directives)
    });

    if log.is_some_and(|l| l.json) {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}
