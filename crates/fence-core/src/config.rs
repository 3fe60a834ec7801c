//! fenced.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FenceConfig {
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub log: LogConfig,
    pub membership: Option<MembershipConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistenceConfig {
    pub data_dir: PathBuf,
    /// Number of history shards (fencing domains) in the cluster.
    pub num_history_shards: u32,
    /// Number of physical databases the history shards are spread over.
    #[serde(default = "default_db_shards")]
    pub num_db_shards: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive.
    pub filter: Option<String>,
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MembershipConfig {
    /// Service name shard ownership is resolved against.
    pub service: String,
    /// Address this host advertises to the ring.
    pub self_address: String,
    /// Other ring members. This host is always part of the ring.
    #[serde(default)]
    pub peers: Vec<String>,
}

fn default_db_shards() -> u32 {
    1
}

impl FenceConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FenceConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let p = &self.persistence;
        if p.num_history_shards == 0 {
            anyhow::bail!("persistence.num_history_shards must be at least 1");
        }
        if p.num_db_shards == 0 {
            anyhow::bail!("persistence.num_db_shards must be at least 1");
        }
        if p.num_db_shards > p.num_history_shards {
            anyhow::bail!(
                "persistence.num_db_shards ({}) exceeds num_history_shards ({})",
                p.num_db_shards,
                p.num_history_shards
            );
        }
        Ok(())
    }

    /// Scaffold a minimal single-database config rooted at `data_dir`.
    pub fn scaffold(data_dir: &Path, num_history_shards: u32) -> Self {
        FenceConfig {
            persistence: PersistenceConfig {
                data_dir: data_dir.to_path_buf(),
                num_history_shards,
                num_db_shards: default_db_shards(),
            },
            log: LogConfig {
                filter: Some("info,fenced=debug,fencegrid=debug".to_string()),
                json: false,
            },
            membership: Some(MembershipConfig {
                service: "history".to_string(),
                self_address: "127.0.0.1:7934".to_string(),
                peers: Vec::new(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaffold() {
        let config = FenceConfig::scaffold(Path::new("/var/lib/fencegrid"), 16);
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("num_history_shards = 16"));
        assert!(toml_str.contains("/var/lib/fencegrid"));

        let parsed: FenceConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_parse_minimal() {
        let toml_str = r#"
[persistence]
data_dir = "/tmp/fg"
num_history_shards = 4
"#;
        let config: FenceConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.persistence.num_db_shards, 1);
        assert!(!config.log.json);
        assert!(config.membership.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_more_db_shards_than_history_shards() {
        let mut config = FenceConfig::scaffold(Path::new("/tmp"), 2);
        config.persistence.num_db_shards = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fenced.toml");
        let config = FenceConfig::scaffold(dir.path(), 8);
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = FenceConfig::from_file(&path).unwrap();
        assert_eq!(loaded.persistence.num_history_shards, 8);
    }
}
