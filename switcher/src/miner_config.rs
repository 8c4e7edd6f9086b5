//! Shared miner configuration file.
//!
//! The file is shared with other writers (wallet, worker name, pool
//! settings). Only `mining.targetChain`, `mining.mergedMining` and
//! `mining.sharding` are owned here; everything else round-trips through
//! the flattened `extra` maps untouched.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::chain::ChainId;
use crate::error::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MinerConfigFile {
    #[serde(default)]
    pub mining: MiningSection,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MiningSection {
    // Replaced wholesale on every switch, so a block this crate cannot
    // read is treated as absent.
    #[serde(default, deserialize_with = "replaceable_section", skip_serializing_if = "Option::is_none")]
    pub target_chain: Option<TargetChain>,
    #[serde(default, deserialize_with = "replaceable_section", skip_serializing_if = "Option::is_none")]
    pub merged_mining: Option<MergedMining>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharding: Option<ShardingSection>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TargetChain {
    pub id: ChainId,
    pub key: String,
    pub name: String,
    pub switched_at: DateTime<Utc>,
    pub reason: String,
    /// Decimal string; difficulties overflow JSON-safe integers. Numbers
    /// written by other tools are read back as their decimal text.
    #[serde(deserialize_with = "difficulty_text", skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MergedMining {
    pub enabled: bool,
    pub chains: Vec<ChainId>,
    pub auto_switched: bool,
    pub switched_at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ShardingSection {
    pub enabled: bool,
    pub active_zones: Vec<ChainId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_zone: Option<ChainId>,
}

fn replaceable_section<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.and_then(|v| match serde_json::from_value(v) {
        Ok(section) => Some(section),
        Err(e) => {
            tracing::warn!(error = %e, "unreadable engine-owned section in miner config, replacing it");
            None
        }
    }))
}

fn difficulty_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// Read-merge-write access to the shared miner config.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Current contents, or a synthesized default when there is nothing to read.
    async fn load(&self) -> Result<MinerConfigFile, ConfigError>;

    async fn save(&self, config: &MinerConfigFile) -> Result<(), ConfigError>;
}

/// JSON file on disk, replaced atomically through a sibling temp file.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl ConfigStore for JsonFileStore {
    async fn load(&self) -> Result<MinerConfigFile, ConfigError> {
        let txt = match tokio::fs::read_to_string(&self.path).await {
            Ok(txt) => txt,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "miner config unreadable, starting from defaults"
                );
                return Ok(MinerConfigFile::default());
            }
        };
        if txt.trim().is_empty() {
            return Ok(MinerConfigFile::default());
        }
        // Refuse to fall back here: writing defaults over a file we could not
        // parse would destroy the other writers' sections.
        serde_json::from_str(&txt).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    async fn save(&self, config: &MinerConfigFile) -> Result<(), ConfigError> {
        let body = serde_json::to_vec_pretty(config)?;
        let tmp = self.temp_path();
        let write_err = |source| ConfigError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }
        tokio::fs::write(&tmp, &body).await.map_err(write_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(write_err)?;
        Ok(())
    }
}
