//! Switcher settings.
//!
//! Layered the same way as the pool config: built-in defaults, then an
//! optional JSON file, then `SWITCHER_*` environment overrides, then
//! validation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chain::{ChainId, ChainSet};
use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcSettings {
    #[serde(default = "default_rpc_host")]
    pub host: String,
    #[serde(default = "default_rpc_path")]
    pub path: String,
    /// JSON-RPC method returning the latest header.
    #[serde(default = "default_rpc_method")]
    pub method: String,
    /// Per-request timeout (seconds)
    #[serde(default = "default_rpc_timeout")]
    pub timeout_secs: u64,
    /// HTTP port of each chain's RPC endpoint
    #[serde(default = "default_rpc_ports")]
    pub ports: BTreeMap<ChainId, u16>,
}

fn default_rpc_host() -> String { "127.0.0.1".to_string() }
fn default_rpc_path() -> String { "/".to_string() }
fn default_rpc_method() -> String { "quai_getHeaderByNumber".to_string() }
fn default_rpc_timeout() -> u64 { 8 }

fn default_rpc_ports() -> BTreeMap<ChainId, u16> {
    [
        ("Prime", 9001),
        ("Cyprus", 9002),
        ("Paxos", 9003),
        ("Hydra", 9004),
        ("Zone-0-0", 9200),
        ("Zone-0-1", 9201),
        ("Zone-0-2", 9202),
    ]
    .into_iter()
    .map(|(c, p)| (ChainId::from(c), p))
    .collect()
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            host: default_rpc_host(),
            path: default_rpc_path(),
            method: default_rpc_method(),
            timeout_secs: default_rpc_timeout(),
            ports: default_rpc_ports(),
        }
    }
}

impl RpcSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MinerServiceSettings {
    /// systemd unit of the external miner
    #[serde(default = "default_unit")]
    pub unit: String,
    #[serde(default)]
    pub use_sudo: bool,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_unit() -> String { "quai-gpu-miner".to_string() }
fn default_command_timeout() -> u64 { 30 }

impl Default for MinerServiceSettings {
    fn default() -> Self {
        Self {
            unit: default_unit(),
            use_sudo: false,
            command_timeout_secs: default_command_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ShardingSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub zones: Vec<ChainId>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SwitcherSettings {
    /// Enable automatic switching (sampling runs regardless)
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sampling and decision cadence (seconds)
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    /// Minimum relative improvement before leaving the current chain
    #[serde(default = "default_threshold")]
    pub switch_threshold: f64,
    /// Minimum time between automatic switches (seconds, 0 = off)
    #[serde(default)]
    pub min_switch_interval_secs: u64,
    /// Block reward per chain; chains left out use the nominal reward
    #[serde(default)]
    pub block_rewards: BTreeMap<ChainId, f64>,
    #[serde(default)]
    pub chains: ChainSet,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_switch_history_capacity")]
    pub switch_history_capacity: usize,
    /// Shared miner config file the engine retargets
    #[serde(default = "default_miner_config_path")]
    pub miner_config_path: PathBuf,
    #[serde(default)]
    pub rpc: RpcSettings,
    #[serde(default)]
    pub miner_service: MinerServiceSettings,
    #[serde(default)]
    pub sharding: ShardingSettings,
}

fn default_true() -> bool { true }
fn default_check_interval() -> u64 { 300 } // 5 minutes
fn default_threshold() -> f64 { 0.05 } // 5%
fn default_history_capacity() -> usize { 1000 } // ~83h at 5 minutes
fn default_switch_history_capacity() -> usize { 100 }
fn default_miner_config_path() -> PathBuf { PathBuf::from("miner-config.json") }

impl Default for SwitcherSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: default_check_interval(),
            switch_threshold: default_threshold(),
            min_switch_interval_secs: 0,
            block_rewards: BTreeMap::new(),
            chains: ChainSet::default(),
            history_capacity: default_history_capacity(),
            switch_history_capacity: default_switch_history_capacity(),
            miner_config_path: default_miner_config_path(),
            rpc: RpcSettings::default(),
            miner_service: MinerServiceSettings::default(),
            sharding: ShardingSettings::default(),
        }
    }
}

impl SwitcherSettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn min_switch_interval(&self) -> Duration {
        Duration::from_secs(self.min_switch_interval_secs)
    }

    /// Load settings from `path` (or `SWITCHER_CONFIG`, or `./switcher.json`),
    /// then apply env overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(p) = path {
            candidates.push(p.to_path_buf());
        } else {
            if let Ok(p) = std::env::var("SWITCHER_CONFIG") {
                candidates.push(PathBuf::from(p));
            }
            candidates.push(PathBuf::from("switcher.json"));
        }

        let mut cfg = Self::default();
        for candidate in &candidates {
            match std::fs::read_to_string(candidate) {
                Ok(txt) => {
                    cfg = serde_json::from_str(&txt).map_err(|source| ConfigError::Parse {
                        path: candidate.clone(),
                        source,
                    })?;
                    tracing::info!(path = %candidate.display(), "loaded switcher settings");
                    break;
                }
                Err(e) if path.is_some() => {
                    return Err(ConfigError::InvalidSettings(format!(
                        "cannot read {}: {}",
                        candidate.display(),
                        e
                    )));
                }
                Err(_) => continue,
            }
        }

        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("SWITCHER_ENABLED") {
            self.enabled = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("SWITCHER_INTERVAL_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.check_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("SWITCHER_THRESHOLD") {
            if let Ok(n) = v.parse::<f64>() {
                self.switch_threshold = n;
            }
        }
        if let Ok(v) = std::env::var("SWITCHER_MIN_SWITCH_INTERVAL_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.min_switch_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("SWITCHER_RPC_HOST") {
            self.rpc.host = v;
        }
        if let Ok(v) = std::env::var("SWITCHER_RPC_TIMEOUT_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.rpc.timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("SWITCHER_MINER_CONFIG") {
            self.miner_config_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SWITCHER_MINER_UNIT") {
            self.miner_service.unit = v;
        }
    }

    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.check_interval_secs == 0 {
            return Err(ConfigError::InvalidSettings(
                "check_interval_secs must be positive".to_string(),
            ));
        }
        if self.rpc.timeout_secs == 0 {
            self.rpc.timeout_secs = default_rpc_timeout();
        }
        if !self.switch_threshold.is_finite() {
            self.switch_threshold = default_threshold();
        }
        self.switch_threshold = self.switch_threshold.clamp(0.0, 1.0);
        if self.history_capacity == 0 {
            self.history_capacity = default_history_capacity();
        }
        if self.switch_history_capacity == 0 {
            self.switch_history_capacity = default_switch_history_capacity();
        }
        for (chain, reward) in &self.block_rewards {
            if !reward.is_finite() || *reward < 0.0 {
                return Err(ConfigError::InvalidSettings(format!(
                    "block reward for {} must be a non-negative number",
                    chain
                )));
            }
        }
        if let Some(bad) = self.sharding.zones.iter().find(|z| !z.is_zone()) {
            return Err(ConfigError::InvalidSettings(format!(
                "sharding zone {} is not a zone chain",
                bad
            )));
        }
        for chain in self.chains.iter() {
            if !self.rpc.ports.contains_key(chain) {
                tracing::warn!(chain = %chain, "no RPC port configured, chain will never be sampled");
            }
        }
        Ok(())
    }

    /// Reward table with nominal defaults filled in for every tracked chain.
    pub fn reward_table(&self) -> BTreeMap<ChainId, f64> {
        let mut table = self.chains.default_rewards();
        table.extend(self.block_rewards.iter().map(|(c, r)| (c.clone(), *r)));
        table
    }
}
