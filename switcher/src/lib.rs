pub mod chain;
pub mod config;
pub mod error;
pub mod history;
pub mod miner_config;
pub mod process;
pub mod rpc_client;
pub mod scheduler;

// Decision layer: tracker samples difficulties, engine acts on them
pub mod tracker;
pub mod engine;

pub use chain::{ChainClass, ChainId, ChainSet};
pub use config::SwitcherSettings;
pub use engine::{ChainSwitcher, CycleOutcome, SwitchDecision, SwitchRecord, SwitcherStatus};
pub use error::{ConfigError, ControlError, RpcError, SwitchError};
pub use miner_config::{ConfigStore, JsonFileStore, MinerConfigFile};
pub use process::{MinerControl, SystemdMinerControl};
pub use rpc_client::{DifficultySource, NodeRpcClient};
pub use tracker::{DifficultyTracker, Profitability, Trend};
