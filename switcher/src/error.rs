use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single difficulty fetch. Never escapes the tracker.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("no RPC endpoint configured for chain {0}")]
    UnknownChain(String),

    #[error("RPC circuit breaker is open for {0}")]
    CircuitOpen(String),

    #[error("RPC request timed out after {0:?}")]
    Timeout(Duration),

    #[error("RPC connection failed: {0}")]
    Transport(String),

    #[error("RPC HTTP error: {0}")]
    HttpStatus(u16),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("difficulty field missing from header")]
    MissingDifficulty,

    #[error("malformed difficulty value: {0:?}")]
    MalformedDifficulty(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to parse miner config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write miner config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize miner config: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("{command} exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },
}

#[derive(Error, Debug)]
pub enum SwitchError {
    #[error("cannot persist switch to {chain}: {source}")]
    Persist {
        chain: String,
        #[source]
        source: ConfigError,
    },

    #[error("{0} is not a zone chain")]
    InvalidZone(String),

    #[error("already mining {0}")]
    AlreadyCurrent(String),

    #[error("engine stopped while switching to {0}")]
    Cancelled(String),
}
