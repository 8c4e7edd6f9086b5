//! Node RPC client - latest header difficulty per chain
//!
//! Every chain is served by its own HTTP endpoint on the node. Each endpoint
//! gets its own circuit breaker so one dead chain never blocks the others.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{body::Buf, Method, Request};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::chain::ChainId;
use crate::config::RpcSettings;
use crate::error::RpcError;

/// Anything that can report a chain's current difficulty.
#[async_trait]
pub trait DifficultySource: Send + Sync {
    async fn fetch_difficulty(&self, chain: &ChainId) -> Result<u128, RpcError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

#[derive(Debug, Clone)]
struct CircuitBreaker {
    failures: u32,
    last_failure: Option<Instant>,
    is_open: bool,
    max_failures: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            failures: 0,
            last_failure: None,
            is_open: false,
            max_failures: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }

    fn record_failure(&mut self, chain: &ChainId) {
        self.failures += 1;
        self.last_failure = Some(Instant::now());

        if self.failures >= self.max_failures && !self.is_open {
            self.is_open = true;
            tracing::error!(
                chain = %chain,
                failures = self.failures,
                "circuit breaker tripped, pausing RPC for {}s",
                self.reset_timeout.as_secs()
            );
        }
    }

    fn record_success(&mut self, chain: &ChainId) {
        if self.failures > 0 {
            self.failures = 0;
            tracing::info!(chain = %chain, "circuit breaker reset");
        }
    }

    fn check(&mut self, chain: &ChainId) -> Result<(), RpcError> {
        if self.is_open {
            if let Some(last_fail) = self.last_failure {
                if last_fail.elapsed() > self.reset_timeout {
                    tracing::info!(chain = %chain, "circuit breaker half-open");
                    self.is_open = false;
                    self.failures = 0;
                } else {
                    return Err(RpcError::CircuitOpen(chain.to_string()));
                }
            }
        }
        Ok(())
    }
}

/// Parse a node-reported difficulty: a base-16 string with or without `0x`.
pub fn parse_difficulty(raw: &str) -> Result<u128, RpcError> {
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    if digits.is_empty() {
        return Err(RpcError::MalformedDifficulty(raw.to_string()));
    }
    u128::from_str_radix(digits, 16).map_err(|_| RpcError::MalformedDifficulty(raw.to_string()))
}

/// Extract the difficulty from a header result. Newer nodes nest it under
/// the work-object header.
pub fn difficulty_from_header(header: &Value) -> Result<u128, RpcError> {
    let field = header
        .get("difficulty")
        .or_else(|| header.get("woHeader").and_then(|wo| wo.get("difficulty")))
        .ok_or(RpcError::MissingDifficulty)?;
    match field {
        Value::String(s) => parse_difficulty(s),
        other => Err(RpcError::MalformedDifficulty(other.to_string())),
    }
}

pub struct NodeRpcClient {
    endpoints: HashMap<ChainId, String>,
    method: String,
    timeout: Duration,
    client: Client<HttpConnector, Full<Bytes>>,
    breakers: Mutex<HashMap<ChainId, CircuitBreaker>>,
}

impl NodeRpcClient {
    pub fn new(settings: &RpcSettings) -> Self {
        let path = if settings.path.starts_with('/') {
            settings.path.clone()
        } else {
            format!("/{}", settings.path)
        };
        let endpoints: HashMap<ChainId, String> = settings
            .ports
            .iter()
            .map(|(chain, port)| (chain.clone(), format!("http://{}:{}{}", settings.host, port, path)))
            .collect();

        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build_http();

        tracing::info!(
            host = %settings.host,
            endpoints = endpoints.len(),
            timeout_secs = settings.timeout_secs,
            "node RPC client initialized"
        );

        Self {
            endpoints,
            method: settings.method.clone(),
            timeout: settings.timeout(),
            client,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn endpoint(&self, chain: &ChainId) -> Option<&str> {
        self.endpoints.get(chain).map(String::as_str)
    }

    fn record(&self, chain: &ChainId, ok: bool) {
        let mut breakers = self.breakers.lock();
        let breaker = breakers.entry(chain.clone()).or_insert_with(CircuitBreaker::new);
        if ok {
            breaker.record_success(chain);
        } else {
            breaker.record_failure(chain);
        }
    }

    /// Make one JSON-RPC call against a chain's endpoint.
    pub async fn call(&self, chain: &ChainId, method: &str, params: Value) -> Result<Value, RpcError> {
        let url = self
            .endpoints
            .get(chain)
            .ok_or_else(|| RpcError::UnknownChain(chain.to_string()))?;

        self.breakers
            .lock()
            .entry(chain.clone())
            .or_insert_with(CircuitBreaker::new)
            .check(chain)?;

        let payload = RpcRequest {
            jsonrpc: "2.0".to_string(),
            id: 1,
            method: method.to_string(),
            params,
        };
        let body = Full::new(Bytes::from(serde_json::to_vec(&payload)?));

        let req = Request::builder()
            .method(Method::POST)
            .uri(url.as_str())
            .header("Content-Type", "application/json")
            .body(body)
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        // one deadline covers headers and body
        let exchange = async {
            let response = self
                .client
                .request(req)
                .await
                .map_err(|e| RpcError::Transport(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(RpcError::HttpStatus(status.as_u16()));
            }

            let body_bytes = response
                .into_body()
                .collect()
                .await
                .map_err(|e| RpcError::Transport(e.to_string()))?
                .to_bytes();
            let rpc_response: RpcResponse = serde_json::from_reader(body_bytes.reader())?;

            if let Some(error) = rpc_response.error {
                return Err(RpcError::Rpc(error.to_string()));
            }
            Ok(rpc_response.result.unwrap_or(Value::Null))
        };
        let result = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout(self.timeout)),
        };

        // Application-level errors mean the node is up; only transport
        // failures count against the breaker.
        match &result {
            Ok(_) | Err(RpcError::Rpc(_)) => self.record(chain, true),
            Err(_) => self.record(chain, false),
        }
        result
    }
}

#[async_trait]
impl DifficultySource for NodeRpcClient {
    async fn fetch_difficulty(&self, chain: &ChainId) -> Result<u128, RpcError> {
        let header = self.call(chain, &self.method, json!(["latest"])).await?;
        if header.is_null() {
            return Err(RpcError::MissingDifficulty);
        }
        difficulty_from_header(&header)
    }
}
