//! Difficulty Tracker
//!
//! Samples every tracked chain's difficulty once per cycle, keeps the latest
//! successful sample per chain and a bounded history of snapshots for trend
//! queries.
//!
//! Sampling is best-effort: a chain whose fetch fails keeps its previous
//! value and is retried next cycle. Nothing here returns an error to the
//! caller; missing data shows up as `None`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chain::{ChainId, ChainSet};
use crate::history::BoundedHistory;
use crate::rpc_client::DifficultySource;
use crate::scheduler::spawn_periodic;

/// Longest trend window accepted (one year).
const MAX_WINDOW_HOURS: u32 = 24 * 365;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DifficultySample {
    pub chain: ChainId,
    #[serde(serialize_with = "as_decimal")]
    pub difficulty: u128,
    pub observed_at: DateTime<Utc>,
}

/// Latest successful sample per chain.
pub type DifficultySnapshot = BTreeMap<ChainId, DifficultySample>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(serialize_with = "map_as_decimal")]
    pub difficulties: BTreeMap<ChainId, u128>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Profitability {
    pub chain: ChainId,
    pub profitability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trend {
    pub chain: ChainId,
    pub hours: u32,
    pub samples: usize,
    /// Percentage change from the earliest to the latest sample in the window
    pub change_percent: f64,
    #[serde(serialize_with = "as_decimal")]
    pub first: u128,
    #[serde(serialize_with = "as_decimal")]
    pub last: u128,
    #[serde(serialize_with = "as_decimal")]
    pub min: u128,
    #[serde(serialize_with = "as_decimal")]
    pub max: u128,
    pub average: f64,
}

/// Outcome of one sampling cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub updated: Vec<ChainId>,
    pub failed: Vec<ChainId>,
    /// The tracker was stopped while the cycle was in flight
    pub discarded: bool,
}

// u128 does not survive JSON consumers as a number
fn as_decimal<S: serde::Serializer>(v: &u128, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(v)
}

fn map_as_decimal<S: serde::Serializer>(m: &BTreeMap<ChainId, u128>, s: S) -> Result<S::Ok, S::Error> {
    s.collect_map(m.iter().map(|(k, v)| (k, v.to_string())))
}

struct TrackerState {
    snapshot: DifficultySnapshot,
    history: BoundedHistory<HistoryEntry>,
    last_updated: Option<DateTime<Utc>>,
}

pub struct DifficultyTracker {
    source: Arc<dyn DifficultySource>,
    chains: ChainSet,
    state: RwLock<TrackerState>,
    /// Serializes cycles started by the timer and by the engine
    cycle: tokio::sync::Mutex<()>,
    /// Bumped on stop; cycles begun under an older epoch are discarded
    epoch: AtomicU64,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl DifficultyTracker {
    pub fn new(source: Arc<dyn DifficultySource>, chains: ChainSet, history_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            source,
            chains,
            state: RwLock::new(TrackerState {
                snapshot: BTreeMap::new(),
                history: BoundedHistory::new(history_capacity),
                last_updated: None,
            }),
            cycle: tokio::sync::Mutex::new(()),
            epoch: AtomicU64::new(0),
            timer: Mutex::new(None),
        })
    }

    pub fn chains(&self) -> &ChainSet {
        &self.chains
    }

    /// Sample now, then every `interval`. Restarting replaces the old timer.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let tracker = Arc::clone(self);
        let handle = spawn_periodic("difficulty-tracker", interval, move || {
            let tracker = Arc::clone(&tracker);
            async move {
                tracker.update_difficulties().await;
            }
        });

        if let Some(old) = self.timer.lock().replace(handle) {
            old.abort();
        }
        info!(
            chains = self.chains.len(),
            interval_secs = interval.as_secs(),
            "difficulty tracker started"
        );
    }

    pub fn stop(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
            info!("difficulty tracker stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Fetch every tracked chain concurrently, then record one history entry.
    pub async fn update_difficulties(&self) -> CycleSummary {
        let _cycle = self.cycle.lock().await;
        let epoch = self.epoch.load(Ordering::SeqCst);

        let fetches = self.chains.iter().map(|chain| async move {
            let difficulty = self.fetch_difficulty(chain).await;
            (chain, difficulty)
        });
        let results = futures::future::join_all(fetches).await;

        let mut summary = CycleSummary::default();
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!("tracker stopped mid-cycle, discarding samples");
            summary.discarded = true;
            return summary;
        }

        let now = Utc::now();
        let mut state = self.state.write();
        for (chain, difficulty) in results {
            match difficulty {
                Some(difficulty) => {
                    state.snapshot.insert(
                        chain.clone(),
                        DifficultySample {
                            chain: chain.clone(),
                            difficulty,
                            observed_at: now,
                        },
                    );
                    summary.updated.push(chain.clone());
                }
                None => summary.failed.push(chain.clone()),
            }
        }

        let entry = HistoryEntry {
            timestamp: now,
            difficulties: state
                .snapshot
                .iter()
                .map(|(c, s)| (c.clone(), s.difficulty))
                .collect(),
        };
        state.history.push(entry);
        if !summary.updated.is_empty() {
            state.last_updated = Some(now);
        }
        drop(state);

        debug!(
            updated = summary.updated.len(),
            failed = summary.failed.len(),
            "difficulty cycle complete"
        );
        summary
    }

    /// One RPC round trip for `chain`. Any failure means no sample this cycle.
    pub async fn fetch_difficulty(&self, chain: &ChainId) -> Option<u128> {
        match self.source.fetch_difficulty(chain).await {
            Ok(difficulty) => Some(difficulty),
            Err(e) => {
                warn!(chain = %chain, error = %e, "difficulty fetch failed");
                None
            }
        }
    }

    pub fn get_difficulty(&self, chain: &ChainId) -> Option<u128> {
        self.state.read().snapshot.get(chain).map(|s| s.difficulty)
    }

    pub fn get_all_difficulties(&self) -> DifficultySnapshot {
        self.state.read().snapshot.clone()
    }

    /// Time of the most recent cycle that produced at least one sample.
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_updated
    }

    /// `block_reward / difficulty`, or `None` when that cannot be computed.
    pub fn calculate_profitability(&self, chain: &ChainId, block_reward: f64) -> Option<f64> {
        if !block_reward.is_finite() || block_reward < 0.0 {
            return None;
        }
        match self.get_difficulty(chain) {
            Some(0) | None => None,
            Some(difficulty) => Some(block_reward / difficulty as f64),
        }
    }

    /// Highest profitability across prime, regions and zones.
    ///
    /// Chains without a reward entry or a usable difficulty are skipped. On
    /// equal profitability the lexicographically smallest chain id wins, so
    /// the result does not depend on configuration order.
    pub fn get_most_profitable_chain(&self, block_rewards: &BTreeMap<ChainId, f64>) -> Option<Profitability> {
        let mut best: Option<Profitability> = None;
        for chain in self.chains.iter() {
            let Some(reward) = block_rewards.get(chain) else {
                continue;
            };
            let Some(p) = self.calculate_profitability(chain, *reward) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some(b) => p > b.profitability || (p == b.profitability && *chain < b.chain),
            };
            if better {
                best = Some(Profitability {
                    chain: chain.clone(),
                    profitability: p,
                });
            }
        }
        best
    }

    /// Entries recorded within the last `hours`, oldest first.
    pub fn get_history(&self, hours: u32) -> Vec<HistoryEntry> {
        let cutoff = window_start(Utc::now(), hours);
        self.state
            .read()
            .history
            .iter()
            .filter(|e| e.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    pub fn history_len(&self) -> usize {
        self.state.read().history.len()
    }

    pub fn get_trends(&self, chain: &ChainId, hours: u32) -> Option<Trend> {
        self.trend_at(chain, hours, Utc::now())
    }

    /// Trend for every tracked chain; `None` marks "no trend".
    pub fn get_all_trends(&self, hours: u32) -> BTreeMap<ChainId, Option<Trend>> {
        let now = Utc::now();
        self.chains
            .iter()
            .map(|c| (c.clone(), self.trend_at(c, hours, now)))
            .collect()
    }

    fn trend_at(&self, chain: &ChainId, hours: u32, now: DateTime<Utc>) -> Option<Trend> {
        let cutoff = window_start(now, hours);
        let values: Vec<u128> = self
            .state
            .read()
            .history
            .iter()
            .filter(|e| e.timestamp >= cutoff)
            .filter_map(|e| e.difficulties.get(chain).copied())
            .collect();

        if values.len() < 2 {
            return None;
        }
        let first = values[0];
        let last = values[values.len() - 1];
        if first == 0 {
            return None;
        }

        let min = values.iter().copied().min().unwrap_or(first);
        let max = values.iter().copied().max().unwrap_or(first);
        let average = values.iter().map(|v| *v as f64).sum::<f64>() / values.len() as f64;
        let change_percent = (last as f64 - first as f64) / first as f64 * 100.0;

        Some(Trend {
            chain: chain.clone(),
            hours,
            samples: values.len(),
            change_percent,
            first,
            last,
            min,
            max,
            average,
        })
    }

    #[cfg(test)]
    fn push_history(&self, entry: HistoryEntry) {
        self.state.write().history.push(entry);
    }
}

fn window_start(now: DateTime<Utc>, hours: u32) -> DateTime<Utc> {
    now - ChronoDuration::hours(i64::from(hours.min(MAX_WINDOW_HOURS)))
}
