//! Chain Switching Engine
//!
//! Decides, once per cycle, whether the miner should move to a more
//! profitable chain and applies that decision to the outside world.
//!
//! Cycle:
//!   tracker.update_difficulties()  (awaited, so decisions never read a
//!       │                           half-finished sample)
//!       ├── most profitable chain for the reward table
//!       ├── should_switch: bootstrap / same chain / unknown current /
//!       │                  relative improvement >= threshold / dwell time
//!       └── on switch: merge miner config → restart miner (best-effort)
//!                      → append SwitchRecord → current_chain = target

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::chain::{ChainClass, ChainId};
use crate::config::SwitcherSettings;
use crate::error::SwitchError;
use crate::history::BoundedHistory;
use crate::miner_config::{ConfigStore, MergedMining, MinerConfigFile, ShardingSection, TargetChain};
use crate::process::{restart_best_effort, MinerControl};
use crate::scheduler::spawn_periodic;
use crate::tracker::{DifficultySnapshot, DifficultyTracker, Profitability};

/// Number of switch records reported by `get_status`.
const STATUS_RECENT_SWITCHES: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwitchRecord {
    pub chain: ChainId,
    pub from: Option<ChainId>,
    pub timestamp: DateTime<Utc>,
    /// `None` only for manual switches to a chain without a usable difficulty
    pub profitability_at_switch: Option<f64>,
    pub reason: String,
}

/// Outcome of `should_switch`.
#[derive(Debug, Clone, PartialEq)]
pub enum SwitchDecision {
    /// No current chain yet
    Bootstrap,
    /// Current chain's profitability cannot be computed
    CurrentUnknown,
    /// Candidate beats the current chain by at least the threshold
    Improvement(f64),
    SameChain,
    BelowThreshold(f64),
    /// Better chain found but the minimum dwell time has not elapsed
    Cooldown(Duration),
}

impl SwitchDecision {
    pub fn is_switch(&self) -> bool {
        matches!(self, Self::Bootstrap | Self::CurrentUnknown | Self::Improvement(_))
    }

    fn reason(&self) -> String {
        match self {
            Self::Bootstrap => "initial chain selection".to_string(),
            Self::CurrentUnknown => "current chain profitability unknown".to_string(),
            Self::Improvement(i) if i.is_infinite() => "current chain pays no reward".to_string(),
            Self::Improvement(i) => format!("profitability advantage +{:.1}%", i * 100.0),
            Self::SameChain => "already on the most profitable chain".to_string(),
            Self::BelowThreshold(i) => format!("advantage +{:.1}% below threshold", i * 100.0),
            Self::Cooldown(left) => format!("cooldown active ({}s remaining)", left.as_secs()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// No chain had a computable profitability
    NoData,
    /// Automatic switching is disabled; sampling still ran
    Paused,
    Stayed {
        candidate: Profitability,
        decision: SwitchDecision,
    },
    Switched(SwitchRecord),
    /// The engine was stopped while the cycle was in flight
    Discarded,
}

#[derive(Debug, Clone, Serialize)]
pub struct SwitcherStatus {
    pub enabled: bool,
    pub monitoring: bool,
    pub current_chain: Option<ChainId>,
    pub most_profitable: Option<Profitability>,
    pub difficulties: DifficultySnapshot,
    pub threshold: f64,
    pub sharding_enabled: bool,
    pub zone_preferences: Vec<ChainId>,
    /// Newest first
    pub recent_switches: Vec<SwitchRecord>,
    pub last_update: Option<DateTime<Utc>>,
}

struct SwitcherState {
    enabled: bool,
    current_chain: Option<ChainId>,
    threshold: f64,
    min_switch_interval: Duration,
    block_rewards: BTreeMap<ChainId, f64>,
    sharding_enabled: bool,
    zone_preferences: BTreeSet<ChainId>,
    switch_history: BoundedHistory<SwitchRecord>,
    last_switch_at: Option<DateTime<Utc>>,
}

/// Everything one switch writes.
struct SwitchPlan {
    target: ChainId,
    difficulty: Option<u128>,
    reason: String,
    auto: bool,
    /// Active zone set when the target is a zone and sharding is on
    sharding: Option<Vec<ChainId>>,
}

pub struct ChainSwitcher {
    tracker: Arc<DifficultyTracker>,
    store: Arc<dyn ConfigStore>,
    miner: Arc<dyn MinerControl>,
    interval: Duration,
    state: RwLock<SwitcherState>,
    /// One decision cycle (or manual switch) at a time
    cycle: tokio::sync::Mutex<()>,
    epoch: AtomicU64,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl ChainSwitcher {
    pub fn new(
        tracker: Arc<DifficultyTracker>,
        store: Arc<dyn ConfigStore>,
        miner: Arc<dyn MinerControl>,
        settings: &SwitcherSettings,
    ) -> Arc<Self> {
        let threshold = if settings.switch_threshold.is_finite() {
            settings.switch_threshold.clamp(0.0, 1.0)
        } else {
            0.05
        };
        Arc::new(Self {
            tracker,
            store,
            miner,
            interval: settings.check_interval(),
            state: RwLock::new(SwitcherState {
                enabled: settings.enabled,
                current_chain: None,
                threshold,
                min_switch_interval: settings.min_switch_interval(),
                block_rewards: settings.reward_table(),
                sharding_enabled: settings.sharding.enabled,
                zone_preferences: settings
                    .sharding
                    .zones
                    .iter()
                    .filter(|z| z.is_zone())
                    .cloned()
                    .collect(),
                switch_history: BoundedHistory::new(settings.switch_history_capacity),
                last_switch_at: None,
            }),
            cycle: tokio::sync::Mutex::new(()),
            epoch: AtomicU64::new(0),
            timer: Mutex::new(None),
        })
    }

    pub fn tracker(&self) -> &Arc<DifficultyTracker> {
        &self.tracker
    }

    // ── Lifecycle ──

    /// Evaluate now, then every interval. No-op while already monitoring.
    pub fn start(self: &Arc<Self>) {
        let mut timer = self.timer.lock();
        if timer.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            debug!("chain switcher already monitoring");
            return;
        }

        let engine = Arc::clone(self);
        *timer = Some(spawn_periodic("chain-switcher", self.interval, move || {
            let engine = Arc::clone(&engine);
            async move {
                match engine.check_and_switch().await {
                    Ok(outcome) => engine.log_cycle(&outcome),
                    Err(e) => error!(error = %e, "switch cycle failed"),
                }
            }
        }));
        drop(timer);

        // timer and state locks are never held together
        let (threshold, enabled) = {
            let state = self.state.read();
            (state.threshold, state.enabled)
        };
        info!(
            interval_secs = self.interval.as_secs(),
            threshold,
            enabled,
            "chain switcher started"
        );
    }

    /// Cancel both timers. Cycles still in flight are discarded.
    pub fn stop(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.tracker.stop();
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
            info!("chain switcher stopped");
        }
    }

    fn log_cycle(&self, outcome: &CycleOutcome) {
        let summary = match outcome {
            CycleOutcome::NoData => "no data",
            CycleOutcome::Paused => "paused",
            CycleOutcome::Stayed { .. } => "stayed",
            CycleOutcome::Switched(_) => "switched",
            CycleOutcome::Discarded => return,
        };
        let state = self.state.read();
        info!(
            current = state.current_chain.as_ref().map(|c| c.as_str()).unwrap_or("none"),
            chains_sampled = self.tracker.get_all_difficulties().len(),
            switches = state.switch_history.len(),
            "📊 switch cycle: {}",
            summary
        );
    }

    pub fn is_monitoring(&self) -> bool {
        self.timer
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    // ── Decision cycle ──

    /// Refresh difficulties, pick the best chain and switch if policy allows.
    ///
    /// Only a failure to persist the miner config is returned as an error.
    pub async fn check_and_switch(&self) -> Result<CycleOutcome, SwitchError> {
        let _cycle = self.cycle.lock().await;
        let epoch = self.epoch.load(Ordering::SeqCst);

        let summary = self.tracker.update_difficulties().await;
        if summary.discarded || self.epoch.load(Ordering::SeqCst) != epoch {
            return Ok(CycleOutcome::Discarded);
        }

        let (enabled, rewards) = {
            let state = self.state.read();
            (state.enabled, state.block_rewards.clone())
        };
        if !enabled {
            debug!("automatic switching disabled, skipping decision");
            return Ok(CycleOutcome::Paused);
        }

        let Some(best) = self.tracker.get_most_profitable_chain(&rewards) else {
            debug!(failed = summary.failed.len(), "no chain has a known profitability, skipping cycle");
            return Ok(CycleOutcome::NoData);
        };

        let decision = self.should_switch(&best.chain, best.profitability);
        if !decision.is_switch() {
            debug!(
                candidate = %best.chain,
                profitability = best.profitability,
                "staying: {}",
                decision.reason()
            );
            return Ok(CycleOutcome::Stayed {
                candidate: best,
                decision,
            });
        }

        let plan = self.plan(&best.chain, decision.reason(), true);
        let record = self.commit(plan, Some(best.profitability), epoch).await?;
        Ok(CycleOutcome::Switched(record))
    }

    /// Switch policy against the current state.
    pub fn should_switch(&self, target: &ChainId, target_profitability: f64) -> SwitchDecision {
        let state = self.state.read();
        let Some(current) = state.current_chain.as_ref() else {
            return SwitchDecision::Bootstrap;
        };
        if current == target {
            return SwitchDecision::SameChain;
        }

        let current_profitability = state
            .block_rewards
            .get(current)
            .and_then(|reward| self.tracker.calculate_profitability(current, *reward));
        let Some(current_profitability) = current_profitability else {
            return SwitchDecision::CurrentUnknown;
        };

        let improvement = relative_improvement(target_profitability, current_profitability);
        if improvement.is_nan() || improvement < state.threshold {
            return SwitchDecision::BelowThreshold(improvement);
        }

        if let Some(last) = state.last_switch_at {
            let since = (Utc::now() - last).to_std().unwrap_or(Duration::ZERO);
            if since < state.min_switch_interval {
                return SwitchDecision::Cooldown(state.min_switch_interval - since);
            }
        }

        SwitchDecision::Improvement(improvement)
    }

    /// Manual override; bypasses threshold and cooldown.
    pub async fn force_switch(&self, chain: &ChainId) -> Result<SwitchRecord, SwitchError> {
        let _cycle = self.cycle.lock().await;
        let epoch = self.epoch.load(Ordering::SeqCst);

        let profitability = {
            let state = self.state.read();
            if state.current_chain.as_ref() == Some(chain) {
                return Err(SwitchError::AlreadyCurrent(chain.to_string()));
            }
            state
                .block_rewards
                .get(chain)
                .and_then(|reward| self.tracker.calculate_profitability(chain, *reward))
        };

        info!(chain = %chain, "manual switch requested");
        let plan = self.plan(chain, "manual switch".to_string(), false);
        self.commit(plan, profitability, epoch).await
    }

    fn plan(&self, target: &ChainId, reason: String, auto: bool) -> SwitchPlan {
        let state = self.state.read();
        let is_zone = self.tracker.chains().class_of(target) == ChainClass::Zone;
        let sharding = (state.sharding_enabled && is_zone).then(|| {
            if state.zone_preferences.is_empty() {
                vec![target.clone()]
            } else {
                state.zone_preferences.iter().cloned().collect()
            }
        });
        SwitchPlan {
            target: target.clone(),
            difficulty: self.tracker.get_difficulty(target),
            reason,
            auto,
            sharding,
        }
    }

    /// Persist, restart, record. Config persistence is the only fallible step.
    async fn commit(
        &self,
        plan: SwitchPlan,
        profitability: Option<f64>,
        epoch: u64,
    ) -> Result<SwitchRecord, SwitchError> {
        let persist_err = |source| SwitchError::Persist {
            chain: plan.target.to_string(),
            source,
        };

        let now = Utc::now();
        let mut cfg = self.store.load().await.map_err(persist_err)?;
        merge_switch(&mut cfg, &plan, now);

        if self.epoch.load(Ordering::SeqCst) != epoch {
            return Err(SwitchError::Cancelled(plan.target.to_string()));
        }
        self.store.save(&cfg).await.map_err(persist_err)?;

        restart_best_effort(self.miner.as_ref()).await;

        let mut state = self.state.write();
        let record = SwitchRecord {
            chain: plan.target.clone(),
            from: state.current_chain.clone(),
            timestamp: now,
            profitability_at_switch: profitability,
            reason: plan.reason.clone(),
        };
        info!(
            from = record.from.as_ref().map(|c| c.as_str()).unwrap_or("none"),
            to = %record.chain,
            profitability = ?profitability,
            "🔄 chain switch: {}",
            plan.reason
        );
        state.switch_history.push(record.clone());
        state.current_chain = Some(plan.target);
        state.last_switch_at = Some(now);
        Ok(record)
    }

    // ── Configuration ──

    /// Clamped to [0, 1]; NaN is ignored.
    pub fn set_threshold(&self, threshold: f64) {
        if threshold.is_nan() {
            return;
        }
        let threshold = threshold.clamp(0.0, 1.0);
        self.state.write().threshold = threshold;
        info!(threshold, "switch threshold updated");
    }

    pub fn threshold(&self) -> f64 {
        self.state.read().threshold
    }

    /// Merge into the reward table; chains not mentioned keep their reward.
    pub fn update_block_rewards(&self, rewards: &BTreeMap<ChainId, f64>) {
        let mut state = self.state.write();
        for (chain, reward) in rewards {
            if reward.is_finite() && *reward >= 0.0 {
                state.block_rewards.insert(chain.clone(), *reward);
            }
        }
    }

    pub fn block_rewards(&self) -> BTreeMap<ChainId, f64> {
        self.state.read().block_rewards.clone()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.write().enabled = enabled;
        info!(enabled, "automatic switching toggled");
    }

    /// Only affects what the next switch writes; never triggers one.
    pub fn set_sharding(&self, enabled: bool, zones: Option<Vec<ChainId>>) -> Result<(), SwitchError> {
        if let Some(bad) = zones.iter().flatten().find(|z| !z.is_zone()) {
            return Err(SwitchError::InvalidZone(bad.to_string()));
        }
        let mut state = self.state.write();
        state.sharding_enabled = enabled;
        if let Some(zones) = zones {
            state.zone_preferences = zones.into_iter().collect();
        }
        info!(
            enabled,
            zones = state.zone_preferences.len(),
            "zone sharding updated"
        );
        Ok(())
    }

    pub fn current_chain(&self) -> Option<ChainId> {
        self.state.read().current_chain.clone()
    }

    /// Oldest first.
    pub fn switch_history(&self) -> Vec<SwitchRecord> {
        self.state.read().switch_history.iter().cloned().collect()
    }

    pub fn get_status(&self) -> SwitcherStatus {
        let monitoring = self.is_monitoring();
        let state = self.state.read();
        SwitcherStatus {
            enabled: state.enabled,
            monitoring,
            current_chain: state.current_chain.clone(),
            most_profitable: self.tracker.get_most_profitable_chain(&state.block_rewards),
            difficulties: self.tracker.get_all_difficulties(),
            threshold: state.threshold,
            sharding_enabled: state.sharding_enabled,
            zone_preferences: state.zone_preferences.iter().cloned().collect(),
            recent_switches: state
                .switch_history
                .recent(STATUS_RECENT_SWITCHES)
                .cloned()
                .collect(),
            last_update: self.tracker.last_updated(),
        }
    }
}

/// `(target - current) / current`. A zero-paying current chain is beaten by
/// any positive candidate and ties with another zero-paying one.
fn relative_improvement(target: f64, current: f64) -> f64 {
    if current > 0.0 {
        (target - current) / current
    } else if target > current {
        f64::INFINITY
    } else {
        0.0
    }
}

/// Write the engine-owned sections into `cfg`, leaving everything else alone.
fn merge_switch(cfg: &mut MinerConfigFile, plan: &SwitchPlan, now: DateTime<Utc>) {
    let mining = &mut cfg.mining;
    mining.target_chain = Some(TargetChain {
        id: plan.target.clone(),
        key: plan.target.key(),
        name: plan.target.display_name(),
        switched_at: now,
        reason: plan.reason.clone(),
        difficulty: plan.difficulty.map(|d| d.to_string()),
    });
    mining.merged_mining = Some(MergedMining {
        enabled: true,
        chains: vec![plan.target.clone()],
        auto_switched: plan.auto,
        switched_at: now,
        reason: plan.reason.clone(),
    });
    match &plan.sharding {
        Some(zones) => {
            mining.sharding = Some(ShardingSection {
                enabled: true,
                active_zones: zones.clone(),
                preferred_zone: Some(plan.target.clone()),
            });
        }
        None => {
            if let Some(existing) = mining.sharding.as_mut() {
                existing.enabled = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainSet;
    use crate::error::ConfigError;
    use crate::process::fake::FakeMiner;
    use crate::tracker::fake::FakeSource;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::watch;

    #[derive(Default)]
    struct MemoryStore {
        config: Mutex<MinerConfigFile>,
        fail_save: AtomicBool,
        saves: AtomicU64,
        /// Holds every load until the sender publishes `true`
        load_gate: Mutex<Option<watch::Receiver<bool>>>,
    }

    impl MemoryStore {
        fn snapshot(&self) -> MinerConfigFile {
            self.config.lock().clone()
        }
    }

    #[async_trait]
    impl ConfigStore for MemoryStore {
        async fn load(&self) -> Result<MinerConfigFile, ConfigError> {
            let gate = self.load_gate.lock().clone();
            if let Some(mut rx) = gate {
                let _ = rx.wait_for(|open| *open).await;
            }
            Ok(self.config.lock().clone())
        }

        async fn save(&self, config: &MinerConfigFile) -> Result<(), ConfigError> {
            if self.fail_save.load(Ordering::SeqCst) {
                return Err(ConfigError::Write {
                    path: "memory".into(),
                    source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
                });
            }
            self.saves.fetch_add(1, Ordering::SeqCst);
            *self.config.lock() = config.clone();
            Ok(())
        }
    }

    struct Harness {
        source: Arc<FakeSource>,
        store: Arc<MemoryStore>,
        miner: Arc<FakeMiner>,
        engine: Arc<ChainSwitcher>,
    }

    fn chains() -> ChainSet {
        ChainSet {
            prime: ChainId::from("Prime"),
            regions: vec![ChainId::from("Cyprus"), ChainId::from("Hydra")],
            zones: vec![ChainId::from("Zone-0-0"), ChainId::from("Zone-0-1"), ChainId::from("Zone-0-2")],
        }
    }

    fn harness(values: &[(&str, u128)], rewards: &[(&str, f64)], tweak: impl FnOnce(&mut SwitcherSettings)) -> Harness {
        let mut settings = SwitcherSettings {
            chains: chains(),
            block_rewards: rewards.iter().map(|(c, r)| (ChainId::from(*c), *r)).collect(),
            ..Default::default()
        };
        tweak(&mut settings);

        let source = FakeSource::with(values);
        let tracker = DifficultyTracker::new(source.clone(), settings.chains.clone(), settings.history_capacity);
        let store = Arc::new(MemoryStore::default());
        let miner = Arc::new(FakeMiner::default());
        let engine = ChainSwitcher::new(tracker, store.clone(), miner.clone(), &settings);
        Harness { source, store, miner, engine }
    }

    fn prime_cyprus() -> Harness {
        harness(
            &[("Prime", 100), ("Cyprus", 40)],
            &[("Prime", 1.0), ("Cyprus", 0.8)],
            |_| {},
        )
    }

    #[tokio::test]
    async fn bootstrap_switches_to_most_profitable() {
        let h = prime_cyprus();

        let outcome = h.engine.check_and_switch().await.unwrap();
        let CycleOutcome::Switched(record) = outcome else {
            panic!("expected a switch, got {:?}", outcome);
        };
        assert_eq!(record.chain, ChainId::from("Cyprus"));
        assert_eq!(record.from, None);
        assert!((record.profitability_at_switch.unwrap() - 0.02).abs() < 1e-12);
        assert_eq!(h.engine.current_chain(), Some(ChainId::from("Cyprus")));

        let cfg = h.store.snapshot();
        let target = cfg.mining.target_chain.unwrap();
        assert_eq!(target.id, ChainId::from("Cyprus"));
        assert_eq!(target.difficulty.as_deref(), Some("40"));
        let merged = cfg.mining.merged_mining.unwrap();
        assert_eq!(merged.chains, vec![ChainId::from("Cyprus")]);
        assert!(merged.auto_switched);
        assert_eq!(h.miner.calls(), vec!["is_active", "start"]);
    }

    #[tokio::test]
    async fn unchanged_difficulties_do_not_switch_again() {
        let h = prime_cyprus();
        h.engine.check_and_switch().await.unwrap();

        let outcome = h.engine.check_and_switch().await.unwrap();
        assert!(matches!(
            outcome,
            CycleOutcome::Stayed { decision: SwitchDecision::SameChain, .. }
        ));
        assert_eq!(h.engine.switch_history().len(), 1);
        assert_eq!(h.store.saves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn threshold_is_a_hysteresis_guard() {
        let h = harness(&[("Prime", 100), ("Cyprus", 100)], &[("Prime", 100.0), ("Cyprus", 1.0)], |_| {});
        h.engine.tracker().update_difficulties().await;
        h.engine.force_switch(&ChainId::from("Prime")).await.unwrap();

        // current profitability is 1.0
        let cyprus = ChainId::from("Cyprus");
        assert!(!h.engine.should_switch(&cyprus, 1.04).is_switch());
        assert!(matches!(h.engine.should_switch(&cyprus, 1.04), SwitchDecision::BelowThreshold(_)));
        assert!(h.engine.should_switch(&cyprus, 1.06).is_switch());

        h.engine.set_threshold(0.10);
        assert!(!h.engine.should_switch(&cyprus, 1.06).is_switch());
    }

    #[tokio::test]
    async fn unknown_current_profitability_prefers_candidate() {
        let h = prime_cyprus();
        h.engine.check_and_switch().await.unwrap();

        h.source.set("Cyprus", 0);
        h.source.set("Prime", 100);
        let outcome = h.engine.check_and_switch().await.unwrap();
        let CycleOutcome::Switched(record) = outcome else {
            panic!("expected a switch, got {:?}", outcome);
        };
        assert_eq!(record.chain, ChainId::from("Prime"));
        assert_eq!(record.from, Some(ChainId::from("Cyprus")));
    }

    #[tokio::test]
    async fn no_known_chain_skips_cycle() {
        let h = harness(&[], &[], |_| {});
        let outcome = h.engine.check_and_switch().await.unwrap();
        assert_eq!(outcome, CycleOutcome::NoData);
        assert_eq!(h.engine.current_chain(), None);
        assert_eq!(h.engine.tracker().history_len(), 1);
        assert!(h.miner.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_restart_still_commits_switch() {
        let h = prime_cyprus();
        h.miner.fail_start.store(true, Ordering::SeqCst);

        let outcome = h.engine.check_and_switch().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Switched(_)));
        assert_eq!(h.engine.current_chain(), Some(ChainId::from("Cyprus")));
        assert_eq!(h.engine.switch_history().len(), 1);
        assert!(h.store.snapshot().mining.target_chain.is_some());
    }

    #[tokio::test]
    async fn config_write_failure_is_surfaced_and_state_untouched() {
        let h = prime_cyprus();
        h.store.fail_save.store(true, Ordering::SeqCst);

        let err = h.engine.check_and_switch().await.unwrap_err();
        assert!(matches!(err, SwitchError::Persist { .. }));
        assert_eq!(h.engine.current_chain(), None);
        assert!(h.engine.switch_history().is_empty());
        assert!(h.miner.calls().is_empty());
    }

    #[tokio::test]
    async fn zone_switch_writes_sharding_block() {
        let h = harness(
            &[("Prime", 100), ("Zone-0-1", 10)],
            &[("Prime", 1.0), ("Zone-0-1", 1.0)],
            |_| {},
        );
        h.engine
            .set_sharding(true, Some(vec![ChainId::from("Zone-0-0"), ChainId::from("Zone-0-2")]))
            .unwrap();
        // toggling sharding never switches by itself
        assert!(h.engine.switch_history().is_empty());
        assert_eq!(h.store.saves.load(Ordering::SeqCst), 0);

        h.engine.check_and_switch().await.unwrap();
        let sharding = h.store.snapshot().mining.sharding.unwrap();
        assert!(sharding.enabled);
        let zones: BTreeSet<_> = sharding.active_zones.into_iter().collect();
        let expected: BTreeSet<_> = [ChainId::from("Zone-0-0"), ChainId::from("Zone-0-2")].into_iter().collect();
        assert_eq!(zones, expected);
        assert_eq!(sharding.preferred_zone, Some(ChainId::from("Zone-0-1")));
    }

    #[tokio::test]
    async fn sharding_without_preferences_uses_target_zone() {
        let h = harness(&[("Zone-0-2", 10)], &[("Zone-0-2", 1.0)], |s| {
            s.sharding.enabled = true;
        });
        h.engine.check_and_switch().await.unwrap();
        let sharding = h.store.snapshot().mining.sharding.unwrap();
        assert_eq!(sharding.active_zones, vec![ChainId::from("Zone-0-2")]);
    }

    #[tokio::test]
    async fn disabled_sharding_marks_existing_block_off() {
        let h = harness(&[("Cyprus", 10)], &[("Cyprus", 1.0)], |_| {});
        h.store.config.lock().mining.sharding = Some(ShardingSection {
            enabled: true,
            active_zones: vec![ChainId::from("Zone-0-0")],
            preferred_zone: None,
        });
        h.engine.check_and_switch().await.unwrap();
        let sharding = h.store.snapshot().mining.sharding.unwrap();
        assert!(!sharding.enabled);
        assert_eq!(sharding.active_zones, vec![ChainId::from("Zone-0-0")]);
    }

    #[tokio::test]
    async fn non_zone_preferences_are_rejected() {
        let h = prime_cyprus();
        let err = h
            .engine
            .set_sharding(true, Some(vec![ChainId::from("Zone-0-0"), ChainId::from("Hydra")]))
            .unwrap_err();
        assert!(matches!(err, SwitchError::InvalidZone(z) if z == "Hydra"));
        assert!(!h.engine.get_status().sharding_enabled);
    }

    #[tokio::test]
    async fn switch_history_is_capped() {
        let h = prime_cyprus();
        h.engine.tracker().update_difficulties().await;
        let targets = [ChainId::from("Prime"), ChainId::from("Cyprus")];
        for i in 0..150 {
            h.engine.force_switch(&targets[i % 2]).await.unwrap();
        }
        let history = h.engine.switch_history();
        assert_eq!(history.len(), 100);
        // oldest 50 evicted; record 50 targeted Prime
        assert_eq!(history[0].chain, ChainId::from("Prime"));
        assert_eq!(h.engine.get_status().recent_switches.len(), 10);
    }

    #[tokio::test]
    async fn force_switch_to_current_is_rejected() {
        let h = prime_cyprus();
        h.engine.check_and_switch().await.unwrap();
        let err = h.engine.force_switch(&ChainId::from("Cyprus")).await.unwrap_err();
        assert!(matches!(err, SwitchError::AlreadyCurrent(_)));
    }

    #[tokio::test]
    async fn cooldown_delays_automatic_switch() {
        let h = harness(
            &[("Prime", 100), ("Cyprus", 40)],
            &[("Prime", 1.0), ("Cyprus", 0.8)],
            |s| s.min_switch_interval_secs = 3600,
        );
        h.engine.check_and_switch().await.unwrap();

        h.source.set("Prime", 10);
        let outcome = h.engine.check_and_switch().await.unwrap();
        assert!(matches!(
            outcome,
            CycleOutcome::Stayed { decision: SwitchDecision::Cooldown(_), .. }
        ));
        assert_eq!(h.engine.current_chain(), Some(ChainId::from("Cyprus")));
    }

    #[tokio::test]
    async fn disabled_engine_samples_but_never_switches() {
        let h = harness(
            &[("Prime", 100), ("Cyprus", 40)],
            &[("Prime", 1.0), ("Cyprus", 0.8)],
            |s| s.enabled = false,
        );
        assert_eq!(h.engine.check_and_switch().await.unwrap(), CycleOutcome::Paused);
        assert_eq!(h.engine.tracker().history_len(), 1);

        h.engine.set_enabled(true);
        assert!(matches!(
            h.engine.check_and_switch().await.unwrap(),
            CycleOutcome::Switched(_)
        ));
    }

    #[tokio::test]
    async fn zero_reward_current_chain_never_divides_by_zero() {
        let h = harness(&[("Prime", 100), ("Cyprus", 100)], &[("Prime", 0.0), ("Cyprus", 0.0)], |_| {});
        h.engine.tracker().update_difficulties().await;
        h.engine.force_switch(&ChainId::from("Prime")).await.unwrap();

        let decision = h.engine.should_switch(&ChainId::from("Cyprus"), 0.0);
        assert_eq!(decision, SwitchDecision::BelowThreshold(0.0));

        let outcome = h.engine.check_and_switch().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Stayed { .. }), "{:?}", outcome);
        assert_eq!(h.engine.current_chain(), Some(ChainId::from("Prime")));
        assert_eq!(h.engine.switch_history().len(), 1);

        // any paying chain beats a chain that pays nothing
        let rewards: BTreeMap<_, _> = [(ChainId::from("Cyprus"), 1.0)].into_iter().collect();
        h.engine.update_block_rewards(&rewards);
        let outcome = h.engine.check_and_switch().await.unwrap();
        let CycleOutcome::Switched(record) = outcome else {
            panic!("expected a switch, got {:?}", outcome);
        };
        assert_eq!(record.chain, ChainId::from("Cyprus"));
        assert!(!record.reason.contains("NaN"));
        let written = h.store.snapshot().mining.target_chain.unwrap();
        assert!(!written.reason.contains("NaN") && !written.reason.contains("inf"));
    }

    #[tokio::test]
    async fn stop_during_sampling_discards_the_cycle() {
        let h = prime_cyprus();
        let (open, gate) = watch::channel(false);
        h.source.gate(gate);

        let in_flight = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.check_and_switch().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.engine.stop();
        open.send(true).unwrap();

        let outcome = in_flight.await.unwrap().unwrap();
        assert_eq!(outcome, CycleOutcome::Discarded);
        assert_eq!(h.engine.current_chain(), None);
        assert_eq!(h.store.saves.load(Ordering::SeqCst), 0);
        assert!(h.miner.calls().is_empty());
    }

    #[tokio::test]
    async fn stop_before_config_write_cancels_the_switch() {
        let h = prime_cyprus();
        let (open, gate) = watch::channel(false);
        *h.store.load_gate.lock() = Some(gate);

        let in_flight = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.check_and_switch().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.engine.stop();
        open.send(true).unwrap();

        let err = in_flight.await.unwrap().unwrap_err();
        assert!(matches!(err, SwitchError::Cancelled(ref c) if c == "Cyprus"), "{:?}", err);
        assert_eq!(h.engine.current_chain(), None);
        assert!(h.engine.switch_history().is_empty());
        assert_eq!(h.store.saves.load(Ordering::SeqCst), 0);
        assert!(h.miner.calls().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_and_status_do_not_hold_timer_and_state_together() {
        let h = prime_cyprus();
        let engine = h.engine.clone();
        let runtime = tokio::runtime::Handle::current();
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        std::thread::spawn(move || {
            // a status-style reader that needs the timer lock next
            let state = engine.state.read();
            let writer = {
                let engine = engine.clone();
                std::thread::spawn(move || engine.set_threshold(0.2))
            };
            std::thread::sleep(Duration::from_millis(50));
            let starter = {
                let engine = engine.clone();
                std::thread::spawn(move || {
                    let _rt = runtime.enter();
                    engine.start();
                })
            };
            std::thread::sleep(Duration::from_millis(50));
            let monitoring = engine.is_monitoring();
            drop(state);
            writer.join().unwrap();
            starter.join().unwrap();
            let _ = done_tx.send(monitoring);
        });

        let finished = tokio::task::spawn_blocking(move || done_rx.recv_timeout(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(finished.is_ok(), "start() and a state reader deadlocked");
        assert_eq!(h.engine.threshold(), 0.2);
        h.engine.stop();
    }

    #[tokio::test]
    async fn threshold_clamps_and_rewards_merge() {
        let h = prime_cyprus();
        h.engine.set_threshold(7.5);
        assert_eq!(h.engine.threshold(), 1.0);
        h.engine.set_threshold(-0.3);
        assert_eq!(h.engine.threshold(), 0.0);
        h.engine.set_threshold(f64::NAN);
        assert_eq!(h.engine.threshold(), 0.0);

        let update: BTreeMap<_, _> = [(ChainId::from("Prime"), 5.0)].into_iter().collect();
        h.engine.update_block_rewards(&update);
        let rewards = h.engine.block_rewards();
        assert_eq!(rewards[&ChainId::from("Prime")], 5.0);
        assert_eq!(rewards[&ChainId::from("Cyprus")], 0.8);
        // untouched chains keep the nominal reward
        assert_eq!(rewards[&ChainId::from("Hydra")], 1.0);
    }

    #[tokio::test]
    async fn status_reports_live_view() {
        let h = prime_cyprus();
        let idle = h.engine.get_status();
        assert!(idle.most_profitable.is_none());
        assert!(idle.last_update.is_none());

        h.engine.check_and_switch().await.unwrap();
        let status = h.engine.get_status();
        assert_eq!(status.current_chain, Some(ChainId::from("Cyprus")));
        assert_eq!(status.most_profitable.as_ref().unwrap().chain, ChainId::from("Cyprus"));
        assert_eq!(status.difficulties.len(), 2);
        assert_eq!(status.recent_switches.len(), 1);
        assert!(status.last_update.is_some());
        assert!(!status.monitoring);
        assert!(serde_json::to_value(&status).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn start_evaluates_immediately_and_stop_cancels() {
        let h = prime_cyprus();
        h.engine.start();
        h.engine.start();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(h.engine.is_monitoring());
        assert_eq!(h.engine.current_chain(), Some(ChainId::from("Cyprus")));
        assert_eq!(h.engine.tracker().history_len(), 1);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(h.engine.tracker().history_len(), 2);

        h.engine.stop();
        h.engine.stop();
        assert!(!h.engine.is_monitoring());
        tokio::time::sleep(Duration::from_secs(3000)).await;
        assert_eq!(h.engine.tracker().history_len(), 2);
    }
}
