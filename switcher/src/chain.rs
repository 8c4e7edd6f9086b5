//! Chain identities and the tracked chain set.
//!
//! Chains are opaque strings. The hierarchy has one prime chain, a fixed
//! set of regions and a node-configurable set of zones; zones outside the
//! configured set are still recognized by their `Zone-` prefix.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Prefix identifying zone-class chains.
pub const ZONE_PREFIX: &str = "Zone-";

/// Every chain pays the same nominal reward until the operator says otherwise,
/// so the default ranking is purely by difficulty.
pub const NOMINAL_BLOCK_REWARD: f64 = 1.0;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(String);

impl ChainId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_zone(&self) -> bool {
        self.0.starts_with(ZONE_PREFIX)
    }

    /// Lower-case key used by the miner config (`Zone-0-1` -> `zone-0-1`).
    pub fn key(&self) -> String {
        self.0.to_ascii_lowercase()
    }

    /// Human readable name (`Zone-0-1` -> `Zone 0-1`).
    pub fn display_name(&self) -> String {
        match self.0.strip_prefix(ZONE_PREFIX) {
            Some(rest) => format!("Zone {}", rest),
            None => self.0.clone(),
        }
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChainId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ChainId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainClass {
    Prime,
    Region,
    Zone,
}

/// The chains the tracker samples, in evaluation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSet {
    #[serde(default = "default_prime")]
    pub prime: ChainId,
    #[serde(default = "default_regions")]
    pub regions: Vec<ChainId>,
    #[serde(default = "default_zones")]
    pub zones: Vec<ChainId>,
}

fn default_prime() -> ChainId {
    ChainId::from("Prime")
}

fn default_regions() -> Vec<ChainId> {
    ["Cyprus", "Paxos", "Hydra"].into_iter().map(ChainId::from).collect()
}

fn default_zones() -> Vec<ChainId> {
    ["Zone-0-0", "Zone-0-1", "Zone-0-2"].into_iter().map(ChainId::from).collect()
}

impl Default for ChainSet {
    fn default() -> Self {
        Self {
            prime: default_prime(),
            regions: default_regions(),
            zones: default_zones(),
        }
    }
}

impl ChainSet {
    /// Prime first, then regions, then zones.
    pub fn iter(&self) -> impl Iterator<Item = &ChainId> {
        std::iter::once(&self.prime)
            .chain(self.regions.iter())
            .chain(self.zones.iter())
    }

    pub fn len(&self) -> usize {
        1 + self.regions.len() + self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, chain: &ChainId) -> bool {
        self.iter().any(|c| c == chain)
    }

    pub fn class_of(&self, chain: &ChainId) -> ChainClass {
        if *chain == self.prime {
            ChainClass::Prime
        } else if self.regions.contains(chain) {
            ChainClass::Region
        } else if self.zones.contains(chain) || chain.is_zone() {
            ChainClass::Zone
        } else {
            // untracked non-zone ids sit between prime and the zones
            ChainClass::Region
        }
    }

    /// Nominal block reward per chain, used when the operator supplies none.
    pub fn default_rewards(&self) -> BTreeMap<ChainId, f64> {
        self.iter()
            .map(|c| (c.clone(), NOMINAL_BLOCK_REWARD))
            .collect()
    }
}
