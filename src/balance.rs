//! Endpoint selection.
//!
//! A [`LoadBalancer`] picks one index out of the healthy endpoint snapshot of a
//! service. Selection never blocks and never does I/O; strategies that need
//! state (the round-robin cursor, the hash ring) keep it behind atomics.
use std::{
    fmt,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use arc_swap::ArcSwapOption;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::{config::ConfigError, naming::Endpoint};

/// What a balancer may look at besides the endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    pub service: String,
    pub method: String,
    pub hash_key: Option<u64>,
}

impl CallContext {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            hash_key: None,
        }
    }

    pub fn with_hash_key(mut self, key: u64) -> Self {
        self.hash_key = Some(key);
        self
    }
}

pub trait LoadBalancer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Index into `endpoints`, or `None` when it is empty.
    fn select(&self, endpoints: &[Endpoint], ctx: &CallContext) -> Option<usize>;
}

#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl LoadBalancer for RoundRobin {
    fn name(&self) -> &'static str {
        "rr"
    }

    fn select(&self, endpoints: &[Endpoint], _: &CallContext) -> Option<usize> {
        if endpoints.is_empty() {
            return None;
        }
        Some(self.next.fetch_add(1, Ordering::Relaxed) % endpoints.len())
    }
}

#[derive(Debug, Default)]
pub struct Random;

impl LoadBalancer for Random {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select(&self, endpoints: &[Endpoint], _: &CallContext) -> Option<usize> {
        if endpoints.is_empty() {
            return None;
        }
        Some(rand::rng().random_range(0..endpoints.len()))
    }
}

/// Picks each endpoint with probability proportional to its weight.
#[derive(Debug, Default)]
pub struct WeightedRandom;

impl LoadBalancer for WeightedRandom {
    fn name(&self) -> &'static str {
        "weight"
    }

    fn select(&self, endpoints: &[Endpoint], ctx: &CallContext) -> Option<usize> {
        let total: u64 = endpoints.iter().map(|e| u64::from(e.weight)).sum();
        if total == 0 {
            return Random.select(endpoints, ctx);
        }
        let mut point = rand::rng().random_range(0..total);
        for (idx, endpoint) in endpoints.iter().enumerate() {
            let weight = u64::from(endpoint.weight);
            if point < weight {
                return Some(idx);
            }
            point -= weight;
        }
        None
    }
}

const POINTS_PER_DIGEST: usize = 4;
const DIGESTS_PER_WEIGHT: u64 = 40;
/// Weights are scaled down proportionally so the largest is at most this many units.
const MAX_RING_WEIGHT: u64 = 100;

type RingKey = Vec<(String, u16, u32)>;

struct Ring {
    key: RingKey,
    points: Vec<(u32, usize)>,
}

impl Ring {
    fn key(endpoints: &[Endpoint]) -> RingKey {
        endpoints
            .iter()
            .map(|e| (e.host.clone(), e.port, e.weight))
            .collect()
    }

    fn units(endpoints: &[Endpoint]) -> Vec<u64> {
        let max = endpoints
            .iter()
            .map(|e| u64::from(e.weight.max(1)))
            .max()
            .unwrap_or(1);
        endpoints
            .iter()
            .map(|e| {
                let weight = u64::from(e.weight.max(1));
                if max <= MAX_RING_WEIGHT {
                    weight
                } else {
                    (weight * MAX_RING_WEIGHT).div_ceil(max)
                }
            })
            .collect()
    }

    fn build(endpoints: &[Endpoint]) -> Self {
        let mut points = Vec::new();
        let units = Self::units(endpoints);
        for (idx, endpoint) in endpoints.iter().enumerate() {
            for replica in 0..DIGESTS_PER_WEIGHT * units[idx] {
                let digest = Sha256::digest(format!("{endpoint}-{replica}").as_bytes());
                for chunk in digest.chunks_exact(4).take(POINTS_PER_DIGEST) {
                    let hash = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    points.push((hash, idx));
                }
            }
        }
        points.sort_unstable();
        Self {
            key: Self::key(endpoints),
            points,
        }
    }

    fn locate(&self, hash: u32) -> Option<usize> {
        let at = self.points.partition_point(|(point, _)| *point < hash);
        self.points
            .get(at)
            .or_else(|| self.points.first())
            .map(|(_, idx)| *idx)
    }
}

/// Ketama ring with 160 virtual nodes per unit of weight.
///
/// Large weights are scaled so the heaviest endpoint has at most 100 units,
/// which bounds the ring at 16 000 points per endpoint.
///
/// Calls without a `hash_key` fall back to a random pick. The ring is rebuilt
/// only when the endpoint list it was built from changes.
#[derive(Default)]
pub struct ConsistentHash {
    ring: ArcSwapOption<Ring>,
}

impl ConsistentHash {
    fn ring(&self, endpoints: &[Endpoint]) -> Arc<Ring> {
        if let Some(ring) = self.ring.load_full() {
            if ring.key == Ring::key(endpoints) {
                return ring;
            }
        }
        let ring = Arc::new(Ring::build(endpoints));
        self.ring.store(Some(Arc::clone(&ring)));
        ring
    }
}

impl fmt::Debug for ConsistentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsistentHash").finish_non_exhaustive()
    }
}

impl LoadBalancer for ConsistentHash {
    fn name(&self) -> &'static str {
        "hash"
    }

    fn select(&self, endpoints: &[Endpoint], ctx: &CallContext) -> Option<usize> {
        if endpoints.is_empty() {
            return None;
        }
        let Some(key) = ctx.hash_key else {
            return Random.select(endpoints, ctx);
        };
        let folded = (key ^ (key >> 32)) as u32;
        self.ring(endpoints).locate(folded)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadBalanceKind {
    #[default]
    RoundRobin,
    Random,
    WeightedRandom,
    ConsistentHash,
}

impl LoadBalanceKind {
    pub fn build(self) -> Box<dyn LoadBalancer> {
        match self {
            LoadBalanceKind::RoundRobin => Box::new(RoundRobin::default()),
            LoadBalanceKind::Random => Box::new(Random),
            LoadBalanceKind::WeightedRandom => Box::new(WeightedRandom),
            LoadBalanceKind::ConsistentHash => Box::new(ConsistentHash::default()),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LoadBalanceKind::RoundRobin => "rr",
            LoadBalanceKind::Random => "random",
            LoadBalanceKind::WeightedRandom => "weight",
            LoadBalanceKind::ConsistentHash => "hash",
        }
    }
}

impl FromStr for LoadBalanceKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rr" | "round_robin" => Ok(LoadBalanceKind::RoundRobin),
            "random" => Ok(LoadBalanceKind::Random),
            "weight" | "weighted" => Ok(LoadBalanceKind::WeightedRandom),
            "hash" | "consistent_hash" => Ok(LoadBalanceKind::ConsistentHash),
            _ => Err(ConfigError::UnknownLoadBalance(s.to_string())),
        }
    }
}

impl fmt::Display for LoadBalanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
