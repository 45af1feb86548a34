//! Group selection within one directory.
//!
//! Both balancers are weighted by each group's warm-up adjusted weight for
//! the directory, and only fall back to unavailable groups when no group has
//! a live channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

use saturn_common::{Result, SaturnError};

use crate::config::LoadBalancerKind;
use crate::group::ChannelGroup;

pub trait LoadBalancer: Send + Sync {
    /// Choose one group from `groups`, a snapshot of `directory`.
    fn select(&self, groups: &[Arc<ChannelGroup>], directory: &str) -> Result<Arc<ChannelGroup>>;
}

pub fn load_balancer(kind: LoadBalancerKind) -> Arc<dyn LoadBalancer> {
    match kind {
        LoadBalancerKind::RoundRobin => Arc::new(RoundRobinLoadBalancer::new()),
        LoadBalancerKind::Random => Arc::new(RandomLoadBalancer),
    }
}

/// Available groups, or every group if none is available.
fn candidates(groups: &[Arc<ChannelGroup>], directory: &str) -> Result<Vec<Arc<ChannelGroup>>> {
    if groups.is_empty() {
        return Err(SaturnError::NoAvailableProvider(directory.to_string()));
    }
    let available: Vec<_> = groups.iter().filter(|g| g.is_available()).cloned().collect();
    if available.is_empty() {
        Ok(groups.to_vec())
    } else {
        Ok(available)
    }
}

/// Effective weights, and whether they are all equal.
fn weights(groups: &[Arc<ChannelGroup>], directory: &str) -> (Vec<u32>, bool) {
    let weights: Vec<u32> = groups.iter().map(|g| g.effective_weight(directory)).collect();
    let same = weights.windows(2).all(|w| w[0] == w[1]);
    (weights, same)
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Index of the slot covering `position` in the cumulative weights.
fn slot(cumulative: &[u64], position: u64) -> usize {
    cumulative.partition_point(|&c| c <= position)
}

fn cumulative(weights: &[u32], divisor: u32) -> Vec<u64> {
    let mut sum = 0u64;
    weights
        .iter()
        .map(|w| {
            sum += (*w / divisor) as u64;
            sum
        })
        .collect()
}

/// Weighted round robin.
///
/// With equal weights this is plain rotation. Otherwise the rotation counter
/// walks a virtual sequence where each group occupies `weight / gcd` slots,
/// in insertion order.
#[derive(Debug, Default)]
pub struct RoundRobinLoadBalancer {
    sequence: AtomicUsize,
}

impl RoundRobinLoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobinLoadBalancer {
    fn select(&self, groups: &[Arc<ChannelGroup>], directory: &str) -> Result<Arc<ChannelGroup>> {
        let groups = candidates(groups, directory)?;
        if groups.len() == 1 {
            return Ok(groups[0].clone());
        }

        let index = self.sequence.fetch_add(1, Ordering::Relaxed);
        let (weights, same) = weights(&groups, directory);
        if same {
            return Ok(groups[index % groups.len()].clone());
        }

        let divisor = weights.iter().copied().fold(0, gcd).max(1);
        let cumulative = cumulative(&weights, divisor);
        let total = cumulative.last().copied().unwrap_or(1).max(1);
        let position = index as u64 % total;
        Ok(groups[slot(&cumulative, position).min(groups.len() - 1)].clone())
    }
}

/// Weighted random: uniform over the sum of weights.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomLoadBalancer;

impl LoadBalancer for RandomLoadBalancer {
    fn select(&self, groups: &[Arc<ChannelGroup>], directory: &str) -> Result<Arc<ChannelGroup>> {
        let groups = candidates(groups, directory)?;
        if groups.len() == 1 {
            return Ok(groups[0].clone());
        }

        let mut rng = rand::rng();
        let (weights, same) = weights(&groups, directory);
        if same {
            return Ok(groups[rng.random_range(0..groups.len())].clone());
        }

        let cumulative = cumulative(&weights, 1);
        let total = cumulative.last().copied().unwrap_or(1).max(1);
        let position = rng.random_range(0..total);
        Ok(groups[slot(&cumulative, position).min(groups.len() - 1)].clone())
    }
}
