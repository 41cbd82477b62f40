//! Endpoint selection strategies.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Cycle from just after the last pick, skipping ineligible endpoints.
    RoundRobin,
    /// First eligible endpoint in configured order.
    #[default]
    PriorityOrder,
    /// Lowest last observed latency; unmeasured endpoints count as zero.
    LeastLatency,
    /// Lowest configured unit cost.
    CostOptimized,
    /// Uniform sample among eligible endpoints.
    Random,
}

impl std::fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SelectionStrategy::RoundRobin => "round_robin",
            SelectionStrategy::PriorityOrder => "priority_order",
            SelectionStrategy::LeastLatency => "least_latency",
            SelectionStrategy::CostOptimized => "cost_optimized",
            SelectionStrategy::Random => "random",
        };
        f.write_str(name)
    }
}

/// What a strategy may look at for one eligible endpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub index: usize,
    pub latency: Option<Duration>,
    pub unit_cost: f64,
}

impl SelectionStrategy {
    /// Index of the chosen endpoint, or `None` if `candidates` is empty.
    ///
    /// `candidates` must be sorted by index. `cursor` holds the round-robin
    /// position for a pool of `pool_size` endpoints.
    pub fn pick(
        &self,
        candidates: &[Candidate],
        cursor: &AtomicUsize,
        pool_size: usize,
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let chosen = match self {
            SelectionStrategy::RoundRobin => {
                let start = cursor.load(Ordering::SeqCst) % pool_size.max(1);
                let chosen = candidates
                    .iter()
                    .find(|c| c.index >= start)
                    .unwrap_or(&candidates[0])
                    .index;
                cursor.store(chosen + 1, Ordering::SeqCst);
                chosen
            }
            SelectionStrategy::PriorityOrder => candidates[0].index,
            SelectionStrategy::LeastLatency => {
                candidates
                    .iter()
                    .min_by_key(|c| c.latency.unwrap_or(Duration::ZERO))
                    .map(|c| c.index)?
            }
            SelectionStrategy::CostOptimized => {
                candidates
                    .iter()
                    .min_by(|a, b| a.unit_cost.total_cmp(&b.unit_cost))
                    .map(|c| c.index)?
            }
            SelectionStrategy::Random => {
                candidates[rand::rng().random_range(0..candidates.len())].index
            }
        };
        Some(chosen)
    }
}
