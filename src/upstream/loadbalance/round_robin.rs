use super::Target;
use std::sync::atomic::{AtomicU64, Ordering};

/// Round-robin over the healthy candidate list: `H[cursor % |H|]`, cursor
/// advanced atomically per selection. Weights are ignored — the weighted
/// balancer handles proportional distribution.
pub struct RoundRobinBalancer {
    cursor: AtomicU64,
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self {
            cursor: AtomicU64::new(0),
        }
    }
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn do_select(&self, candidates: &[Target]) -> Option<Target> {
        if candidates.is_empty() {
            return None;
        }
        let count = self.cursor.fetch_add(1, Ordering::Relaxed);
        let idx = (count % candidates.len() as u64) as usize;
        Some(candidates[idx].clone())
    }
}
