use super::Target;
use rand::Rng;

/// Random selection: uniform over the candidates, or weighted random
/// (probability ∝ weight, prefix sum + binary search) when any candidate
/// carries a weight above zero.
pub struct RandomBalancer;

impl Default for RandomBalancer {
    fn default() -> Self {
        Self
    }
}

impl RandomBalancer {
    pub fn new() -> Self {
        Self
    }

    pub fn do_select(&self, candidates: &[Target]) -> Option<Target> {
        if candidates.is_empty() {
            return None;
        }
        let mut rng = rand::thread_rng();

        let mut prefix_sum = Vec::with_capacity(candidates.len());
        let mut total: u64 = 0;
        for target in candidates {
            total += target.weight as u64;
            prefix_sum.push(total);
        }

        if total == 0 {
            let idx = rng.gen_range(0..candidates.len());
            return Some(candidates[idx].clone());
        }

        let slot = rng.gen_range(0..total);
        let idx = prefix_sum.partition_point(|&s| s <= slot);
        Some(candidates[idx].clone())
    }
}
