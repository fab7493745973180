use super::Target;
use std::sync::atomic::{AtomicU64, Ordering};

/// Weighted round-robin using prefix sum + modular counter.
///
/// Equivalent to expanding the candidate list into a virtual list where
/// each target appears `weight` times and round-robining over it, without
/// materializing the expansion. Weight 0 excludes a target.
pub struct WeightedBalancer {
    counter: AtomicU64,
}

impl Default for WeightedBalancer {
    fn default() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }
}

impl WeightedBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn do_select(&self, candidates: &[Target]) -> Option<Target> {
        let mut prefix_sum = Vec::with_capacity(candidates.len());
        let mut total: u64 = 0;
        for target in candidates {
            total += target.weight as u64;
            prefix_sum.push(total);
        }
        if total == 0 {
            return None;
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        let slot = count % total;
        let idx = prefix_sum.partition_point(|&s| s <= slot);
        Some(candidates[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn target(host: &str, weight: u32) -> Target {
        Target::new(host, 80, weight)
    }

    #[test]
    fn test_exact_proportions() {
        let lb = WeightedBalancer::new();
        let ts = vec![target("a", 2), target("b", 3)];
        let mut counts = HashMap::new();
        for _ in 0..5000 {
            let t = lb.do_select(&ts).unwrap();
            *counts.entry(t.host.clone()).or_insert(0) += 1;
        }
        assert_eq!(counts["a"], 2000);
        assert_eq!(counts["b"], 3000);
    }

    #[test]
    fn test_distribution_within_tolerance() {
        let lb = WeightedBalancer::new();
        let ts = vec![target("a", 1), target("b", 4)];
        let mut a = 0u32;
        for _ in 0..10_000 {
            if lb.do_select(&ts).unwrap().host == "a" {
                a += 1;
            }
        }
        // weight_a / total = 0.2; ±2% of 10 000 requests.
        assert!((1800..=2200).contains(&a), "a count: {}", a);
    }

    #[test]
    fn test_zero_weight_excluded() {
        let lb = WeightedBalancer::new();
        let ts = vec![target("a", 0), target("b", 1)];
        for _ in 0..20 {
            assert_eq!(lb.do_select(&ts).unwrap().host, "b");
        }
    }

    #[test]
    fn test_all_zero_weights() {
        let lb = WeightedBalancer::new();
        let ts = vec![target("a", 0), target("b", 0)];
        assert!(lb.do_select(&ts).is_none());
    }

    #[test]
    fn test_empty() {
        assert!(WeightedBalancer::new().do_select(&[]).is_none());
    }
}
