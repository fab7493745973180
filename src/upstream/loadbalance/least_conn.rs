use super::Target;

/// Least-connections: the candidate with the smallest active-connection
/// count wins; ties break toward the earliest list position.
pub struct LeastConnBalancer;

impl Default for LeastConnBalancer {
    fn default() -> Self {
        Self
    }
}

impl LeastConnBalancer {
    pub fn new() -> Self {
        Self
    }

    pub fn do_select(&self, candidates: &[Target]) -> Option<Target> {
        let mut best: Option<(&Target, usize)> = None;
        for target in candidates {
            let active = target.active_conns();
            match best {
                Some((_, min)) if active >= min => {}
                _ => best = Some((target, active)),
            }
        }
        best.map(|(t, _)| t.clone())
    }
}
