use super::Target;
use std::net::IpAddr;

/// IP-hash affinity: `H[hash(client_ip) % |H|]`.
///
/// Uses FNV-1a rather than the std hasher so the mapping is stable across
/// process restarts for the same client IP and the same ordered candidate
/// list (`RandomState` is seeded per process).
pub struct IpHashBalancer;

impl Default for IpHashBalancer {
    fn default() -> Self {
        Self
    }
}

impl IpHashBalancer {
    pub fn new() -> Self {
        Self
    }

    pub fn do_select(&self, candidates: &[Target], client_ip: IpAddr) -> Option<Target> {
        if candidates.is_empty() {
            return None;
        }
        let hash = fnv1a64(client_ip.to_string().as_bytes());
        let idx = (hash % candidates.len() as u64) as usize;
        Some(candidates[idx].clone())
    }
}

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
