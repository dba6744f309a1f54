use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use rand::seq::SliceRandom;

use crate::Proxy;

/// Orders the upstream list for each forwarded query.
#[derive(Debug)]
pub enum Policy {
    /// A uniform permutation of the pool.
    Random,
    /// Rotation by an atomic counter.
    RoundRobin(AtomicU32),
}

// === impl Policy ===

impl Policy {
    pub fn round_robin() -> Self {
        Policy::RoundRobin(AtomicU32::new(0))
    }

    pub(crate) fn order(&self, proxies: &[Arc<Proxy>]) -> Vec<Arc<Proxy>> {
        match self {
            Policy::Random => match proxies.len() {
                // Nothing to shuffle.
                0 | 1 => proxies.to_vec(),
                // Fair coin swap.
                2 => {
                    if rand::random() {
                        vec![proxies[1].clone(), proxies[0].clone()]
                    } else {
                        proxies.to_vec()
                    }
                }
                _ => {
                    let mut shuffled = proxies.to_vec();
                    shuffled.shuffle(&mut rand::thread_rng());
                    shuffled
                }
            },
            Policy::RoundRobin(robin) => {
                if proxies.is_empty() {
                    return Vec::new();
                }
                let start = robin.fetch_add(1, Ordering::Relaxed) as usize % proxies.len();
                let mut ordered = Vec::with_capacity(proxies.len());
                ordered.push(proxies[start].clone());
                ordered.extend(proxies[..start].iter().cloned());
                ordered.extend(proxies[start + 1..].iter().cloned());
                ordered
            }
        }
    }
}

impl std::str::FromStr for Policy {
    type Err = InvalidPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(Policy::Random),
            "round_robin" => Ok(Policy::round_robin()),
            _ => Err(InvalidPolicy(s.to_string())),
        }
    }
}

impl std::fmt::Display for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Policy::Random => "random".fmt(f),
            Policy::RoundRobin(_) => "round_robin".fmt(f),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown policy {0:?}; expected `random` or `round_robin`")]
pub struct InvalidPolicy(String);
