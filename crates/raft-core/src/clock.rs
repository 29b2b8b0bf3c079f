//! # clock
//!
//! why: election and heartbeat deadlines need a monotonic time source that tests can drive
//! relations: read by node.rs on every tick; raft-node runs on SystemClock, tests on ManualClock
//! what: Clock trait, SystemClock, ManualClock, ElectionTimeouts

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::config::RaftConfig;

/// Monotonic time provider.
///
/// `now` is the time elapsed since an arbitrary fixed origin; only
/// differences between readings are meaningful.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Duration;
}

/// Wall-clock backed by `std::time::Instant`.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same time, so a test can hand one clone to each node
/// and advance the whole simulated cluster at once.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_ms: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, at: Duration) {
        self.now_ms.store(at.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.now_ms.load(Ordering::SeqCst))
    }
}

/// Draws randomized election timeouts from `[min, max]`.
///
/// Each node owns its own generator so timeouts are independent across the
/// cluster, which keeps split votes rare.
#[derive(Debug)]
pub struct ElectionTimeouts {
    rng: SmallRng,
    min: u64,
    max: u64,
}

impl ElectionTimeouts {
    pub fn new(config: &RaftConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        Self {
            rng,
            min: config.election_timeout_min,
            max: config.election_timeout_max.max(config.election_timeout_min),
        }
    }

    pub fn next_timeout(&mut self) -> Duration {
        Duration::from_millis(self.rng.gen_range(self.min..=self.max))
    }
}
