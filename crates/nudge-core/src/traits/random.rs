//! Injectable randomness for occurrence generation.

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Uniform integer source over a half-open range `[lo, hi)`.
pub trait RandomSource: Send + Sync {
    fn uniform_int(&self, lo: i64, hi: i64) -> i64;
}

/// Thread-local RNG. The default in production.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn uniform_int(&self, lo: i64, hi: i64) -> i64 {
        if hi <= lo {
            return lo;
        }
        rand::thread_rng().gen_range(lo..hi)
    }
}

/// Reproducible RNG for tests and replays.
#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn uniform_int(&self, lo: i64, hi: i64) -> i64 {
        if hi <= lo {
            return lo;
        }
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        rng.gen_range(lo..hi)
    }
}
