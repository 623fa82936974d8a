//! xorshift64* delay sampler
//!
//! Model code draws service times, breakdown intervals and similar delays
//! from here, so that a seed fully determines a run.

use serde::{Deserialize, Serialize};

use crate::core::clock::Tick;

/// Seeded generator of tick delays
///
/// # Example
/// ```
/// use sim_kernel_core::DelayRng;
///
/// let mut rng = DelayRng::new(7);
/// let service = rng.uniform_ticks(100, 200);
/// assert!((100..200).contains(&service));
///
/// let mut replay = DelayRng::new(7);
/// assert_eq!(replay.uniform_ticks(100, 200), service);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRng {
    state: u64,
}

impl DelayRng {
    /// Create a generator; a zero seed is replaced by 1
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    /// Derive an independent generator, e.g. one per model entity
    pub fn fork(&mut self) -> Self {
        Self::new(self.next_u64())
    }

    /// Next raw 64-bit value
    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    /// Uniform in [0.0, 1.0)
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 * (1.0 / ((1u64 << 53) as f64))
    }

    /// Uniform delay in [lo, hi)
    ///
    /// # Panics
    /// Panics if `lo >= hi`
    pub fn uniform_ticks(&mut self, lo: Tick, hi: Tick) -> Tick {
        assert!(lo < hi, "lo must be less than hi");
        lo + self.next_u64() % (hi - lo)
    }

    /// Exponentially distributed delay with the given mean, rounded to ticks
    ///
    /// # Panics
    /// Panics if `mean` is negative or not finite
    pub fn exponential_ticks(&mut self, mean: f64) -> Tick {
        assert!(mean.is_finite() && mean >= 0.0, "mean must be finite and non-negative");
        // 1 - u lies in (0, 1], so the log is finite
        let sample = -mean * (1.0 - self.next_f64()).ln();
        if sample >= Tick::MAX as f64 {
            Tick::MAX
        } else {
            sample.round() as Tick
        }
    }

    /// True with probability `p`
    pub fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    /// Current state, for reproducing a run from a midpoint
    pub fn state(&self) -> u64 {
        self.state
    }
}
