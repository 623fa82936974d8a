//! Real-time pacing for playback
//!
//! When a real-time factor is set, the driving loop sleeps before each
//! clock advance so that simulated time moves at `factor` time units per
//! wall-clock second. Pacing never reorders events; it only delays them.

use std::time::{Duration, Instant};

/// Maps simulated-time targets onto wall-clock delays
#[derive(Debug, Clone)]
pub struct RealTimePacer {
    /// Simulated time units per wall-clock second
    factor: f64,
    /// Wall-clock instant at which the anchor was taken
    anchor_wall: Instant,
    /// Simulated time at the anchor
    anchor_sim_time: f64,
}

impl RealTimePacer {
    /// Anchor a pacer at the current wall-clock instant and simulated time
    ///
    /// Returns `None` if `factor` is not a positive, finite number.
    pub fn new(factor: f64, sim_time: f64) -> Option<Self> {
        if !(factor.is_finite() && factor > 0.0) {
            return None;
        }
        Some(Self {
            factor,
            anchor_wall: Instant::now(),
            anchor_sim_time: sim_time,
        })
    }

    /// How long to sleep before simulated time may reach `sim_time`
    ///
    /// Returns `Duration::ZERO` when the target is already due (or behind
    /// the anchor).
    pub fn delay_until(&self, sim_time: f64) -> Duration {
        let ahead = sim_time - self.anchor_sim_time;
        if ahead <= 0.0 {
            return Duration::ZERO;
        }
        let due = Duration::try_from_secs_f64(ahead / self.factor).unwrap_or(Duration::MAX);
        due.saturating_sub(self.anchor_wall.elapsed())
    }
}
