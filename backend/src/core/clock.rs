//! Virtual clock for the simulation
//!
//! The simulation operates in discrete ticks. The clock only ever jumps
//! forward, from one scheduled event to the next. A fixed conversion factor
//! maps ticks onto simulated time units (seconds, hours, whatever the model
//! uses) for reporting.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest indivisible unit of virtual time.
pub type Tick = u64;

/// Errors raised by the clock
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClockError {
    #[error("cannot move clock back from tick {current} to tick {requested}")]
    Regression { current: Tick, requested: Tick },
}

/// Holds the current virtual tick and the tick/time-unit conversion
///
/// # Example
/// ```
/// use sim_kernel_core::Clock;
///
/// let mut clock = Clock::new(1000.0); // 1000 ticks per time unit
/// assert_eq!(clock.now(), 0);
///
/// clock.advance_to(2500).unwrap();
/// assert_eq!(clock.now(), 2500);
/// assert_eq!(clock.to_sim_time(clock.now()), 2.5);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clock {
    /// Tick of the event currently being processed
    current_tick: Tick,
    /// Number of ticks in one simulated time unit
    ticks_per_time_unit: f64,
    /// Simulated time units per wall-clock second, when pacing playback
    real_time_factor: Option<f64>,
}

impl Clock {
    /// Largest tick for which `to_tick(to_sim_time(tick)) == tick` holds
    ///
    /// Up to 2^50 the tick converts to `f64` exactly and the two rounding
    /// steps of the round trip stay well under half a tick. Past 2^53 ticks
    /// are no longer representable and the round trip drifts by the `f64`
    /// spacing at that magnitude.
    pub const MAX_EXACT_TICK: Tick = 1 << 50;

    /// Create a new clock at tick 0
    ///
    /// # Arguments
    /// * `ticks_per_time_unit` - Number of ticks in one simulated time unit
    ///
    /// # Panics
    /// If `ticks_per_time_unit` is not a positive, finite number.
    pub fn new(ticks_per_time_unit: f64) -> Self {
        assert!(
            ticks_per_time_unit.is_finite() && ticks_per_time_unit > 0.0,
            "ticks_per_time_unit must be positive and finite"
        );
        Self {
            current_tick: 0,
            ticks_per_time_unit,
            real_time_factor: None,
        }
    }

    /// Get the current tick
    pub fn now(&self) -> Tick {
        self.current_tick
    }

    /// Move the clock forward to `tick`
    ///
    /// Advancing to the current tick is allowed (several events may share a
    /// tick). Moving backwards is a scheduling bug and is rejected.
    ///
    /// # Example
    /// ```
    /// use sim_kernel_core::{Clock, ClockError};
    ///
    /// let mut clock = Clock::new(1.0);
    /// clock.advance_to(10).unwrap();
    /// assert_eq!(
    ///     clock.advance_to(5),
    ///     Err(ClockError::Regression { current: 10, requested: 5 })
    /// );
    /// assert_eq!(clock.now(), 10);
    /// ```
    pub fn advance_to(&mut self, tick: Tick) -> Result<(), ClockError> {
        if tick < self.current_tick {
            return Err(ClockError::Regression {
                current: self.current_tick,
                requested: tick,
            });
        }
        self.current_tick = tick;
        Ok(())
    }

    /// Convert a tick into simulated time units
    ///
    /// Exact to within rounding for ticks up to [`Clock::MAX_EXACT_TICK`].
    pub fn to_sim_time(&self, tick: Tick) -> f64 {
        tick as f64 / self.ticks_per_time_unit
    }

    /// Convert simulated time units into the nearest tick
    ///
    /// Negative and NaN inputs map to tick 0; values past the representable
    /// range saturate at `Tick::MAX`. Inverts [`Clock::to_sim_time`] exactly
    /// for ticks up to [`Clock::MAX_EXACT_TICK`].
    ///
    /// # Example
    /// ```
    /// use sim_kernel_core::Clock;
    ///
    /// let clock = Clock::new(1000.0);
    /// assert_eq!(clock.to_tick(1.2344), 1234);
    /// assert_eq!(clock.to_tick(1.2346), 1235);
    /// assert_eq!(clock.to_tick(-3.0), 0);
    /// ```
    pub fn to_tick(&self, sim_time: f64) -> Tick {
        let ticks = (sim_time * self.ticks_per_time_unit).round();
        if ticks.is_nan() || ticks <= 0.0 {
            0
        } else if ticks >= Tick::MAX as f64 {
            Tick::MAX
        } else {
            ticks as Tick
        }
    }

    /// Get the tick/time-unit conversion factor
    pub fn ticks_per_time_unit(&self) -> f64 {
        self.ticks_per_time_unit
    }

    /// Get the real-time pacing factor, if playback is paced
    pub fn real_time_factor(&self) -> Option<f64> {
        self.real_time_factor
    }

    /// Set or clear the real-time pacing factor
    pub fn set_real_time_factor(&mut self, factor: Option<f64>) {
        self.real_time_factor = factor;
    }

    /// Rewind to tick 0 for a fresh run
    pub fn reset(&mut self) {
        self.current_tick = 0;
    }
}
