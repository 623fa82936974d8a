//! Time keeping: the virtual clock and real-time pacing

pub mod clock;
pub mod pacing;

pub use clock::{Clock, ClockError, Tick};
pub use pacing::RealTimePacer;
