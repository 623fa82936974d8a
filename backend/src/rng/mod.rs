//! Deterministic random delays for model code
//!
//! The kernel itself never draws random numbers; models that do should draw
//! them here so a seed reproduces the whole run.

mod xorshift;

pub use xorshift::DelayRng;
