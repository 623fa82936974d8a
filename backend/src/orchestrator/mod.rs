//! Orchestrator - the scheduler and the handle tasks use to talk to it
//!
//! See `engine.rs` for the driving loop.

pub mod config;
pub mod context;
pub mod engine;

pub use config::SchedulerConfig;
pub use context::{TaskContext, WaitFor};
pub use engine::{RunSummary, Scheduler, SchedulerError, StopReason, WeakScheduler};
