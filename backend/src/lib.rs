//! Simulation Kernel Core
//!
//! Discrete-event simulation kernel: model logic runs as cooperative tasks
//! that suspend themselves on a virtual clock.
//!
//! # Architecture
//!
//! - **core**: Virtual clock and real-time pacing
//! - **models**: Entities, events, event records and tasks
//! - **queue**: Future-event list
//! - **orchestrator**: Scheduler loop and the task-side context
//! - **trace**: Attribution of events and tasks for monitors
//! - **rng**: Deterministic delay sampling for models
//!
//! # Critical Invariants
//!
//! 1. At most one task executes at any instant
//! 2. The clock never moves backwards
//! 3. Events at the same tick fire by priority, then in scheduling order

pub mod core;
pub mod models;
pub mod orchestrator;
pub mod queue;
pub mod rng;
pub mod trace;

// Re-exports for convenience
pub use crate::core::{Clock, ClockError, RealTimePacer, Tick};
pub use models::{
    entity::{Entity, EntityRef, NamedEntity},
    event::{Event, EventHandle, EventLog, EventRecord, EventStatus, Priority},
    task::{TaskFault, TaskHandle, TaskOutcome, TaskResult, TaskState, Wakeup},
};
pub use orchestrator::{
    RunSummary, Scheduler, SchedulerConfig, SchedulerError, StopReason, TaskContext, WaitFor,
};
pub use queue::{EventQueue, PriorityOrder, QueueError};
pub use rng::DelayRng;
pub use trace::{Description, TraceContext, TraceHook, TraceTarget};
