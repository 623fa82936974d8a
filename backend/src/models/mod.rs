//! Domain models for the simulation kernel

pub mod entity;
pub mod event;
pub mod task;

pub use entity::{Entity, EntityRef, NamedEntity};
pub use event::{Event, EventHandle, EventLog, EventRecord, EventStatus, Priority};
pub use task::{TaskFault, TaskHandle, TaskOutcome, TaskResult, TaskState, Wakeup};
