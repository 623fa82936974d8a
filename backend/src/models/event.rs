//! Scheduled events and their status records
//!
//! An [`Event`] is the immutable record of one scheduled resumption: which
//! task to resume, at which tick, with which priority, and who asked for it.
//! Once an event is in the queue its fields never change; cancelling an
//! event removes it from the queue instead.
//!
//! Monitors observe events through [`EventRecord`]s, a flat, stable,
//! human-readable view of an event plus a status label. The scheduler
//! appends records to an [`EventLog`] as events are scheduled, fired,
//! interrupted or terminated.
//!
//! # Example
//!
//! ```rust
//! use sim_kernel_core::{Clock, EventLog, EventRecord, EventStatus};
//!
//! let clock = Clock::new(1000.0);
//! let mut log = EventLog::new();
//! log.log(EventRecord {
//!     sched_tick: 1500,
//!     sched_time: clock.to_sim_time(1500),
//!     priority: 0,
//!     caller_name: "Server1".to_string(),
//!     caller_input_name: "Server1".to_string(),
//!     class_method: "Server.process".to_string(),
//!     file_line: "model.rs:42".to_string(),
//!     added_time: 0.0,
//!     status: EventStatus::Waiting,
//!     fault: None,
//! });
//!
//! assert_eq!(log.records_with_status(EventStatus::Waiting).len(), 1);
//! assert_eq!(log.records()[0].columns()[9], "Waiting");
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::clock::{Clock, Tick};
use crate::models::entity::EntityRef;
use crate::models::task::TaskHandle;
use crate::trace::TraceContext;

/// Scheduling priority; see `PriorityOrder` for the firing direction
pub type Priority = i32;

/// Handle to a queued event
///
/// The raw value is the event's insertion sequence, which is unique per
/// queue and strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventHandle(u64);

impl EventHandle {
    /// Wrap a raw sequence number
    #[inline]
    pub fn new(raw: u64) -> Self {
        EventHandle(raw)
    }

    /// Return the raw sequence number
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E#{}", self.0)
    }
}

/// One scheduled resumption of a task
#[derive(Debug, Clone)]
pub struct Event {
    added_tick: Tick,
    sched_tick: Tick,
    priority: Priority,
    task: TaskHandle,
    caller: EntityRef,
    trace: TraceContext,
}

impl Event {
    /// Build an event
    ///
    /// # Panics
    /// If `sched_tick < added_tick`; callers compute `sched_tick` from the
    /// current tick plus a non-negative delay.
    pub fn new(
        added_tick: Tick,
        sched_tick: Tick,
        priority: Priority,
        task: TaskHandle,
        caller: EntityRef,
        trace: TraceContext,
    ) -> Self {
        assert!(sched_tick >= added_tick, "event scheduled before it was added");
        Self {
            added_tick,
            sched_tick,
            priority,
            task,
            caller,
            trace,
        }
    }

    /// Tick at which the event was queued
    pub fn added_tick(&self) -> Tick {
        self.added_tick
    }

    /// Tick at which the event fires
    pub fn sched_tick(&self) -> Tick {
        self.sched_tick
    }

    /// Scheduling priority
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Task resumed when the event fires
    pub fn task(&self) -> TaskHandle {
        self.task
    }

    /// Entity that requested the wait
    pub fn caller(&self) -> &EntityRef {
        &self.caller
    }

    /// Attribution captured when the wait was requested
    pub fn trace(&self) -> &TraceContext {
        &self.trace
    }
}

/// Status label attached to an event record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventStatus {
    /// Queued, not yet fired
    Waiting,
    /// Fired and its task segment ran to the next wait or to completion
    RanNormally,
    /// Cancelled because its task was interrupted
    Interrupted,
    /// Cancelled because its task was killed
    Terminated,
    /// Its task segment raised a fault
    Faulted,
}

impl EventStatus {
    /// Label shown to monitors
    pub fn label(self) -> &'static str {
        match self {
            EventStatus::Waiting => "Waiting",
            EventStatus::RanNormally => "Ran Normally",
            EventStatus::Interrupted => "Interrupted",
            EventStatus::Terminated => "Terminated",
            EventStatus::Faulted => "Faulted",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Flat, human-readable view of an event for monitors
///
/// The column layout returned by [`EventRecord::columns`] is the contract
/// external tooling relies on; keep it stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub sched_tick: Tick,
    pub sched_time: f64,
    pub priority: Priority,
    pub caller_name: String,
    pub caller_input_name: String,
    /// `Type.method` active when the wait was requested
    pub class_method: String,
    /// `file:line` of the suspension point
    pub file_line: String,
    pub added_time: f64,
    pub status: EventStatus,
    /// Fault detail, set only for `EventStatus::Faulted`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
}

impl EventRecord {
    /// Number of columns in the tabular form
    pub const COLUMNS: usize = 10;

    /// Column headers matching [`EventRecord::columns`]
    pub const HEADERS: [&'static str; Self::COLUMNS] = [
        "Sched Tick",
        "Sched Time",
        "Priority",
        "Caller",
        "Input Name",
        "",
        "Method",
        "Location",
        "Added Time",
        "Status",
    ];

    /// Snapshot an event with the given status
    pub fn from_event(event: &Event, clock: &Clock, status: EventStatus) -> Self {
        let caller = event.caller();
        Self {
            sched_tick: event.sched_tick(),
            sched_time: clock.to_sim_time(event.sched_tick()),
            priority: event.priority(),
            caller_name: caller.name().to_string(),
            caller_input_name: caller.input_name().to_string(),
            class_method: event.trace().class_method(caller.as_ref()),
            file_line: event.trace().file_line(),
            added_time: clock.to_sim_time(event.added_tick()),
            status,
            fault: None,
        }
    }

    /// Attach fault detail and mark the record as faulted
    pub fn with_fault(mut self, detail: impl Into<String>) -> Self {
        self.status = EventStatus::Faulted;
        self.fault = Some(detail.into());
        self
    }

    /// Fixed-width tabular form
    ///
    /// Column 5 is reserved and always empty.
    pub fn columns(&self) -> [String; Self::COLUMNS] {
        [
            format!("{:>15}", self.sched_tick),
            format!("{:>15.3}", self.sched_time),
            format!("{:>5}", self.priority),
            self.caller_name.clone(),
            self.caller_input_name.clone(),
            String::new(),
            self.class_method.clone(),
            self.file_line.clone(),
            format!("{:>15.3}", self.added_time),
            self.status.label().to_string(),
        ]
    }
}

/// Ordered log of event records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventLog {
    records: Vec<EventRecord>,
}

impl EventLog {
    /// Create a new empty log
    pub fn new() -> Self {
        Self { records: Vec::new() }
    }

    /// Append a record
    pub fn log(&mut self, record: EventRecord) {
        self.records.push(record);
    }

    /// Get the number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the log is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Get all records in logging order
    pub fn records(&self) -> &[EventRecord] {
        &self.records
    }

    /// Get records with a given status
    pub fn records_with_status(&self, status: EventStatus) -> Vec<&EventRecord> {
        self.records.iter().filter(|r| r.status == status).collect()
    }

    /// Get records requested by a given entity
    pub fn records_for_caller(&self, caller_name: &str) -> Vec<&EventRecord> {
        self.records
            .iter()
            .filter(|r| r.caller_name == caller_name)
            .collect()
    }

    /// Get records for events scheduled at a given tick
    pub fn records_at_tick(&self, tick: Tick) -> Vec<&EventRecord> {
        self.records.iter().filter(|r| r.sched_tick == tick).collect()
    }

    /// Serialize all records as a JSON array
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.records)
    }

    /// SHA-256 over the tabular form of every record, hex encoded
    ///
    /// Two runs of the same model with the same inputs produce the same
    /// digest.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for record in &self.records {
            for column in record.columns() {
                hasher.update(column.as_bytes());
                hasher.update([0x1f]);
            }
            if let Some(fault) = &record.fault {
                hasher.update(fault.as_bytes());
            }
            hasher.update([0x1e]);
        }
        format!("{:x}", hasher.finalize())
    }

    /// Remove all records
    pub fn clear(&mut self) {
        self.records.clear();
    }
}
