//! Attribution of events and tasks for diagnostic tooling
//!
//! Every task carries a [`TraceContext`]: the entity method it is currently
//! executing and the source location of its last suspension point. The
//! context is updated explicitly (the method given at start,
//! `TaskContext::set_method`, and the `#[track_caller]` location captured by
//! `wait_for`) and copied into each event when the wait is registered.
//!
//! [`TraceHook`] reads those contexts back for monitors. It is strictly
//! best-effort: it never blocks on the scheduler, never mutates it, and
//! answers [`Description::unknown`] whenever it cannot tell.

use std::borrow::Cow;
use std::fmt;
use std::panic::Location;

use serde::{Deserialize, Serialize};

use crate::models::entity::Entity;
use crate::models::event::Event;
use crate::models::task::TaskHandle;
use crate::orchestrator::engine::WeakScheduler;

/// Placeholder for anything the hook cannot resolve
pub const UNKNOWN: &str = "Unknown";

/// Placeholder location when no suspension point has been recorded
pub const UNKNOWN_LOCATION: &str = "Unknown method state";

/// What a task was doing at its most recent suspension point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    method: Cow<'static, str>,
    location: Option<&'static Location<'static>>,
}

impl TraceContext {
    /// Context for a task that has not suspended yet
    pub fn new(method: impl Into<Cow<'static, str>>) -> Self {
        Self {
            method: method.into(),
            location: None,
        }
    }

    /// Copy of this context pinned to a suspension point
    pub fn at(&self, location: &'static Location<'static>) -> Self {
        Self {
            method: self.method.clone(),
            location: Some(location),
        }
    }

    /// Name of the entity method active at the suspension point
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Replace the active method name
    pub fn set_method(&mut self, method: impl Into<Cow<'static, str>>) {
        self.method = method.into();
    }

    /// Source location of the suspension point, if one was recorded
    pub fn location(&self) -> Option<&'static Location<'static>> {
        self.location
    }

    /// `Type.method` label for the given entity
    pub fn class_method(&self, entity: &dyn Entity) -> String {
        format!("{}.{}", entity.type_name(), self.method)
    }

    /// `file:line` label, or the unknown placeholder
    pub fn file_line(&self) -> String {
        match self.location {
            Some(location) => format!("{}:{}", location.file(), location.line()),
            None => UNKNOWN_LOCATION.to_string(),
        }
    }
}

/// Human-readable attribution of an event or task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Description {
    /// Display name of the originating entity
    pub entity_name: String,
    /// `Type.method` active when the wait was requested
    pub method_name: String,
    /// `file:line` of the suspension point
    pub source_location: String,
}

impl Description {
    /// Placeholder returned when attribution is not possible
    pub fn unknown() -> Self {
        Self {
            entity_name: UNKNOWN.to_string(),
            method_name: UNKNOWN.to_string(),
            source_location: UNKNOWN_LOCATION.to_string(),
        }
    }

    /// Build a description from an entity and its recorded context
    pub fn from_context(entity: &dyn Entity, context: &TraceContext) -> Self {
        Self {
            entity_name: entity.name().to_string(),
            method_name: context.class_method(entity),
            source_location: context.file_line(),
        }
    }

    /// Whether this is the unknown placeholder
    pub fn is_unknown(&self) -> bool {
        *self == Self::unknown()
    }
}

impl fmt::Display for Description {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} in {} at {}",
            self.entity_name, self.method_name, self.source_location
        )
    }
}

/// Something the hook can describe
#[derive(Debug, Clone, Copy)]
pub enum TraceTarget<'a> {
    /// A pending or fired event
    Event(&'a Event),
    /// A task, described from its current context
    Task(TaskHandle),
}

impl<'a> From<&'a Event> for TraceTarget<'a> {
    fn from(event: &'a Event) -> Self {
        TraceTarget::Event(event)
    }
}

impl From<TaskHandle> for TraceTarget<'_> {
    fn from(handle: TaskHandle) -> Self {
        TraceTarget::Task(handle)
    }
}

/// Read-only attribution facility for monitors and debuggers
///
/// Holds only a weak reference to the scheduler, so keeping a hook alive
/// never keeps a finished run alive.
#[derive(Debug, Clone)]
pub struct TraceHook {
    scheduler: WeakScheduler,
}

impl TraceHook {
    pub(crate) fn new(scheduler: WeakScheduler) -> Self {
        Self { scheduler }
    }

    /// Describe an event or a task
    ///
    /// Tasks that have terminated, or whose scheduler is busy or gone,
    /// describe as unknown.
    pub fn describe<'a>(&self, target: impl Into<TraceTarget<'a>>) -> Description {
        match target.into() {
            TraceTarget::Event(event) => Description::from_context(event.caller().as_ref(), event.trace()),
            TraceTarget::Task(handle) => self.describe_task(handle),
        }
    }

    fn describe_task(&self, handle: TaskHandle) -> Description {
        let Some(scheduler) = self.scheduler.upgrade() else {
            return Description::unknown();
        };
        match scheduler.try_task_trace(handle) {
            Some((entity, context)) => Description::from_context(entity.as_ref(), &context),
            None => Description::unknown(),
        }
    }
}
