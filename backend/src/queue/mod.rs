//! Future-event list
//!
//! Pending events ordered by `(sched_tick, priority rank, insertion
//! sequence)`. The insertion sequence is assigned here, at enqueue time, so
//! events with identical tick and priority always fire in the order they
//! were scheduled, whatever happened in wall-clock time around them.
//!
//! Any event can be removed by handle before it fires; that is how
//! interrupts and kills take a task's wait off the list.
//!
//! # Example
//!
//! ```rust
//! use sim_kernel_core::{Event, EventQueue, NamedEntity, PriorityOrder, TaskHandle, TraceContext};
//!
//! let mut queue = EventQueue::new(PriorityOrder::LowerFirst);
//! let caller = NamedEntity::shared("Source");
//! let event = |tick, priority| {
//!     Event::new(0, tick, priority, TaskHandle::new(0), caller.clone(), TraceContext::new("run"))
//! };
//!
//! queue.insert(event(10, 0));
//! queue.insert(event(10, 5));
//! let early = queue.insert(event(5, 0));
//!
//! let (handle, first) = queue.pop_min().unwrap();
//! assert_eq!(handle, early);
//! assert_eq!((first.sched_tick(), first.priority()), (5, 0));
//! ```

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::clock::Tick;
use crate::models::event::{Event, EventHandle, Priority};

/// Errors raised by the event queue
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("event {0} was already cancelled")]
    DuplicateHandle(EventHandle),

    #[error("event {0} was never issued by this queue")]
    UnknownHandle(EventHandle),
}

/// Direction in which priorities fire among events at the same tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityOrder {
    /// Lower priority values fire first
    #[default]
    LowerFirst,
    /// Higher priority values fire first
    HigherFirst,
}

impl PriorityOrder {
    /// Sort rank of a priority: smaller ranks fire first
    pub fn rank(self, priority: Priority) -> i64 {
        match self {
            PriorityOrder::LowerFirst => i64::from(priority),
            PriorityOrder::HigherFirst => -i64::from(priority),
        }
    }
}

/// Total ordering key of a queued event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKey {
    pub tick: Tick,
    pub rank: i64,
    pub seq: u64,
}

/// Priority-ordered set of pending events
#[derive(Debug)]
pub struct EventQueue {
    order: PriorityOrder,
    entries: BTreeMap<EventKey, Event>,
    /// Live handles and where their events sit
    index: HashMap<EventHandle, EventKey>,
    /// Most recently cancelled handles, oldest first
    cancelled: RecentHandles,
    next_seq: u64,
}

/// How many cancelled handles are remembered for duplicate detection
pub const CANCEL_WINDOW: usize = 1024;

/// Bounded set of recently cancelled handles
#[derive(Debug, Default)]
struct RecentHandles {
    order: VecDeque<EventHandle>,
    members: HashSet<EventHandle>,
}

impl RecentHandles {
    fn contains(&self, handle: EventHandle) -> bool {
        self.members.contains(&handle)
    }

    fn remember(&mut self, handle: EventHandle) {
        if self.order.len() == CANCEL_WINDOW {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.order.push_back(handle);
        self.members.insert(handle);
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

impl EventQueue {
    /// Create an empty queue
    pub fn new(order: PriorityOrder) -> Self {
        Self {
            order,
            entries: BTreeMap::new(),
            index: HashMap::new(),
            cancelled: RecentHandles::default(),
            next_seq: 0,
        }
    }

    /// Priority direction used by this queue
    pub fn order(&self) -> PriorityOrder {
        self.order
    }

    /// Enqueue an event and return its handle
    pub fn insert(&mut self, event: Event) -> EventHandle {
        let seq = self.next_seq;
        self.next_seq += 1;

        let key = EventKey {
            tick: event.sched_tick(),
            rank: self.order.rank(event.priority()),
            seq,
        };
        let handle = EventHandle::new(seq);
        self.entries.insert(key, event);
        self.index.insert(handle, key);
        handle
    }

    /// Earliest pending event, if any
    pub fn peek_min(&self) -> Option<&Event> {
        self.entries.values().next()
    }

    /// Tick of the earliest pending event, if any
    pub fn peek_min_tick(&self) -> Option<Tick> {
        self.entries.keys().next().map(|key| key.tick)
    }

    /// Remove and return the earliest pending event
    pub fn pop_min(&mut self) -> Option<(EventHandle, Event)> {
        let (key, event) = self.entries.pop_first()?;
        let handle = EventHandle::new(key.seq);
        self.index.remove(&handle);
        Some((handle, event))
    }

    /// Remove a specific pending event
    ///
    /// Returns the event if it was still pending, or `None` if it has
    /// already fired (a no-op). Cancelling a handle twice is a caller bug
    /// and is reported while the handle is among the last
    /// [`CANCEL_WINDOW`] cancellations; older handles read as fired.
    pub fn cancel(&mut self, handle: EventHandle) -> Result<Option<Event>, QueueError> {
        if handle.raw() >= self.next_seq {
            return Err(QueueError::UnknownHandle(handle));
        }
        if let Some(key) = self.index.remove(&handle) {
            self.cancelled.remember(handle);
            return Ok(self.entries.remove(&key));
        }
        if self.cancelled.contains(handle) {
            return Err(QueueError::DuplicateHandle(handle));
        }
        Ok(None)
    }

    /// Whether `handle` is still pending
    pub fn contains(&self, handle: EventHandle) -> bool {
        self.index.contains_key(&handle)
    }

    /// Number of pending events
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no events are pending
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pending events in firing order
    pub fn iter(&self) -> impl Iterator<Item = (EventHandle, &Event)> {
        self.entries
            .iter()
            .map(|(key, event)| (EventHandle::new(key.seq), event))
    }

    /// Drop every pending event, returning them in firing order
    ///
    /// Sequence numbers keep increasing afterwards, so stale handles never
    /// alias new events.
    pub fn clear(&mut self) -> Vec<(EventHandle, Event)> {
        self.index.clear();
        std::mem::take(&mut self.entries)
            .into_iter()
            .map(|(key, event)| (EventHandle::new(key.seq), event))
            .collect()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(PriorityOrder::default())
    }
}
