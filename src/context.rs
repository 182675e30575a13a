//! Event contexts and their routing capabilities.
//!
//! A context reaches a stage through one of three paths:
//!
//! - **single-threaded**: plain contexts (no [`Scheduling`]) always land on queue 0
//! - **multi-threaded**: contexts that return [`Scheduling`] are pinned by key,
//!   or sent to the shortest queue when the key is absent
//! - **specialized**: [`SpecializedEvent`]s carry their own `execute` and never
//!   reach the stage's handler

use crate::error::HandlerError;
use crate::monitor::PipelineMonitor;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Key used to pin related contexts to the same internal queue.
///
/// Every context with an equal key is handled by the same worker, in
/// submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchedulingKey(u64);

impl SchedulingKey {
    /// Key from any hashable value
    pub fn hashed<K: Hash + ?Sized>(key: &K) -> Self {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        SchedulingKey(hasher.finish())
    }

    /// Key used as-is; `raw % queue_count` picks the queue
    pub const fn raw(value: u64) -> Self {
        SchedulingKey(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Destination queue for this key among `queue_count` queues
    pub fn queue_index(&self, queue_count: usize) -> usize {
        (self.0 % queue_count as u64) as usize
    }
}

impl From<u64> for SchedulingKey {
    fn from(value: u64) -> Self {
        SchedulingKey(value)
    }
}

impl From<u32> for SchedulingKey {
    fn from(value: u32) -> Self {
        SchedulingKey(value as u64)
    }
}

impl From<usize> for SchedulingKey {
    fn from(value: usize) -> Self {
        SchedulingKey(value as u64)
    }
}

/// Multi-threaded capability of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Scheduling {
    /// `None` lets the stage pick the shortest queue
    pub key: Option<SchedulingKey>,
    /// Visit every internal queue before running
    pub flush: bool,
}

impl Scheduling {
    /// Unkeyed: any queue will do
    pub fn any() -> Self {
        Self::default()
    }

    pub fn keyed(key: impl Into<SchedulingKey>) -> Self {
        Self {
            key: Some(key.into()),
            flush: false,
        }
    }

    /// Mark as a flush barrier
    pub fn flushing(mut self) -> Self {
        self.flush = true;
        self
    }
}

/// Payload routed through a stage.
///
/// Plain contexts implement this with no methods. Contexts that can be spread
/// over several worker threads return a [`Scheduling`] from [`scheduling`](Self::scheduling).
pub trait EventContext: Send + 'static {
    /// Multi-threaded capability; `None` means single-threaded only
    fn scheduling(&self) -> Option<Scheduling> {
        None
    }

    /// Cross-stage trace carried by this context, if any
    fn monitor(&self) -> Option<&PipelineMonitor> {
        None
    }
}

macro_rules! plain_context {
    ($($ty:ty),* $(,)?) => {
        $(impl EventContext for $ty {})*
    };
}

plain_context!(u8, u16, u32, u64, usize, i32, i64, String, Vec<u8>);

/// Self-executing work that only needs to reach the right thread.
pub trait SpecializedEvent: Send + 'static {
    /// Queue selection key; `None` picks the shortest queue
    fn execution_key(&self) -> Option<SchedulingKey> {
        None
    }

    fn execute(self: Box<Self>) -> Result<(), HandlerError>;
}

/// Closure-backed [`SpecializedEvent`]
pub struct Specialized<F> {
    key: Option<SchedulingKey>,
    task: F,
}

impl<F> Specialized<F>
where
    F: FnOnce() -> Result<(), HandlerError> + Send + 'static,
{
    pub fn new(task: F) -> Self {
        Self { key: None, task }
    }

    pub fn keyed(key: impl Into<SchedulingKey>, task: F) -> Self {
        Self {
            key: Some(key.into()),
            task,
        }
    }

    pub fn boxed(self) -> Box<dyn SpecializedEvent> {
        Box::new(self)
    }
}

impl<F> SpecializedEvent for Specialized<F>
where
    F: FnOnce() -> Result<(), HandlerError> + Send + 'static,
{
    fn execution_key(&self) -> Option<SchedulingKey> {
        self.key
    }

    fn execute(self: Box<Self>) -> Result<(), HandlerError> {
        (self.task)()
    }
}
