//! The queue side of a stage.
//!
//! A [`StageQueue`] owns one or more bounded internal queues and decides which
//! one an incoming context lands on:
//!
//! - single-threaded contexts always go to queue 0
//! - keyed multi-threaded contexts go to `key % N`, so one key is always
//!   handled by one worker, in submission order
//! - unkeyed contexts go to the shortest queue ([`FindStrategy`])
//! - flush contexts visit every queue in turn before they run
//!
//! Producers block in `put` while the destination queue is full.

use crate::config::FindStrategy;
use crate::context::{EventContext, SchedulingKey, SpecializedEvent};
use crate::error::{DispatchError, Result};
use crate::monitor::{Phase, PipelineMonitor};
use crate::queue::{BlockingQueue, QueueFactory};
use crate::sink::Sink;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// What a queued envelope asks the worker to do
pub(crate) enum Payload<EC> {
    /// Run the stage handler
    Handled(EC),
    /// Hop to the next queue until all `N` have been visited, then run the handler
    Flushing {
        context: EC,
        origin: usize,
        visits: usize,
    },
    /// Call the event's own `execute`
    Direct(Box<dyn SpecializedEvent>),
    /// Close marker, one per queue
    Close,
}

pub(crate) struct Envelope<EC> {
    pub(crate) payload: Payload<EC>,
    pub(crate) enqueued: Instant,
    pub(crate) monitor: Option<PipelineMonitor>,
}

impl<EC> Envelope<EC> {
    fn new(payload: Payload<EC>, monitor: Option<PipelineMonitor>) -> Self {
        Self {
            payload,
            enqueued: Instant::now(),
            monitor,
        }
    }

    fn is_marker(&self) -> bool {
        matches!(self.payload, Payload::Close)
    }
}

#[derive(Debug, Clone, Copy)]
enum Layout {
    Singleton,
    Multi {
        strategy: FindStrategy,
        partition_shift: u32,
        /// `N - 1` when `N` is a power of two
        mask: Option<usize>,
    },
}

/// Internal queues of one stage
pub struct StageQueue<EC> {
    name: String,
    layout: Layout,
    queues: Vec<Box<dyn BlockingQueue<Envelope<EC>>>>,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    /// Close markers sitting in each queue; excluded from reported depths
    markers: Vec<AtomicUsize>,
    /// Brute search start; best effort, written by workers that find their queue empty
    cursor: AtomicUsize,
    partition_hand: AtomicUsize,
}

impl<EC: EventContext> StageQueue<EC> {
    /// Build `queue_count` queues sharing `capacity` (ceil-divided, at least one slot each).
    ///
    /// The queue starts closed; the owning stage opens it on start.
    pub fn new<F: QueueFactory>(
        name: impl Into<String>,
        queue_count: usize,
        capacity: usize,
        strategy: FindStrategy,
        factory: &F,
    ) -> Self {
        let queue_count = queue_count.max(1);
        let per_queue = capacity.div_ceil(queue_count).max(1);
        let queues = (0..queue_count).map(|_| factory.create(per_queue)).collect();

        let layout = if queue_count == 1 {
            Layout::Singleton
        } else {
            Layout::Multi {
                strategy,
                partition_shift: if queue_count >= 8 { 2 } else { 1 },
                mask: queue_count
                    .is_power_of_two()
                    .then(|| queue_count - 1),
            }
        };

        Self {
            name: name.into(),
            layout,
            queues,
            closed: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            markers: (0..queue_count).map(|_| AtomicUsize::new(0)).collect(),
            cursor: AtomicUsize::new(0),
            partition_hand: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Per-queue capacity
    pub fn queue_capacity(&self) -> usize {
        self.queues[0].capacity()
    }

    // `closed` and `in_flight` are SeqCst: a producer bumps the count then
    // reads the flag, a worker reads the flag then the count.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Events queued across all internal queues, close markers excluded
    pub fn size(&self) -> usize {
        (0..self.queues.len()).map(|i| self.depth(i)).sum()
    }

    pub fn is_empty(&self) -> bool {
        (0..self.queues.len()).all(|i| self.depth(i) == 0)
    }

    pub fn depths(&self) -> Vec<usize> {
        (0..self.queues.len()).map(|i| self.depth(i)).collect()
    }

    /// Logical events accepted and not yet finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Plain context, always onto queue 0
    pub fn add_single_threaded(&self, context: EC) -> Result<()> {
        self.ensure_open()?;
        if context.scheduling().is_some() {
            return Err(DispatchError::NotSingleThreaded(self.name.clone()));
        }
        let monitor = self.trace_enqueue(&context);
        self.enqueue(0, Envelope::new(Payload::Handled(context), monitor))
    }

    /// Context with a scheduling capability; routed by key, or to the shortest queue
    pub fn add_multi_threaded(&self, context: EC) -> Result<()> {
        self.ensure_open()?;
        let Some(scheduling) = context.scheduling() else {
            return Err(DispatchError::NotMultiThreaded(self.name.clone()));
        };
        let index = self.route(scheduling.key);
        let monitor = self.trace_enqueue(&context);
        let payload = if scheduling.flush {
            Payload::Flushing {
                context,
                origin: index,
                visits: 0,
            }
        } else {
            Payload::Handled(context)
        };
        self.enqueue(index, Envelope::new(payload, monitor))
    }

    /// Self-executing event; the handler is never invoked
    pub fn add_specialized(&self, event: Box<dyn SpecializedEvent>) -> Result<()> {
        self.ensure_open()?;
        let index = self.route(event.execution_key());
        self.enqueue(index, Envelope::new(Payload::Direct(event), None))
    }

    /// Stop accepting events and put a close marker on every queue.
    ///
    /// Already queued events still drain. A queue with no room left gets no
    /// marker; its workers notice the closed flag once it runs dry.
    pub fn close(&self) -> Result<()> {
        if !self.seal() {
            return Err(DispatchError::AlreadyClosed(self.name.clone()));
        }
        for (index, queue) in self.queues.iter().enumerate() {
            self.markers[index].fetch_add(1, Ordering::AcqRel);
            if queue.offer(Envelope::new(Payload::Close, None)).is_err() {
                self.markers[index].fetch_sub(1, Ordering::AcqRel);
                debug!(stage = %self.name, queue = index, "No room for close marker");
            }
        }
        Ok(())
    }

    /// Set the closed flag without queueing markers; false if already closed
    pub(crate) fn seal(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Drop every queued event without closing. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut cleared = 0;
        for index in 0..self.queues.len() {
            while let Some(envelope) = self.try_poll(index) {
                if !envelope.is_marker() {
                    cleared += 1;
                }
            }
        }
        if cleared > 0 {
            self.in_flight.fetch_sub(cleared, Ordering::AcqRel);
        }
        info!(stage = %self.name, cleared, "Cleared stage queue");
        cleared
    }

    pub(crate) fn open(&self) {
        self.closed.store(false, Ordering::Release);
    }

    /// Try to claim the idle stage for an inline execution
    pub(crate) fn claim_idle(&self) -> bool {
        self.in_flight
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Count a logical event as finished
    pub(crate) fn finish(&self) {
        self.finish_many(1);
    }

    pub(crate) fn finish_many(&self, count: usize) {
        self.in_flight.fetch_sub(count, Ordering::AcqRel);
    }

    pub(crate) fn poll(&self, index: usize, timeout: Duration) -> Option<Envelope<EC>> {
        let queue = &self.queues[index];
        let polled = queue.poll(timeout);
        if polled.is_none() || queue.is_empty() {
            // Steer the next brute search toward a queue that just ran dry.
            self.cursor.store(index, Ordering::Relaxed);
        }
        self.taken(index, polled)
    }

    pub(crate) fn try_poll(&self, index: usize) -> Option<Envelope<EC>> {
        let polled = self.queues[index].try_poll();
        self.taken(index, polled)
    }

    pub(crate) fn queue_is_empty(&self, index: usize) -> bool {
        self.depth(index) == 0
    }

    /// Send a flush context on to its next queue.
    ///
    /// Returns the context once it has been dequeued from every queue.
    pub(crate) fn advance_flush(
        &self,
        context: EC,
        origin: usize,
        visits: usize,
        monitor: Option<PipelineMonitor>,
    ) -> Option<EC> {
        let visits = visits + 1;
        if visits >= self.queues.len() {
            return Some(context);
        }
        let next = self.modulo(origin + visits);
        let envelope = Envelope::new(
            Payload::Flushing {
                context,
                origin,
                visits,
            },
            monitor,
        );
        match self.queues[next].put(envelope) {
            Ok(()) => None,
            Err(envelope) => {
                debug!(stage = %self.name, queue = next, "Flush hop rejected; running early");
                match envelope.payload {
                    Payload::Flushing { context, .. } => Some(context),
                    _ => None,
                }
            }
        }
    }

    fn trace_enqueue(&self, context: &EC) -> Option<PipelineMonitor> {
        context
            .monitor()
            .map(|m| m.action(&self.name, Phase::Enqueue, None))
    }

    fn depth(&self, index: usize) -> usize {
        self.queues[index]
            .len()
            .saturating_sub(self.markers[index].load(Ordering::Acquire))
    }

    fn taken(&self, index: usize, polled: Option<Envelope<EC>>) -> Option<Envelope<EC>> {
        if polled.as_ref().is_some_and(Envelope::is_marker) {
            self.markers[index].fetch_sub(1, Ordering::AcqRel);
        }
        polled
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(DispatchError::Closed(self.name.clone()))
        } else {
            Ok(())
        }
    }

    fn enqueue(&self, index: usize, envelope: Envelope<EC>) -> Result<()> {
        // Count first, then check: a closing stage either sees the count and
        // waits for the event, or the event sees the flag and is turned away.
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(DispatchError::Closed(self.name.clone()));
        }
        match self.queues[index].put(envelope) {
            Ok(()) => {
                debug!(stage = %self.name, queue = index, "Added context");
                Ok(())
            }
            Err(_) => {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                Err(DispatchError::Closed(self.name.clone()))
            }
        }
    }

    fn route(&self, key: Option<SchedulingKey>) -> usize {
        match (key, self.layout) {
            (_, Layout::Singleton) => 0,
            (Some(key), _) => key.queue_index(self.queues.len()),
            (None, Layout::Multi { .. }) => self.shortest_queue(),
        }
    }

    fn modulo(&self, i: usize) -> usize {
        match self.layout {
            Layout::Multi {
                mask: Some(mask), ..
            } => i & mask,
            _ => i % self.queues.len(),
        }
    }

    fn shortest_queue(&self) -> usize {
        match self.layout {
            Layout::Singleton => 0,
            Layout::Multi {
                strategy: FindStrategy::Partition,
                partition_shift,
                ..
            } => {
                let hand = self.partition_hand.fetch_add(1, Ordering::Relaxed);
                let mut offset = self.modulo(hand.wrapping_shl(partition_shift));
                let mut best = offset;
                let mut min = usize::MAX;
                for _ in 0..(1usize << partition_shift) {
                    let depth = self.queues[offset].len();
                    if depth < min {
                        best = offset;
                        min = depth;
                    }
                    offset = self.modulo(offset + 1);
                }
                best
            }
            Layout::Multi {
                strategy: FindStrategy::Brute,
                ..
            } => {
                let pointer = self.cursor.load(Ordering::Relaxed);
                let mut best = self.modulo(pointer);
                let mut min = usize::MAX;
                for x in 0..self.queues.len() {
                    let index = self.modulo(pointer + x);
                    let queue = &self.queues[index];
                    if queue.is_empty() {
                        return index;
                    }
                    // Concurrent producers race here; a stale depth only costs balance.
                    let depth = queue.len();
                    if depth < min {
                        best = index;
                        min = depth;
                    }
                }
                best
            }
        }
    }
}

impl<EC: EventContext> Sink<EC> for StageQueue<EC> {
    fn add_single_threaded(&self, context: EC) -> Result<()> {
        StageQueue::add_single_threaded(self, context)
    }

    fn add_multi_threaded(&self, context: EC) -> Result<()> {
        StageQueue::add_multi_threaded(self, context)
    }

    fn add_specialized(&self, event: Box<dyn SpecializedEvent>) -> Result<()> {
        StageQueue::add_specialized(self, event)
    }

    fn size(&self) -> usize {
        StageQueue::size(self)
    }

    fn clear(&self) -> usize {
        StageQueue::clear(self)
    }
}
