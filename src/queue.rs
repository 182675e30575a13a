//! Bounded FIFO queues backing each stage.
//!
//! [`QueueFactory`] is the pluggable seam: the stage queue only ever sees a
//! [`BlockingQueue`]. Two flavors ship with the crate:
//!
//! - [`ChannelQueue`]: crossbeam bounded channel, parks producers and consumers
//! - [`RingBuffer`]: crossbeam `ArrayQueue`, spins with backoff before sleeping

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use crossbeam::queue::ArrayQueue;
use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// A bounded FIFO with a blocking producer side and a timed consumer side.
///
/// `put` blocking while the queue is full is the engine's only backpressure
/// mechanism.
pub trait BlockingQueue<T>: Send + Sync {
    /// Enqueue, blocking while full. Returns the item if the queue is unusable.
    fn put(&self, item: T) -> Result<(), T>;

    /// Enqueue only if there is room right now
    fn offer(&self, item: T) -> Result<(), T>;

    /// Dequeue, waiting up to `timeout`
    fn poll(&self, timeout: Duration) -> Option<T>;

    /// Dequeue without waiting
    fn try_poll(&self) -> Option<T>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capacity(&self) -> usize;
}

/// Creates the internal queues of a stage
pub trait QueueFactory {
    fn create<T: Send + 'static>(&self, capacity: usize) -> Box<dyn BlockingQueue<T>>;
}

/// Built-in queue factories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueFlavor {
    /// Crossbeam bounded channel
    #[default]
    Channel,
    /// Lock-free ring buffer; spins `spin` backoff steps before sleeping
    RingBuffer { spin: u32 },
}

impl QueueFactory for QueueFlavor {
    fn create<T: Send + 'static>(&self, capacity: usize) -> Box<dyn BlockingQueue<T>> {
        match *self {
            QueueFlavor::Channel => Box::new(ChannelQueue::new(capacity)),
            QueueFlavor::RingBuffer { spin } => Box::new(RingBuffer::with_spin(capacity, spin)),
        }
    }
}

/// Queue over a crossbeam bounded channel
#[derive(Debug)]
pub struct ChannelQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
}

impl<T: Send> ChannelQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = channel::bounded(capacity);
        Self { tx, rx, capacity }
    }
}

impl<T: Send> BlockingQueue<T> for ChannelQueue<T> {
    fn put(&self, item: T) -> Result<(), T> {
        // Both ends live in self, so the channel never disconnects while in use.
        self.tx.send(item).map_err(|e| e.into_inner())
    }

    fn offer(&self, item: T) -> Result<(), T> {
        self.tx.try_send(item).map_err(|e| e.into_inner())
    }

    fn poll(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    fn try_poll(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    fn len(&self) -> usize {
        self.rx.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A lock-free ring buffer using crossbeam's ArrayQueue
#[derive(Debug)]
pub struct RingBuffer<T: Send> {
    queue: Arc<ArrayQueue<T>>,
    spin: u32,
    block_count: Arc<AtomicU64>,
}

impl<T: Send> Clone for RingBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            spin: self.spin,
            block_count: Arc::clone(&self.block_count),
        }
    }
}

impl<T: Send> RingBuffer<T> {
    /// Longest single sleep once spinning is exhausted
    const PARK: Duration = Duration::from_micros(50);

    /// Create a new ring buffer with the specified capacity
    pub fn new(capacity: usize) -> Self {
        Self::with_spin(capacity, 0)
    }

    /// Ring buffer that spins up to `spin` backoff steps before sleeping
    pub fn with_spin(capacity: usize, spin: u32) -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(capacity.max(1))),
            spin,
            block_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Attempt to push without blocking
    pub fn try_push(&self, item: T) -> Result<(), T> {
        self.queue.push(item)
    }

    /// Push with blocking until space is available
    fn push_blocking(&self, mut item: T) -> Result<(), T> {
        self.block_count.fetch_add(1, Ordering::Relaxed);
        let backoff = Backoff::new();
        let mut spins = 0u32;
        loop {
            match self.queue.push(item) {
                Ok(()) => return Ok(()),
                Err(i) => {
                    item = i;
                    if spins < self.spin && !backoff.is_completed() {
                        spins += 1;
                        backoff.snooze();
                    } else {
                        thread::sleep(Self::PARK);
                    }
                }
            }
        }
    }

    /// Attempt to pop an item from the buffer
    pub fn pop(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Get the number of times a producer had to wait for space
    pub fn block_count(&self) -> u64 {
        self.block_count.load(Ordering::Relaxed)
    }
}

impl<T: Send> BlockingQueue<T> for RingBuffer<T> {
    fn put(&self, item: T) -> Result<(), T> {
        match self.queue.push(item) {
            Ok(()) => Ok(()),
            Err(item) => self.push_blocking(item),
        }
    }

    fn offer(&self, item: T) -> Result<(), T> {
        self.queue.push(item)
    }

    fn poll(&self, timeout: Duration) -> Option<T> {
        if let Some(item) = self.queue.pop() {
            return Some(item);
        }
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        let mut spins = 0u32;
        loop {
            if let Some(item) = self.queue.pop() {
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            if spins < self.spin && !backoff.is_completed() {
                spins += 1;
                backoff.snooze();
            } else {
                thread::sleep(Self::PARK.min(deadline - now));
            }
        }
    }

    fn try_poll(&self) -> Option<T> {
        self.queue.pop()
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}
