//! Cross-stage tracing for a single in-flight event.
//!
//! A [`PipelineMonitor`] travels with its context. Each stage the context
//! passes through appends `Enqueue`, `Run` and `End` records. Once closed the
//! record list is frozen and handed to the injected [`TraceConsumer`].

use crate::error::{DispatchError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Point in a stage visit that a record marks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Enqueue,
    Run,
    End,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Enqueue => "enqueue",
            Phase::Run => "run",
            Phase::End => "end",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct TraceRecord {
    pub stage: String,
    pub phase: Phase,
    /// Free-form detail, e.g. the handler or entity acted on
    pub target: Option<String>,
    pub thread: String,
    /// Offset from the start of the trace
    pub offset: Duration,
}

/// Receives completed traces
pub trait TraceConsumer: Send + Sync {
    fn consume(&self, records: &[TraceRecord]);
}

/// Emits each closed trace as a debug log line
#[derive(Debug, Default)]
pub struct LogConsumer;

impl TraceConsumer for LogConsumer {
    fn consume(&self, records: &[TraceRecord]) {
        let path: Vec<String> = records
            .iter()
            .map(|r| format!("{}:{}@{}us", r.stage, r.phase, r.offset.as_micros()))
            .collect();
        debug!(records = records.len(), path = %path.join(" -> "), "Pipeline trace");
    }
}

/// Keeps every closed trace in memory
#[derive(Debug, Default)]
pub struct CollectingConsumer {
    traces: Mutex<Vec<Vec<TraceRecord>>>,
}

impl CollectingConsumer {
    pub fn traces(&self) -> Vec<Vec<TraceRecord>> {
        self.traces.lock().clone()
    }
}

impl TraceConsumer for CollectingConsumer {
    fn consume(&self, records: &[TraceRecord]) {
        self.traces.lock().push(records.to_vec());
    }
}

struct TraceState {
    started: Instant,
    records: Vec<TraceRecord>,
    closed: bool,
}

/// Mutable trace for one in-flight event
#[derive(Clone)]
pub struct PipelineMonitor {
    state: Arc<Mutex<TraceState>>,
    consumer: Arc<dyn TraceConsumer>,
}

impl fmt::Debug for PipelineMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PipelineMonitor")
            .field("records", &state.records.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl PipelineMonitor {
    pub fn new(consumer: Arc<dyn TraceConsumer>) -> Self {
        Self::from_state(
            TraceState {
                started: Instant::now(),
                records: Vec::new(),
                closed: false,
            },
            consumer,
        )
    }

    fn from_state(state: TraceState, consumer: Arc<dyn TraceConsumer>) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            consumer,
        }
    }

    /// Append a record and return the monitor that now holds it.
    ///
    /// A closed trace is never mutated: the records are copied into a fresh
    /// open continuation which is returned instead.
    pub fn action(&self, stage: &str, phase: Phase, target: Option<&str>) -> PipelineMonitor {
        let mut state = self.state.lock();
        let record = TraceRecord {
            stage: stage.to_string(),
            phase,
            target: target.map(str::to_string),
            thread: thread_label(),
            offset: state.started.elapsed(),
        };
        if state.closed {
            let mut records = state.records.clone();
            records.push(record);
            let started = state.started;
            drop(state);
            return Self::from_state(
                TraceState {
                    started,
                    records,
                    closed: false,
                },
                Arc::clone(&self.consumer),
            );
        }
        state.records.push(record);
        self.clone()
    }

    /// Freeze the trace and report it. Closing twice is an error.
    pub fn close(&self) -> Result<()> {
        let records = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(DispatchError::MonitorClosed);
            }
            state.closed = true;
            state.records.clone()
        };
        self.consumer.consume(&records);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn records(&self) -> Vec<TraceRecord> {
        self.state.lock().records.clone()
    }

    /// Whether both handles refer to the same trace
    pub fn same_trace(&self, other: &PipelineMonitor) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

fn thread_label() -> String {
    let current = std::thread::current();
    current
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{:?}", current.id()))
}
