use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sliding window of latency measurements
#[derive(Debug, Clone)]
pub struct PercentileTracker {
    measurements: Arc<Mutex<VecDeque<u64>>>,
    window_size: usize,
}

impl PercentileTracker {
    /// Create a new percentile tracker with a specified window size
    pub fn new(window_size: usize) -> Self {
        Self {
            measurements: Arc::new(Mutex::new(VecDeque::with_capacity(window_size))),
            window_size,
        }
    }

    /// Record a measurement (in nanoseconds)
    pub fn record(&self, nanos: u64) {
        let mut measurements = self.measurements.lock();
        if measurements.len() >= self.window_size {
            measurements.pop_front();
        }
        measurements.push_back(nanos);
    }

    /// Mean of the window in microseconds
    pub fn average_us(&self) -> f64 {
        let measurements = self.measurements.lock();
        if measurements.is_empty() {
            return 0.0;
        }
        let total: u128 = measurements.iter().map(|&n| n as u128).sum();
        total as f64 / measurements.len() as f64 / 1000.0
    }

    pub fn p50_us(&self) -> f64 {
        self.percentile(0.50)
    }

    pub fn p99_us(&self) -> f64 {
        self.percentile(0.99)
    }

    fn percentile(&self, p: f64) -> f64 {
        let measurements = self.measurements.lock();
        if measurements.is_empty() {
            return 0.0;
        }

        let mut sorted: Vec<_> = measurements.iter().copied().collect();
        sorted.sort_unstable();

        let idx = ((sorted.len() as f64 * p).ceil() as usize).saturating_sub(1);
        sorted[idx] as f64 / 1000.0
    }

    pub fn count(&self) -> usize {
        self.measurements.lock().len()
    }

    pub fn clear(&self) {
        self.measurements.lock().clear();
    }
}

/// Per-stage statistics. Collection is off until enabled.
#[derive(Debug, Clone)]
pub struct StageStats {
    enabled: Arc<AtomicBool>,
    processed: Arc<AtomicU64>,
    /// Time from enqueue to the start of handling
    queue_time: PercentileTracker,
    /// Time spent inside the handler
    run_time: PercentileTracker,
    since: Arc<Mutex<Instant>>,
}

impl StageStats {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(enabled)),
            processed: Arc::new(AtomicU64::new(0)),
            queue_time: PercentileTracker::new(1000),
            run_time: PercentileTracker::new(1000),
            since: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn enable(&self, enable: bool) {
        if enable && !self.is_enabled() {
            self.reset();
        }
        self.enabled.store(enable, Ordering::Relaxed);
    }

    /// Record one handled event
    pub fn record(&self, queued: Duration, ran: Duration) {
        if !self.is_enabled() {
            return;
        }
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.queue_time.record(queued.as_nanos() as u64);
        self.run_time.record(ran.as_nanos() as u64);
    }

    pub fn total_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn queue_time_avg_us(&self) -> f64 {
        self.queue_time.average_us()
    }

    pub fn run_time_avg_us(&self) -> f64 {
        self.run_time.average_us()
    }

    /// Events handled per `frequency` since the last reset
    pub fn rate(&self, frequency: Duration) -> f64 {
        let elapsed = self.since.lock().elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.total_processed() as f64 / elapsed * frequency.as_secs_f64()
        }
    }

    pub fn reset(&self) {
        self.processed.store(0, Ordering::Relaxed);
        self.queue_time.clear();
        self.run_time.clear();
        *self.since.lock() = Instant::now();
    }

    pub fn snapshot(&self, name: &str, depths: Vec<usize>, frequency: Duration) -> StatsSnapshot {
        StatsSnapshot {
            name: name.to_string(),
            enabled: self.is_enabled(),
            depths,
            total_processed: self.total_processed(),
            rate: self.rate(frequency),
            frequency,
            queue_time_p50_us: self.queue_time.p50_us(),
            queue_time_p99_us: self.queue_time.p99_us(),
            run_time_p50_us: self.run_time.p50_us(),
            run_time_p99_us: self.run_time.p99_us(),
        }
    }
}

impl Default for StageStats {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Point-in-time view of a stage, as returned by `Stage::state`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageState {
    pub name: String,
    /// Events waiting in the stage's queues
    pub backlog: usize,
    /// Events accepted and not yet finished, including the ones running
    pub in_flight: usize,
    pub threads: usize,
    pub queues: usize,
    pub running: bool,
    pub paused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_time_avg_us: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_time_avg_us: Option<f64>,
}

/// A snapshot of stage statistics at a point in time
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub name: String,
    pub enabled: bool,
    /// Depth of every internal queue
    pub depths: Vec<usize>,
    pub total_processed: u64,
    /// Events handled per `frequency`
    pub rate: f64,
    pub frequency: Duration,
    pub queue_time_p50_us: f64,
    pub queue_time_p99_us: f64,
    pub run_time_p50_us: f64,
    pub run_time_p99_us: f64,
}

impl StatsSnapshot {
    const NAME_WIDTH: usize = 40;

    /// One line per internal queue: `name[index] : depth`
    pub fn details(&self) -> String {
        self.depths
            .iter()
            .enumerate()
            .map(|(i, depth)| {
                let label = format!("{}[{}]", self.name, i);
                if self.enabled {
                    format!("{:<width$} : {}", label, depth, width = Self::NAME_WIDTH)
                } else {
                    format!("{:<width$} : Not Monitored", label, width = Self::NAME_WIDTH)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Format statistics as a human-readable string
    pub fn format(&self) -> String {
        format!(
            "{}: Backlog: {}, Processed: {}, Rate: {:.2}/{:?}, \
             Queue P50: {:.2}µs, P99: {:.2}µs, Run P50: {:.2}µs, P99: {:.2}µs",
            self.name,
            self.depths.iter().sum::<usize>(),
            self.total_processed,
            self.rate,
            self.frequency,
            self.queue_time_p50_us,
            self.queue_time_p99_us,
            self.run_time_p50_us,
            self.run_time_p99_us,
        )
    }
}
