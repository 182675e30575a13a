use crate::context::{EventContext, SpecializedEvent};
use crate::error::{DispatchError, HandlerError, Result};
use crate::handler::{guarded, ConfigurationContext, EventHandler};
use crate::monitor::{Phase, PipelineMonitor};
use crate::sink::Sink;
use crate::stage_queue::{Envelope, Payload, StageQueue};
use crate::stats::{StageState, StageStats, StatsSnapshot};
use crate::thread_group::ThreadGroup;
use parking_lot::Mutex;
use std::any::{type_name, Any};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};

/// Thread and queue sizing for a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageOptions {
    pub threads: usize,
    /// Workers sharing one internal queue. 1 gives every worker its own
    /// queue and strict per-key ordering.
    pub threads_to_queue_ratio: usize,
    /// Total capacity, split across the internal queues
    pub capacity: usize,
}

impl StageOptions {
    pub fn new(threads: usize, capacity: usize) -> Self {
        Self {
            threads: threads.max(1),
            threads_to_queue_ratio: 1,
            capacity: capacity.max(1),
        }
    }

    pub fn with_ratio(mut self, threads_to_queue_ratio: usize) -> Self {
        self.threads_to_queue_ratio = threads_to_queue_ratio.max(1);
        self
    }

    pub fn queue_count(&self) -> usize {
        (self.threads / self.threads_to_queue_ratio.max(1)).max(1)
    }
}

/// Everything a stage needs besides its handler and queue
pub(crate) struct StageSettings {
    pub(crate) threads: usize,
    pub(crate) poll_interval: Duration,
    pub(crate) sleep: Option<Duration>,
    pub(crate) paused: bool,
    pub(crate) stats_enabled: bool,
    pub(crate) thread_group: Arc<dyn ThreadGroup>,
}

struct StageInner<EC: EventContext> {
    name: String,
    handler: Arc<dyn EventHandler<EC>>,
    queue: Arc<StageQueue<EC>>,
    threads: usize,
    poll_interval: Duration,
    sleep: Option<Duration>,
    thread_group: Arc<dyn ThreadGroup>,
    stats: StageStats,
    paused: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    running: AtomicBool,
    workers: Mutex<Vec<JoinHandle<Result<()>>>>,
}

/// A named unit of processing: one handler, one stage queue and its workers.
///
/// `Stage` is a cheap handle; clones refer to the same stage.
pub struct Stage<EC: EventContext> {
    inner: Arc<StageInner<EC>>,
}

impl<EC: EventContext> Clone for Stage<EC> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<EC: EventContext> Stage<EC> {
    pub(crate) fn new(
        name: String,
        handler: Arc<dyn EventHandler<EC>>,
        queue: StageQueue<EC>,
        settings: StageSettings,
    ) -> Self {
        Self {
            inner: Arc::new(StageInner {
                name,
                handler,
                queue: Arc::new(queue),
                threads: settings.threads.max(1),
                poll_interval: settings.poll_interval,
                sleep: settings.sleep,
                thread_group: settings.thread_group,
                stats: StageStats::new(settings.stats_enabled),
                paused: Arc::new(AtomicBool::new(settings.paused)),
                shutdown: Arc::new(AtomicBool::new(false)),
                running: AtomicBool::new(false),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The producer side of this stage
    pub fn sink(&self) -> Arc<StageQueue<EC>> {
        Arc::clone(&self.inner.queue)
    }

    pub fn threads(&self) -> usize {
        self.inner.threads
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// No event queued or running
    pub fn is_idle(&self) -> bool {
        self.inner.queue.in_flight() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.inner.queue.in_flight()
    }

    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::Release);
    }

    pub fn unpause(&self) {
        self.inner.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    /// Initialize the handler, open the queue and spawn the workers
    pub fn start(&self, context: &ConfigurationContext) -> Result<()> {
        let inner = &self.inner;
        if inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DispatchError::StageRunning(inner.name.clone()));
        }

        if let Err(source) = inner.handler.initialize_context(context) {
            inner.running.store(false, Ordering::Release);
            return Err(DispatchError::Handler {
                stage: inner.name.clone(),
                source,
            });
        }

        inner.shutdown.store(false, Ordering::Release);
        inner.queue.open();

        let queue_count = inner.queue.queue_count();
        let mut workers = inner.workers.lock();
        for index in 0..inner.threads {
            let worker = Worker {
                stage: inner.name.clone(),
                index,
                queue_index: index % queue_count,
                queue: Arc::clone(&inner.queue),
                handler: Arc::clone(&inner.handler),
                stats: inner.stats.clone(),
                paused: Arc::clone(&inner.paused),
                shutdown: Arc::clone(&inner.shutdown),
                poll_interval: inner.poll_interval,
                sleep: inner.sleep,
                thread_group: Arc::clone(&inner.thread_group),
            };
            let spawned = thread::Builder::new()
                .name(inner.thread_group.thread_name(&inner.name, index))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    drop(workers);
                    self.abort_start();
                    return Err(DispatchError::ThreadError(format!(
                        "failed to spawn worker {} for stage {}: {}",
                        index, inner.name, e
                    )));
                }
            }
        }
        info!(
            stage = %inner.name,
            threads = inner.threads,
            queues = queue_count,
            "Stage started"
        );
        Ok(())
    }

    /// Unwind the workers that did start; the stage ends up stopped either way
    fn abort_start(&self) {
        if let Err(e) = self.destroy() {
            warn!(stage = %self.inner.name, error = %e, "Unwinding partially started stage failed");
        }
    }

    /// Close the queue, let the workers drain it and join them.
    ///
    /// A no-op on a stage that is not running. Returns the first handler
    /// failure that stopped a worker, if any.
    pub fn destroy(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.running.load(Ordering::Acquire) {
            return Ok(());
        }
        // Paused workers would never drain.
        self.unpause();
        if let Err(e) = inner.queue.close() {
            debug!(stage = %inner.name, error = %e, "Queue already closed");
        }
        let result = self.join_workers();
        if result.is_err() {
            let dropped = inner.queue.clear();
            warn!(stage = %inner.name, dropped, "Dropped events left behind by a failed worker");
        }
        inner.running.store(false, Ordering::Release);
        inner.handler.destroy();
        info!(stage = %inner.name, "Stage destroyed");
        result
    }

    /// Stop the workers after their current event and drop whatever is queued
    pub fn halt(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.running.load(Ordering::Acquire) {
            return Ok(());
        }
        inner.shutdown.store(true, Ordering::Release);
        inner.queue.seal();
        let result = self.join_workers();
        let dropped = inner.queue.clear();
        inner.running.store(false, Ordering::Release);
        inner.handler.destroy();
        info!(stage = %inner.name, dropped, "Stage halted");
        result
    }

    fn join_workers(&self) -> Result<()> {
        let handles: Vec<_> = self.inner.workers.lock().drain(..).collect();
        let mut first_error = None;
        for handle in handles {
            let outcome = match handle.join() {
                Ok(result) => result,
                Err(_) => Err(DispatchError::ThreadError(format!(
                    "worker of stage {} panicked",
                    self.inner.name
                ))),
            };
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drop queued events without stopping the stage
    pub fn clear(&self) -> usize {
        self.inner.queue.clear()
    }

    pub fn size(&self) -> usize {
        self.inner.queue.size()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.is_empty()
    }

    pub fn enable_stats(&self, enable: bool) {
        self.inner.stats.enable(enable);
    }

    pub fn is_stats_enabled(&self) -> bool {
        self.inner.stats.is_enabled()
    }

    pub fn reset_stats(&self) {
        self.inner.stats.reset();
    }

    pub fn state(&self) -> StageState {
        let inner = &self.inner;
        let stats_on = inner.stats.is_enabled();
        StageState {
            name: inner.name.clone(),
            backlog: inner.queue.size(),
            in_flight: inner.queue.in_flight(),
            threads: inner.threads,
            queues: inner.queue.queue_count(),
            running: self.is_running(),
            paused: self.is_paused(),
            queue_time_avg_us: stats_on.then(|| inner.stats.queue_time_avg_us()),
            run_time_avg_us: stats_on.then(|| inner.stats.run_time_avg_us()),
        }
    }

    /// Statistics with rates expressed per `frequency`
    pub fn stats(&self, frequency: Duration) -> StatsSnapshot {
        self.inner
            .stats
            .snapshot(&self.inner.name, self.inner.queue.depths(), frequency)
    }

    pub(crate) fn handler(&self) -> &Arc<dyn EventHandler<EC>> {
        &self.inner.handler
    }

    pub(crate) fn queue(&self) -> &StageQueue<EC> {
        &self.inner.queue
    }

    pub(crate) fn record(&self, queued: Duration, ran: Duration) {
        self.inner.stats.record(queued, ran);
    }
}

impl<EC: EventContext> Sink<EC> for Stage<EC> {
    fn add_single_threaded(&self, context: EC) -> Result<()> {
        self.inner.queue.add_single_threaded(context)
    }

    fn add_multi_threaded(&self, context: EC) -> Result<()> {
        self.inner.queue.add_multi_threaded(context)
    }

    fn add_specialized(&self, event: Box<dyn SpecializedEvent>) -> Result<()> {
        self.inner.queue.add_specialized(event)
    }

    fn size(&self) -> usize {
        self.inner.queue.size()
    }

    fn clear(&self) -> usize {
        self.inner.queue.clear()
    }
}

/// Type-erased view used by the stage registry
pub(crate) trait ManagedStage: Send + Sync {
    fn name(&self) -> &str;
    fn context_type(&self) -> &'static str;
    fn start(&self, context: &ConfigurationContext) -> Result<()>;
    fn destroy(&self) -> Result<()>;
    fn clear(&self) -> usize;
    fn unpause(&self);
    fn is_running(&self) -> bool;
    fn enable_stats(&self, enable: bool);
    fn state(&self) -> StageState;
    fn stats(&self, frequency: Duration) -> StatsSnapshot;
    fn as_any(&self) -> &dyn Any;
}

impl<EC: EventContext> ManagedStage for Stage<EC> {
    fn name(&self) -> &str {
        Stage::name(self)
    }

    fn context_type(&self) -> &'static str {
        type_name::<EC>()
    }

    fn start(&self, context: &ConfigurationContext) -> Result<()> {
        Stage::start(self, context)
    }

    fn destroy(&self) -> Result<()> {
        Stage::destroy(self)
    }

    fn clear(&self) -> usize {
        Stage::clear(self)
    }

    fn unpause(&self) {
        Stage::unpause(self)
    }

    fn is_running(&self) -> bool {
        Stage::is_running(self)
    }

    fn enable_stats(&self, enable: bool) {
        Stage::enable_stats(self, enable)
    }

    fn state(&self) -> StageState {
        Stage::state(self)
    }

    fn stats(&self, frequency: Duration) -> StatsSnapshot {
        Stage::stats(self, frequency)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// What the worker loop does after an envelope
enum Step {
    Continue,
    Exit,
}

/// One worker thread, bound to one internal queue for its whole life
struct Worker<EC: EventContext> {
    stage: String,
    index: usize,
    queue_index: usize,
    queue: Arc<StageQueue<EC>>,
    handler: Arc<dyn EventHandler<EC>>,
    stats: StageStats,
    paused: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    poll_interval: Duration,
    sleep: Option<Duration>,
    thread_group: Arc<dyn ThreadGroup>,
}

impl<EC: EventContext> Worker<EC> {
    fn run(self) -> Result<()> {
        let span = info_span!("stage", name = %self.stage, queue = self.queue_index);
        let _entered = span.enter();
        self.thread_group.on_thread_start(&self.stage, self.index);
        debug!(worker = self.index, "Worker started");

        while !self.shutdown.load(Ordering::Acquire) {
            if self.paused.load(Ordering::Acquire) {
                thread::sleep(self.poll_interval);
                continue;
            }
            match self.queue.poll(self.queue_index, self.poll_interval) {
                Some(envelope) => match self.process(envelope) {
                    Ok(Step::Continue) => {
                        if let Some(sleep) = self.sleep {
                            thread::sleep(sleep);
                        }
                    }
                    Ok(Step::Exit) => break,
                    Err(HandlerError::ShuttingDown) => {
                        info!("Handler reported shutdown in progress");
                    }
                    Err(source) => {
                        let err = DispatchError::Handler {
                            stage: self.stage.clone(),
                            source,
                        };
                        // A broken handler stops the whole stage: no new events, no other workers.
                        self.queue.seal();
                        self.shutdown.store(true, Ordering::Release);
                        self.thread_group.on_fatal(&self.stage, &err);
                        return Err(err);
                    }
                },
                None => {
                    // In-flight work may still hop onto this queue (flush barrier).
                    if self.queue.is_closed() && self.queue.in_flight() == 0 {
                        break;
                    }
                }
            }
        }
        debug!(worker = self.index, "Worker stopped");
        Ok(())
    }

    fn process(&self, envelope: Envelope<EC>) -> std::result::Result<Step, HandlerError> {
        let Envelope {
            payload,
            enqueued,
            monitor,
        } = envelope;
        match payload {
            Payload::Handled(context) => self.handle(context, enqueued, monitor),
            Payload::Flushing {
                context,
                origin,
                visits,
            } => match self
                .queue
                .advance_flush(context, origin, visits, monitor.clone())
            {
                Some(context) => self.handle(context, enqueued, monitor),
                None => Ok(Step::Continue),
            },
            Payload::Direct(event) => {
                let started = Instant::now();
                let result = guarded(|| event.execute());
                self.stats.record(started - enqueued, started.elapsed());
                self.queue.finish();
                result.map(|_| Step::Continue)
            }
            Payload::Close => {
                debug!("Close marker reached");
                // Markers left over from an earlier run are stale once the queue reopens.
                if self.queue.is_closed()
                    && self.queue.queue_is_empty(self.queue_index)
                    && self.queue.in_flight() == 0
                {
                    Ok(Step::Exit)
                } else {
                    Ok(Step::Continue)
                }
            }
        }
    }

    fn handle(
        &self,
        context: EC,
        enqueued: Instant,
        monitor: Option<PipelineMonitor>,
    ) -> std::result::Result<Step, HandlerError> {
        let limit = self.handler.batch_limit();
        if limit > 1 {
            return self.handle_batch(context, enqueued, monitor, limit);
        }

        let monitor = monitor.map(|m| m.action(&self.stage, Phase::Run, None));
        let started = Instant::now();
        let result = guarded(|| self.handler.handle_event(context));
        self.stats.record(started - enqueued, started.elapsed());
        self.queue.finish();
        if let Some(m) = monitor {
            m.action(&self.stage, Phase::End, None);
        }
        result.map(|_| Step::Continue)
    }

    /// Drain consecutive ready contexts behind `first` and hand them over in one call
    fn handle_batch(
        &self,
        first: EC,
        enqueued: Instant,
        monitor: Option<PipelineMonitor>,
        limit: usize,
    ) -> std::result::Result<Step, HandlerError> {
        let mut contexts = vec![first];
        let mut queued_at = vec![enqueued];
        let mut monitors = vec![monitor];
        let mut carried = None;
        while contexts.len() < limit {
            match self.queue.try_poll(self.queue_index) {
                Some(Envelope {
                    payload: Payload::Handled(context),
                    enqueued,
                    monitor,
                }) => {
                    contexts.push(context);
                    queued_at.push(enqueued);
                    monitors.push(monitor);
                }
                Some(other) => {
                    carried = Some(other);
                    break;
                }
                None => break,
            }
        }

        let count = contexts.len();
        let monitors: Vec<_> = monitors
            .into_iter()
            .flatten()
            .map(|m| m.action(&self.stage, Phase::Run, None))
            .collect();
        let started = Instant::now();
        let result = guarded(|| self.handler.handle_events(contexts));
        let ran = started.elapsed() / count as u32;
        for enqueued in queued_at {
            self.stats.record(started - enqueued, ran);
        }
        self.queue.finish_many(count);
        for m in monitors {
            m.action(&self.stage, Phase::End, None);
        }
        if let Err(e) = result {
            if let Some(envelope) = carried {
                // The carried envelope was already dequeued; run it so it is not lost.
                warn!("Batch failed; processing the carried envelope before stopping");
                if let Err(second) = self.process(envelope) {
                    error!(error = %second, "Carried envelope failed after batch failure");
                }
            }
            return Err(e);
        }
        match carried {
            Some(envelope) => self.process(envelope),
            None => Ok(Step::Continue),
        }
    }
}
