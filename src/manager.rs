use crate::config::DispatchConfig;
use crate::context::EventContext;
use crate::direct::{DirectActivation, DirectSink};
use crate::error::{DispatchError, Result};
use crate::handler::{ConfigurationContext, EventHandler, PostInit};
use crate::queue::{QueueFactory, QueueFlavor};
use crate::stage::{ManagedStage, Stage, StageOptions, StageSettings};
use crate::stage_queue::StageQueue;
use crate::stats::{StageState, StatsSnapshot};
use crate::thread_group::{DefaultThreadGroup, ThreadGroup};
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::any::type_name;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Periodic backlog logger, stopped by dropping its sender
struct StatsLogger {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl StatsLogger {
    fn shutdown(self) {
        drop(self.stop);
        if self.handle.join().is_err() {
            warn!("Stats logger thread panicked");
        }
    }
}

struct ManagerInner {
    config: DispatchConfig,
    flavor: QueueFlavor,
    thread_group: Arc<dyn ThreadGroup>,
    /// Creation order is kept so start and stop walk stages predictably
    stages: Mutex<Vec<Arc<dyn ManagedStage>>>,
    started: AtomicBool,
    protected: Mutex<HashSet<String>>,
    logger: Mutex<Option<StatsLogger>>,
}

/// Registry of every stage and the lifecycle gate around them.
///
/// Stages are created before [`start_all`](Self::start_all); after that the
/// registry is frozen until [`stop_all`](Self::stop_all). Clones share the
/// same registry.
#[derive(Clone)]
pub struct StageManager {
    inner: Arc<ManagerInner>,
}

impl StageManager {
    pub fn new(config: DispatchConfig) -> Self {
        Self::with_options(config, QueueFlavor::default(), Arc::new(DefaultThreadGroup))
    }

    pub fn with_options(
        config: DispatchConfig,
        flavor: QueueFlavor,
        thread_group: Arc<dyn ThreadGroup>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                flavor,
                thread_group,
                stages: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                protected: Mutex::new(HashSet::new()),
                logger: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.inner.config
    }

    /// Context handed to handlers when their stage starts
    pub fn context(&self) -> ConfigurationContext {
        ConfigurationContext::new(self.clone())
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Create a stage with one queue per thread
    pub fn create_stage<EC, H>(
        &self,
        name: impl Into<String>,
        handler: H,
        threads: usize,
        capacity: usize,
    ) -> Result<Stage<EC>>
    where
        EC: EventContext,
        H: EventHandler<EC>,
    {
        self.create_stage_with(name, handler, StageOptions::new(threads, capacity))
    }

    pub fn create_stage_with<EC, H>(
        &self,
        name: impl Into<String>,
        handler: H,
        options: StageOptions,
    ) -> Result<Stage<EC>>
    where
        EC: EventContext,
        H: EventHandler<EC>,
    {
        let flavor = self.inner.flavor;
        self.create_stage_with_factory(name, handler, options, &flavor)
    }

    /// Create a stage whose internal queues come from `factory`
    pub fn create_stage_with_factory<EC, H, F>(
        &self,
        name: impl Into<String>,
        handler: H,
        options: StageOptions,
        factory: &F,
    ) -> Result<Stage<EC>>
    where
        EC: EventContext,
        H: EventHandler<EC>,
        F: QueueFactory,
    {
        let name = name.into();
        let config = &self.inner.config;
        let mut stages = self.inner.stages.lock();
        if self.is_started() {
            return Err(DispatchError::AlreadyStarted);
        }
        if stages.iter().any(|s| s.name() == name) {
            return Err(DispatchError::DuplicateStage(name));
        }

        let overrides = config.stage(&name);
        let queue = StageQueue::new(
            name.clone(),
            options.queue_count(),
            options.capacity,
            config.find_strategy,
            factory,
        );
        let stage = Stage::new(
            name.clone(),
            Arc::new(handler),
            queue,
            StageSettings {
                threads: options.threads,
                poll_interval: config.poll_interval(),
                sleep: overrides.sleep(),
                paused: overrides.paused,
                stats_enabled: config.monitor_enabled,
                thread_group: Arc::clone(&self.inner.thread_group),
            },
        );
        stages.push(Arc::new(stage.clone()));
        info!(
            stage = %name,
            threads = options.threads,
            queues = options.queue_count(),
            capacity = options.capacity,
            "Created stage"
        );
        Ok(stage)
    }

    /// Typed lookup; fails if the stage was created for another context type
    pub fn get_stage<EC: EventContext>(&self, name: &str) -> Result<Stage<EC>> {
        let managed = self.managed(name)?;
        managed
            .as_any()
            .downcast_ref::<Stage<EC>>()
            .cloned()
            .ok_or_else(|| DispatchError::TypeMismatch {
                name: name.to_string(),
                expected: type_name::<EC>(),
                actual: managed.context_type(),
            })
    }

    /// Wrap a stage in a sink that may run the handler on the caller's thread
    pub fn direct_sink<EC: EventContext>(
        &self,
        name: &str,
        activation: DirectActivation,
    ) -> Result<DirectSink<EC>> {
        let stage = self.get_stage::<EC>(name)?;
        Ok(DirectSink::new(
            stage,
            activation,
            self.inner.config.direct_sinks,
        ))
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.inner
            .stages
            .lock()
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    /// Initialize the post-init collaborators, then start every stage not
    /// named in `exclude`. One-shot until `stop_all`.
    pub fn start_all(
        &self,
        context: &ConfigurationContext,
        post_init: &[Arc<dyn PostInit>],
        exclude: &[&str],
    ) -> Result<()> {
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DispatchError::AlreadyStarted);
        }

        for collaborator in post_init {
            collaborator
                .initialize_context(context)
                .map_err(|source| DispatchError::Handler {
                    stage: "post-init".to_string(),
                    source,
                })?;
        }

        for stage in self.snapshot() {
            if exclude.iter().any(|name| *name == stage.name()) {
                debug!(stage = %stage.name(), "Leaving excluded stage stopped");
                continue;
            }
            stage.start(context)?;
        }

        if self.inner.config.monitor_enabled {
            self.start_stats_logger(self.inner.config.monitor_delay());
        }
        info!(stages = self.inner.stages.lock().len(), "All stages started");
        Ok(())
    }

    /// Destroy every stage and empty the registry.
    ///
    /// Stages that were never started or already stopped are skipped. Every
    /// stage is destroyed even if one fails; the first failure is returned.
    pub fn stop_all(&self) -> Result<()> {
        if let Some(logger) = self.inner.logger.lock().take() {
            logger.shutdown();
        }
        let stages: Vec<_> = self.inner.stages.lock().drain(..).collect();
        let mut first_error = None;
        for stage in &stages {
            if let Err(e) = stage.destroy() {
                warn!(stage = %stage.name(), error = %e, "Stage stopped with an error");
                first_error.get_or_insert(e);
            }
        }
        self.inner.protected.lock().clear();
        self.inner.started.store(false, Ordering::Release);
        info!(stages = stages.len(), "All stages stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Exempt a stage from `cleanup`
    pub fn protect_from_cleanup(&self, name: impl Into<String>) {
        self.inner.protected.lock().insert(name.into());
    }

    /// Drop queued events from every unprotected stage; returns how many were dropped
    pub fn cleanup(&self) -> usize {
        let protected = self.inner.protected.lock().clone();
        let dropped = self
            .snapshot()
            .iter()
            .filter(|s| !protected.contains(s.name()))
            .map(|s| s.clear())
            .sum();
        info!(dropped, protected = protected.len(), "Cleaned up stages");
        dropped
    }

    pub fn enable_stats(&self, enable: bool) {
        for stage in self.snapshot() {
            stage.enable_stats(enable);
        }
    }

    pub fn states(&self) -> Vec<StageState> {
        self.snapshot().iter().map(|s| s.state()).collect()
    }

    pub fn stats(&self, frequency: Duration) -> Vec<StatsSnapshot> {
        self.snapshot().iter().map(|s| s.stats(frequency)).collect()
    }

    /// Log every stage's backlog each `delay` until `stop_all`.
    ///
    /// Replaces a logger that is already running.
    pub fn start_stats_logger(&self, delay: Duration) {
        let (stop, ticks) = channel::bounded::<()>(0);
        let registry = Arc::downgrade(&self.inner);
        let spawned = thread::Builder::new()
            .name("stage-stats".to_string())
            .spawn(move || loop {
                match ticks.recv_timeout(delay) {
                    Err(RecvTimeoutError::Timeout) => {
                        if !log_backlogs(&registry) {
                            break;
                        }
                    }
                    _ => break,
                }
            });
        match spawned {
            Ok(handle) => {
                let previous = self.inner.logger.lock().replace(StatsLogger { stop, handle });
                if let Some(previous) = previous {
                    previous.shutdown();
                }
                info!(delay_ms = delay.as_millis() as u64, "Stats logger started");
            }
            Err(e) => warn!(error = %e, "Could not start stats logger"),
        }
    }

    pub(crate) fn managed(&self, name: &str) -> Result<Arc<dyn ManagedStage>> {
        self.inner
            .stages
            .lock()
            .iter()
            .find(|s| s.name() == name)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownStage(name.to_string()))
    }

    fn snapshot(&self) -> Vec<Arc<dyn ManagedStage>> {
        self.inner.stages.lock().clone()
    }
}

/// One logging pass; false once the manager is gone
fn log_backlogs(registry: &Weak<ManagerInner>) -> bool {
    let Some(inner) = registry.upgrade() else {
        return false;
    };
    let stages = inner.stages.lock().clone();
    for stage in stages {
        let state = stage.state();
        info!(
            stage = %state.name,
            backlog = state.backlog,
            in_flight = state.in_flight,
            paused = state.paused,
            "Stage backlog"
        );
        let snapshot = stage.stats(inner.config.monitor_delay());
        if snapshot.enabled {
            debug!("\n{}", snapshot.details());
        }
    }
    true
}
