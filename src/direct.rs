//! Inline execution of a stage's handler on the producer thread.
//!
//! When the caller has declared the runtime single-threaded (through a
//! [`DirectActivation`]) and the target stage has nothing queued or running,
//! [`DirectSink`] runs the handler straight away instead of queueing. In every
//! other case it behaves exactly like the stage's own sink.

use crate::context::{EventContext, SpecializedEvent};
use crate::error::{DispatchError, HandlerError, Result};
use crate::handler::guarded;
use crate::monitor::Phase;
use crate::sink::Sink;
use crate::stage::Stage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, trace};

/// Caller-owned switch declaring that no other thread is producing right now
#[derive(Debug, Clone, Default)]
pub struct DirectActivation {
    active: Arc<AtomicBool>,
}

impl DirectActivation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate(&self) {
        self.active.store(true, Ordering::Release);
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

pub struct DirectSink<EC: EventContext> {
    stage: Stage<EC>,
    activation: DirectActivation,
    enabled: bool,
}

impl<EC: EventContext> DirectSink<EC> {
    pub fn new(stage: Stage<EC>, activation: DirectActivation, enabled: bool) -> Self {
        Self {
            stage,
            activation,
            enabled,
        }
    }

    pub fn stage(&self) -> &Stage<EC> {
        &self.stage
    }

    /// Run inline if possible; hands the context back when it must be queued
    fn try_direct(&self, context: EC) -> Result<Option<EC>> {
        let queue = self.stage.queue();
        if !self.enabled
            || !self.activation.is_active()
            || queue.is_closed()
            || self.stage.is_paused()
        {
            return Ok(Some(context));
        }
        if !queue.claim_idle() {
            return Ok(Some(context));
        }

        let name = self.stage.name();
        trace!(stage = %name, "Running handler inline");
        let monitor = context.monitor().map(|m| {
            m.action(name, Phase::Enqueue, None)
                .action(name, Phase::Run, None)
        });
        let started = Instant::now();
        let handler = self.stage.handler();
        let result = guarded(|| handler.handle_event(context));
        let ran = started.elapsed();

        // Our claim is the only thing that may be in flight.
        let raced = queue.in_flight() != 1 || !queue.is_empty();
        self.stage.record(Duration::ZERO, ran);
        queue.finish();
        if let Some(m) = monitor {
            m.action(name, Phase::End, None);
        }
        if raced {
            return Err(DispatchError::DirectExecutionRace(name.to_string()));
        }

        match result {
            Ok(()) => Ok(None),
            Err(HandlerError::ShuttingDown) => {
                info!(stage = %name, "Handler reported shutdown in progress");
                Ok(None)
            }
            Err(source) => Err(DispatchError::Handler {
                stage: name.to_string(),
                source,
            }),
        }
    }
}

impl<EC: EventContext> Sink<EC> for DirectSink<EC> {
    fn add_single_threaded(&self, context: EC) -> Result<()> {
        if context.scheduling().is_some() {
            return Err(DispatchError::NotSingleThreaded(self.stage.name().to_string()));
        }
        match self.try_direct(context)? {
            Some(context) => self.stage.add_single_threaded(context),
            None => Ok(()),
        }
    }

    fn add_multi_threaded(&self, context: EC) -> Result<()> {
        if context.scheduling().is_none() {
            return Err(DispatchError::NotMultiThreaded(self.stage.name().to_string()));
        }
        match self.try_direct(context)? {
            Some(context) => self.stage.add_multi_threaded(context),
            None => Ok(()),
        }
    }

    /// Specialized events always hop onto the stage's threads
    fn add_specialized(&self, event: Box<dyn SpecializedEvent>) -> Result<()> {
        self.stage.add_specialized(event)
    }

    fn size(&self) -> usize {
        self.stage.size()
    }

    fn clear(&self) -> usize {
        self.stage.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::handler::FnHandler;
    use crate::manager::StageManager;
    use parking_lot::Mutex;
    use std::thread::{self, ThreadId};

    fn recording_stage(
        manager: &StageManager,
        seen: Arc<Mutex<Vec<(u64, ThreadId)>>>,
    ) -> Stage<u64> {
        manager
            .create_stage::<u64, _>(
                "direct",
                FnHandler::new(move |value: u64| {
                    seen.lock().push((value, thread::current().id()));
                    Ok(())
                }),
                1,
                16,
            )
            .unwrap()
    }

    #[test]
    fn test_runs_inline_when_active_and_idle() {
        let manager = StageManager::new(DispatchConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        recording_stage(&manager, seen.clone());
        manager.start_all(&manager.context(), &[], &[]).unwrap();

        let activation = DirectActivation::new();
        activation.activate();
        let sink = manager.direct_sink::<u64>("direct", activation).unwrap();
        sink.add_single_threaded(7).unwrap();

        assert_eq!(*seen.lock(), vec![(7, thread::current().id())]);
        assert_eq!(sink.stage().in_flight(), 0);
        manager.stop_all().unwrap();
    }

    #[test]
    fn test_falls_back_to_queue_when_inactive() {
        let manager = StageManager::new(DispatchConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stage = recording_stage(&manager, seen.clone());
        stage.pause();
        manager.start_all(&manager.context(), &[], &[]).unwrap();

        let sink = manager
            .direct_sink::<u64>("direct", DirectActivation::new())
            .unwrap();
        sink.add_single_threaded(1).unwrap();
        assert!(seen.lock().is_empty());
        assert_eq!(sink.size(), 1);

        manager.stop_all().unwrap();
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_ne!(seen[0].1, thread::current().id());
    }

    #[test]
    fn test_disabled_by_config() {
        let manager = StageManager::new(DispatchConfig::default().with_direct_sinks(false));
        let seen = Arc::new(Mutex::new(Vec::new()));
        recording_stage(&manager, seen.clone());
        manager.start_all(&manager.context(), &[], &[]).unwrap();

        let activation = DirectActivation::new();
        activation.activate();
        let sink = manager.direct_sink::<u64>("direct", activation).unwrap();
        sink.add_single_threaded(3).unwrap();
        manager.stop_all().unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_ne!(seen[0].1, thread::current().id());
    }

    #[test]
    fn test_busy_stage_keeps_queue_order() {
        let manager = StageManager::new(DispatchConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stage = recording_stage(&manager, seen.clone());
        manager.start_all(&manager.context(), &[], &[]).unwrap();

        // Work already queued means the stage is not idle.
        stage.pause();
        stage.add_single_threaded(1).unwrap();
        let activation = DirectActivation::new();
        activation.activate();
        let sink = manager.direct_sink::<u64>("direct", activation).unwrap();
        stage.unpause();
        sink.add_single_threaded(2).unwrap();

        manager.stop_all().unwrap();
        let order: Vec<u64> = seen.lock().iter().map(|(v, _)| *v).collect();
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn test_enqueue_during_inline_run_is_reported() {
        let manager = StageManager::new(DispatchConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let own: Arc<Mutex<Option<Stage<u64>>>> = Arc::new(Mutex::new(None));
        let (release, gate) = crossbeam::channel::bounded::<()>(1);
        let (record, target) = (seen.clone(), own.clone());
        let stage = manager
            .create_stage::<u64, _>(
                "reentrant",
                FnHandler::new(move |value: u64| {
                    record.lock().push(value);
                    match value {
                        1 => {
                            let stage = target.lock().clone();
                            if let Some(stage) = stage {
                                stage
                                    .add_single_threaded(2)
                                    .map_err(|e| HandlerError::failed(e.to_string()))?;
                            }
                        }
                        // Keeps the stage busy until the test has looked.
                        _ => {
                            let _ = gate.recv_timeout(Duration::from_secs(5));
                        }
                    }
                    Ok(())
                }),
                1,
                16,
            )
            .unwrap();
        *own.lock() = Some(stage.clone());
        manager.start_all(&manager.context(), &[], &[]).unwrap();

        let activation = DirectActivation::new();
        activation.activate();
        let sink = manager.direct_sink::<u64>("reentrant", activation).unwrap();
        assert!(matches!(
            sink.add_single_threaded(1),
            Err(DispatchError::DirectExecutionRace(ref name)) if name == "reentrant"
        ));
        assert_eq!(stage.in_flight(), 1);

        release.send(()).unwrap();
        manager.stop_all().unwrap();
        assert_eq!(*seen.lock(), vec![1, 2]);
        // Break the handler -> stage cycle.
        own.lock().take();
    }

    #[test]
    fn test_panicking_handler_releases_idle_claim() {
        let manager = StageManager::new(DispatchConfig::default());
        let stage = manager
            .create_stage::<u64, _>(
                "explosive",
                FnHandler::new(|value: u64| {
                    if value == 0 {
                        panic!("zero");
                    }
                    Ok(())
                }),
                1,
                4,
            )
            .unwrap();
        manager.start_all(&manager.context(), &[], &[]).unwrap();

        let activation = DirectActivation::new();
        activation.activate();
        let sink = manager.direct_sink::<u64>("explosive", activation).unwrap();
        assert!(matches!(
            sink.add_single_threaded(0),
            Err(DispatchError::Handler {
                source: HandlerError::Panicked(_),
                ..
            })
        ));
        assert_eq!(stage.in_flight(), 0);
        sink.add_single_threaded(5).unwrap();
        manager.stop_all().unwrap();
    }

    #[test]
    fn test_rejects_scheduled_context_on_single_path() {
        use crate::context::Scheduling;

        struct Keyed;
        impl EventContext for Keyed {
            fn scheduling(&self) -> Option<Scheduling> {
                Some(Scheduling::keyed(1u64))
            }
        }

        let manager = StageManager::new(DispatchConfig::default());
        manager
            .create_stage::<Keyed, _>("keyed", FnHandler::new(|_: Keyed| Ok(())), 1, 4)
            .unwrap();
        let sink = manager
            .direct_sink::<Keyed>("keyed", DirectActivation::new())
            .unwrap();
        assert!(matches!(
            sink.add_single_threaded(Keyed),
            Err(DispatchError::NotSingleThreaded(_))
        ));
    }
}
