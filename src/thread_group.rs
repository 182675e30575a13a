use crate::error::DispatchError;
use core_affinity::CoreId;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{error, info, warn};

/// Hook for the worker threads of every stage: naming, per-thread setup
/// (affinity, priorities) and fatal handler errors.
pub trait ThreadGroup: Send + Sync + 'static {
    fn thread_name(&self, stage: &str, index: usize) -> String {
        format!("{stage} - {index}")
    }

    /// Runs on the worker thread before it polls for the first time
    fn on_thread_start(&self, _stage: &str, _index: usize) {}

    /// A handler failed and its worker stopped
    fn on_fatal(&self, stage: &str, error: &DispatchError) {
        error!(stage = %stage, %error, "Stage worker stopped on handler failure");
    }
}

/// Names threads and logs failures; no affinity
#[derive(Debug, Default)]
pub struct DefaultThreadGroup;

impl ThreadGroup for DefaultThreadGroup {}

/// Pins each new worker thread to the next core, round-robin
#[derive(Debug)]
pub struct PinnedThreadGroup {
    cores: Vec<CoreId>,
    next: AtomicUsize,
}

impl PinnedThreadGroup {
    /// Pin across every core the OS reports
    pub fn all_cores() -> Self {
        Self::with_cores(core_affinity::get_core_ids().unwrap_or_default())
    }

    pub fn with_cores(cores: Vec<CoreId>) -> Self {
        Self {
            cores,
            next: AtomicUsize::new(0),
        }
    }

    pub fn core_count(&self) -> usize {
        self.cores.len()
    }
}

impl ThreadGroup for PinnedThreadGroup {
    fn on_thread_start(&self, stage: &str, index: usize) {
        if self.cores.is_empty() {
            return;
        }
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.cores.len();
        let core = self.cores[slot];
        if core_affinity::set_for_current(core) {
            info!(stage = %stage, queue = index, core = core.id, "Pinned stage worker to core");
        } else {
            warn!(stage = %stage, queue = index, core = core.id, "Failed to pin stage worker");
        }
    }
}
