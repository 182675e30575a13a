use crate::context::EventContext;
use crate::error::{HandlerError, Result};
use crate::manager::StageManager;
use crate::stage::Stage;
use std::panic::{self, AssertUnwindSafe};

/// Consumes the contexts of one stage.
///
/// A single handler instance is shared by every worker of the stage, so
/// handlers take `&self` and must be `Sync`.
pub trait EventHandler<EC>: Send + Sync + 'static {
    fn handle_event(&self, context: EC) -> std::result::Result<(), HandlerError>;

    /// Handle several ready contexts at once, in queue order.
    ///
    /// Only called when [`batch_limit`](Self::batch_limit) is greater than one.
    fn handle_events(&self, contexts: Vec<EC>) -> std::result::Result<(), HandlerError> {
        for context in contexts {
            self.handle_event(context)?;
        }
        Ok(())
    }

    /// Most contexts a worker hands to `handle_events` in one call
    fn batch_limit(&self) -> usize {
        1
    }

    /// Called once each time the stage starts, before any worker runs
    fn initialize_context(
        &self,
        _context: &ConfigurationContext,
    ) -> std::result::Result<(), HandlerError> {
        Ok(())
    }

    /// Called after the stage's workers have stopped
    fn destroy(&self) {}
}

/// Closure-backed handler
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<EC, F> EventHandler<EC> for FnHandler<F>
where
    F: Fn(EC) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle_event(&self, context: EC) -> std::result::Result<(), HandlerError> {
        (self.f)(context)
    }
}

/// Run handler code so that a panic comes back as [`HandlerError::Panicked`].
///
/// Workers and the inline path must always reach their bookkeeping after a
/// handler call, whatever the handler does.
pub(crate) fn guarded<T>(
    f: impl FnOnce() -> std::result::Result<T, HandlerError>,
) -> std::result::Result<T, HandlerError> {
    panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(HandlerError::from_panic(payload)))
}

/// Collaborator initialized by `StageManager::start_all` before any stage starts
pub trait PostInit: Send + Sync {
    fn initialize_context(&self, context: &ConfigurationContext)
        -> std::result::Result<(), HandlerError>;
}

/// Handed to handlers and post-init collaborators at start-up so they can
/// look up the stages they produce into.
#[derive(Clone)]
pub struct ConfigurationContext {
    manager: StageManager,
}

impl ConfigurationContext {
    pub fn new(manager: StageManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &StageManager {
        &self.manager
    }

    /// Typed lookup of a registered stage
    pub fn stage<EC: EventContext>(&self, name: &str) -> Result<Stage<EC>> {
        self.manager.get_stage::<EC>(name)
    }
}
