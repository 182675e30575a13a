use crate::context::{EventContext, SpecializedEvent};
use crate::error::Result;
use std::sync::Arc;

/// Producer-facing entry point of a stage.
///
/// `put` semantics: every `add_*` blocks while the destination queue is full.
pub trait Sink<EC: EventContext>: Send + Sync {
    /// Plain context onto the stage's first queue. Rejects contexts with a
    /// scheduling capability.
    fn add_single_threaded(&self, context: EC) -> Result<()>;

    /// Context with a scheduling capability, routed by key or to the shortest queue
    fn add_multi_threaded(&self, context: EC) -> Result<()>;

    /// Self-executing event that bypasses the handler
    fn add_specialized(&self, event: Box<dyn SpecializedEvent>) -> Result<()>;

    /// Pick the path from the context's own capability
    fn add_to_sink(&self, context: EC) -> Result<()> {
        if context.scheduling().is_some() {
            self.add_multi_threaded(context)
        } else {
            self.add_single_threaded(context)
        }
    }

    /// Events waiting in the sink's queues
    fn size(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Drop everything queued; returns how many events were dropped
    fn clear(&self) -> usize;
}

impl<EC, S> Sink<EC> for Arc<S>
where
    EC: EventContext,
    S: Sink<EC> + ?Sized,
{
    fn add_single_threaded(&self, context: EC) -> Result<()> {
        (**self).add_single_threaded(context)
    }

    fn add_multi_threaded(&self, context: EC) -> Result<()> {
        (**self).add_multi_threaded(context)
    }

    fn add_specialized(&self, event: Box<dyn SpecializedEvent>) -> Result<()> {
        (**self).add_specialized(event)
    }

    fn add_to_sink(&self, context: EC) -> Result<()> {
        (**self).add_to_sink(context)
    }

    fn size(&self) -> usize {
        (**self).size()
    }

    fn clear(&self) -> usize {
        (**self).clear()
    }
}
