use crate::context::{EventContext, SpecializedEvent};
use crate::error::{DispatchError, Result};
use crate::sink::Sink;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use tracing::{debug, warn};

/// Context stamped with a gap-free sequence number starting at 1
pub trait Sequenced {
    fn sequence(&self) -> u64;
}

struct OrderState<EC> {
    /// Highest sequence forwarded so far
    current: u64,
    pending: BTreeMap<u64, EC>,
}

/// Sink decorator that forwards contexts to `delegate` in strict sequence order.
///
/// Early arrivals are held back until every lower sequence has been
/// forwarded. All producers serialize on one lock, so delivery order is total
/// even with many concurrent callers.
pub struct OrderedSink<EC, S> {
    delegate: S,
    state: Mutex<OrderState<EC>>,
    _context: PhantomData<fn(EC)>,
}

impl<EC, S> OrderedSink<EC, S>
where
    EC: EventContext + Sequenced,
    S: Sink<EC>,
{
    const WARN_EVERY: usize = 10;

    pub fn new(delegate: S) -> Self {
        Self {
            delegate,
            state: Mutex::new(OrderState {
                current: 0,
                pending: BTreeMap::new(),
            }),
            _context: PhantomData,
        }
    }

    pub fn delegate(&self) -> &S {
        &self.delegate
    }

    /// Last sequence handed to the delegate
    pub fn current(&self) -> u64 {
        self.state.lock().current
    }

    /// Contexts held back waiting for a gap to fill
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn add(&self, context: EC) -> Result<()> {
        let seq = context.sequence();
        let mut state = self.state.lock();
        if seq <= state.current {
            return Err(DispatchError::SequenceRegression {
                seq,
                current: state.current,
            });
        }

        if seq != state.current + 1 {
            if state.pending.contains_key(&seq) {
                return Err(DispatchError::DuplicateSequence(seq));
            }
            state.pending.insert(seq, context);
            let buffered = state.pending.len();
            if buffered % Self::WARN_EVERY == 0 {
                warn!(
                    missing = state.current + 1,
                    buffered, "Ordered sink is waiting on a missing sequence"
                );
            }
            return Ok(());
        }

        state.current = seq;
        self.delegate.add_to_sink(context)?;
        loop {
            let next = state.current + 1;
            let Some(ready) = state.pending.remove(&next) else {
                break;
            };
            state.current = next;
            self.delegate.add_to_sink(ready)?;
        }
        debug!(current = state.current, pending = state.pending.len(), "Ordered sink advanced");
        Ok(())
    }
}

impl<EC, S> Sink<EC> for OrderedSink<EC, S>
where
    EC: EventContext + Sequenced,
    S: Sink<EC>,
{
    fn add_single_threaded(&self, context: EC) -> Result<()> {
        self.add(context)
    }

    fn add_multi_threaded(&self, context: EC) -> Result<()> {
        self.add(context)
    }

    fn add_specialized(&self, event: Box<dyn SpecializedEvent>) -> Result<()> {
        self.delegate.add_specialized(event)
    }

    fn add_to_sink(&self, context: EC) -> Result<()> {
        self.add(context)
    }

    fn size(&self) -> usize {
        self.pending() + self.delegate.size()
    }

    /// Drop held-back contexts, rewind to sequence 0 and clear the delegate
    fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.pending.len();
        state.pending.clear();
        state.current = 0;
        dropped + self.delegate.clear()
    }
}
