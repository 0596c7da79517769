//! Reentrant FIFO publish/subscribe queue
//!
//! Events are dispatched by their concrete type. Until
//! [`EventQueue::start_publishing`] is called, enqueued events are held back;
//! afterwards every `enqueue` drains the queue before returning. A listener
//! may enqueue further events while it runs: the outer drain loop picks them
//! up in order instead of recursing.

use std::any::{Any, TypeId};
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Listener = Arc<dyn Fn(&dyn Any) + Send + Sync>;

struct Pending {
    type_id: TypeId,
    type_name: &'static str,
    event: Box<dyn Any + Send>,
}

#[derive(Default)]
struct QueueState {
    listeners: HashMap<TypeId, Vec<Listener>>,
    pending: VecDeque<Pending>,
    publishing: bool,
    draining: bool,
}

impl QueueState {
    /// Become the single drainer if publishing and nobody else is draining.
    fn claim_drain(&mut self) -> bool {
        if self.publishing && !self.draining {
            self.draining = true;
            true
        } else {
            false
        }
    }
}

/// Shared event bus handle.
///
/// Construct one per application session and pass clones to every
/// component that publishes or subscribes.
#[derive(Clone, Default)]
pub struct EventQueue {
    state: Arc<Mutex<QueueState>>,
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("EventQueue")
            .field("listener_types", &state.listeners.len())
            .field("pending", &state.pending.len())
            .field("publishing", &state.publishing)
            .finish()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `listener` for every future event of type `E`.
    ///
    /// Listeners of one type run in registration order.
    pub fn subscribe<E, F>(&self, listener: F)
    where
        E: Any + Send,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let erased: Listener = Arc::new(move |event: &dyn Any| {
            if let Some(event) = event.downcast_ref::<E>() {
                listener(event);
            }
        });
        self.lock()
            .listeners
            .entry(TypeId::of::<E>())
            .or_default()
            .push(erased);
    }

    /// Append an event; dispatch it (and anything queued before it) if
    /// publishing has started.
    pub fn enqueue<E>(&self, event: E)
    where
        E: Any + Send,
    {
        let should_drain = {
            let mut state = self.lock();
            state.pending.push_back(Pending {
                type_id: TypeId::of::<E>(),
                type_name: std::any::type_name::<E>(),
                event: Box::new(event),
            });
            state.claim_drain()
        };

        if should_drain {
            self.drain();
        }
    }

    /// Start dispatching. Everything queued so far is delivered, in enqueue
    /// order, before this returns.
    pub fn start_publishing(&self) {
        let should_drain = {
            let mut state = self.lock();
            state.publishing = true;
            state.claim_drain()
        };

        if should_drain {
            self.drain();
        }
    }

    pub fn is_publishing(&self) -> bool {
        self.lock().publishing
    }

    /// Number of events waiting for dispatch
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Dispatch until the queue is empty. The caller must have claimed the
    /// drain.
    fn drain(&self) {
        loop {
            let (pending, listeners) = {
                let mut state = self.lock();
                let Some(pending) = state.pending.pop_front() else {
                    state.draining = false;
                    return;
                };
                let listeners = state
                    .listeners
                    .get(&pending.type_id)
                    .cloned()
                    .unwrap_or_default();
                (pending, listeners)
            };

            if listeners.is_empty() {
                log::trace!("Dropping {} with no subscribers", pending.type_name);
                continue;
            }

            for listener in listeners {
                let event: &dyn Any = pending.event.as_ref();
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener(event)));
                if outcome.is_err() {
                    log::error!("Listener for {} panicked; continuing", pending.type_name);
                }
            }
        }
    }
}
