//! Publish/subscribe emitter.
//!
//! Subscribers are either callbacks, invoked synchronously on the emitting
//! task, or unbounded channels. A subscriber may watch one execution or all
//! of them. Callbacks run outside the registry lock, so a callback may
//! subscribe or unsubscribe without deadlocking; a panicking callback is
//! caught, logged and dropped from the registry.

use crate::event::ExecutionEvent;
use pilot_core::ExecutionId;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

type Callback = Arc<dyn Fn(&ExecutionEvent) + Send + Sync>;

#[derive(Clone)]
enum Sink {
    Callback(Callback),
    Channel(mpsc::UnboundedSender<ExecutionEvent>),
}

#[derive(Clone)]
struct Subscriber {
    id: u64,
    execution: Option<ExecutionId>,
    sink: Sink,
}

impl Subscriber {
    fn wants(&self, event: &ExecutionEvent) -> bool {
        self.execution.is_none_or(|id| id == event.execution_id)
    }
}

#[derive(Default)]
struct Registry {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl Registry {
    fn insert(&self, execution: Option<ExecutionId>, sink: Sink) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber { id, execution, sink });
        id
    }

    fn remove(&self, ids: &[u64]) {
        if ids.is_empty() {
            return;
        }
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|s| !ids.contains(&s.id));
    }

    fn snapshot(&self) -> Vec<Subscriber> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Process-wide event emitter, shared as `Arc<EventEmitter>`
#[derive(Default)]
pub struct EventEmitter {
    registry: Arc<Registry>,
}

impl EventEmitter {
    /// Create an emitter with no subscribers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for one execution
    pub fn subscribe<F>(&self, execution: ExecutionId, callback: F) -> Subscription
    where
        F: Fn(&ExecutionEvent) + Send + Sync + 'static,
    {
        self.attach(Some(execution), Sink::Callback(Arc::new(callback)))
    }

    /// Register a callback for every execution
    pub fn subscribe_all<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ExecutionEvent) + Send + Sync + 'static,
    {
        self.attach(None, Sink::Callback(Arc::new(callback)))
    }

    /// Receive events over a channel; `None` watches every execution
    pub fn subscribe_channel(
        &self,
        execution: Option<ExecutionId>,
    ) -> (Subscription, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.attach(execution, Sink::Channel(tx)), rx)
    }

    fn attach(&self, execution: Option<ExecutionId>, sink: Sink) -> Subscription {
        let id = self.registry.insert(execution, sink);
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
            detached: false,
        }
    }

    /// Number of live subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.registry
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver an event to every interested subscriber
    ///
    /// Never fails: panicking callbacks and closed channels are removed.
    pub fn emit(&self, event: &ExecutionEvent) {
        let mut dead = Vec::new();
        for subscriber in self.registry.snapshot() {
            if !subscriber.wants(event) {
                continue;
            }
            match &subscriber.sink {
                Sink::Callback(callback) => {
                    if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                        warn!(
                            subscriber = subscriber.id,
                            kind = %event.kind,
                            execution = %event.execution_id,
                            "event subscriber panicked, removing it"
                        );
                        dead.push(subscriber.id);
                    }
                }
                Sink::Channel(tx) => {
                    if tx.send(event.clone()).is_err() {
                        debug!(subscriber = subscriber.id, "event channel closed");
                        dead.push(subscriber.id);
                    }
                }
            }
        }
        self.registry.remove(&dead);
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Handle to a registered subscriber
///
/// Dropping the handle unsubscribes; call [`Subscription::detach`] to keep
/// the subscriber for the emitter's lifetime.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
    detached: bool,
}

impl Subscription {
    /// Remove the subscriber now
    pub fn unsubscribe(mut self) {
        self.release();
    }

    /// Keep the subscriber registered after the handle is dropped
    pub fn detach(mut self) {
        self.detached = true;
    }

    fn release(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&[self.id]);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use pilot_core::StepId;
    use std::sync::Mutex;

    fn started(execution: ExecutionId) -> ExecutionEvent {
        ExecutionEvent::for_step(execution, EventKind::StepStarted, StepId::new("step1"))
    }

    #[test]
    fn test_callback_filtered_by_execution() {
        let emitter = EventEmitter::new();
        let mine = ExecutionId::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = emitter.subscribe(mine, move |e| sink.lock().unwrap().push(e.kind));

        emitter.emit(&started(mine));
        emitter.emit(&started(ExecutionId::new()));
        emitter.emit(&ExecutionEvent::new(mine, EventKind::ExecutionComplete));

        assert_eq!(*seen.lock().unwrap(), vec![EventKind::StepStarted, EventKind::ExecutionComplete]);
    }

    #[test]
    fn test_unsubscribe_and_drop() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicU64::new(0));

        let c = Arc::clone(&count);
        let sub = emitter.subscribe_all(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        emitter.emit(&started(ExecutionId::new()));
        sub.unsubscribe();
        emitter.emit(&started(ExecutionId::new()));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        {
            let _scoped = emitter.subscribe_all(|_| {});
            assert_eq!(emitter.subscriber_count(), 1);
        }
        assert_eq!(emitter.subscriber_count(), 0);

        emitter.subscribe_all(|_| {}).detach();
        assert_eq!(emitter.subscriber_count(), 1);
    }

    #[test]
    fn test_panicking_subscriber_isolated() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicU64::new(0));
        emitter.subscribe_all(|_| panic!("subscriber bug")).detach();
        let c = Arc::clone(&count);
        let _ok = emitter.subscribe_all(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit(&started(ExecutionId::new()));
        emitter.emit(&started(ExecutionId::new()));

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(emitter.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_channel_subscription() {
        let emitter = EventEmitter::new();
        let execution = ExecutionId::new();
        let (sub, mut rx) = emitter.subscribe_channel(Some(execution));

        emitter.emit(&started(execution));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.step_id.as_ref().map(StepId::as_str), Some("step1"));

        drop(rx);
        emitter.emit(&started(execution));
        assert_eq!(emitter.subscriber_count(), 0);
        drop(sub);
    }
}
