//! Named event dispatch with one-shot and non-clearable registrations.
//!
//! Every component in the engine (peer sessions, rendezvous connectors, the
//! supervisor) exposes its lifecycle through a [`Subscribable`]. Handlers are
//! invoked synchronously, in insertion order, and a panicking handler never
//! prevents its siblings from running.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Payload types dispatched through a [`Subscribable`] name themselves.
///
/// The name a value reports is the event it is delivered under, so `emit`
/// takes only the payload.
pub trait EventName {
    fn name(&self) -> &'static str;
}

struct Handler<E> {
    id: u64,
    cb: Arc<dyn Fn(&E) + Send + Sync>,
    permanent: bool,
    once: bool,
}

struct Registry<E> {
    handlers: HashMap<&'static str, Vec<Handler<E>>>,
    next_id: u64,
}

impl<E> Registry<E> {
    fn remove(&mut self, event: &str, id: u64) {
        if let Some(list) = self.handlers.get_mut(event) {
            list.retain(|h| h.id != id);
        }
    }
}

/// An idempotent unregister handle returned by `on`, `once` and `permanent`.
///
/// Calling [`Subscription::unsubscribe`] more than once is a no-op, and the
/// handle does nothing on drop; a registration outlives the handle unless it
/// is explicitly unsubscribed.
pub struct Subscription {
    cancel: Box<dyn Fn() + Send + Sync>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        (self.cancel)()
    }
}

/// A semantic event bus: event name to ordered set of callbacks.
pub struct Subscribable<E> {
    inner: Arc<Mutex<Registry<E>>>,
}

impl<E> Clone for Subscribable<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: EventName + 'static> Default for Subscribable<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: EventName + 'static> Subscribable<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                handlers: HashMap::new(),
                next_id: 0,
            })),
        }
    }

    fn register(
        &self,
        event: &'static str,
        cb: Arc<dyn Fn(&E) + Send + Sync>,
        permanent: bool,
        once: bool,
    ) -> Subscription {
        let id = {
            let mut reg = self.inner.lock();
            let id = reg.next_id;
            reg.next_id += 1;
            reg.handlers.entry(event).or_default().push(Handler {
                id,
                cb,
                permanent,
                once,
            });
            id
        };
        let weak: Weak<Mutex<Registry<E>>> = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.lock().remove(event, id);
                }
            }),
        }
    }

    /// Register `cb` for `event`. Returns an idempotent unregister handle.
    pub fn on(&self, event: &'static str, cb: impl Fn(&E) + Send + Sync + 'static) -> Subscription {
        self.register(event, Arc::new(cb), false, false)
    }

    /// Register `cb` for a single delivery; it is unregistered before it runs.
    pub fn once(
        &self,
        event: &'static str,
        cb: impl Fn(&E) + Send + Sync + 'static,
    ) -> Subscription {
        self.register(event, Arc::new(cb), false, true)
    }

    /// Register `cb` immune to [`Subscribable::remove_all_listeners`].
    pub fn permanent(
        &self,
        event: &'static str,
        cb: impl Fn(&E) + Send + Sync + 'static,
    ) -> Subscription {
        self.register(event, Arc::new(cb), true, false)
    }

    /// Deliver `value` to every handler registered under its name.
    ///
    /// Handlers run synchronously in insertion order against a snapshot of
    /// the registry, so a handler unregistering itself (or a sibling) during
    /// emission does not skip anyone. A panicking handler is logged and
    /// suppressed.
    pub fn emit(&self, value: E) {
        let snapshot: Vec<Arc<dyn Fn(&E) + Send + Sync>> = {
            let mut reg = self.inner.lock();
            let Some(list) = reg.handlers.get_mut(value.name()) else {
                return;
            };
            let cbs = list.iter().map(|h| h.cb.clone()).collect();
            list.retain(|h| !h.once);
            cbs
        };
        for cb in snapshot {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| cb(&value))) {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic".into());
                tracing::warn!(event = value.name(), "event handler panicked: {msg}");
            }
        }
    }

    /// Clear non-permanent callbacks for one event, or for all events when
    /// `event` is `None`. Permanent callbacks survive in place.
    pub fn remove_all_listeners(&self, event: Option<&str>) {
        let mut reg = self.inner.lock();
        match event {
            Some(name) => {
                if let Some(list) = reg.handlers.get_mut(name) {
                    list.retain(|h| h.permanent);
                }
            }
            None => {
                for list in reg.handlers.values_mut() {
                    list.retain(|h| h.permanent);
                }
            }
        }
    }

    /// Number of live registrations for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.inner
            .lock()
            .handlers
            .get(event)
            .map_or(0, |list| list.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    enum TestEvent {
        Ping(u32),
        Pong,
    }

    impl EventName for TestEvent {
        fn name(&self) -> &'static str {
            match self {
                TestEvent::Ping(_) => "ping",
                TestEvent::Pong => "pong",
            }
        }
    }

    #[test]
    fn subscribe_round_trip() {
        let bus = Subscribable::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let sub = bus.on("ping", move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(TestEvent::Ping(1));
        sub.unsubscribe();
        bus.emit(TestEvent::Ping(2));
        // Unsubscribing twice is a no-op.
        sub.unsubscribe();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn once_delivers_exactly_once() {
        let bus = Subscribable::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        bus.once("ping", move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(TestEvent::Ping(1));
        bus.emit(TestEvent::Ping(2));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count("ping"), 0);
    }

    #[test]
    fn emission_order_is_insertion_order() {
        let bus = Subscribable::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let order = order.clone();
            bus.on("ping", move |_| order.lock().push(tag));
        }
        bus.emit(TestEvent::Ping(0));
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn panicking_handler_does_not_starve_siblings() {
        let bus = Subscribable::new();
        let seen = Arc::new(AtomicUsize::new(0));
        bus.on("ping", |_| panic!("boom"));
        let seen2 = seen.clone();
        bus.on("ping", move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(TestEvent::Ping(0));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_unregistering_itself_does_not_skip_siblings() {
        let bus: Subscribable<TestEvent> = Subscribable::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot2 = slot.clone();
        let sub = bus.on("ping", move |_| {
            if let Some(sub) = slot2.lock().take() {
                sub.unsubscribe();
            }
        });
        *slot.lock() = Some(sub);
        let seen2 = seen.clone();
        bus.on("ping", move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(TestEvent::Ping(0));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn permanent_survives_remove_all_listeners() {
        let bus = Subscribable::new();
        let normal = Arc::new(AtomicUsize::new(0));
        let perm = Arc::new(AtomicUsize::new(0));
        let n2 = normal.clone();
        bus.on("pong", move |_| {
            n2.fetch_add(1, Ordering::SeqCst);
        });
        let p2 = perm.clone();
        bus.permanent("pong", move |_| {
            p2.fetch_add(1, Ordering::SeqCst);
        });
        bus.remove_all_listeners(None);
        bus.emit(TestEvent::Pong);
        assert_eq!(normal.load(Ordering::SeqCst), 0);
        assert_eq!(perm.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_all_listeners_scoped_to_one_event() {
        let bus = Subscribable::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        bus.on("ping", move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        bus.remove_all_listeners(Some("pong"));
        bus.emit(TestEvent::Ping(0));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
