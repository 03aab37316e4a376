//! Event emitter with explicit, ordered listener registration.
//!
//! Emission iterates over a snapshot of the listener list, so listeners added
//! during an emit are not called for that emit. A listener removed during an
//! emit is skipped if it has not run yet.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Handle returned by [`EventEmitter::on`] and [`EventEmitter::once`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Which event names a listener receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    Any,
    Events(Vec<String>),
}

impl EventFilter {
    fn matches(&self, event: &str) -> bool {
        match self {
            EventFilter::Any => true,
            EventFilter::Events(names) => names.iter().any(|n| n == event),
        }
    }

    fn names(&self, event: &str) -> bool {
        matches!(self, EventFilter::Events(names) if names.iter().any(|n| n == event))
    }
}

impl From<&str> for EventFilter {
    fn from(event: &str) -> Self {
        EventFilter::Events(vec![event.to_string()])
    }
}

impl From<String> for EventFilter {
    fn from(event: String) -> Self {
        EventFilter::Events(vec![event])
    }
}

impl From<&[&str]> for EventFilter {
    fn from(events: &[&str]) -> Self {
        EventFilter::Events(events.iter().map(|e| (*e).to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for EventFilter {
    fn from(events: [&str; N]) -> Self {
        EventFilter::Events(events.iter().map(|e| (*e).to_string()).collect())
    }
}

impl From<Vec<String>> for EventFilter {
    fn from(events: Vec<String>) -> Self {
        EventFilter::Events(events)
    }
}

impl From<Option<&str>> for EventFilter {
    fn from(event: Option<&str>) -> Self {
        event.map_or(EventFilter::Any, EventFilter::from)
    }
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Listener<T> {
    id: ListenerId,
    filter: EventFilter,
    once: bool,
    registered: AtomicBool,
    callback: Callback<T>,
}

pub struct EventEmitter<T> {
    listeners: Mutex<Vec<Arc<Listener<T>>>>,
    next_id: AtomicU64,
}

impl<T> Default for EventEmitter<T> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T: 'static> std::fmt::Debug for EventEmitter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl<T: 'static> EventEmitter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, filter: impl Into<EventFilter>, listener: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.register(filter.into(), false, Arc::new(listener))
    }

    /// Like [`on`](Self::on), but the listener is removed before its first call.
    pub fn once<F>(&self, filter: impl Into<EventFilter>, listener: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.register(filter.into(), true, Arc::new(listener))
    }

    /// Calls `listener` now if `current == target`, otherwise once `target` is emitted.
    pub fn when_state<F>(&self, target: &str, current: &str, listener: F) -> Option<ListenerId>
    where
        F: FnOnce(Option<&T>) + Send + 'static,
    {
        if target == current {
            listener(None);
            return None;
        }
        let slot = Mutex::new(Some(listener));
        Some(self.once(target, move |payload: &T| {
            let taken = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(f) = taken {
                f(Some(payload));
            }
        }))
    }

    fn register(&self, filter: EventFilter, once: bool, callback: Callback<T>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let listener = Arc::new(Listener {
            id,
            filter,
            once,
            registered: AtomicBool::new(true),
            callback,
        });
        self.lock().push(listener);
        id
    }

    /// Returns whether a listener was removed.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|l| {
            if l.id == id {
                l.registered.store(false, Ordering::SeqCst);
                false
            } else {
                true
            }
        });
        listeners.len() != before
    }

    /// Removes every listener whose filter names `event`.
    pub fn off_event(&self, event: &str) {
        self.lock().retain(|l| {
            let remove = l.filter.names(event);
            if remove {
                l.registered.store(false, Ordering::SeqCst);
            }
            !remove
        });
    }

    pub fn off_all(&self) {
        for l in self.lock().drain(..) {
            l.registered.store(false, Ordering::SeqCst);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock().len()
    }

    pub fn emit(&self, event: &str, payload: &T) {
        let snapshot: Vec<Arc<Listener<T>>> = self
            .lock()
            .iter()
            .filter(|l| l.filter.matches(event))
            .cloned()
            .collect();

        for listener in snapshot {
            if listener.once {
                if listener
                    .registered
                    .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    continue;
                }
                let id = listener.id;
                self.lock().retain(|l| l.id != id);
            } else if !listener.registered.load(Ordering::SeqCst) {
                continue;
            }

            let callback = Arc::clone(&listener.callback);
            if catch_unwind(AssertUnwindSafe(|| callback(payload))).is_err() {
                tracing::error!(event, "event listener panicked");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Listener<T>>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn debug_reports_listener_count() {
        let emitter: EventEmitter<String> = EventEmitter::new();
        emitter.on(EventFilter::Any, |_: &String| {});
        emitter.on("a", |_: &String| {});
        assert_eq!(format!("{emitter:?}"), "EventEmitter { listeners: 2 }");
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&u32) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move |_: &u32| {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn filters_by_event_name() {
        let emitter = EventEmitter::<u32>::new();
        let (any, f_any) = counter();
        let (named, f_named) = counter();
        let (multi, f_multi) = counter();
        emitter.on(EventFilter::Any, f_any);
        emitter.on("attached", f_named);
        emitter.on(["attached", "detached"], f_multi);

        emitter.emit("attached", &1);
        emitter.emit("detached", &2);
        emitter.emit("failed", &3);

        assert_eq!(any.load(Ordering::SeqCst), 3);
        assert_eq!(named.load(Ordering::SeqCst), 1);
        assert_eq!(multi.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn once_fires_a_single_time() {
        let emitter = EventEmitter::<u32>::new();
        let (count, f) = counter();
        emitter.once("x", f);
        emitter.emit("x", &1);
        emitter.emit("x", &1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn off_removes_listener() {
        let emitter = EventEmitter::<u32>::new();
        let (count, f) = counter();
        let id = emitter.on(EventFilter::Any, f);
        assert!(emitter.off(id));
        assert!(!emitter.off(id));
        emitter.emit("x", &1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn off_event_and_off_all() {
        let emitter = EventEmitter::<u32>::new();
        let (count, f) = counter();
        emitter.on("a", f);
        let (other, g) = counter();
        emitter.on(EventFilter::Any, g);
        emitter.off_event("a");
        emitter.emit("a", &1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(other.load(Ordering::SeqCst), 1);
        emitter.off_all();
        emitter.emit("a", &1);
        assert_eq!(other.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_added_during_emit_is_not_called() {
        let emitter = Arc::new(EventEmitter::<u32>::new());
        let (count, f) = counter();
        let f = Arc::new(f);
        let inner = Arc::clone(&emitter);
        emitter.on(EventFilter::Any, move |_| {
            let f = Arc::clone(&f);
            inner.on(EventFilter::Any, move |p| f(p));
        });
        emitter.emit("x", &1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        emitter.emit("x", &1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_removed_during_emit_is_skipped() {
        let emitter = Arc::new(EventEmitter::<u32>::new());
        let (count, f) = counter();
        let victim = Arc::new(Mutex::new(None::<ListenerId>));
        let inner = Arc::clone(&emitter);
        let v = Arc::clone(&victim);
        emitter.on(EventFilter::Any, move |_| {
            if let Some(id) = *v.lock().unwrap() {
                inner.off(id);
            }
        });
        let id = emitter.on(EventFilter::Any, f);
        *victim.lock().unwrap() = Some(id);
        emitter.emit("x", &1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_listener_does_not_stop_dispatch() {
        let emitter = EventEmitter::<u32>::new();
        emitter.on(EventFilter::Any, |_| panic!("listener failure"));
        let (count, f) = counter();
        emitter.on(EventFilter::Any, f);
        emitter.emit("x", &1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn when_state_immediate_and_deferred() {
        let emitter = EventEmitter::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        assert!(
            emitter
                .when_state("attached", "attached", move |p| s.lock().unwrap().push(p.copied()))
                .is_none()
        );
        let s = Arc::clone(&seen);
        emitter.when_state("attached", "attaching", move |p| s.lock().unwrap().push(p.copied()));
        emitter.emit("attached", &7);
        emitter.emit("attached", &8);
        assert_eq!(*seen.lock().unwrap(), vec![None, Some(7)]);
    }
}
