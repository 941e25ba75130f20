use std::{
    collections::{HashMap, HashSet},
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use parking_lot::Mutex;

/// Fired once the native module has finished starting.
pub const READY: &str = "ready";

pub type Listener = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct NotifierState {
    listeners: HashMap<String, Vec<(ListenerId, Listener)>>,
    latched: HashSet<String>,
    next_id: u64,
}

impl NotifierState {
    fn snapshot(&self, event: &str) -> Vec<Listener> {
        self.listeners
            .get(event)
            .map(|listeners| listeners.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default()
    }
}

/// Named events with subscribe/unsubscribe/emit. A latched event stays
/// fired: subscribing to it afterwards invokes the listener right away.
#[derive(Default)]
pub struct Notifier {
    state: Mutex<NotifierState>,
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Notifier")
            .field("events", &state.listeners.keys().collect::<Vec<_>>())
            .field("latched", &state.latched)
            .finish()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// The listener is kept even when it fires immediately, so later
    /// `emit`s still reach it.
    pub fn on(&self, event: &str, listener: impl Fn() + Send + Sync + 'static) -> ListenerId {
        let listener: Listener = Arc::new(listener);
        let (id, latched) = {
            let mut state = self.state.lock();
            state.next_id += 1;
            let id = ListenerId(state.next_id);
            state
                .listeners
                .entry(event.to_owned())
                .or_default()
                .push((id, listener.clone()));
            (id, state.latched.contains(event))
        };
        if latched {
            invoke(event, &listener);
        }
        id
    }

    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let mut state = self.state.lock();
        let Some(listeners) = state.listeners.get_mut(event) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(other, _)| *other != id);
        before != listeners.len()
    }

    /// Invokes every current listener outside the lock; returns how many
    /// ran.
    pub fn emit(&self, event: &str) -> usize {
        let snapshot = self.state.lock().snapshot(event);
        run_all(event, &snapshot)
    }

    /// Marks `event` fired and emits it. Only the first latch emits.
    /// Listeners subscribed after the flag is set are run by `on`, not
    /// here.
    pub fn latch(&self, event: &str) -> usize {
        let snapshot = {
            let mut state = self.state.lock();
            if !state.latched.insert(event.to_owned()) {
                return 0;
            }
            state.snapshot(event)
        };
        log::debug!("event `{event}` latched");
        run_all(event, &snapshot)
    }

    pub fn has_fired(&self, event: &str) -> bool {
        self.state.lock().latched.contains(event)
    }
}

fn run_all(event: &str, listeners: &[Listener]) -> usize {
    for listener in listeners {
        invoke(event, listener);
    }
    listeners.len()
}

fn invoke(event: &str, listener: &Listener) {
    if panic::catch_unwind(AssertUnwindSafe(|| listener())).is_err() {
        log::error!("listener for `{event}` panicked");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        (count, move || {
            seen.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn late_subscription_fires_immediately() {
        let notifier = Notifier::new();
        assert_eq!(notifier.latch(READY), 0);
        assert!(notifier.has_fired(READY));

        let (count, listener) = counter();
        notifier.on(READY, listener);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // still registered after the immediate call
        assert_eq!(notifier.emit(READY), 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn latch_emits_only_once() {
        let notifier = Notifier::new();
        let (count, listener) = counter();
        notifier.on(READY, listener);
        assert_eq!(notifier.latch(READY), 1);
        assert_eq!(notifier.latch(READY), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn racing_subscribers_see_the_latch_once() {
        for _ in 0..50 {
            let notifier = Notifier::new();
            let counts: Vec<Arc<AtomicUsize>> =
                (0..64).map(|_| Arc::new(AtomicUsize::new(0))).collect();
            std::thread::scope(|scope| {
                for chunk in counts.chunks(16) {
                    let notifier = &notifier;
                    scope.spawn(move || {
                        for count in chunk {
                            let count = count.clone();
                            notifier.on(READY, move || {
                                count.fetch_add(1, Ordering::SeqCst);
                            });
                        }
                    });
                }
                scope.spawn(|| notifier.latch(READY));
            });
            assert!(counts.iter().all(|count| count.load(Ordering::SeqCst) == 1));
        }
    }

    #[test]
    fn off_removes_only_that_listener() {
        let notifier = Notifier::new();
        let (a_count, a) = counter();
        let (b_count, b) = counter();
        let a_id = notifier.on("tick", a);
        notifier.on("tick", b);

        assert!(notifier.off("tick", a_id));
        assert!(!notifier.off("tick", a_id));
        assert!(!notifier.off("other", a_id));

        assert_eq!(notifier.emit("tick"), 1);
        assert_eq!(a_count.load(Ordering::SeqCst), 0);
        assert_eq!(b_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listeners_may_subscribe_while_being_emitted() {
        let notifier = Arc::new(Notifier::new());
        let inner = notifier.clone();
        notifier.on("tick", move || {
            inner.on("tock", || {});
        });
        assert_eq!(notifier.emit("tick"), 1);
        assert_eq!(notifier.emit("tock"), 1);
    }

    #[test]
    fn a_panicking_listener_does_not_stop_the_rest() {
        let notifier = Notifier::new();
        let (count, listener) = counter();
        notifier.on("tick", || panic!("listener bug"));
        notifier.on("tick", listener);
        assert_eq!(notifier.emit("tick"), 2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
