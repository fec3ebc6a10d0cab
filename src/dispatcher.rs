//! Typed publish/subscribe registry between the hub and its consumers.
//!
//! Consumers register a handler per [`EventKind`] with
//! [`EventDispatcher::on`] and get back a [`Subscription`] guard. Dropping the
//! guard unsubscribes, so a torn-down view can never be called back.
//!
//! ```
//! use signal_hub_client::dispatcher::EventDispatcher;
//! use signal_hub_client::event::EventKind;
//!
//! let dispatcher = EventDispatcher::new();
//! let subscription = dispatcher.on(EventKind::PresenceChanged, |event| {
//!     println!("presence: {event:?}");
//! });
//! assert_eq!(dispatcher.subscriber_count(EventKind::PresenceChanged), 1);
//! drop(subscription);
//! assert_eq!(dispatcher.subscriber_count(EventKind::PresenceChanged), 0);
//! ```

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error};

use crate::event::{EventKind, HubEvent};
use crate::lock::lock;

/// Callback invoked for each matching event.
pub type Handler = Arc<dyn Fn(&HubEvent) + Send + Sync>;

/// Opaque identifier of one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Entry {
    id: SubscriptionId,
    /// `None` subscribes to every kind.
    kind: Option<EventKind>,
    handler: Handler,
    /// Cleared by `off` so a dispatch already in flight skips the handler.
    active: Arc<AtomicBool>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: Vec<Entry>,
}

/// Fan-out of [`HubEvent`]s to registered handlers.
///
/// Cloning is cheap and every clone shares the same registry.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    registry: Arc<Mutex<Registry>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind`.
    ///
    /// Handlers for the same kind run in registration order.
    #[must_use = "dropping the subscription immediately unsubscribes the handler"]
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&HubEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(handler))
    }

    /// Register `handler` for every event.
    #[must_use = "dropping the subscription immediately unsubscribes the handler"]
    pub fn on_any<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&HubEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(handler))
    }

    /// Remove a registration. Returns `false` if it was already removed;
    /// calling it again is never an error.
    ///
    /// Safe to call from inside a handler, including the handler being
    /// removed.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut registry = lock(&self.registry);
        let Some(pos) = registry.entries.iter().position(|e| e.id == id) else {
            return false;
        };
        let entry = registry.entries.remove(pos);
        entry.active.store(false, Ordering::Release);
        debug!(subscription = %id, "unsubscribed");
        true
    }

    /// Number of handlers that would receive an event of `kind`.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        lock(&self.registry)
            .entries
            .iter()
            .filter(|e| e.kind.is_none_or(|k| k == kind))
            .count()
    }

    /// Deliver `event` to every matching handler.
    ///
    /// The handler list is snapshotted before any handler runs, so handlers
    /// may subscribe or unsubscribe freely. A handler that panics is logged
    /// and skipped; the remaining handlers still run.
    pub(crate) fn emit(&self, event: &HubEvent) {
        let kind = event.kind();
        let targets: Vec<(SubscriptionId, Handler, Arc<AtomicBool>)> = lock(&self.registry)
            .entries
            .iter()
            .filter(|e| e.kind.is_none_or(|k| k == kind))
            .map(|e| (e.id, Arc::clone(&e.handler), Arc::clone(&e.active)))
            .collect();

        for (id, handler, active) in targets {
            if !active.load(Ordering::Acquire) {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(subscription = %id, ?kind, "event handler panicked");
            }
        }
    }

    fn register(&self, kind: Option<EventKind>, handler: Handler) -> Subscription {
        let mut registry = lock(&self.registry);
        registry.next_id += 1;
        let id = SubscriptionId(registry.next_id);
        registry.entries.push(Entry {
            id,
            kind,
            handler,
            active: Arc::new(AtomicBool::new(true)),
        });
        debug!(subscription = %id, ?kind, "subscribed");
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
            released: false,
        }
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscribers", &lock(&self.registry).entries.len())
            .finish()
    }
}

/// Guard for one registration. Unsubscribes on drop.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    registry: Weak<Mutex<Registry>>,
    released: bool,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Unsubscribe now. Equivalent to dropping the guard.
    pub fn release(mut self) {
        self.unsubscribe();
    }

    /// Keep the handler registered past the guard's lifetime. It stays until
    /// [`EventDispatcher::off`] is called with the returned id.
    pub fn detach(mut self) -> SubscriptionId {
        self.released = true;
        self.id
    }

    fn unsubscribe(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(registry) = self.registry.upgrade() {
            EventDispatcher { registry }.off(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::protocol::PresenceEntry;
    use std::sync::Mutex as StdMutex;

    fn presence_event(user: &str) -> HubEvent {
        HubEvent::PresenceChanged(PresenceEntry {
            user_id: user.into(),
            is_online: true,
            last_active_at: chrono::DateTime::<chrono::Utc>::UNIX_EPOCH,
        })
    }

    fn server_error() -> HubEvent {
        HubEvent::ServerError {
            message: "boom".into(),
        }
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let dispatcher = EventDispatcher::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        let subs: Vec<Subscription> = (0..3)
            .map(|n| {
                let log = Arc::clone(&log);
                dispatcher.on(EventKind::PresenceChanged, move |_| {
                    log.lock().unwrap().push(n);
                })
            })
            .collect();

        dispatcher.emit(&presence_event("u1"));
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
        drop(subs);
    }

    #[test]
    fn handlers_only_see_their_kind() {
        let dispatcher = EventDispatcher::new();
        let hits = Arc::new(StdMutex::new(0));
        let counter = Arc::clone(&hits);
        let _sub = dispatcher.on(EventKind::ServerError, move |_| {
            *counter.lock().unwrap() += 1;
        });

        dispatcher.emit(&presence_event("u1"));
        dispatcher.emit(&server_error());
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn on_any_sees_every_kind() {
        let dispatcher = EventDispatcher::new();
        let kinds = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&kinds);
        let _sub = dispatcher.on_any(move |event| sink.lock().unwrap().push(event.kind()));

        dispatcher.emit(&presence_event("u1"));
        dispatcher.emit(&server_error());
        assert_eq!(
            *kinds.lock().unwrap(),
            vec![EventKind::PresenceChanged, EventKind::ServerError]
        );
        assert_eq!(dispatcher.subscriber_count(EventKind::NewMessage), 1);
    }

    #[test]
    fn panicking_handler_does_not_stop_the_rest() {
        let dispatcher = EventDispatcher::new();
        let reached = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&reached);

        let _bad = dispatcher.on(EventKind::ServerError, |_| panic!("handler bug"));
        let _good = dispatcher.on(EventKind::ServerError, move |_| {
            flag.store(true, Ordering::SeqCst);
        });

        dispatcher.emit(&server_error());
        assert!(reached.load(Ordering::SeqCst));
    }

    #[test]
    fn off_twice_is_a_no_op() {
        let dispatcher = EventDispatcher::new();
        let id = dispatcher.on(EventKind::ServerError, |_| {}).detach();

        assert!(dispatcher.off(id));
        assert!(!dispatcher.off(id));
        assert_eq!(dispatcher.subscriber_count(EventKind::ServerError), 0);
    }

    #[test]
    fn dropping_the_guard_unsubscribes() {
        let dispatcher = EventDispatcher::new();
        let sub = dispatcher.on(EventKind::ServerError, |_| {});
        let id = sub.id();
        assert_eq!(dispatcher.subscriber_count(EventKind::ServerError), 1);

        drop(sub);
        assert_eq!(dispatcher.subscriber_count(EventKind::ServerError), 0);
        assert!(!dispatcher.off(id));
    }

    #[test]
    fn handler_can_unsubscribe_itself_and_a_later_handler() {
        let dispatcher = EventDispatcher::new();
        let ids: Arc<StdMutex<Vec<SubscriptionId>>> = Arc::new(StdMutex::new(Vec::new()));
        let later_calls = Arc::new(StdMutex::new(0));

        let first = {
            let inner = dispatcher.clone();
            let ids = Arc::clone(&ids);
            dispatcher.on(EventKind::ServerError, move |_| {
                for id in ids.lock().unwrap().iter() {
                    inner.off(*id);
                }
            })
        };
        let second = {
            let calls = Arc::clone(&later_calls);
            dispatcher.on(EventKind::ServerError, move |_| {
                *calls.lock().unwrap() += 1;
            })
        };
        ids.lock().unwrap().extend([first.detach(), second.detach()]);

        dispatcher.emit(&server_error());
        assert_eq!(*later_calls.lock().unwrap(), 0);
        assert_eq!(dispatcher.subscriber_count(EventKind::ServerError), 0);

        // A second emit reaches nobody and does not fail.
        dispatcher.emit(&server_error());
    }

    #[test]
    fn guard_outliving_dispatcher_is_harmless() {
        let dispatcher = EventDispatcher::new();
        let sub = dispatcher.on(EventKind::ServerError, |_| {});
        drop(dispatcher);
        sub.release();
    }
}
