use indexmap::IndexMap;
use serde_json::Value;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;

/// An event delivered to listeners
#[derive(Debug, Clone, PartialEq)]
pub struct PusherEvent {
    pub event_name: String,
    pub channel_name: Option<String>,
    pub data: Value,
    /// Sender of a client event on a presence channel, when the server supplies it
    pub user_id: Option<String>,
}

impl PusherEvent {
    pub fn new(event_name: impl Into<String>, channel_name: Option<String>, data: Value) -> Self {
        Self {
            event_name: event_name.into(),
            channel_name,
            data,
            user_id: None,
        }
    }
}

/// Handle returned by `bind`, used to remove one specific listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Listener callback invoked on the connection task
pub type Listener = Arc<dyn Fn(&PusherEvent) + Send + Sync>;

/// Ordered mapping from event name to the listeners bound to it.
///
/// Listeners for one event run in the order they were bound. A listener
/// that panics is logged and skipped; the remaining listeners still run.
#[derive(Default)]
pub struct EventDispatcher {
    listeners: IndexMap<String, Vec<(ListenerId, Listener)>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener for `event`
    pub fn bind(&mut self, event: &str, listener: Listener) -> ListenerId {
        let id = ListenerId::next();
        self.bind_with_id(id, event, listener);
        id
    }

    pub(crate) fn bind_with_id(&mut self, id: ListenerId, event: &str, listener: Listener) {
        self.listeners
            .entry(event.to_string())
            .or_default()
            .push((id, listener));
    }

    /// Remove every listener bound to `event`, returning how many were dropped
    pub fn unbind(&mut self, event: &str) -> usize {
        self.listeners
            .shift_remove(event)
            .map_or(0, |listeners| listeners.len())
    }

    /// Remove a single listener by id
    pub fn unbind_listener(&mut self, id: ListenerId) -> bool {
        let mut removed = false;
        for listeners in self.listeners.values_mut() {
            let before = listeners.len();
            listeners.retain(|(listener_id, _)| *listener_id != id);
            removed |= listeners.len() != before;
        }
        self.listeners.retain(|_, listeners| !listeners.is_empty());
        removed
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.get(event).map_or(0, Vec::len)
    }

    /// Invoke every listener bound to the event's name.
    ///
    /// Returns the number of listeners that completed without panicking.
    pub fn dispatch(&self, event: &PusherEvent) -> usize {
        let Some(listeners) = self.listeners.get(&event.event_name) else {
            return 0;
        };

        let mut completed = 0;
        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => completed += 1,
                Err(_) => error!(
                    "Listener {:?} for {} panicked, continuing with remaining listeners",
                    id, event.event_name
                ),
            }
        }
        completed
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: Vec<(&str, usize)> = self
            .listeners
            .iter()
            .map(|(event, listeners)| (event.as_str(), listeners.len()))
            .collect();
        f.debug_struct("EventDispatcher")
            .field("listeners", &counts)
            .finish()
    }
}
