//! Change listeners with collection/type/id filters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use braid_core::{EventKind, InstanceId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

const LISTENER_CAP: usize = 16;

/// A state change applied to a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    /// The collection that changed.
    pub collection: String,
    /// What happened.
    pub kind: EventKind,
    /// The affected instance.
    pub instance: InstanceId,
}

/// One listener filter. `None` fields match anything; a listener with
/// several filters fires when any of them matches.
#[derive(Debug, Clone, Default)]
pub struct ActionFilter {
    /// Restrict to one collection.
    pub collection: Option<String>,
    /// Restrict to one action kind.
    pub kind: Option<EventKind>,
    /// Restrict to one instance.
    pub instance: Option<InstanceId>,
}

impl ActionFilter {
    fn matches(&self, action: &Action) -> bool {
        if let Some(collection) = &self.collection {
            if *collection != action.collection {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if kind != action.kind {
                return false;
            }
        }
        if let Some(instance) = self.instance {
            if instance != action.instance {
                return false;
            }
        }
        true
    }
}

struct Entry {
    filters: Vec<ActionFilter>,
    tx: mpsc::Sender<Action>,
}

/// Registry of active listeners.
#[derive(Default)]
pub(crate) struct Notifee {
    entries: Mutex<HashMap<u64, Entry>>,
    next_id: AtomicU64,
}

impl Notifee {
    /// Register a listener; dropped or closed listeners deregister.
    pub(crate) fn listen(self: &Arc<Self>, filters: Vec<ActionFilter>) -> Listener {
        let (tx, rx) = mpsc::channel(LISTENER_CAP);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(id, Entry { filters, tx });
        Listener {
            id,
            rx,
            registry: Arc::downgrade(self),
        }
    }

    /// Deliver actions to every matching listener. Writers are never
    /// blocked: if a listener's buffer is full the action is dropped.
    pub(crate) fn notify(&self, actions: &[Action]) {
        let entries = self.entries.lock();
        for action in actions {
            for entry in entries.values() {
                let matched = entry.filters.is_empty()
                    || entry.filters.iter().any(|filter| filter.matches(action));
                if matched {
                    if entry.tx.try_send(action.clone()).is_err() {
                        warn!(?action, "dropped action for slow listener");
                    }
                }
            }
        }
    }

    /// Drop every listener (database close).
    pub(crate) fn close(&self) {
        self.entries.lock().clear();
    }

    fn remove(&self, id: u64) {
        self.entries.lock().remove(&id);
    }
}

/// A stream of matching [`Action`]s.
///
/// Buffered but undelivered actions are dropped when the listener closes.
pub struct Listener {
    id: u64,
    rx: mpsc::Receiver<Action>,
    registry: std::sync::Weak<Notifee>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Listener({})", self.id)
    }
}

impl Listener {
    /// The next matching action, or `None` once the database closed.
    pub async fn next(&mut self) -> Option<Action> {
        self.rx.recv().await
    }

    /// Non-blocking poll for a buffered action.
    pub fn try_next(&mut self) -> Option<Action> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(collection: &str, kind: EventKind) -> Action {
        Action {
            collection: collection.into(),
            kind,
            instance: InstanceId::new_random(),
        }
    }

    #[tokio::test]
    async fn filters_select_matching_actions() {
        let notifee = Arc::new(Notifee::default());
        let mut listener = notifee.listen(vec![ActionFilter {
            collection: Some("C1".into()),
            kind: Some(EventKind::Save),
            instance: None,
        }]);

        notifee.notify(&[
            action("C1", EventKind::Create),
            action("C1", EventKind::Save),
            action("C1", EventKind::Delete),
            action("C2", EventKind::Create),
        ]);

        let seen = listener.next().await.unwrap();
        assert_eq!(seen.collection, "C1");
        assert_eq!(seen.kind, EventKind::Save);
        assert!(listener.try_next().is_none());
    }

    #[tokio::test]
    async fn empty_filter_receives_everything() {
        let notifee = Arc::new(Notifee::default());
        let mut listener = notifee.listen(Vec::new());
        notifee.notify(&[action("C1", EventKind::Create), action("C2", EventKind::Delete)]);
        assert!(listener.next().await.is_some());
        assert!(listener.next().await.is_some());
    }

    #[tokio::test]
    async fn dropped_listener_deregisters() {
        let notifee = Arc::new(Notifee::default());
        let listener = notifee.listen(Vec::new());
        assert_eq!(notifee.entries.lock().len(), 1);
        drop(listener);
        assert_eq!(notifee.entries.lock().len(), 0);
    }
}
