//! Durable ordered fan-out of events to reducers.

use std::sync::Arc;

use braid_core::Event;
use braid_store::Datastore;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::DbError;

/// Applies a batch of events to some state.
///
/// Unlike a pub-sub system, every event batch reaches every registered
/// reducer. Reducers run under the database writer lock, so they observe
/// one total order of events.
pub trait Reducer: Send + Sync {
    /// Apply one transaction's events, in array order.
    fn reduce(&self, events: &[Event]) -> Result<(), DbError>;
}

/// Persists event batches to a durable queue, then drives reducers.
///
/// Persistence precedes reduction: a crash after the write leaves the
/// queue replayable. A reducer error fails the whole dispatch.
pub struct Dispatcher {
    store: Datastore,
    prefix: String,
    reducers: RwLock<Vec<Arc<dyn Reducer>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("prefix", &self.prefix)
            .field("reducers", &self.reducers.read().len())
            .finish()
    }
}

impl Dispatcher {
    /// A dispatcher persisting under `<db prefix>/dispatcher`.
    pub fn new(store: Datastore, db_prefix: &str) -> Self {
        Dispatcher {
            store,
            prefix: format!("{db_prefix}/dispatcher"),
            reducers: RwLock::new(Vec::new()),
        }
    }

    /// Register a reducer; it receives every subsequent dispatch.
    pub fn register(&self, reducer: Arc<dyn Reducer>) {
        self.reducers.write().push(reducer);
    }

    /// Drop all reducers (used on close to break reference cycles).
    pub fn clear_reducers(&self) {
        self.reducers.write().clear();
    }

    fn event_key(&self, event: &Event) -> Vec<u8> {
        // zero-padded timestamp keeps the queue in time order
        format!(
            "{}/{:020}/{}/{}",
            self.prefix,
            event.time,
            event.instance,
            event.kind.as_str()
        )
        .into_bytes()
    }

    /// Persist a batch, then invoke every reducer with it in order.
    pub fn dispatch(&self, events: &[Event]) -> Result<(), DbError> {
        if events.is_empty() {
            return Ok(());
        }
        self.store.write(|tx| {
            for event in events {
                tx.put(&self.event_key(event), &postcard::to_stdvec(event)?)?;
            }
            Ok::<(), DbError>(())
        })?;
        debug!(count = events.len(), "events persisted, reducing");

        let reducers: Vec<Arc<dyn Reducer>> = self.reducers.read().clone();
        for reducer in reducers {
            reducer.reduce(events)?;
        }
        Ok(())
    }

    /// True if this event was already persisted (and therefore
    /// dispatched, barring a crash mid-dispatch).
    pub fn contains(&self, event: &Event) -> Result<bool, DbError> {
        Ok(self.store.has(&self.event_key(event))?)
    }

    /// All persisted events, in dispatch order. The replay source after a
    /// crash between persistence and reduction.
    pub fn persisted(&self) -> Result<Vec<Event>, DbError> {
        let mut events = Vec::new();
        for (_, value) in self.store.scan_prefix(self.prefix.as_bytes())? {
            events.push(postcard::from_bytes(&value)?);
        }
        Ok(events)
    }

    /// Drop the durable queue (used by a purging delete).
    pub fn clear_queue(&self) -> Result<(), DbError> {
        self.store.write(|tx| {
            tx.delete_prefix(self.prefix.as_bytes())?;
            Ok::<(), DbError>(())
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_core::{EventKind, InstanceId};
    use bytes::Bytes;
    use parking_lot::Mutex;

    struct Recording {
        seen: Mutex<Vec<InstanceId>>,
        fail: bool,
    }

    impl Reducer for Recording {
        fn reduce(&self, events: &[Event]) -> Result<(), DbError> {
            if self.fail {
                return Err(DbError::ReplicaIntegrity("boom".into()));
            }
            self.seen
                .lock()
                .extend(events.iter().map(|event| event.instance));
            Ok(())
        }
    }

    fn event(time: u64) -> Event {
        Event {
            collection: "c".into(),
            instance: InstanceId::new_random(),
            kind: EventKind::Create,
            time,
            patch: Bytes::from_static(b"{}"),
        }
    }

    #[test]
    fn dispatch_reaches_reducers_in_order() {
        let dispatcher = Dispatcher::new(Datastore::memory().unwrap(), "/db/t");
        let reducer = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            fail: false,
        });
        dispatcher.register(reducer.clone());

        let events = vec![event(1), event(2)];
        dispatcher.dispatch(&events).unwrap();
        assert_eq!(
            reducer.seen.lock().clone(),
            events.iter().map(|event| event.instance).collect::<Vec<_>>()
        );
    }

    #[test]
    fn events_persist_before_reduction() {
        let dispatcher = Dispatcher::new(Datastore::memory().unwrap(), "/db/t");
        dispatcher.register(Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            fail: true,
        }));

        let events = vec![event(7)];
        assert!(dispatcher.dispatch(&events).is_err());
        // the queue still holds the batch for replay
        assert_eq!(dispatcher.persisted().unwrap(), events);
    }

    #[test]
    fn queue_is_time_ordered() {
        let dispatcher = Dispatcher::new(Datastore::memory().unwrap(), "/db/t");
        dispatcher.dispatch(&[event(20)]).unwrap();
        dispatcher.dispatch(&[event(3)]).unwrap();
        let times: Vec<u64> = dispatcher
            .persisted()
            .unwrap()
            .iter()
            .map(|event| event.time)
            .collect();
        assert_eq!(times, vec![3, 20]);
    }
}
