//! The DB aggregate: collections, dispatcher, listeners and the thread
//! adapter.
//!
//! A database is bound to exactly one thread. Local writes run through a
//! write transaction whose commit encodes buffered actions into events,
//! dispatches them (persist, reduce, notify) and appends them to this
//! peer's log. Remote records arrive through the replication engine's
//! event sink and drive the same dispatcher, so both sides converge on one
//! total order per log.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use braid_core::{Event, EventKind, InstanceId, ThreadId};
use braid_net::{EventSink, Net};
use braid_store::Datastore;
use bytes::Bytes;
use cid::Cid;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::collection::{
    action_of, ensure_instance_id, Collection, CollectionConfig, CollectionSpec,
};
use crate::dispatcher::{Dispatcher, Reducer};
use crate::error::DbError;
use crate::index::{self, IndexConfig};
use crate::listeners::{Action, ActionFilter, Listener, Notifee};
use crate::path::value_key;
use crate::query::Query;

/// A replicated, schema-constrained document database over one thread.
#[derive(Clone)]
pub struct Db {
    pub(crate) inner: Arc<DbInner>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Db({})", self.inner.thread)
    }
}

pub(crate) struct DbInner {
    pub(crate) thread: ThreadId,
    pub(crate) store: Datastore,
    pub(crate) net: Net,
    pub(crate) prefix: String,
    /// Readers-writer lock over the materialized state. Transactions take
    /// read or write; the reducer runs under the write side.
    pub(crate) state: tokio::sync::RwLock<()>,
    pub(crate) collections: parking_lot::RwLock<HashMap<String, Arc<CollectionSpec>>>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) notifee: Arc<Notifee>,
    pending_actions: Mutex<Vec<Action>>,
    closed: AtomicBool,
}

struct CollectionsReducer {
    inner: Weak<DbInner>,
}

impl Reducer for CollectionsReducer {
    fn reduce(&self, events: &[Event]) -> Result<(), DbError> {
        let inner = self.inner.upgrade().ok_or(DbError::Closed)?;
        let actions = inner.apply_events(events)?;
        inner.pending_actions.lock().extend(actions);
        Ok(())
    }
}

struct DbSink {
    inner: Weak<DbInner>,
}

#[async_trait]
impl EventSink for DbSink {
    async fn deliver(
        &self,
        _thread: &ThreadId,
        log: &braid_core::LogId,
        record: Cid,
        events: Vec<Event>,
    ) -> anyhow::Result<()> {
        let inner = self.inner.upgrade().ok_or_else(|| anyhow::anyhow!("database closed"))?;
        let _guard = inner.state.write().await;
        debug!(%log, %record, count = events.len(), "delivering remote events");
        match inner.dispatcher.dispatch(&events) {
            Ok(()) => {
                inner.flush_notifications();
                Ok(())
            }
            Err(err) => {
                inner.clear_notifications();
                // integrity and persistence failures are fatal: the log
                // is consistent but the local view is not, so enter the
                // closed state instead of retrying forever
                error!(
                    thread = %inner.thread,
                    %log,
                    %record,
                    "dispatch failed, closing database: {err}"
                );
                Db {
                    inner: inner.clone(),
                }
                .close();
                Err(err.into())
            }
        }
    }
}

impl Db {
    /// Open (or create) the database of a thread. The thread must already
    /// be installed with the replication engine.
    pub async fn open(store: Datastore, net: Net, thread: ThreadId) -> Result<Db, DbError> {
        let prefix = format!("/db/{thread}");
        let dispatcher = Dispatcher::new(store.clone(), &prefix);
        let inner = Arc::new(DbInner {
            thread: thread.clone(),
            store,
            net: net.clone(),
            prefix,
            state: tokio::sync::RwLock::new(()),
            collections: parking_lot::RwLock::new(HashMap::new()),
            dispatcher,
            notifee: Arc::new(Notifee::default()),
            pending_actions: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        inner.hydrate_collections()?;
        inner.dispatcher.register(Arc::new(CollectionsReducer {
            inner: Arc::downgrade(&inner),
        }));
        net.register_sink(
            &thread,
            Arc::new(DbSink {
                inner: Arc::downgrade(&inner),
            }),
        );
        let db = Db { inner };
        db.catch_up().await?;
        Ok(db)
    }

    /// Replay events of records that advanced log heads while no sink was
    /// attached (records applied before this database existed, or pushed
    /// in the window before registration). Already-dispatched batches are
    /// skipped via the durable queue.
    async fn catch_up(&self) -> Result<(), DbError> {
        let inner = &self.inner;
        let Some(read_key) = inner.net.store().read_key(&inner.thread)? else {
            return Ok(()); // replicate-only follower
        };
        let blocks = inner.net.blocks().clone();
        for log in inner.net.store().logs(&inner.thread)? {
            let records = inner
                .net
                .local_records(&inner.thread, &log, None, usize::MAX)
                .await?;
            for record in records {
                let events = match record.open_events(blocks.as_ref(), &read_key).await {
                    Ok(events) => events,
                    Err(braid_core::Error::BlockNotFound(_)) => continue,
                    Err(err) => return Err(DbError::Net(err.into())),
                };
                let Some(first) = events.first() else { continue };
                if inner.dispatcher.contains(first)? {
                    continue;
                }
                debug!(%log, record = %record.cid(), "catching up missed record");
                let _guard = inner.state.write().await;
                match inner.dispatcher.dispatch(&events) {
                    Ok(()) => inner.flush_notifications(),
                    Err(err) => {
                        inner.clear_notifications();
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }

    /// The thread this database is bound to.
    pub fn thread(&self) -> &ThreadId {
        &self.inner.thread
    }

    /// Register a new collection.
    pub fn new_collection(&self, config: CollectionConfig) -> Result<Collection, DbError> {
        self.check_open()?;
        let spec = CollectionSpec::build(&config)?;
        let mut collections = self.inner.collections.write();
        if collections.contains_key(&config.name) {
            return Err(DbError::CollectionAlreadyRegistered);
        }
        self.inner.persist_collection(&config)?;
        collections.insert(config.name.clone(), Arc::new(spec));
        Ok(Collection {
            db: self.clone(),
            name: config.name,
        })
    }

    /// Replace a collection's schema and reconcile its index set. Existing
    /// instances are not re-validated; new indexes start empty, removed
    /// indexes are dropped.
    pub fn update_collection(&self, config: CollectionConfig) -> Result<Collection, DbError> {
        self.check_open()?;
        let spec = CollectionSpec::build(&config)?;
        let mut collections = self.inner.collections.write();
        let previous = collections
            .get(&config.name)
            .ok_or(DbError::CollectionNotFound)?
            .clone();

        let removed: Vec<&IndexConfig> = previous
            .indexes
            .iter()
            .filter(|old| !config.indexes.iter().any(|new| new.path == old.path))
            .collect();
        self.inner.store.write(|tx| {
            for index in removed {
                index::drop_index(tx, &self.inner.prefix, &config.name, &index.path)?;
            }
            Ok::<_, DbError>(())
        })?;

        self.inner.persist_collection(&config)?;
        collections.insert(config.name.clone(), Arc::new(spec));
        Ok(Collection {
            db: self.clone(),
            name: config.name,
        })
    }

    /// Unregister a collection and delete its schema, instances and
    /// indexes.
    pub fn delete_collection(&self, name: &str) -> Result<(), DbError> {
        self.check_open()?;
        let mut collections = self.inner.collections.write();
        if collections.remove(name).is_none() {
            return Err(DbError::CollectionNotFound);
        }
        let prefix = &self.inner.prefix;
        self.inner.store.write(|tx| {
            tx.delete(format!("{prefix}/schema/{name}").as_bytes())?;
            tx.delete(format!("{prefix}/index/{name}").as_bytes())?;
            tx.delete_prefix(format!("{prefix}/collection/{name}/").as_bytes())?;
            tx.delete_prefix(&index::collection_index_prefix(prefix, name))?;
            Ok::<_, DbError>(())
        })
    }

    /// Look up a registered collection.
    pub fn collection(&self, name: &str) -> Result<Collection, DbError> {
        self.check_open()?;
        if !self.inner.collections.read().contains_key(name) {
            return Err(DbError::CollectionNotFound);
        }
        Ok(Collection {
            db: self.clone(),
            name: name.to_string(),
        })
    }

    /// Names of all registered collections.
    pub fn collection_names(&self) -> Vec<String> {
        self.inner.collections.read().keys().cloned().collect()
    }

    /// Open a read transaction; reads are serializable with respect to
    /// concurrent writers.
    pub async fn read_txn(&self) -> Result<ReadTxn<'_>, DbError> {
        self.check_open()?;
        Ok(ReadTxn {
            db: self,
            _guard: self.inner.state.read().await,
        })
    }

    /// Open a write transaction holding the DB write lock until commit or
    /// discard. Nested transactions deadlock by design; take one at a
    /// time per task.
    pub async fn write_txn(&self) -> Result<WriteTxn<'_>, DbError> {
        self.check_open()?;
        Ok(WriteTxn {
            db: self,
            _guard: self.inner.state.write().await,
            actions: Vec::new(),
            terminated: false,
        })
    }

    /// Register a change listener.
    pub fn listen(&self, filters: Vec<ActionFilter>) -> Result<Listener, DbError> {
        self.check_open()?;
        Ok(self.inner.notifee.listen(filters))
    }

    /// Close the database: detach from the replication engine and drop
    /// listeners. Stored state is kept.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.net.unregister_sink(&self.inner.thread);
        self.inner.dispatcher.clear_reducers();
        self.inner.notifee.close();
    }

    fn check_open(&self) -> Result<(), DbError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(DbError::Closed);
        }
        Ok(())
    }
}

impl DbInner {
    fn instance_key(&self, collection: &str, id: &InstanceId) -> Vec<u8> {
        format!("{}/collection/{collection}/{id}", self.prefix).into_bytes()
    }

    fn instances_prefix(&self, collection: &str) -> Vec<u8> {
        format!("{}/collection/{collection}/", self.prefix).into_bytes()
    }

    pub(crate) fn spec(&self, collection: &str) -> Result<Arc<CollectionSpec>, DbError> {
        self.collections
            .read()
            .get(collection)
            .cloned()
            .ok_or(DbError::CollectionNotFound)
    }

    fn persist_collection(&self, config: &CollectionConfig) -> Result<(), DbError> {
        let prefix = &self.prefix;
        let name = &config.name;
        let schema = serde_json::to_vec(&config.schema)?;
        let indexes = serde_json::to_vec(&config.indexes)?;
        self.store.write(|tx| {
            tx.put(format!("{prefix}/schema/{name}").as_bytes(), &schema)?;
            tx.put(format!("{prefix}/index/{name}").as_bytes(), &indexes)?;
            Ok::<_, DbError>(())
        })
    }

    fn hydrate_collections(&self) -> Result<(), DbError> {
        let schema_prefix = format!("{}/schema/", self.prefix);
        for (key, value) in self.store.scan_prefix(schema_prefix.as_bytes())? {
            let Some(name) = key
                .strip_prefix(schema_prefix.as_bytes())
                .and_then(|suffix| std::str::from_utf8(suffix).ok())
            else {
                continue;
            };
            let schema: Value = serde_json::from_slice(&value)?;
            let indexes: Vec<IndexConfig> = match self
                .store
                .get(format!("{}/index/{name}", self.prefix).as_bytes())?
            {
                Some(bytes) => serde_json::from_slice(&bytes)?,
                None => Vec::new(),
            };
            let config = CollectionConfig {
                name: name.to_string(),
                schema,
                indexes,
            };
            let spec = CollectionSpec::build(&config)?;
            self.collections
                .write()
                .insert(config.name.clone(), Arc::new(spec));
            debug!(collection = name, "collection hydrated");
        }
        Ok(())
    }

    /// Apply one event batch to the materialized state, atomically.
    fn apply_events(&self, events: &[Event]) -> Result<Vec<Action>, DbError> {
        self.store.write(|tx| {
            let mut actions = Vec::with_capacity(events.len());
            for event in events {
                let spec = self.collections.read().get(&event.collection).cloned();
                let indexes: &[IndexConfig] =
                    spec.as_ref().map(|spec| spec.indexes.as_slice()).unwrap_or(&[]);
                if spec.is_none() {
                    warn!(
                        collection = %event.collection,
                        "applying event for unregistered collection; instance stored unindexed"
                    );
                }
                let key = self.instance_key(&event.collection, &event.instance);
                let instance_key = event.instance.to_string().into_bytes();
                let old = tx.get(&key)?;

                match event.kind {
                    EventKind::Create | EventKind::Save => {
                        let incoming: Value = serde_json::from_slice(&event.patch)?;
                        if let Some(old_bytes) = &old {
                            let outgoing: Value = serde_json::from_slice(old_bytes)?;
                            index::index_delete(
                                tx,
                                &self.prefix,
                                &event.collection,
                                indexes,
                                &instance_key,
                                &outgoing,
                            )?;
                        }
                        index::index_add(
                            tx,
                            &self.prefix,
                            &event.collection,
                            indexes,
                            &instance_key,
                            &incoming,
                            false,
                        )?;
                        tx.put(&key, &event.patch)?;
                    }
                    EventKind::Delete => match &old {
                        Some(old_bytes) => {
                            let outgoing: Value = serde_json::from_slice(old_bytes)?;
                            index::index_delete(
                                tx,
                                &self.prefix,
                                &event.collection,
                                indexes,
                                &instance_key,
                                &outgoing,
                            )?;
                            tx.delete(&key)?;
                        }
                        None => {
                            // a concurrent writer on another log may have
                            // deleted it first
                            warn!(
                                collection = %event.collection,
                                instance = %event.instance,
                                "delete of unknown instance skipped"
                            );
                            continue;
                        }
                    },
                }
                actions.push(action_of(&event.collection, event.kind, event.instance));
            }
            Ok(actions)
        })
    }

    fn flush_notifications(&self) {
        let actions: Vec<Action> = self.pending_actions.lock().drain(..).collect();
        if !actions.is_empty() {
            self.notifee.notify(&actions);
        }
    }

    fn clear_notifications(&self) {
        self.pending_actions.lock().clear();
    }

    fn get_instance(&self, collection: &str, id: &InstanceId) -> Result<Vec<u8>, DbError> {
        self.spec(collection)?;
        self.store
            .get(&self.instance_key(collection, id))?
            .ok_or(DbError::InstanceNotFound)
    }

    fn has_instances(&self, collection: &str, ids: &[InstanceId]) -> Result<bool, DbError> {
        self.spec(collection)?;
        for id in ids {
            if !self.store.has(&self.instance_key(collection, id))? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn find(&self, collection: &str, query: &Query) -> Result<Vec<Vec<u8>>, DbError> {
        let spec = self.spec(collection)?;

        // indexed fast path: the hinted path must be indexed and pinned by
        // an equality on the mandatory spine of the predicate
        let bucket = query.use_index.as_ref().and_then(|path| {
            spec.indexes.iter().find(|index| index.path == *path)?;
            let value = query.filter.as_ref()?.required_eq(path)?;
            Some((path.clone(), value_key(value)))
        });

        let mut hits: Vec<(Value, Vec<u8>)> = Vec::new();
        match bucket {
            Some((path, value)) => {
                for raw_id in
                    index::bucket_keys(&self.store, &self.prefix, collection, &path, &value)?
                {
                    let Ok(id) = std::str::from_utf8(&raw_id)
                        .map_err(|_| ())
                        .and_then(|text| text.parse::<InstanceId>().map_err(|_| ()))
                    else {
                        warn!(collection, "skipping undecodable index entry");
                        continue;
                    };
                    let Some(bytes) = self.store.get(&self.instance_key(collection, &id))? else {
                        continue;
                    };
                    let instance: Value = serde_json::from_slice(&bytes)?;
                    if query
                        .filter
                        .as_ref()
                        .map(|filter| filter.matches(&instance))
                        .unwrap_or(true)
                    {
                        hits.push((instance, bytes));
                    }
                }
            }
            None => {
                for (_, bytes) in self.store.scan_prefix(&self.instances_prefix(collection))? {
                    let instance: Value = serde_json::from_slice(&bytes)?;
                    if query
                        .filter
                        .as_ref()
                        .map(|filter| filter.matches(&instance))
                        .unwrap_or(true)
                    {
                        hits.push((instance, bytes));
                    }
                }
            }
        }
        Ok(query.finish(hits))
    }

    /// Enforce unique indexes against the committed state and the batch
    /// itself, before any event is produced.
    fn check_unique(&self, actions: &[PendingAction]) -> Result<(), DbError> {
        let mut batch_taken: HashMap<(String, String, String), InstanceId> = HashMap::new();
        for action in actions {
            let Some(current) = &action.current else {
                continue;
            };
            let spec = self.spec(&action.collection)?;
            let instance: Value = serde_json::from_slice(current)?;
            for config in spec.indexes.iter().filter(|config| config.unique) {
                let Some(value) = crate::path::path_value(&instance, &config.path) else {
                    continue;
                };
                let value = value_key(value);
                let slot = (
                    action.collection.clone(),
                    config.path.clone(),
                    value.clone(),
                );
                if let Some(holder) = batch_taken.get(&slot) {
                    if *holder != action.instance {
                        return Err(DbError::UniqueViolation {
                            path: config.path.clone(),
                        });
                    }
                }
                batch_taken.insert(slot, action.instance);

                let own_key = action.instance.to_string().into_bytes();
                let existing = index::bucket_keys(
                    &self.store,
                    &self.prefix,
                    &action.collection,
                    &config.path,
                    &value,
                )?;
                if existing.iter().any(|key| *key != own_key) {
                    return Err(DbError::UniqueViolation {
                        path: config.path.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PendingAction {
    pub(crate) collection: String,
    pub(crate) kind: EventKind,
    pub(crate) instance: InstanceId,
    pub(crate) current: Option<Vec<u8>>,
}

/// A read transaction holding the DB read lock.
pub struct ReadTxn<'a> {
    db: &'a Db,
    _guard: tokio::sync::RwLockReadGuard<'a, ()>,
}

impl ReadTxn<'_> {
    /// The raw JSON bytes of one instance.
    pub fn find_by_id(&self, collection: &str, id: &InstanceId) -> Result<Vec<u8>, DbError> {
        self.db.inner.get_instance(collection, id)
    }

    /// True only if all ids exist.
    pub fn has(&self, collection: &str, ids: &[InstanceId]) -> Result<bool, DbError> {
        self.db.inner.has_instances(collection, ids)
    }

    /// Run a query.
    pub fn find(&self, collection: &str, query: &Query) -> Result<Vec<Vec<u8>>, DbError> {
        self.db.inner.find(collection, query)
    }
}

/// A write transaction. Actions are buffered and turn into one atomic
/// event batch on commit; dropping the transaction discards them.
pub struct WriteTxn<'a> {
    db: &'a Db,
    _guard: tokio::sync::RwLockWriteGuard<'a, ()>,
    actions: Vec<PendingAction>,
    terminated: bool,
}

impl WriteTxn<'_> {
    fn check_active(&self) -> Result<(), DbError> {
        if self.terminated {
            return Err(DbError::TransactionAlreadyTerminated);
        }
        Ok(())
    }

    fn pending_current(&self, collection: &str, id: &InstanceId) -> Option<&PendingAction> {
        self.actions
            .iter()
            .rev()
            .find(|action| action.collection == collection && action.instance == *id)
    }

    fn exists(&self, collection: &str, id: &InstanceId) -> Result<bool, DbError> {
        if let Some(pending) = self.pending_current(collection, id) {
            return Ok(pending.current.is_some());
        }
        Ok(self
            .db
            .inner
            .store
            .has(&self.db.inner.instance_key(collection, id))?)
    }

    /// Buffer instance creations. Instances without an `_id` get a fresh
    /// UUIDv4 patched in; the returned ids line up with the input order.
    pub fn create(
        &mut self,
        collection: &str,
        instances: &[&[u8]],
    ) -> Result<Vec<InstanceId>, DbError> {
        self.check_active()?;
        let spec = self.db.inner.spec(collection)?;
        let mut ids = Vec::with_capacity(instances.len());
        for bytes in instances {
            let mut instance: Value = serde_json::from_slice(bytes)?;
            let id = ensure_instance_id(&mut instance)?;
            spec.validate(&instance)?;
            if self.exists(collection, &id)? {
                return Err(DbError::InstanceAlreadyExists);
            }
            self.actions.push(PendingAction {
                collection: collection.to_string(),
                kind: EventKind::Create,
                instance: id,
                current: Some(serde_json::to_vec(&instance)?),
            });
            ids.push(id);
        }
        Ok(ids)
    }

    /// Buffer replacements of existing instances.
    pub fn save(&mut self, collection: &str, instances: &[&[u8]]) -> Result<(), DbError> {
        self.check_active()?;
        let spec = self.db.inner.spec(collection)?;
        for bytes in instances {
            let mut instance: Value = serde_json::from_slice(bytes)?;
            let id = ensure_instance_id(&mut instance)?;
            spec.validate(&instance)?;
            if !self.exists(collection, &id)? {
                return Err(DbError::InstanceNotFound);
            }
            self.actions.push(PendingAction {
                collection: collection.to_string(),
                kind: EventKind::Save,
                instance: id,
                current: Some(serde_json::to_vec(&instance)?),
            });
        }
        Ok(())
    }

    /// Buffer deletions. Every id must exist.
    pub fn delete(&mut self, collection: &str, ids: &[InstanceId]) -> Result<(), DbError> {
        self.check_active()?;
        self.db.inner.spec(collection)?;
        for id in ids {
            if !self.exists(collection, id)? {
                return Err(DbError::InstanceNotFound);
            }
            self.actions.push(PendingAction {
                collection: collection.to_string(),
                kind: EventKind::Delete,
                instance: *id,
                current: None,
            });
        }
        Ok(())
    }

    /// Reads inside a write transaction observe the committed state, not
    /// the buffered actions.
    pub fn find_by_id(&self, collection: &str, id: &InstanceId) -> Result<Vec<u8>, DbError> {
        self.check_active()?;
        self.db.inner.get_instance(collection, id)
    }

    /// Commit the buffered actions: one timestamp, one event batch, one
    /// record appended to this peer's log.
    pub async fn commit(&mut self) -> Result<(), DbError> {
        self.check_active()?;
        self.terminated = true;
        if self.actions.is_empty() {
            return Ok(());
        }
        let inner = &self.db.inner;
        inner.check_unique(&self.actions)?;

        let time = braid_core::time::monotonic_nanos();
        let events: Vec<Event> = self
            .actions
            .drain(..)
            .map(|action| Event {
                collection: action.collection,
                instance: action.instance,
                kind: action.kind,
                time,
                patch: action.current.map(Bytes::from).unwrap_or_default(),
            })
            .collect();

        if let Err(err) = inner.dispatcher.dispatch(&events) {
            inner.clear_notifications();
            // the events are durable but the reduce failed; the
            // materialized view can no longer be trusted
            error!(thread = %inner.thread, "commit dispatch failed, closing database: {err}");
            self.db.close();
            return Err(err);
        }
        inner.flush_notifications();

        // the write guard is still held, so records seal in commit order
        inner.net.create_record(&inner.thread, events).await?;
        Ok(())
    }

    /// Drop the buffered actions without applying them.
    pub fn discard(&mut self) -> Result<(), DbError> {
        self.check_active()?;
        self.terminated = true;
        self.actions.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_core::{LogKeypair, MemBlockStore, ThreadKey, Variant};
    use braid_net::mem::MemNetwork;
    use braid_net::NetConfig;
    use braid_store::Logstore;

    async fn open_db() -> (Db, ThreadId) {
        let network = MemNetwork::new();
        let peer = libp2p_identity::Keypair::generate_ed25519()
            .public()
            .to_peer_id();
        let (transport, gossip) = network.attach(peer);
        let store = Datastore::memory().unwrap();
        let net = Net::new(
            Logstore::new(store.clone()),
            Arc::new(MemBlockStore::new()),
            Arc::new(transport),
            Arc::new(gossip),
            NetConfig::default(),
        );
        let thread = ThreadId::new(Variant::Raw);
        net.create_thread(&thread, ThreadKey::generate())
            .await
            .unwrap();
        let db = Db::open(store, net, thread.clone()).await.unwrap();
        (db, thread)
    }

    struct FailingReducer;

    impl Reducer for FailingReducer {
        fn reduce(&self, _events: &[Event]) -> Result<(), DbError> {
            Err(DbError::ReplicaIntegrity("induced failure".into()))
        }
    }

    #[tokio::test]
    async fn remote_dispatch_failure_closes_the_database() {
        let (db, thread) = open_db().await;
        db.inner.dispatcher.register(Arc::new(FailingReducer));

        let sink = DbSink {
            inner: Arc::downgrade(&db.inner),
        };
        let events = vec![Event {
            collection: "C1".into(),
            instance: InstanceId::new_random(),
            kind: EventKind::Create,
            time: braid_core::time::monotonic_nanos(),
            patch: Bytes::from_static(b"{}"),
        }];
        let log = LogKeypair::generate().id();
        let record = braid_core::content_cid(b"record");
        let result = braid_net::EventSink::deliver(&sink, &thread, &log, record, events).await;
        assert!(result.is_err());

        // the database entered the closed state; every operation refuses
        assert!(matches!(db.collection("C1"), Err(DbError::Closed)));
        assert!(matches!(db.write_txn().await, Err(DbError::Closed)));
        assert!(matches!(db.read_txn().await, Err(DbError::Closed)));
        assert!(matches!(db.listen(Vec::new()), Err(DbError::Closed)));
    }
}
