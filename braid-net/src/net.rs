//! The replication engine.
//!
//! One [`Net`] per node owns the per-peer connection cache, the two call
//! queues, the gossip consumer and the periodic edge-exchange loop. It is
//! shared by every database under a manager; databases attach themselves
//! per thread as [`EventSink`]s to receive remote events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use braid_core::{
    Event, LogId, LogInfo, LogKeypair, ReadKey, Record, ThreadAddr, ThreadId, ThreadInfo,
    ThreadKey,
};
use braid_core::BlockStore;
use cid::Cid;
use libp2p_identity::PeerId;
use multiaddr::{Multiaddr, Protocol};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::NetError;
use crate::queue::{CallPriority, CallQueue};
use crate::transport::{Connection, Gossip, Transport};

/// Deadline for dialing a peer.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for push-style calls.
pub const PUSH_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for pull-style calls.
pub const PULL_TIMEOUT: Duration = Duration::from_secs(10);

/// Tunables for the engine.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Period of the background edge-exchange loop.
    pub exchange_interval: Duration,
    /// Initial back-off before re-pulling after a gap, doubled per attempt.
    pub backfill_backoff: Duration,
    /// Pull attempts before a gap is reported.
    pub backfill_attempts: u32,
    /// Back-off applied to a peer after a signature failure.
    pub signature_backoff: Duration,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            exchange_interval: Duration::from_secs(5),
            backfill_backoff: Duration::from_millis(500),
            backfill_attempts: 3,
            signature_backoff: Duration::from_secs(30),
        }
    }
}

/// Receives decoded events of verified remote records, exactly once per
/// record, before the log head advances.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    /// Persist and apply the events. An error aborts record application
    /// and leaves the head unchanged.
    async fn deliver(
        &self,
        thread: &ThreadId,
        log: &LogId,
        record: Cid,
        events: Vec<Event>,
    ) -> anyhow::Result<()>;
}

pub(crate) struct NetInner {
    pub(crate) store: braid_store::Logstore,
    pub(crate) blocks: Arc<dyn BlockStore>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) gossip: Arc<dyn Gossip>,
    pub(crate) config: NetConfig,
    pub(crate) sinks: RwLock<HashMap<ThreadId, Arc<dyn EventSink>>>,
    pub(crate) conns: Mutex<HashMap<PeerId, Arc<dyn Connection>>>,
    pub(crate) queue_get_logs: CallQueue,
    pub(crate) queue_get_records: CallQueue,
    pub(crate) backoff: Mutex<HashMap<(PeerId, ThreadId), Instant>>,
    pub(crate) shutdown: watch::Sender<bool>,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to the replication engine. Cheap to clone.
#[derive(Clone)]
pub struct Net {
    pub(crate) inner: Arc<NetInner>,
}

impl std::fmt::Debug for Net {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Net({})", self.inner.transport.local_peer())
    }
}

impl Net {
    /// Start the engine and its background tasks.
    pub fn new(
        store: braid_store::Logstore,
        blocks: Arc<dyn BlockStore>,
        transport: Arc<dyn Transport>,
        gossip: Arc<dyn Gossip>,
        config: NetConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let net = Net {
            inner: Arc::new(NetInner {
                store,
                blocks,
                transport,
                gossip,
                config,
                sinks: RwLock::new(HashMap::new()),
                conns: Mutex::new(HashMap::new()),
                queue_get_logs: CallQueue::new(),
                queue_get_records: CallQueue::new(),
                backoff: Mutex::new(HashMap::new()),
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        };
        net.spawn_accept_loop();
        net.spawn_gossip_loop();
        net.spawn_exchange_loop();
        net.rejoin_topics();
        net
    }

    /// This node's peer identity.
    pub fn local_peer(&self) -> PeerId {
        self.inner.transport.local_peer()
    }

    /// Addresses this node is reachable at.
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.inner.transport.listen_addrs()
    }

    /// The shared log store.
    pub fn store(&self) -> &braid_store::Logstore {
        &self.inner.store
    }

    /// The shared block store.
    pub fn blocks(&self) -> &Arc<dyn BlockStore> {
        &self.inner.blocks
    }

    /// A dialable address for one of this node's threads.
    pub fn thread_addr(&self, thread: &ThreadId) -> Option<ThreadAddr> {
        let peer = self.local_peer();
        self.listen_addrs().into_iter().next().map(|addr| {
            let host: Multiaddr = addr
                .iter()
                .take_while(|proto| !matches!(proto, Protocol::P2p(_)))
                .collect();
            ThreadAddr::new(host, peer, thread.clone())
        })
    }

    /// Install a brand-new thread created by this peer.
    pub async fn create_thread(
        &self,
        thread: &ThreadId,
        key: ThreadKey,
    ) -> Result<ThreadInfo, NetError> {
        self.inner.store.add_thread(thread, &key)?;
        self.inner
            .gossip
            .join(&thread.to_bytes())
            .await
            .map_err(NetError::Other)?;
        Ok(self.inner.store.thread_info(thread)?)
    }

    /// Install a thread hosted by another peer: keys and gossip topic
    /// only. Requires the service key; the read key is optional
    /// (replicate-only follower otherwise). Call
    /// [`Net::bootstrap_thread`] once consumers (the database sink) are
    /// attached.
    pub async fn add_thread(
        &self,
        addr: &ThreadAddr,
        key: ThreadKey,
    ) -> Result<ThreadInfo, NetError> {
        self.inner.store.add_thread(&addr.thread, &key)?;
        self.inner
            .gossip
            .join(&addr.thread.to_bytes())
            .await
            .map_err(NetError::Other)?;
        Ok(self.inner.store.thread_info(&addr.thread)?)
    }

    /// Seed a joined thread's logs from its hosting peer, advertise this
    /// peer's own log, and pull records.
    pub async fn bootstrap_thread(&self, addr: &ThreadAddr) -> Result<(), NetError> {
        let mut host = addr.host.clone();
        host.push(Protocol::P2p(addr.peer));
        match self.get_logs(addr.peer, &[host], &addr.thread).await {
            Ok(logs) => {
                for log in logs {
                    self.inner.store.add_log(&addr.thread, &log)?;
                }
            }
            Err(err) => warn!("seeding logs from {} failed: {err}", addr.peer),
        }

        // create our own log up front and push it to the host, so other
        // followers learn this peer's address through the host's log set
        let own = match self.inner.store.own_log(&addr.thread)? {
            Some(own) => own,
            None => self.inner.store.create_own_log(
                &addr.thread,
                LogKeypair::generate(),
                self.listen_addrs(),
            )?,
        };
        if let Err(err) = self.push_log(addr.peer, &addr.thread, &own, false).await {
            warn!("advertising own log to {} failed: {err}", addr.peer);
        }

        self.schedule_update_records(addr.peer, addr.thread.clone(), CallPriority::High);
        Ok(())
    }

    /// Everything known locally about a thread.
    pub fn get_thread(&self, thread: &ThreadId) -> Result<ThreadInfo, NetError> {
        Ok(self.inner.store.thread_info(thread)?)
    }

    /// Leave a thread's gossip topic and drop its event sink, keeping all
    /// stored state. The thread can be re-attached later.
    pub async fn detach_thread(&self, thread: &ThreadId) -> Result<(), NetError> {
        self.inner
            .gossip
            .leave(&thread.to_bytes())
            .await
            .map_err(NetError::Other)?;
        self.inner.sinks.write().remove(thread);
        Ok(())
    }

    /// Detach from a thread and drop its book entries. Sealed records stay
    /// in the block store.
    pub async fn delete_thread(&self, thread: &ThreadId) -> Result<(), NetError> {
        self.inner
            .gossip
            .leave(&thread.to_bytes())
            .await
            .map_err(NetError::Other)?;
        self.inner.sinks.write().remove(thread);
        self.inner.store.delete_thread(thread)?;
        Ok(())
    }

    /// Attach the per-thread consumer of remote events.
    pub fn register_sink(&self, thread: &ThreadId, sink: Arc<dyn EventSink>) {
        self.inner.sinks.write().insert(thread.clone(), sink);
    }

    /// Detach a thread's event consumer.
    pub fn unregister_sink(&self, thread: &ThreadId) {
        self.inner.sinks.write().remove(thread);
    }

    /// Seal a new record onto this peer's own log and fan it out.
    ///
    /// The peer's log is created lazily on first append. The local head
    /// advances before the call returns; pushes to followers and the
    /// gossip publish run in the background.
    pub async fn create_record(
        &self,
        thread: &ThreadId,
        events: Vec<Event>,
    ) -> Result<Record, NetError> {
        let service_key = self
            .inner
            .store
            .service_key(thread)?
            .ok_or_else(|| NetError::ThreadNotFound(thread.clone()))?;
        let read_key = self
            .inner
            .store
            .read_key(thread)?
            .ok_or(NetError::Core(braid_core::Error::CannotRead))?;

        let own = match self.inner.store.own_log(thread)? {
            Some(log) => log,
            None => self.inner.store.create_own_log(
                thread,
                LogKeypair::generate(),
                self.listen_addrs(),
            )?,
        };
        let keypair = own
            .priv_key
            .clone()
            .ok_or(NetError::Core(braid_core::Error::InvalidKey))?;
        let prev = own.heads.first().copied();

        let record = Record::create(
            self.inner.blocks.as_ref(),
            &keypair,
            &service_key,
            &read_key,
            prev,
            &events,
        )
        .await?;
        self.inner
            .store
            .heads()
            .advance_head(thread, &own.id, prev, record.cid())?;
        debug!(%thread, log = %own.id, record = %record.cid(), "created record");

        let net = self.clone();
        let thread = thread.clone();
        let log = own.id;
        let pushed = record.clone();
        tokio::spawn(async move {
            if let Err(err) = net.push_record(&thread, &log, &pushed).await {
                warn!(%thread, %log, "record fan-out failed: {err:#}");
            }
        });
        Ok(record)
    }

    /// Ask every peer hosting this thread for newer records.
    pub async fn pull_thread(&self, thread: &ThreadId) -> Result<(), NetError> {
        let peers = self.thread_peers(thread)?;
        for peer in peers {
            self.schedule_update_records(peer, thread.clone(), CallPriority::High);
        }
        Ok(())
    }

    /// Shut down background tasks, waiting a bounded grace period.
    pub async fn close(&self) {
        let _ = self.inner.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(Duration::from_secs(5), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
        self.inner.conns.lock().clear();
    }

    /// Unique peers (never self) advertised across all logs of a thread.
    pub(crate) fn thread_peers(&self, thread: &ThreadId) -> Result<Vec<PeerId>, NetError> {
        let local = self.local_peer();
        let mut peers = Vec::new();
        for log in self.inner.store.logs(thread)? {
            for addr in self.inner.store.addrs().addrs(thread, &log)? {
                if let Some(peer) = addr_peer(&addr) {
                    if peer != local && !peers.contains(&peer) {
                        peers.push(peer);
                    }
                }
            }
        }
        Ok(peers)
    }

    /// Dial-hint addresses of one peer within one thread.
    pub(crate) fn peer_addrs(&self, thread: &ThreadId, peer: &PeerId) -> Vec<Multiaddr> {
        let mut out = Vec::new();
        if let Ok(logs) = self.inner.store.logs(thread) {
            for log in logs {
                if let Ok(addrs) = self.inner.store.addrs().addrs(thread, &log) {
                    for addr in addrs {
                        if addr_peer(&addr) == Some(*peer) && !out.contains(&addr) {
                            out.push(addr);
                        }
                    }
                }
            }
        }
        out
    }

    pub(crate) fn schedule_update_records(
        &self,
        peer: PeerId,
        thread: ThreadId,
        priority: CallPriority,
    ) {
        let net = self.clone();
        let accepted = self.inner.queue_get_records.schedule(
            peer,
            thread.clone(),
            priority,
            Arc::new(move |peer, thread| {
                let net = net.clone();
                Box::pin(async move { net.update_records_from_peer(peer, &thread).await })
            }),
        );
        if accepted {
            debug!(%peer, %thread, "record update scheduled");
        }
    }

    pub(crate) fn schedule_update_logs(
        &self,
        peer: PeerId,
        thread: ThreadId,
        priority: CallPriority,
    ) {
        let net = self.clone();
        let accepted = self.inner.queue_get_logs.schedule(
            peer,
            thread.clone(),
            priority,
            Arc::new(move |peer, thread| {
                let net = net.clone();
                Box::pin(async move { net.update_logs_from_peer(peer, &thread).await })
            }),
        );
        if accepted {
            debug!(%peer, %thread, "log update scheduled");
        }
    }

    /// Record a signature failure from a peer; pulls of this thread from
    /// them back off for a while.
    pub(crate) fn mark_signature_failure(&self, peer: PeerId, thread: &ThreadId) {
        let until = Instant::now() + self.inner.config.signature_backoff;
        self.inner
            .backoff
            .lock()
            .insert((peer, thread.clone()), until);
        warn!(%peer, %thread, "signature failure, backing off pulls");
    }

    pub(crate) fn in_backoff(&self, peer: PeerId, thread: &ThreadId) -> bool {
        let mut backoff = self.inner.backoff.lock();
        match backoff.get(&(peer, thread.clone())) {
            Some(until) if *until > Instant::now() => true,
            Some(_) => {
                backoff.remove(&(peer, thread.clone()));
                false
            }
            None => false,
        }
    }

    fn rejoin_topics(&self) {
        let net = self.clone();
        self.spawn(async move {
            match net.inner.store.threads() {
                Ok(threads) => {
                    for thread in threads {
                        if let Err(err) = net.inner.gossip.join(&thread.to_bytes()).await {
                            warn!(%thread, "rejoining gossip topic failed: {err:#}");
                        }
                    }
                }
                Err(err) => error!("enumerating threads for gossip rejoin failed: {err}"),
            }
        });
    }

    fn spawn_accept_loop(&self) {
        let net = self.clone();
        let mut incoming = self.inner.transport.incoming();
        let mut shutdown = self.inner.shutdown.subscribe();
        self.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    inbound = incoming.recv() => {
                        let Some(inbound) = inbound else { break };
                        let net = net.clone();
                        tokio::spawn(async move {
                            let reply = net.handle_request(inbound.from, inbound.request).await;
                            let _ = inbound.reply.send(reply);
                        });
                    }
                }
            }
            debug!("accept loop stopped");
        });
    }

    fn spawn_gossip_loop(&self) {
        let net = self.clone();
        let mut messages = self.inner.gossip.subscribe();
        let mut shutdown = self.inner.shutdown.subscribe();
        self.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    message = messages.recv() => {
                        match message {
                            Ok(message) => net.handle_gossip(message).await,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                                warn!("gossip consumer lagged, missed {missed} messages");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            debug!("gossip loop stopped");
        });
    }

    fn spawn_exchange_loop(&self) {
        let net = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        let interval = self.inner.config.exchange_interval;
        self.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = net.exchange_edges_with_all().await {
                            warn!("edge exchange round failed: {err:#}");
                        }
                    }
                }
            }
            debug!("exchange loop stopped");
        });
    }

    async fn exchange_edges_with_all(&self) -> Result<(), NetError> {
        let threads = self.inner.store.threads()?;
        if threads.is_empty() {
            return Ok(());
        }
        // group threads by the peers hosting them
        let mut by_peer: HashMap<PeerId, Vec<ThreadId>> = HashMap::new();
        for thread in &threads {
            for peer in self.thread_peers(thread)? {
                by_peer.entry(peer).or_default().push(thread.clone());
            }
        }
        for (peer, threads) in by_peer {
            let net = self.clone();
            tokio::spawn(async move {
                if let Err(err) = net.exchange_edges(peer, &threads).await {
                    debug!(%peer, "edge exchange failed: {err:#}");
                }
            });
        }
        Ok(())
    }

    pub(crate) fn spawn(&self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        self.inner.tasks.lock().push(tokio::spawn(task));
    }

    pub(crate) fn read_key_for(&self, thread: &ThreadId) -> Result<Option<ReadKey>, NetError> {
        Ok(self.inner.store.read_key(thread)?)
    }

    pub(crate) fn sink_for(&self, thread: &ThreadId) -> Option<Arc<dyn EventSink>> {
        self.inner.sinks.read().get(thread).cloned()
    }

    /// Install a log observed remotely, creating the external log entry on
    /// first use.
    pub(crate) fn install_log(&self, thread: &ThreadId, info: &LogInfo) -> Result<(), NetError> {
        self.inner.store.add_log(thread, info)?;
        Ok(())
    }
}

/// Extract the peer identity component of a multiaddress.
pub(crate) fn addr_peer(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|proto| match proto {
        Protocol::P2p(peer) => Some(peer),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_peer_extracts_p2p_component() {
        let keypair = libp2p_identity::Keypair::generate_ed25519();
        let peer = keypair.public().to_peer_id();
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/4006/p2p/{peer}").parse().unwrap();
        assert_eq!(addr_peer(&addr), Some(peer));
        let plain: Multiaddr = "/ip4/127.0.0.1/tcp/4006".parse().unwrap();
        assert_eq!(addr_peer(&plain), None);
    }
}
