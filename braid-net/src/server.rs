//! Inbound request handling and the record application pipeline.

use braid_core::{content_cid, LogId, Record, ThreadId};
use bytes::Bytes;
use cid::Cid;
use libp2p_identity::PeerId;
use tracing::{debug, error, warn};

use crate::error::NetError;
use crate::net::Net;
use crate::proto::{
    decode_framed, EdgeReply, ErrorCode, LogOffset, LogRecords, Reply, Request, ThreadEdges,
    WireLog, WireRecord, MAX_PULL_LIMIT,
};
use crate::queue::CallPriority;
use crate::transport::GossipMessage;

impl Net {
    /// Dispatch one inbound request to its handler.
    pub(crate) async fn handle_request(&self, from: PeerId, request: Request) -> Reply {
        match request {
            Request::GetLogs {
                thread,
                service_key,
            } => self.handle_get_logs(from, thread, service_key),
            Request::PushLog {
                thread,
                log,
                service_key,
                read_key,
            } => self.handle_push_log(from, thread, log, service_key, read_key).await,
            Request::GetRecords {
                thread,
                service_key,
                logs,
            } => self.handle_get_records(from, thread, service_key, logs).await,
            Request::PushRecord {
                thread,
                log,
                record,
            } => self.handle_push_record(from, thread, log, record).await,
            Request::ExchangeEdges { threads } => self.handle_exchange_edges(from, threads),
        }
    }

    /// Records received over gossip run through the same path as direct
    /// pushes; duplicates are no-ops.
    pub(crate) async fn handle_gossip(&self, message: GossipMessage) {
        if message.from == self.local_peer() {
            return;
        }
        let request: Request = match decode_framed(message.data) {
            Ok(request) => request,
            Err(err) => {
                warn!(from = %message.from, "undecodable gossip payload: {err:#}");
                return;
            }
        };
        match request {
            Request::PushRecord { .. } => {
                // This will be "log not found" when the record beats the
                // log over gossip; the log arrives directly afterwards.
                if let Reply::Error(code) = self.handle_request(message.from, request).await {
                    debug!(from = %message.from, ?code, "gossip record not applied");
                }
            }
            other => warn!(from = %message.from, "unexpected gossip request: {other:?}"),
        }
    }

    fn handle_get_logs(&self, from: PeerId, thread: ThreadId, service_key: Vec<u8>) -> Reply {
        debug!(%from, %thread, "received get-logs request");
        match self.check_service_key(&thread, &service_key) {
            Ok(()) => {}
            Err(reply) => return reply,
        }
        match self.inner.store.thread_info(&thread) {
            Ok(info) => Reply::Logs(info.logs.iter().map(WireLog::from_info).collect()),
            Err(braid_store::StoreError::ThreadNotFound) => Reply::Error(ErrorCode::NotFound),
            Err(err) => {
                error!(%thread, "reading thread info failed: {err}");
                Reply::Error(ErrorCode::Unavailable)
            }
        }
    }

    async fn handle_push_log(
        &self,
        from: PeerId,
        thread: ThreadId,
        log: WireLog,
        service_key: Option<Vec<u8>>,
        read_key: Option<Vec<u8>>,
    ) -> Reply {
        debug!(%from, %thread, "received push-log request");
        // pick up missing keys
        let known = match self.inner.store.service_key(&thread) {
            Ok(known) => known,
            Err(err) => {
                error!(%thread, "reading service key failed: {err}");
                return Reply::Error(ErrorCode::Unavailable);
            }
        };
        let newly_installed = known.is_none();
        if newly_installed {
            let Some(raw) = service_key else {
                return Reply::Error(ErrorCode::NotFound);
            };
            let Ok(key) = braid_core::ServiceKey::from_bytes(&raw) else {
                return Reply::Error(ErrorCode::Unauthenticated);
            };
            if let Err(err) = self.inner.store.keys().add_service_key(&thread, &key) {
                error!(%thread, "installing service key failed: {err}");
                return Reply::Error(ErrorCode::Unavailable);
            }
            if let Err(err) = self.inner.gossip.join(&thread.to_bytes()).await {
                warn!(%thread, "joining gossip topic failed: {err:#}");
            }
        }
        match self.inner.store.read_key(&thread) {
            Ok(None) => {
                if let Some(raw) = read_key {
                    match braid_core::ReadKey::from_bytes(&raw) {
                        Ok(key) => {
                            if let Err(err) = self.inner.store.keys().add_read_key(&thread, &key) {
                                error!(%thread, "installing read key failed: {err}");
                                return Reply::Error(ErrorCode::Unavailable);
                            }
                        }
                        Err(_) => return Reply::Error(ErrorCode::Unauthenticated),
                    }
                }
            }
            Ok(Some(_)) => {}
            Err(err) => {
                error!(%thread, "reading read key failed: {err}");
                return Reply::Error(ErrorCode::Unavailable);
            }
        }

        let info = match log.into_info() {
            Ok(info) => info,
            Err(err) => {
                warn!(%from, %thread, "undecodable pushed log: {err}");
                return Reply::Error(ErrorCode::Unauthenticated);
            }
        };
        if let Err(err) = self.install_log(&thread, &info) {
            error!(%thread, "installing pushed log failed: {err}");
            return Reply::Error(ErrorCode::Unavailable);
        }

        let priority = if newly_installed {
            CallPriority::High
        } else {
            CallPriority::Low
        };
        self.schedule_update_records(from, thread, priority);
        Reply::Ok
    }

    async fn handle_get_records(
        &self,
        from: PeerId,
        thread: ThreadId,
        service_key: Vec<u8>,
        offsets: Vec<LogOffset>,
    ) -> Reply {
        debug!(%from, %thread, "received get-records request");
        match self.check_service_key(&thread, &service_key) {
            Ok(()) => {}
            Err(reply) => return reply,
        }

        // fast path: the requester's offsets already match our heads
        match self.offsets_match_heads(&thread, &offsets) {
            Ok(true) => return Reply::Records(Vec::new()),
            Ok(false) => {}
            Err(err) => {
                error!(%thread, "computing heads edge failed: {err}");
                return Reply::Error(ErrorCode::Unavailable);
            }
        }

        let info = match self.inner.store.thread_info(&thread) {
            Ok(info) => info,
            Err(braid_store::StoreError::ThreadNotFound) => {
                return Reply::Error(ErrorCode::NotFound)
            }
            Err(err) => {
                error!(%thread, "reading thread info failed: {err}");
                return Reply::Error(ErrorCode::Unavailable);
            }
        };
        if info.logs.is_empty() {
            return Reply::Records(Vec::new());
        }
        let per_log_limit = MAX_PULL_LIMIT / info.logs.len();

        let mut reply = Vec::with_capacity(info.logs.len());
        for log in &info.logs {
            let requested = offsets.iter().find(|entry| entry.log == log.id);
            let (offset, limit, wire_log) = match requested {
                Some(entry) => {
                    let offset = match entry.offset.as_deref().map(Cid::try_from) {
                        Some(Ok(cid)) => Some(cid),
                        Some(Err(_)) => return Reply::Error(ErrorCode::Unauthenticated),
                        None => None,
                    };
                    (offset, entry.limit.min(per_log_limit), None)
                }
                // the requester does not know this log; send its info too
                None => (None, per_log_limit, Some(WireLog::from_info(log))),
            };

            let records = match self
                .local_records(&thread, &log.id, offset, limit)
                .await
            {
                Ok(records) => records,
                Err(err) => {
                    error!(%thread, log = %log.id, "reading local records failed: {err}");
                    continue;
                }
            };
            if records.is_empty() && wire_log.is_none() {
                // do not include empty logs in the reply
                continue;
            }
            let mut wire_records = Vec::with_capacity(records.len());
            for record in &records {
                wire_records.push(self.wire_record(record).await);
            }
            debug!(%thread, log = %log.id, count = wire_records.len(), "sending records");
            reply.push(LogRecords {
                log: log.id,
                records: wire_records,
                info: wire_log,
            });
        }
        Reply::Records(reply)
    }

    async fn handle_push_record(
        &self,
        from: PeerId,
        thread: ThreadId,
        log: LogId,
        record: WireRecord,
    ) -> Reply {
        debug!(%from, %thread, %log, "received push-record request");
        // a known log is required to accept new records
        let pub_key = match self.inner.store.keys().public_key(&thread, &log) {
            Ok(Some(key)) => key,
            Ok(None) => return Reply::Error(ErrorCode::NotFound),
            Err(err) => {
                error!(%thread, %log, "reading log key failed: {err}");
                return Reply::Error(ErrorCode::Unavailable);
            }
        };
        let Some(service_key) = self.service_key_or_none(&thread) else {
            return Reply::Error(ErrorCode::NotFound);
        };

        let decoded = match Record::from_sealed(&service_key, record.sealed.clone()) {
            Ok(decoded) => decoded,
            Err(_) => return Reply::Error(ErrorCode::Unauthenticated),
        };
        match self.inner.blocks.has(&decoded.cid()).await {
            Ok(true) => return Reply::Ok, // idempotent duplicate
            Ok(false) => {}
            Err(err) => {
                error!("block store failure: {err}");
                return Reply::Error(ErrorCode::Unavailable);
            }
        }
        if decoded.verify(&pub_key).is_err() {
            self.mark_signature_failure(from, &thread);
            return Reply::Error(ErrorCode::Unauthenticated);
        }

        if let Err(err) = self.install_companion_blocks(&decoded, &record).await {
            error!("storing record blocks failed: {err}");
            return Reply::Error(ErrorCode::Unavailable);
        }

        match self.apply_record(&thread, &log, &decoded).await {
            Ok(()) => Reply::Ok,
            Err(NetError::Gap { .. }) => {
                // keep the record; back-fill the missing range from the
                // sender and let the pull re-apply everything in order
                debug!(%thread, %log, "pushed record does not chain, scheduling back-fill");
                self.schedule_update_records(from, thread, CallPriority::High);
                Reply::Ok
            }
            Err(NetError::Dispatch(err)) => {
                // the sink has closed its database; the head stays put
                error!(%thread, %log, "event dispatch failed, database closed: {err}");
                Reply::Error(ErrorCode::Unavailable)
            }
            Err(err) => {
                warn!(%thread, %log, "record application failed: {err}");
                Reply::Error(ErrorCode::Unavailable)
            }
        }
    }

    fn handle_exchange_edges(&self, from: PeerId, threads: Vec<ThreadEdges>) -> Reply {
        debug!(%from, count = threads.len(), "received exchange-edges request");
        let mut edges = Vec::with_capacity(threads.len());
        for entry in threads {
            let exists = matches!(self.inner.store.service_key(&entry.thread), Ok(Some(_)));
            if !exists {
                // requested thread doesn't exist locally; the requester
                // seeds it with a later push-log
                edges.push(EdgeReply {
                    thread: entry.thread,
                    exists: false,
                    addrs_edge: 0,
                    heads_edge: 0,
                });
                continue;
            }
            let (addrs_edge, heads_edge) = match (
                self.inner.store.addrs().addrs_edge(&entry.thread),
                self.inner.store.heads().heads_edge(&entry.thread),
            ) {
                (Ok(addrs_edge), Ok(heads_edge)) => (addrs_edge, heads_edge),
                (addrs, heads) => {
                    error!(thread = %entry.thread, ?addrs, ?heads, "computing local edges failed");
                    continue;
                }
            };
            if addrs_edge != entry.addrs_edge {
                self.schedule_update_logs(from, entry.thread.clone(), CallPriority::Low);
            }
            if heads_edge != entry.heads_edge {
                self.schedule_update_records(from, entry.thread.clone(), CallPriority::Low);
            }
            edges.push(EdgeReply {
                thread: entry.thread,
                exists: true,
                addrs_edge,
                heads_edge,
            });
        }
        Reply::Edges(edges)
    }

    /// Apply a verified record whose companion blocks are installed:
    /// deliver events (when readable and a database is attached), persist
    /// the sealed record, then advance the head.
    pub(crate) async fn apply_record(
        &self,
        thread: &ThreadId,
        log: &LogId,
        record: &Record,
    ) -> Result<(), NetError> {
        let heads = self.inner.store.heads().heads(thread, log)?;
        let chains = match record.prev() {
            Some(prev) => heads.contains(&prev),
            None => true, // a genesis record is always acceptable; a second one forms a concurrent head
        };
        if !chains {
            return Err(NetError::Gap { log: *log });
        }

        if let Some(read_key) = self.read_key_for(thread)? {
            if let Some(sink) = self.sink_for(thread) {
                // the body block normally travels with the record; retry
                // briefly in case a concurrent install has not landed yet
                let mut delay = self.inner.config.backfill_backoff;
                let mut attempt = 0;
                let events = loop {
                    match record
                        .open_events(self.inner.blocks.as_ref(), &read_key)
                        .await
                    {
                        Ok(events) => break events,
                        Err(braid_core::Error::BlockNotFound(cid))
                            if attempt + 1 < self.inner.config.backfill_attempts =>
                        {
                            debug!(%cid, attempt, "event block not yet available, retrying");
                            tokio::time::sleep(delay).await;
                            delay *= 2;
                            attempt += 1;
                        }
                        Err(err) => return Err(err.into()),
                    }
                };
                sink.deliver(thread, log, record.cid(), events)
                    .await
                    .map_err(|err| NetError::Dispatch(format!("{err:#}")))?;
            }
        }

        self.inner.blocks.put(record.sealed().clone()).await?;
        self.inner
            .store
            .heads()
            .advance_head(thread, log, record.prev(), record.cid())?;
        debug!(%thread, %log, record = %record.cid(), "head advanced");
        Ok(())
    }

    /// Store a wire record's header and body blocks after checking they
    /// match the envelope's content addresses.
    pub(crate) async fn install_companion_blocks(
        &self,
        record: &Record,
        wire: &WireRecord,
    ) -> Result<(), NetError> {
        if let Some(header) = &wire.header {
            if content_cid(header) == record.header_cid() {
                self.inner.blocks.put(header.clone()).await?;
            } else {
                warn!(record = %record.cid(), "dropping header block with mismatched address");
            }
        }
        if let Some(body) = &wire.body {
            if content_cid(body) == record.body_cid() {
                self.inner.blocks.put(body.clone()).await?;
            } else {
                warn!(record = %record.cid(), "dropping body block with mismatched address");
            }
        }
        Ok(())
    }

    /// Build the wire form of a record, embedding its companion blocks.
    pub(crate) async fn wire_record(&self, record: &Record) -> WireRecord {
        let header = self
            .inner
            .blocks
            .get(&record.header_cid())
            .await
            .ok()
            .flatten();
        let body = self.inner.blocks.get(&record.body_cid()).await.ok().flatten();
        WireRecord {
            sealed: record.sealed().clone(),
            header,
            body,
        }
    }

    /// The chain segment of a log strictly after `offset`, oldest first,
    /// capped to the newest-to-oldest walk of `limit` entries.
    pub async fn local_records(
        &self,
        thread: &ThreadId,
        log: &LogId,
        offset: Option<Cid>,
        limit: usize,
    ) -> Result<Vec<Record>, NetError> {
        let Some(service_key) = self.service_key_or_none(thread) else {
            return Err(NetError::ThreadNotFound(thread.clone()));
        };
        let mut out = Vec::new();
        for head in self.inner.store.heads().heads(thread, log)? {
            let mut cursor = Some(head);
            let mut segment: Vec<Record> = Vec::new();
            while let Some(cid) = cursor {
                if Some(cid) == offset {
                    break;
                }
                let Some(sealed) = self.inner.blocks.get(&cid).await? else {
                    warn!(%thread, %log, %cid, "record block missing while walking chain");
                    break;
                };
                let record = Record::from_sealed(&service_key, sealed)?;
                cursor = record.prev();
                segment.push(record);
            }
            segment.reverse();
            if segment.len() > limit {
                segment.truncate(limit);
            }
            out.extend(segment);
        }
        Ok(out)
    }

    fn offsets_match_heads(
        &self,
        thread: &ThreadId,
        offsets: &[LogOffset],
    ) -> Result<bool, NetError> {
        let mut entries = Vec::new();
        for entry in offsets {
            if let Some(offset) = &entry.offset {
                let mut bytes = entry.log.to_bytes();
                bytes.extend_from_slice(offset);
                entries.push(bytes);
            }
        }
        if entries.is_empty() {
            return Ok(false);
        }
        let request_edge = braid_store::edges::digest(entries);
        Ok(request_edge == self.inner.store.heads().heads_edge(thread)?)
    }

    fn check_service_key(&self, thread: &ThreadId, presented: &[u8]) -> Result<(), Reply> {
        match self.inner.store.service_key(thread) {
            Ok(Some(known)) if known.as_bytes().as_slice() == presented => Ok(()),
            Ok(Some(_)) => Err(Reply::Error(ErrorCode::Unauthenticated)),
            Ok(None) => Err(Reply::Error(ErrorCode::NotFound)),
            Err(err) => {
                error!(%thread, "reading service key failed: {err}");
                Err(Reply::Error(ErrorCode::Unavailable))
            }
        }
    }

    fn service_key_or_none(&self, thread: &ThreadId) -> Option<braid_core::ServiceKey> {
        self.inner.store.service_key(thread).ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_core::{Event, EventKind, InstanceId, ThreadKey, Variant};
    use bytes::Bytes;
    use std::sync::Arc;

    use crate::mem::MemNetwork;
    use crate::net::{Net, NetConfig};

    fn node(network: &MemNetwork) -> Net {
        let keypair = libp2p_identity::Keypair::generate_ed25519();
        let peer = keypair.public().to_peer_id();
        let (transport, gossip) = network.attach(peer);
        let store = braid_store::Logstore::new(braid_store::Datastore::memory().unwrap());
        Net::new(
            store,
            Arc::new(braid_core::MemBlockStore::new()),
            Arc::new(transport),
            Arc::new(gossip),
            NetConfig::default(),
        )
    }

    fn events() -> Vec<Event> {
        vec![Event {
            collection: "books".into(),
            instance: InstanceId::new_random(),
            kind: EventKind::Create,
            time: braid_core::time::monotonic_nanos(),
            patch: Bytes::from_static(b"{}"),
        }]
    }

    #[tokio::test]
    async fn get_logs_requires_matching_service_key() {
        let network = MemNetwork::new();
        let net = node(&network);
        let thread = ThreadId::new(Variant::Raw);
        let key = ThreadKey::generate();
        net.create_thread(&thread, key.clone()).await.unwrap();
        net.create_record(&thread, events()).await.unwrap();

        let from = libp2p_identity::Keypair::generate_ed25519()
            .public()
            .to_peer_id();
        let ok = net
            .handle_request(
                from,
                Request::GetLogs {
                    thread: thread.clone(),
                    service_key: key.service().as_bytes().to_vec(),
                },
            )
            .await;
        assert!(matches!(ok, Reply::Logs(logs) if logs.len() == 1));

        let bad = net
            .handle_request(
                from,
                Request::GetLogs {
                    thread,
                    service_key: vec![0u8; 32],
                },
            )
            .await;
        assert!(matches!(bad, Reply::Error(ErrorCode::Unauthenticated)));
    }

    #[tokio::test]
    async fn push_record_for_unknown_log_is_not_found() {
        let network = MemNetwork::new();
        let alice = node(&network);
        let bob = node(&network);
        let thread = ThreadId::new(Variant::Raw);
        let key = ThreadKey::generate();
        alice.create_thread(&thread, key.clone()).await.unwrap();
        bob.create_thread(&thread, key).await.unwrap();

        let record = alice.create_record(&thread, events()).await.unwrap();
        let log = alice
            .store()
            .own_log(&thread)
            .unwrap()
            .expect("own log exists")
            .id;

        let reply = bob
            .handle_request(
                alice.local_peer(),
                Request::PushRecord {
                    thread,
                    log,
                    record: alice.wire_record(&record).await,
                },
            )
            .await;
        assert!(matches!(reply, Reply::Error(ErrorCode::NotFound)));
    }

    #[tokio::test]
    async fn matching_edges_schedule_no_follow_up() {
        let network = MemNetwork::new();
        let net = node(&network);
        let thread = ThreadId::new(Variant::Raw);
        net.create_thread(&thread, ThreadKey::generate())
            .await
            .unwrap();
        net.create_record(&thread, events()).await.unwrap();

        let entry = ThreadEdges {
            thread: thread.clone(),
            addrs_edge: net.store().addrs().addrs_edge(&thread).unwrap(),
            heads_edge: net.store().heads().heads_edge(&thread).unwrap(),
        };
        let from = libp2p_identity::Keypair::generate_ed25519()
            .public()
            .to_peer_id();
        let reply = net
            .handle_request(from, Request::ExchangeEdges { threads: vec![entry] })
            .await;
        match reply {
            Reply::Edges(edges) => {
                assert!(edges[0].exists);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        // identical edges on both sides: nothing gets queued
        assert!(net.inner.queue_get_logs.is_idle());
        assert!(net.inner.queue_get_records.is_idle());
    }

    #[tokio::test]
    async fn get_records_fast_path_on_matching_heads() {
        let network = MemNetwork::new();
        let net = node(&network);
        let thread = ThreadId::new(Variant::Raw);
        let key = ThreadKey::generate();
        net.create_thread(&thread, key.clone()).await.unwrap();
        let record = net.create_record(&thread, events()).await.unwrap();
        let log = net.store().own_log(&thread).unwrap().unwrap().id;

        let from = libp2p_identity::Keypair::generate_ed25519()
            .public()
            .to_peer_id();
        let reply = net
            .handle_request(
                from,
                Request::GetRecords {
                    thread,
                    service_key: key.service().as_bytes().to_vec(),
                    logs: vec![LogOffset {
                        log,
                        offset: Some(record.cid().to_bytes()),
                        limit: MAX_PULL_LIMIT,
                    }],
                },
            )
            .await;
        assert!(matches!(reply, Reply::Records(logs) if logs.is_empty()));
    }
}
