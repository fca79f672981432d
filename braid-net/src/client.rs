//! Outbound calls: dialing, pushes, pulls and edge exchange.

use std::sync::Arc;
use std::time::Duration;

use braid_core::{LogId, LogInfo, Record, ThreadId};
use cid::Cid;
use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use tracing::{debug, warn};

use crate::error::NetError;
use crate::net::{Net, DIAL_TIMEOUT, PULL_TIMEOUT, PUSH_TIMEOUT};
use crate::proto::{
    encode_framed, ErrorCode, LogOffset, Reply, Request, ThreadEdges, WireLog, MAX_PULL_LIMIT,
};
use crate::queue::CallPriority;
use crate::transport::Connection;

impl Net {
    /// Dial a peer, reusing a cached connection when it is still live.
    pub(crate) async fn dial(
        &self,
        peer: PeerId,
        addrs: &[Multiaddr],
    ) -> Result<Arc<dyn Connection>, NetError> {
        if let Some(conn) = self.inner.conns.lock().get(&peer) {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
        }
        let conn = tokio::time::timeout(DIAL_TIMEOUT, self.inner.transport.dial(&peer, addrs))
            .await
            .map_err(|_| NetError::Timeout)?
            .map_err(|err| NetError::DialFailed(format!("{err:#}")))?;
        let conn: Arc<dyn Connection> = Arc::from(conn);
        self.inner.conns.lock().insert(peer, conn.clone());
        Ok(conn)
    }

    async fn request(
        &self,
        peer: PeerId,
        thread: &ThreadId,
        request: Request,
        deadline: Duration,
    ) -> Result<Reply, NetError> {
        let addrs = self.peer_addrs(thread, &peer);
        let conn = self.dial(peer, &addrs).await?;
        let reply = tokio::time::timeout(deadline, conn.request(request))
            .await
            .map_err(|_| NetError::Timeout)?;
        match reply {
            Ok(reply) => Ok(reply),
            Err(err) => {
                // a dead connection is evicted so the next call redials
                self.inner.conns.lock().remove(&peer);
                Err(NetError::DialFailed(format!("{err:#}")))
            }
        }
    }

    /// Fetch all logs of a thread from a peer.
    pub(crate) async fn get_logs(
        &self,
        peer: PeerId,
        dial_addrs: &[Multiaddr],
        thread: &ThreadId,
    ) -> Result<Vec<LogInfo>, NetError> {
        let service_key = self
            .inner
            .store
            .service_key(thread)?
            .ok_or_else(|| NetError::ThreadNotFound(thread.clone()))?;
        debug!(%peer, %thread, "getting logs");
        let conn = self.dial(peer, dial_addrs).await?;
        let reply = tokio::time::timeout(
            PULL_TIMEOUT,
            conn.request(Request::GetLogs {
                thread: thread.clone(),
                service_key: service_key.as_bytes().to_vec(),
            }),
        )
        .await
        .map_err(|_| NetError::Timeout)?
        .map_err(|err| NetError::DialFailed(format!("{err:#}")))?
        .into_result()?;
        match reply {
            Reply::Logs(logs) => {
                debug!(%peer, %thread, count = logs.len(), "received logs");
                logs.into_iter().map(WireLog::into_info).collect()
            }
            other => Err(NetError::Other(anyhow::anyhow!(
                "unexpected reply to get-logs: {other:?}"
            ))),
        }
    }

    /// Push a log description to a peer, seeding keys as permitted.
    pub(crate) async fn push_log(
        &self,
        peer: PeerId,
        thread: &ThreadId,
        log: &LogInfo,
        with_keys: bool,
    ) -> Result<(), NetError> {
        let (service_key, read_key) = if with_keys {
            (
                self.inner
                    .store
                    .service_key(thread)?
                    .map(|key| key.as_bytes().to_vec()),
                self.inner
                    .store
                    .read_key(thread)?
                    .map(|key| key.as_bytes().to_vec()),
            )
        } else {
            (None, None)
        };
        debug!(%peer, %thread, log = %log.id, "pushing log");
        let reply = self
            .request(
                peer,
                thread,
                Request::PushLog {
                    thread: thread.clone(),
                    log: WireLog::from_info(log),
                    service_key,
                    read_key,
                },
                PUSH_TIMEOUT,
            )
            .await?
            .into_result()?;
        match reply {
            Reply::Ok => Ok(()),
            other => Err(NetError::Other(anyhow::anyhow!(
                "unexpected reply to push-log: {other:?}"
            ))),
        }
    }

    /// Push a record to every known peer of its thread, then publish the
    /// same envelope on the thread's gossip topic.
    pub(crate) async fn push_record(
        &self,
        thread: &ThreadId,
        log: &LogId,
        record: &Record,
    ) -> Result<(), NetError> {
        let request = Request::PushRecord {
            thread: thread.clone(),
            log: *log,
            record: self.wire_record(record).await,
        };

        // direct pushes, concurrently
        for peer in self.thread_peers(thread)? {
            let net = self.clone();
            let request = request.clone();
            let thread = thread.clone();
            let log = *log;
            tokio::spawn(async move {
                if let Err(err) = net.push_record_to_peer(peer, &thread, &log, request).await {
                    warn!(%peer, %thread, %log, "pushing record failed: {err:#}");
                }
            });
        }

        // and the thread topic
        match encode_framed(&request) {
            Ok(framed) => {
                if let Err(err) = self.inner.gossip.publish(&thread.to_bytes(), framed).await {
                    warn!(%thread, "publishing record failed: {err:#}");
                }
            }
            Err(err) => warn!("encoding gossip envelope failed: {err:#}"),
        }
        Ok(())
    }

    /// One direct push, repairing an unknown log with a follow-up
    /// push-log.
    pub(crate) async fn push_record_to_peer(
        &self,
        peer: PeerId,
        thread: &ThreadId,
        log: &LogId,
        request: Request,
    ) -> Result<(), NetError> {
        let reply = self
            .request(peer, thread, request.clone(), PUSH_TIMEOUT)
            .await?;
        match reply {
            Reply::Ok => Ok(()),
            Reply::Error(ErrorCode::Unavailable) => {
                debug!(%peer, "unavailable, skip pushing the record");
                Ok(())
            }
            Reply::Error(ErrorCode::NotFound) => {
                // send the missing log, then retry the record once
                let info = self.inner.store.log_info(thread, log)?;
                self.push_log(peer, thread, &info, true).await?;
                let reply = self.request(peer, thread, request, PUSH_TIMEOUT).await?;
                match reply {
                    Reply::Ok => Ok(()),
                    other => Err(NetError::Other(anyhow::anyhow!(
                        "retry after push-log failed: {other:?}"
                    ))),
                }
            }
            Reply::Error(ErrorCode::Unauthenticated) => Err(NetError::Unauthenticated),
            other => Err(NetError::Other(anyhow::anyhow!(
                "unexpected reply to push-record: {other:?}"
            ))),
        }
    }

    /// Exchange per-thread edges with one peer and schedule follow-ups
    /// for any divergence.
    pub(crate) async fn exchange_edges(
        &self,
        peer: PeerId,
        threads: &[ThreadId],
    ) -> Result<(), NetError> {
        let mut entries = Vec::with_capacity(threads.len());
        for thread in threads {
            let addrs_edge = self.inner.store.addrs().addrs_edge(thread)?;
            let heads_edge = self.inner.store.heads().heads_edge(thread)?;
            entries.push(ThreadEdges {
                thread: thread.clone(),
                addrs_edge,
                heads_edge,
            });
        }
        if entries.is_empty() {
            return Ok(());
        }
        debug!(%peer, count = entries.len(), "exchanging edges");

        let sent: Vec<ThreadId> = entries.iter().map(|entry| entry.thread.clone()).collect();
        let reply = self
            .request(
                peer,
                &sent[0],
                Request::ExchangeEdges { threads: entries },
                PULL_TIMEOUT,
            )
            .await?;
        let reply = match reply.into_result() {
            Ok(reply) => reply,
            Err(NetError::Unimplemented) => {
                // fall back to pulling records for every thread we asked
                // about
                debug!(%peer, "edge exchange unimplemented, falling back to record pulls");
                for thread in sent {
                    self.schedule_update_records(peer, thread, CallPriority::Low);
                }
                return Ok(());
            }
            Err(NetError::Unavailable) => {
                debug!(%peer, "unavailable, skip edge exchange");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let Reply::Edges(edges) = reply else {
            return Err(NetError::Other(anyhow::anyhow!(
                "unexpected reply to exchange-edges"
            )));
        };

        for (thread, edge) in sent.into_iter().zip(edges) {
            if !edge.exists {
                // the responder doesn't know this thread; it seeds itself
                // from our next push
                continue;
            }
            // re-read local edges, possibly updated meanwhile
            let addrs_edge = self.inner.store.addrs().addrs_edge(&thread)?;
            let heads_edge = self.inner.store.heads().heads_edge(&thread)?;
            if edge.addrs_edge != addrs_edge {
                self.schedule_update_logs(peer, thread.clone(), CallPriority::Low);
            }
            if edge.heads_edge != heads_edge {
                self.schedule_update_records(peer, thread, CallPriority::Low);
            }
        }
        Ok(())
    }

    /// Refresh log descriptions (addresses, new logs) of a thread from a
    /// peer.
    pub(crate) async fn update_logs_from_peer(
        &self,
        peer: PeerId,
        thread: &ThreadId,
    ) -> anyhow::Result<()> {
        let addrs = self.peer_addrs(thread, &peer);
        let logs = self.get_logs(peer, &addrs, thread).await?;
        for log in logs {
            self.install_log(thread, &log)?;
        }
        Ok(())
    }

    /// Pull newer records of every log of a thread from a peer and apply
    /// them in chain order. Retries with widening offsets when a pulled
    /// segment does not chain onto the local head.
    pub(crate) async fn update_records_from_peer(
        &self,
        peer: PeerId,
        thread: &ThreadId,
    ) -> anyhow::Result<()> {
        if self.in_backoff(peer, thread) {
            debug!(%peer, %thread, "pull skipped, peer in back-off");
            return Ok(());
        }

        let mut delay = self.inner.config.backfill_backoff;
        for attempt in 0..self.inner.config.backfill_attempts {
            // first attempt: pull from current heads; later attempts widen
            // to the full chain to close gaps
            let from_heads = attempt == 0;
            match self.pull_records_once(peer, thread, from_heads).await {
                Ok(()) => return Ok(()),
                Err(NetError::Gap { log }) => {
                    debug!(%peer, %thread, %log, attempt, "gap while pulling, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(NetError::Gap {
            log: *self
                .inner
                .store
                .logs(thread)?
                .first()
                .ok_or_else(|| anyhow::anyhow!("no logs for thread {thread}"))?,
        }
        .into())
    }

    async fn pull_records_once(
        &self,
        peer: PeerId,
        thread: &ThreadId,
        from_heads: bool,
    ) -> Result<(), NetError> {
        let service_key = self
            .inner
            .store
            .service_key(thread)?
            .ok_or_else(|| NetError::ThreadNotFound(thread.clone()))?;

        let mut offsets = Vec::new();
        if from_heads {
            for log in self.inner.store.logs(thread)? {
                let head = self
                    .inner
                    .store
                    .heads()
                    .heads(thread, &log)?
                    .first()
                    .map(Cid::to_bytes);
                offsets.push(LogOffset {
                    log,
                    offset: head,
                    limit: MAX_PULL_LIMIT,
                });
            }
        }

        let reply = self
            .request(
                peer,
                thread,
                Request::GetRecords {
                    thread: thread.clone(),
                    service_key: service_key.as_bytes().to_vec(),
                    logs: offsets,
                },
                PULL_TIMEOUT,
            )
            .await?
            .into_result()?;
        let Reply::Records(logs) = reply else {
            return Err(NetError::Other(anyhow::anyhow!(
                "unexpected reply to get-records"
            )));
        };

        let mut gap = None;
        for entry in logs {
            if let Some(info) = entry.info {
                match info.into_info() {
                    Ok(info) => self.install_log(thread, &info)?,
                    Err(err) => {
                        warn!(%peer, %thread, "undecodable log in pull reply: {err}");
                        continue;
                    }
                }
            }
            let Some(pub_key) = self.inner.store.keys().public_key(thread, &entry.log)? else {
                // cannot verify received records
                debug!(%thread, log = %entry.log, "skipping records for key-less log");
                continue;
            };

            debug!(%peer, %thread, log = %entry.log, count = entry.records.len(), "received records");
            for wire in entry.records {
                let record = Record::from_sealed(&service_key, wire.sealed.clone())?;
                if self.inner.blocks.has(&record.cid()).await? {
                    continue; // deduplicated by content address
                }
                if record.verify(&pub_key).is_err() {
                    self.mark_signature_failure(peer, thread);
                    return Err(NetError::Core(braid_core::Error::InvalidSignature));
                }
                self.install_companion_blocks(&record, &wire).await?;
                match self.apply_record(thread, &entry.log, &record).await {
                    Ok(()) => {}
                    Err(NetError::Gap { log }) => {
                        gap = Some(log);
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        match gap {
            Some(log) => Err(NetError::Gap { log }),
            None => Ok(()),
        }
    }
}
