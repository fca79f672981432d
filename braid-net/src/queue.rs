//! Per-(peer, thread) call queues with two-level priority.
//!
//! At most one call is in flight per key. One further call may be pending:
//! a higher-priority arrival supersedes a pending lower-priority one, and
//! a duplicate at equal (or lower) priority is dropped, since the pending
//! call will refresh the same state anyway. Direct [`CallQueue::call`]
//! waits for the slot instead of being dropped.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use braid_core::ThreadId;
use libp2p_identity::PeerId;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Scheduling priority of a queued call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CallPriority {
    /// Background refresh; droppable.
    Low,
    /// User- or protocol-driven; supersedes pending background work.
    High,
}

/// The deferred call shape: `(peer, thread) -> result`.
pub type CallFn = Arc<
    dyn Fn(PeerId, ThreadId) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send
        + Sync,
>;

#[derive(Default)]
struct Slot {
    running: bool,
    pending: Option<(CallPriority, CallFn)>,
    notify: Arc<Notify>,
}

/// One queue instance; the engine keeps one for `GetLogs` and one for
/// `GetRecords`.
#[derive(Clone, Default)]
pub struct CallQueue {
    slots: Arc<Mutex<HashMap<(PeerId, ThreadId), Slot>>>,
}

impl std::fmt::Debug for CallQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CallQueue({} slots)", self.slots.lock().len())
    }
}

impl CallQueue {
    /// A fresh queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when nothing is running or parked.
    pub fn is_idle(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Schedule a call, returning true if it was accepted (immediately
    /// started or parked as the pending entry).
    pub fn schedule(
        &self,
        peer: PeerId,
        thread: ThreadId,
        priority: CallPriority,
        call: CallFn,
    ) -> bool {
        let key = (peer, thread.clone());
        let mut slots = self.slots.lock();
        let slot = slots.entry(key.clone()).or_default();
        if slot.running {
            match &slot.pending {
                Some((pending, _)) if *pending >= priority => {
                    debug!(%peer, %thread, "dropping duplicate queued call");
                    false
                }
                _ => {
                    slot.pending = Some((priority, call));
                    true
                }
            }
        } else {
            slot.running = true;
            drop(slots);
            self.spawn_runner(key, call);
            true
        }
    }

    /// Run a call directly, waiting for the key's slot to free up first.
    pub async fn call<F, Fut>(&self, peer: PeerId, thread: ThreadId, f: F) -> anyhow::Result<()>
    where
        F: FnOnce(PeerId, ThreadId) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let key = (peer, thread.clone());
        loop {
            let waiter = {
                let mut slots = self.slots.lock();
                let slot = slots.entry(key.clone()).or_default();
                if !slot.running {
                    slot.running = true;
                    None
                } else {
                    Some(slot.notify.clone())
                }
            };
            match waiter {
                None => {
                    let result = f(peer, thread).await;
                    self.release(&key);
                    return result;
                }
                Some(notify) => notify.notified().await,
            }
        }
    }

    fn spawn_runner(&self, key: (PeerId, ThreadId), call: CallFn) {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut current = call;
            loop {
                let (peer, thread) = (key.0, key.1.clone());
                if let Err(err) = current(peer, thread).await {
                    warn!(peer = %key.0, thread = %key.1, "queued call failed: {err:#}");
                }
                match queue.take_pending(&key) {
                    Some(next) => current = next,
                    None => break,
                }
            }
        });
    }

    fn take_pending(&self, key: &(PeerId, ThreadId)) -> Option<CallFn> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(key)?;
        match slot.pending.take() {
            Some((_, next)) => Some(next),
            None => {
                let notify = slot.notify.clone();
                slots.remove(key);
                notify.notify_waiters();
                None
            }
        }
    }

    fn release(&self, key: &(PeerId, ThreadId)) {
        // direct calls do not drain pending entries themselves; hand the
        // slot to a runner if anything is parked
        let next = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(key) else {
                return;
            };
            match slot.pending.take() {
                Some((_, next)) => Some(next),
                None => {
                    let notify = slot.notify.clone();
                    slots.remove(key);
                    notify.notify_waiters();
                    None
                }
            }
        };
        if let Some(next) = next {
            self.spawn_runner(key.clone(), next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn peer() -> PeerId {
        libp2p_identity::Keypair::generate_ed25519()
            .public()
            .to_peer_id()
    }

    fn counted(counter: Arc<AtomicUsize>, delay: Duration) -> CallFn {
        Arc::new(move |_, _| {
            let counter = counter.clone();
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn runs_scheduled_calls() {
        let queue = CallQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let thread = ThreadId::new(braid_core::Variant::Raw);
        assert!(queue.schedule(
            peer(),
            thread,
            CallPriority::Low,
            counted(counter.clone(), Duration::ZERO),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_pending_is_dropped_and_high_supersedes() {
        let queue = CallQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let thread = ThreadId::new(braid_core::Variant::Raw);
        let key_peer = peer();

        // occupy the slot
        assert!(queue.schedule(
            key_peer,
            thread.clone(),
            CallPriority::Low,
            counted(counter.clone(), Duration::from_millis(100)),
        ));
        // park a low-priority call
        assert!(queue.schedule(
            key_peer,
            thread.clone(),
            CallPriority::Low,
            counted(counter.clone(), Duration::ZERO),
        ));
        // an equal-priority duplicate is dropped
        assert!(!queue.schedule(
            key_peer,
            thread.clone(),
            CallPriority::Low,
            counted(counter.clone(), Duration::ZERO),
        ));
        // a high-priority call supersedes the pending low one
        assert!(queue.schedule(
            key_peer,
            thread.clone(),
            CallPriority::High,
            counted(counter.clone(), Duration::ZERO),
        ));
        // and a further high-priority duplicate is dropped
        assert!(!queue.schedule(
            key_peer,
            thread,
            CallPriority::High,
            counted(counter.clone(), Duration::ZERO),
        ));

        tokio::time::sleep(Duration::from_millis(300)).await;
        // first call + the superseding high call
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn independent_keys_run_concurrently() {
        let queue = CallQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let thread = ThreadId::new(braid_core::Variant::Raw);
        for _ in 0..4 {
            assert!(queue.schedule(
                peer(),
                thread.clone(),
                CallPriority::Low,
                counted(counter.clone(), Duration::from_millis(50)),
            ));
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn direct_call_waits_for_slot() {
        let queue = CallQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let thread = ThreadId::new(braid_core::Variant::Raw);
        let key_peer = peer();

        queue.schedule(
            key_peer,
            thread.clone(),
            CallPriority::High,
            counted(counter.clone(), Duration::from_millis(80)),
        );
        let called = counter.clone();
        queue
            .call(key_peer, thread, |_, _| async move {
                called.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
