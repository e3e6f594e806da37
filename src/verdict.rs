use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use fnv::{FnvHashMap, FnvHashSet};
use tokio::sync::Notify;
use tracing::{debug, info, instrument};

use crate::clock::now_us;
use crate::pool::UpstreamPool;

/// Diagnostic record for one malicious verdict (§3: `warning_meta`).
#[derive(Debug, Clone, Copy)]
pub struct WarningMeta {
    pub arrived_us: i64,
    pub sequence: u64,
    pub completed_us: Option<i64>,
}

/// The subset of a transaction's state the verdict channel needs to observe
/// and mutate concurrently with the task driving that transaction. Kept
/// separate from [`crate::txn::Transaction`] so the buffers and stage enum
/// never need to cross a lock.
pub struct TxnHandle {
    pub id: i64,
    pub enqueue_seq: u64,
    /// True only while the owning transaction is in `AwaitingResponse`
    /// against a trusted upstream — i.e. exactly the set of transactions a
    /// verdict is allowed to demote (§4.E step 3).
    awaiting_trusted: AtomicBool,
    demote: Notify,
}

impl TxnHandle {
    pub fn new(id: i64, enqueue_seq: u64) -> Arc<Self> {
        Arc::new(TxnHandle {
            id,
            enqueue_seq,
            awaiting_trusted: AtomicBool::new(false),
            demote: Notify::new(),
        })
    }

    pub fn mark_awaiting_trusted(&self) {
        self.awaiting_trusted.store(true, Ordering::Release);
    }

    pub fn clear_awaiting_trusted(&self) {
        self.awaiting_trusted.store(false, Ordering::Release);
    }

    pub async fn wait_for_demotion(&self) {
        self.demote.notified().await;
    }

    /// Attempts to demote this transaction. Returns `true` iff it was
    /// actually eligible (idempotent: a second verdict for the same id
    /// against an already-demoted transaction is a no-op).
    fn try_demote(&self) -> bool {
        let demoted = self
            .awaiting_trusted
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if demoted {
            self.demote.notify_one();
        }
        demoted
    }
}

/// Shared verdict state (§3 "Verdict set", §4.E). One instance per process.
pub struct VerdictSet {
    malicious_ids: RwLock<FnvHashSet<i64>>,
    warning_meta: Mutex<FnvHashMap<i64, WarningMeta>>,
    registry: Mutex<FnvHashMap<i64, Vec<Arc<TxnHandle>>>>,
    pool: Arc<UpstreamPool>,
}

impl VerdictSet {
    pub fn new(pool: Arc<UpstreamPool>) -> Arc<Self> {
        Arc::new(VerdictSet {
            malicious_ids: RwLock::new(FnvHashSet::default()),
            warning_meta: Mutex::new(FnvHashMap::default()),
            registry: Mutex::new(FnvHashMap::default()),
            pool,
        })
    }

    /// Routing policy read (§4.C): is `id` currently flagged malicious?
    pub fn is_malicious(&self, id: i64) -> bool {
        self.malicious_ids.read().expect("lock poisoned").contains(&id)
    }

    /// Registers a freshly-created transaction so a later verdict can find
    /// and demote it. Called once the id is known, on entering Routing.
    pub fn register(&self, handle: Arc<TxnHandle>) {
        self.registry
            .lock()
            .expect("lock poisoned")
            .entry(handle.id)
            .or_default()
            .push(handle);
    }

    /// Called when a transaction reaches Done (or is dropped on error).
    /// Erases its registry entry and, per the reference behavior, the
    /// `malicious_ids`/`warning_meta` entries for its id (§4.E, §8: "for all
    /// ids that reached Done, `malicious_ids` does not contain it").
    ///
    /// Returns the erased `warning_meta` entry, if any, so the caller can log
    /// the diagnostic timestones for a transaction that was ever flagged
    /// malicious (§9 "per-id diagnostic timestones"). Idempotent: a second
    /// call for the same handle (e.g. from [`crate::frontend::TxnGuard`]'s
    /// `Drop` after an explicit completion) finds nothing left to erase.
    pub fn complete(&self, handle: &Arc<TxnHandle>) -> Option<WarningMeta> {
        let mut registry = self.registry.lock().expect("lock poisoned");
        if let Some(handles) = registry.get_mut(&handle.id) {
            handles.retain(|h| !Arc::ptr_eq(h, handle));
            if handles.is_empty() {
                registry.remove(&handle.id);
            }
        }
        drop(registry);
        self.malicious_ids.write().expect("lock poisoned").remove(&handle.id);
        self.warning_meta.lock().expect("lock poisoned").remove(&handle.id)
    }

    /// Processes one verdict message (§4.E steps 1-4).
    #[instrument(skip(self))]
    pub async fn receive_verdict(&self, id: i64, sequence: u64) {
        let arrived_us = now_us();
        self.malicious_ids.write().expect("lock poisoned").insert(id);
        self.warning_meta.lock().expect("lock poisoned").insert(
            id,
            WarningMeta {
                arrived_us,
                sequence,
                completed_us: None,
            },
        );
        info!(id, "received malicious verdict");

        let demoted = self.demote_inflight(id);
        if demoted {
            debug!(id, "demoted in-flight transaction(s), cycling active replica");
            self.pool.cycle().await;
        }

        let completed_us = now_us();
        if let Some(meta) = self.warning_meta.lock().expect("lock poisoned").get_mut(&id) {
            meta.completed_us = Some(completed_us);
        }
    }

    fn demote_inflight(&self, id: i64) -> bool {
        let registry = self.registry.lock().expect("lock poisoned");
        let mut any = false;
        if let Some(handles) = registry.get(&id) {
            for handle in handles {
                if handle.try_demote() {
                    any = true;
                }
            }
        }
        any
    }
}

/// Parses a verdict-channel message: an ASCII decimal integer, optionally
/// followed by whitespace or filler (§6). Only the leading digits matter;
/// anything after them is ignored.
pub fn parse_verdict_id(buf: &[u8]) -> crate::error::Result<i64> {
    let end = buf.iter().position(|b| !b.is_ascii_digit()).unwrap_or(buf.len());
    if end == 0 {
        return Err(crate::error::Error::verdict_malformed());
    }
    std::str::from_utf8(&buf[..end])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(crate::error::Error::verdict_malformed)
}
