//! In-memory buffer of pending envelopes and the batch-trigger policy.
//!
//! Three things turn a buffer into a batch: the count threshold, a one-shot
//! flush timer armed when the first item lands, and an explicit `flush`. The
//! crash flag turns the hand-off synchronous so a dying process still gets
//! its data to disk. The buffer lock is never held across disk I/O; the
//! drained batch is serialized and persisted off the caller's thread.

use crate::envelope::{serialize_batch, Envelope};
use crate::persist::PersistenceStore;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error};

#[derive(Debug, Default)]
struct QueueInner {
    items: Vec<Envelope>,
    flush_timer: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct QueueShared {
    inner: Mutex<QueueInner>,
    store: Arc<PersistenceStore>,
    handle: tokio::runtime::Handle,
    max_batch_count: usize,
    max_batch_interval: Duration,
    disabled: AtomicBool,
    crashing: Arc<AtomicBool>,
}

/// Thread-safe transmit queue. Clones share the same buffer and timer, the
/// same idiom as the rest of the pipeline's shared components.
#[derive(Debug, Clone)]
pub struct TransmitQueue {
    shared: Arc<QueueShared>,
}

impl TransmitQueue {
    pub fn new(
        store: Arc<PersistenceStore>,
        handle: tokio::runtime::Handle,
        max_batch_count: usize,
        max_batch_interval: Duration,
        disabled: bool,
        crashing: Arc<AtomicBool>,
    ) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                inner: Mutex::new(QueueInner::default()),
                store,
                handle,
                max_batch_count,
                max_batch_interval,
                disabled: AtomicBool::new(disabled),
                crashing,
            }),
        }
    }

    /// Buffer one envelope. Returns `false` when telemetry is disabled.
    ///
    /// Appending the `max_batch_count`-th item (or any item while the crash
    /// flag is up) flushes immediately; appending the first item arms the
    /// flush timer.
    pub fn enqueue(&self, envelope: Envelope) -> bool {
        if self.shared.disabled.load(Ordering::SeqCst) {
            debug!("telemetry disabled, envelope dropped");
            return false;
        }

        let crashing = self.shared.crashing.load(Ordering::SeqCst);
        let flush_now = {
            let mut inner = self.lock_inner();
            inner.items.push(envelope);
            if crashing || inner.items.len() >= self.shared.max_batch_count {
                true
            } else {
                if inner.items.len() == 1 {
                    self.arm_timer(&mut inner.flush_timer);
                }
                false
            }
        };

        if flush_now {
            if crashing {
                // Background workers may never run again; write on this thread.
                self.flush_sync(true);
            } else {
                self.flush();
            }
        }
        true
    }

    /// Drain the buffer and hand the batch to persistence off this thread.
    /// Flushing an empty queue is a no-op. Exactly one batch per drain.
    pub fn flush(&self) {
        if let Some(items) = self.drain() {
            let store = self.shared.store.clone();
            self.shared.handle.spawn_blocking(move || {
                if let Some(bytes) = serialize_or_log(&items) {
                    store.persist(&bytes, false);
                }
            });
        }
    }

    /// Crash-path drain: serialize and persist synchronously on the calling
    /// thread.
    pub fn flush_sync(&self, high_priority: bool) {
        if let Some(items) = self.drain() {
            if let Some(bytes) = serialize_or_log(&items) {
                self.shared.store.persist(&bytes, high_priority);
            }
        }
    }

    /// Number of buffered envelopes.
    pub fn pending(&self) -> usize {
        self.lock_inner().items.len()
    }

    /// Toggle the disabled flag; re-enabling allows subsequent enqueues.
    pub fn set_disabled(&self, disabled: bool) {
        self.shared.disabled.store(disabled, Ordering::SeqCst);
    }

    /// Swap the buffer for an empty one and cancel the pending timer.
    /// Returns the drained batch, `None` when there was nothing to flush.
    fn drain(&self) -> Option<Vec<Envelope>> {
        let items = {
            let mut inner = self.lock_inner();
            if let Some(timer) = inner.flush_timer.take() {
                timer.abort();
            }
            mem::take(&mut inner.items)
        };
        if items.is_empty() {
            return None;
        }
        debug!(count = items.len(), "flushing batch");
        Some(items)
    }

    /// Arm the one-shot flush timer, cancelling any stale one so timers
    /// never pile up.
    fn arm_timer(&self, slot: &mut Option<JoinHandle<()>>) {
        let queue = self.clone();
        let interval = self.shared.max_batch_interval;
        let timer = self.shared.handle.spawn(async move {
            tokio::time::sleep(interval).await;
            queue.flush();
        });
        if let Some(stale) = slot.replace(timer) {
            stale.abort();
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        match self.shared.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Serialize a drained batch; a failure loses the batch, which is logged.
fn serialize_or_log(items: &[Envelope]) -> Option<Vec<u8>> {
    match serialize_batch(items) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            error!(error = %e, count = items.len(), "batch serialization failed, dropped");
            None
        }
    }
}
