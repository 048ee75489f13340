//! Parallel mutation-capture pipeline.
//!
//! Per cluster, a driver owns a fleet of clients, each client fans its
//! vbuckets' change-feed events out to handler workers, and handlers write
//! fingerprint records through the shared file-descriptor pool. The
//! checkpoint manager brackets the run: start cursors at the beginning,
//! cursor persistence during and at the end.
//!
//! Children never hold a driver back-reference. The driver hands each child
//! the capability bundle it needs: the vbucket state tracker, the error
//! sink, the cursor store, and the output layout.

pub mod checkpoint;
pub mod client;
pub mod driver;
pub mod handler;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::dcp::checkpoint::CursorStore;
use crate::fdpool::FdPool;

/// Capacity of a driver's error channel. Only the first few errors are
/// interesting on the channel; everything is logged regardless.
const ERROR_CHAN_SIZE: usize = 16;

/// Lifecycle of one vbucket within a capture run.
///
/// `Pending → StreamOpenRequested → StreamOpen → Completed → StreamClosed`,
/// with `Failed` reachable from the open path. `StreamClosed` and `Failed`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VbState {
    Pending,
    StreamOpenRequested,
    StreamOpen,
    Completed,
    StreamClosed,
    Failed,
}

impl VbState {
    pub fn is_terminal(self) -> bool {
        matches!(self, VbState::StreamClosed | VbState::Failed)
    }
}

/// Driver-owned vbucket state map, handed to clients and handlers as a
/// capability. Transitions serialize on the inner lock; completion is
/// counted once per vbucket, and when every vbucket has completed the
/// `all_done` token fires.
pub struct VbTracker {
    states: RwLock<Vec<VbState>>,
    completed: RwLock<usize>,
    total: usize,
    all_done: CancellationToken,
}

impl VbTracker {
    pub fn new(num_vbuckets: u16) -> Self {
        Self {
            states: RwLock::new(vec![VbState::Pending; usize::from(num_vbuckets)]),
            completed: RwLock::new(0),
            total: usize::from(num_vbuckets),
            all_done: CancellationToken::new(),
        }
    }

    pub fn state(&self, vbno: u16) -> VbState {
        self.states.read()[usize::from(vbno)]
    }

    pub fn set_state(&self, vbno: u16, state: VbState) {
        self.states.write()[usize::from(vbno)] = state;
    }

    /// Mark a vbucket's processing complete. Idempotent; terminal vbuckets
    /// keep their state.
    pub fn mark_completed(&self, vbno: u16, reason: &str) {
        let count = {
            let mut states = self.states.write();
            let slot = &mut states[usize::from(vbno)];
            if matches!(*slot, VbState::Completed) || slot.is_terminal() {
                return;
            }
            *slot = VbState::Completed;

            let mut completed = self.completed.write();
            *completed += 1;
            *completed
        };

        debug!(vbno, reason, completed = count, total = self.total, "vbucket completed");

        if count == self.total {
            info!("all vbuckets completed");
            self.all_done.cancel();
        }
    }

    pub fn completed_count(&self) -> usize {
        *self.completed.read()
    }

    /// Token that fires once every vbucket has completed.
    pub fn all_done(&self) -> CancellationToken {
        self.all_done.clone()
    }
}

/// Bounded, non-blocking error funnel from every pipeline task to the
/// driver's owner. The first errors win observability on the channel;
/// overflow is dropped after logging. Any report latches the failure flag
/// used for the process exit status.
#[derive(Clone)]
pub struct ErrorSink {
    tx: mpsc::Sender<anyhow::Error>,
    any: Arc<AtomicBool>,
}

impl ErrorSink {
    pub fn new() -> (Self, mpsc::Receiver<anyhow::Error>) {
        let (tx, rx) = mpsc::channel(ERROR_CHAN_SIZE);
        (
            Self {
                tx,
                any: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    pub fn report(&self, err: anyhow::Error) {
        self.any.store(true, Ordering::Relaxed);
        error!(error = %format!("{err:#}"), "capture error");

        if self.tx.try_send(err).is_err() {
            debug!("error channel full, dropping");
        }
    }

    pub fn any_error(&self) -> bool {
        self.any.load(Ordering::Relaxed)
    }
}

/// Capability bundle a driver hands to its clients and handlers.
#[derive(Clone)]
pub struct CaptureContext {
    /// Output root for this cluster's fingerprint files.
    pub file_dir: PathBuf,
    /// Bins per vbucket.
    pub n_bins: u32,
    /// Shared bounded file-descriptor pool.
    pub fd_pool: Arc<FdPool>,
    /// In-memory cursors advanced by handlers, persisted by the checkpoint
    /// manager.
    pub cursors: Arc<CursorStore>,
    /// Vbucket state map and completion counting.
    pub tracker: Arc<VbTracker>,
    /// Leaf-to-root error funnel.
    pub errors: ErrorSink,
}

/// Split `total` items into `workers` consecutive ranges whose sizes differ
/// by at most one. Returns `(low, high)` index pairs; workers beyond the
/// item count get empty ranges.
pub fn balance_load(workers: usize, total: usize) -> Vec<(usize, usize)> {
    debug_assert!(workers > 0);
    let base = total / workers;
    let extra = total % workers;

    let mut ranges = Vec::with_capacity(workers);
    let mut low = 0;
    for i in 0..workers {
        let size = base + usize::from(i < extra);
        ranges.push((low, low + size));
        low += size;
    }
    ranges
}
