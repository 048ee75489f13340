//! DCP handler workers.
//!
//! Each handler owns a fixed subset of its client's vbuckets and a bounded
//! event queue. Stream events are enqueued by the transport (blocking the
//! feed when the queue is full, which is the intended backpressure) and
//! drained by one task per handler: mutations become fingerprint records on
//! disk, snapshot markers move the cursor's snapshot window, end-of-stream
//! marks the vbucket complete.

use std::collections::HashMap;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dcp::{CaptureContext, VbState};
use crate::record::{
    bin_file_name, bin_for_key, body_digest, FingerprintRecord, OpKind, NO_BODY_DIGEST,
};
use crate::transport::{MutationEvent, StreamEvent};

/// Write failures tolerated per vbucket before the vbucket is failed out.
const MAX_WRITE_FAILURES: u32 = 2;

/// One capture worker. Created stopped; `start` spawns the drain task.
pub struct DcpHandler {
    name: String,
    vb_list: Vec<u16>,
    tx: mpsc::Sender<StreamEvent>,
    rx: Option<mpsc::Receiver<StreamEvent>>,
    ctx: CaptureContext,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl DcpHandler {
    pub fn new(name: String, vb_list: Vec<u16>, chan_size: usize, ctx: CaptureContext) -> Self {
        let (tx, rx) = mpsc::channel(chan_size);
        Self {
            name,
            vb_list,
            tx,
            rx: Some(rx),
            ctx,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Vbuckets this handler owns. Immutable for the handler's lifetime.
    pub fn vb_list(&self) -> &[u16] {
        &self.vb_list
    }

    /// Queue sender the client routes this handler's stream events through.
    pub fn event_sender(&self) -> mpsc::Sender<StreamEvent> {
        self.tx.clone()
    }

    /// Spawn the drain task.
    pub fn start(&mut self) -> Result<()> {
        let rx = self
            .rx
            .take()
            .with_context(|| format!("handler {} already started", self.name))?;

        let drain = DrainState {
            name: self.name.clone(),
            ctx: self.ctx.clone(),
            write_failures: HashMap::new(),
        };

        let cancel = self.cancel.clone();
        self.task = Some(tokio::spawn(drain.run(rx, cancel)));

        debug!(handler = %self.name, vbuckets = self.vb_list.len(), "handler started");
        Ok(())
    }

    /// Signal termination and wait for the drain task. Events already
    /// queued are processed before the task returns.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(handler = %self.name, error = %e, "drain task join failed");
            }
        }
        debug!(handler = %self.name, "handler stopped");
    }
}

struct DrainState {
    name: String,
    ctx: CaptureContext,
    /// Consecutive write failures per vbucket.
    write_failures: HashMap<u16, u32>,
}

impl DrainState {
    async fn run(mut self, mut rx: mpsc::Receiver<StreamEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => {
                        if !self.process(event) {
                            return;
                        }
                    }
                    None => return,
                },
                _ = cancel.cancelled() => {
                    // Finish whatever is already queued, then return.
                    while let Ok(event) = rx.try_recv() {
                        if !self.process(event) {
                            return;
                        }
                    }
                    return;
                }
            }
        }
    }

    /// Handle one stream event. Returns false on a fatal condition.
    fn process(&mut self, event: StreamEvent) -> bool {
        match event {
            StreamEvent::SnapshotMarker {
                vbno,
                start_seqno,
                end_seqno,
            } => {
                self.ctx.cursors.update_snapshot(vbno, start_seqno, end_seqno);
                true
            }
            StreamEvent::Mutation(mutation) => self.process_mutation(mutation),
            StreamEvent::EndOfStream { vbno, seqno } => {
                // The terminal seqno is only trustworthy if every record up
                // to it made it to disk.
                if self.write_failures.get(&vbno).copied().unwrap_or(0) == 0 {
                    self.ctx.cursors.update_seqno(vbno, seqno);
                }
                self.ctx.tracker.mark_completed(vbno, "end of stream");
                true
            }
        }
    }

    fn process_mutation(&mut self, mutation: MutationEvent) -> bool {
        let vbno = mutation.vbno;

        if self
            .write_failures
            .get(&vbno)
            .is_some_and(|n| *n >= MAX_WRITE_FAILURES)
        {
            // The vbucket is already failed out; drop its remaining events.
            return true;
        }

        let record = FingerprintRecord {
            body_digest: match mutation.op {
                OpKind::Mutation => body_digest(&mutation.body),
                OpKind::Deletion | OpKind::Expiration => NO_BODY_DIGEST,
            },
            key: mutation.key,
            seqno: mutation.seqno,
            rev_seqno: mutation.rev_seqno,
            cas: mutation.cas,
            flags: mutation.flags,
            expiry: mutation.expiry,
            op: mutation.op,
        };

        // The fingerprint format is an invariant of the run; an unencodable
        // record means the capture is unsound.
        let encoded = match record.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                self.ctx.errors.report(anyhow::Error::new(e).context(format!(
                    "{}: serializing record for vb {vbno} seqno {}",
                    self.name, record.seqno
                )));
                return false;
            }
        };

        let bin = bin_for_key(&record.key, self.ctx.n_bins);
        let path = self.ctx.file_dir.join(bin_file_name(vbno, bin));

        match self.ctx.fd_pool.write(&path, &encoded) {
            Ok(()) => {
                self.write_failures.remove(&vbno);
                self.ctx.cursors.update_seqno(vbno, record.seqno);
            }
            Err(e) => {
                let failures = self.write_failures.entry(vbno).or_insert(0);
                *failures += 1;

                let err = e.context(format!(
                    "{}: writing record for vb {vbno} seqno {}",
                    self.name, record.seqno
                ));

                if *failures >= MAX_WRITE_FAILURES {
                    self.ctx
                        .errors
                        .report(err.context(format!("repeated write failures for vb {vbno}")));
                    self.ctx.tracker.set_state(vbno, VbState::Failed);
                } else {
                    self.ctx.errors.report(err);
                }
            }
        }

        true
    }
}
