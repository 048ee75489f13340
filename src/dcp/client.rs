//! DCP client.
//!
//! One client owns one cluster connection and a disjoint slice of the
//! driver's vbuckets. It partitions those vbuckets across its handler
//! workers at startup (the vb→handler map never changes afterwards), waits
//! for the checkpoint manager's start cursors, opens one stream per vbucket
//! in randomized order, and runs two periodic tasks: an active-stream
//! reporter and, in complete-by-seqno mode, a sweeper that closes streams
//! whose vbuckets have completed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dcp::checkpoint::CheckpointManager;
use crate::dcp::handler::DcpHandler;
use crate::dcp::{balance_load, CaptureContext, VbState};
use crate::transport::{ClusterEndpoint, DcpTransport, StreamEvent, StreamRequest};

/// How often the client logs its open-stream count.
const ACTIVE_STREAM_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// How often completed vbuckets are swept for stream close.
const COMPLETED_SWEEP_INTERVAL: Duration = Duration::from_secs(3);

pub struct DcpClient {
    name: String,
    vb_list: Vec<u16>,
    workers: usize,
    chan_size: usize,
    complete_by_seqno: bool,
    endpoint: Arc<dyn ClusterEndpoint>,
    checkpoints: Arc<CheckpointManager>,
    ctx: CaptureContext,
    transport: Option<Arc<dyn DcpTransport>>,
    handlers: Vec<DcpHandler>,
    active_streams: Arc<AtomicU32>,
    closing: Arc<AtomicU32>,
    fin: CancellationToken,
    run_task: Option<JoinHandle<()>>,
}

impl DcpClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        vb_list: Vec<u16>,
        workers: usize,
        chan_size: usize,
        complete_by_seqno: bool,
        endpoint: Arc<dyn ClusterEndpoint>,
        checkpoints: Arc<CheckpointManager>,
        ctx: CaptureContext,
    ) -> Self {
        Self {
            name,
            vb_list,
            workers,
            chan_size,
            complete_by_seqno,
            endpoint,
            checkpoints,
            ctx,
            transport: None,
            handlers: Vec::new(),
            active_streams: Arc::new(AtomicU32::new(0)),
            closing: Arc::new(AtomicU32::new(0)),
            fin: CancellationToken::new(),
            run_task: None,
        }
    }

    /// Connect, start handlers, and spawn the stream-opening task.
    pub async fn start(&mut self) -> Result<()> {
        info!(client = %self.name, vbuckets = self.vb_list.len(), "dcp client starting");

        let transport = self
            .endpoint
            .connect(&self.name)
            .await
            .with_context(|| format!("{}: connecting to cluster", self.name))?;
        self.transport = Some(Arc::clone(&transport));

        let vb_handler_map = self.initialize_handlers()?;

        let runner = StreamRunner {
            name: self.name.clone(),
            vb_list: self.vb_list.clone(),
            vb_handler_map,
            transport,
            checkpoints: Arc::clone(&self.checkpoints),
            ctx: self.ctx.clone(),
            complete_by_seqno: self.complete_by_seqno,
            active_streams: Arc::clone(&self.active_streams),
            fin: self.fin.clone(),
        };
        self.run_task = Some(tokio::spawn(runner.run()));

        info!(client = %self.name, "dcp client started");
        Ok(())
    }

    /// Partition vbuckets across handlers and start each one. The returned
    /// map is fixed for the client's lifetime.
    fn initialize_handlers(&mut self) -> Result<HashMap<u16, mpsc::Sender<StreamEvent>>> {
        let mut vb_handler_map = HashMap::with_capacity(self.vb_list.len());
        let split = balance_load(self.workers, self.vb_list.len());

        for (i, (low, high)) in split.into_iter().enumerate() {
            let vb_slice = self.vb_list[low..high].to_vec();
            let mut handler = DcpHandler::new(
                format!("{}_{}", self.name, i),
                vb_slice.clone(),
                self.chan_size,
                self.ctx.clone(),
            );
            handler.start()?;

            let sender = handler.event_sender();
            for vbno in vb_slice {
                vb_handler_map.insert(vbno, sender.clone());
            }
            self.handlers.push(handler);
        }

        Ok(vb_handler_map)
    }

    /// Number of currently open streams.
    pub fn active_streams(&self) -> u32 {
        self.active_streams.load(Ordering::Relaxed)
    }

    /// Shut the client down: close remaining streams best-effort, stop all
    /// handlers, and join the stream task.
    pub async fn stop(&mut self) {
        info!(client = %self.name, "dcp client stopping");
        self.fin.cancel();

        if let Some(transport) = &self.transport {
            // Stream closes are fire-and-forget: waiting for close
            // acknowledgements has been observed to hang, and the counter
            // tolerates acknowledgements landing after stop() returns.
            let pending: Vec<u16> = self
                .vb_list
                .iter()
                .copied()
                .filter(|vbno| !self.ctx.tracker.state(*vbno).is_terminal())
                .collect();

            self.closing.store(pending.len() as u32, Ordering::Relaxed);

            for vbno in pending {
                let transport = Arc::clone(transport);
                let tracker = Arc::clone(&self.ctx.tracker);
                let closing = Arc::clone(&self.closing);
                let name = self.name.clone();

                tokio::spawn(async move {
                    match transport.close_stream(vbno).await {
                        Ok(()) => {
                            if !tracker.state(vbno).is_terminal() {
                                tracker.set_state(vbno, VbState::StreamClosed);
                            }
                        }
                        Err(e) => {
                            warn!(client = %name, vbno, error = %format!("{e:#}"), "stream close failed");
                        }
                    }

                    if closing.fetch_sub(1, Ordering::Relaxed) == 1 {
                        debug!(client = %name, "all stream closes acknowledged");
                    }
                });
            }
        }

        for handler in &mut self.handlers {
            handler.stop().await;
        }

        if let Some(task) = self.run_task.take() {
            if let Err(e) = task.await {
                warn!(client = %self.name, error = %e, "stream task join failed");
            }
        }

        info!(client = %self.name, "dcp client stopped");
    }
}

/// The client's long-lived stream task: waits for start cursors, opens the
/// streams, then runs the periodic reporter and sweeper.
struct StreamRunner {
    name: String,
    vb_list: Vec<u16>,
    vb_handler_map: HashMap<u16, mpsc::Sender<StreamEvent>>,
    transport: Arc<dyn DcpTransport>,
    checkpoints: Arc<CheckpointManager>,
    ctx: CaptureContext,
    complete_by_seqno: bool,
    active_streams: Arc<AtomicU32>,
    fin: CancellationToken,
}

impl StreamRunner {
    async fn run(self) {
        let mut ready = self.checkpoints.subscribe_ready();
        tokio::select! {
            result = ready.wait_for(|ready| *ready) => {
                if result.is_err() {
                    // Checkpoint manager went away before signaling.
                    return;
                }
            }
            _ = self.fin.cancelled() => return,
        }

        let opened = self.open_streams().await;

        if opened > 0 {
            tokio::spawn(report_active_streams(
                self.name.clone(),
                Arc::clone(&self.active_streams),
                opened,
                self.fin.clone(),
            ));
        }

        if self.complete_by_seqno {
            tokio::spawn(close_completed_streams(
                self.vb_list.clone(),
                Arc::clone(&self.transport),
                self.ctx.clone(),
                self.fin.clone(),
            ));
        }
    }

    /// Open one stream per assigned vbucket, randomized so initial load
    /// spreads evenly across handlers. Returns the number opened.
    async fn open_streams(&self) -> usize {
        let mut vbs = self.vb_list.clone();
        vbs.shuffle(&mut rand::thread_rng());

        let mut opened = 0;
        for vbno in vbs {
            if self.fin.is_cancelled() {
                return opened;
            }

            let start = self.checkpoints.start_point(vbno);
            if start.no_stream_needed {
                self.ctx.tracker.mark_completed(vbno, "no mutations to stream");
                continue;
            }

            let request = StreamRequest {
                vbno,
                vbuuid: start.cursor.vbuuid,
                start_seqno: start.cursor.seqno,
                end_seqno: start.end_seqno,
                snapshot_start: start.cursor.seqno,
                snapshot_end: start.cursor.seqno,
            };

            let sender = self.vb_handler_map[&vbno].clone();
            self.ctx.tracker.set_state(vbno, VbState::StreamOpenRequested);

            match self.transport.open_stream(request, sender).await {
                Ok(()) => {
                    self.ctx.tracker.set_state(vbno, VbState::StreamOpen);
                    self.active_streams.fetch_add(1, Ordering::Relaxed);
                    opened += 1;
                }
                Err(e) => {
                    self.ctx.tracker.set_state(vbno, VbState::Failed);
                    self.ctx
                        .errors
                        .report(e.context(format!("{}: opening stream for vb {vbno}", self.name)));
                }
            }
        }

        debug!(client = %self.name, opened, "stream opens finished");
        opened
    }
}

/// Log the open-stream count until every assigned stream is open.
async fn report_active_streams(
    name: String,
    active_streams: Arc<AtomicU32>,
    expected: usize,
    fin: CancellationToken,
) {
    let mut ticker = tokio::time::interval(ACTIVE_STREAM_REPORT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = fin.cancelled() => return,
            _ = ticker.tick() => {
                let active = active_streams.load(Ordering::Relaxed);
                info!(client = %name, active, "active streams");
                if active as usize >= expected {
                    info!(client = %name, "all assigned streams active, reporter exiting");
                    return;
                }
            }
        }
    }
}

/// Sweep completed vbuckets and close their streams.
async fn close_completed_streams(
    vb_list: Vec<u16>,
    transport: Arc<dyn DcpTransport>,
    ctx: CaptureContext,
    fin: CancellationToken,
) {
    let mut ticker = tokio::time::interval(COMPLETED_SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = fin.cancelled() => return,
            _ = ticker.tick() => {
                for &vbno in &vb_list {
                    if ctx.tracker.state(vbno) != VbState::Completed {
                        continue;
                    }
                    if transport.close_stream(vbno).await.is_ok() {
                        ctx.tracker.set_state(vbno, VbState::StreamClosed);
                    }
                }
            }
        }
    }
}
