//! In-process simulated cluster.
//!
//! Backs `mem://` endpoints and the integration test suite. The simulator
//! keeps every vbucket's mutation history in memory, serves failover logs
//! and high-seqno stats, and runs one forwarder task per open stream that
//! replays history and then follows live mutations until the requested end
//! seqno (or a close). Event delivery goes through the handler's bounded
//! channel, so the simulator observes the same backpressure a real feed
//! would.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    ClusterEndpoint, Credentials, DcpTransport, FailoverEntry, MutationEvent, StreamEvent,
    StreamRequest,
};
use crate::record::OpKind;

/// A simulated cluster shared by every connection opened against it.
pub struct SimCluster {
    state: Arc<SimState>,
}

struct SimState {
    num_vbuckets: u16,
    vbs: Vec<Mutex<SimVb>>,
    /// Wakes stream forwarders when a vbucket gains mutations.
    notifies: Vec<Notify>,
    /// Vbuckets whose next stream open is rejected (test injection).
    fail_open: Mutex<HashSet<u16>>,
    /// Distinguishes stream generations on the same vbucket.
    next_stream_id: AtomicU64,
}

struct SimVb {
    /// Newest branch first, as a cluster reports it.
    failover_log: Vec<FailoverEntry>,
    /// Full history in seqno order, seqnos contiguous from 1.
    mutations: Vec<MutationEvent>,
    high_seqno: u64,
    /// Id and cancel token of the currently open stream, if any.
    active_stream: Option<(u64, CancellationToken)>,
}

impl SimCluster {
    pub fn new(num_vbuckets: u16) -> Arc<Self> {
        let vbs = (0..num_vbuckets)
            .map(|vbno| {
                Mutex::new(SimVb {
                    failover_log: vec![FailoverEntry {
                        vbuuid: initial_vbuuid(vbno),
                        seqno: 0,
                    }],
                    mutations: Vec::new(),
                    high_seqno: 0,
                    active_stream: None,
                })
            })
            .collect();

        Arc::new(Self {
            state: Arc::new(SimState {
                num_vbuckets,
                vbs,
                notifies: (0..num_vbuckets).map(|_| Notify::new()).collect(),
                fail_open: Mutex::new(HashSet::new()),
                next_stream_id: AtomicU64::new(0),
            }),
        })
    }

    /// Apply a mutation to a vbucket and return its seqno.
    pub fn apply_mutation(&self, vbno: u16, key: &[u8], body: &[u8]) -> u64 {
        self.apply(vbno, key, body.to_vec(), OpKind::Mutation)
    }

    /// Apply a deletion to a vbucket and return its seqno.
    pub fn apply_deletion(&self, vbno: u16, key: &[u8]) -> u64 {
        self.apply(vbno, key, Vec::new(), OpKind::Deletion)
    }

    /// Reject the next stream open for `vbno` (failure injection).
    pub fn fail_next_stream_open(&self, vbno: u16) {
        self.state.fail_open.lock().insert(vbno);
    }

    /// Current high seqno for one vbucket.
    pub fn high_seqno(&self, vbno: u16) -> u64 {
        self.state.vbs[usize::from(vbno)].lock().high_seqno
    }

    fn apply(&self, vbno: u16, key: &[u8], body: Vec<u8>, op: OpKind) -> u64 {
        let seqno = {
            let mut vb = self.state.vbs[usize::from(vbno)].lock();
            let seqno = vb.high_seqno + 1;
            let vbuuid = vb.failover_log[0].vbuuid;
            vb.mutations.push(MutationEvent {
                vbno,
                key: key.to_vec(),
                seqno,
                rev_seqno: 1,
                cas: (u64::from(vbno) << 48) | (seqno << 16) | (vbuuid & 0xFFFF),
                flags: 0,
                expiry: 0,
                op,
                body,
            });
            vb.high_seqno = seqno;
            seqno
        };

        self.state.notifies[usize::from(vbno)].notify_waiters();
        seqno
    }
}

#[async_trait]
impl ClusterEndpoint for SimCluster {
    fn num_vbuckets(&self) -> u16 {
        self.state.num_vbuckets
    }

    async fn credentials(&self) -> Result<Credentials> {
        Ok(Credentials {
            rbac_supported: true,
            bucket_password: String::new(),
        })
    }

    async fn connect(&self, name: &str) -> Result<Arc<dyn DcpTransport>> {
        Ok(Arc::new(SimConnection {
            name: name.to_string(),
            state: Arc::clone(&self.state),
        }))
    }
}

/// One connection to a [`SimCluster`]; all connections share cluster state.
pub struct SimConnection {
    #[allow(dead_code)]
    name: String,
    state: Arc<SimState>,
}

impl SimConnection {
    fn check_vbno(&self, vbno: u16) -> Result<()> {
        if vbno >= self.state.num_vbuckets {
            bail!(
                "vbucket {vbno} out of range (cluster has {})",
                self.state.num_vbuckets
            );
        }
        Ok(())
    }
}

#[async_trait]
impl DcpTransport for SimConnection {
    async fn failover_log(&self, vbno: u16) -> Result<Vec<FailoverEntry>> {
        self.check_vbno(vbno)?;
        let vb = self.state.vbs[usize::from(vbno)].lock();
        let mut log = vb.failover_log.clone();
        // The live branch's entry reports how far the branch reaches.
        if let Some(newest) = log.first_mut() {
            newest.seqno = vb.high_seqno;
        }
        Ok(log)
    }

    async fn high_seqnos(&self) -> Result<HashMap<u16, u64>> {
        let mut map = HashMap::with_capacity(usize::from(self.state.num_vbuckets));
        for vbno in 0..self.state.num_vbuckets {
            map.insert(vbno, self.state.vbs[usize::from(vbno)].lock().high_seqno);
        }
        Ok(map)
    }

    async fn open_stream(
        &self,
        request: StreamRequest,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<()> {
        let vbno = request.vbno;
        self.check_vbno(vbno)?;

        if self.state.fail_open.lock().remove(&vbno) {
            bail!("stream open rejected for vb {vbno} (injected failure)");
        }

        let (stream_id, token) = {
            let mut vb = self.state.vbs[usize::from(vbno)].lock();
            if vb.active_stream.is_some() {
                bail!("vb {vbno} already has an active stream");
            }
            let stream_id = self.state.next_stream_id.fetch_add(1, Ordering::Relaxed);
            let token = CancellationToken::new();
            vb.active_stream = Some((stream_id, token.clone()));
            (stream_id, token)
        };

        let state = Arc::clone(&self.state);
        tokio::spawn(run_stream(state, request, events, token, stream_id));

        Ok(())
    }

    async fn close_stream(&self, vbno: u16) -> Result<()> {
        self.check_vbno(vbno)?;
        let active = self.state.vbs[usize::from(vbno)].lock().active_stream.take();
        if let Some((_, token)) = active {
            token.cancel();
        }
        Ok(())
    }
}

/// Forward one vbucket's history and live tail into the handler queue.
async fn run_stream(
    state: Arc<SimState>,
    request: StreamRequest,
    events: mpsc::Sender<StreamEvent>,
    token: CancellationToken,
    stream_id: u64,
) {
    let vbno = request.vbno;
    let idx = usize::from(vbno);
    let mut cursor = request.start_seqno;

    'stream: loop {
        // Arm the wakeup before scanning so a concurrent apply cannot be
        // missed between the scan and the wait.
        let notified = state.notifies[idx].notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let batch: Vec<MutationEvent> = {
            let vb = state.vbs[idx].lock();
            vb.mutations
                .iter()
                .filter(|m| m.seqno > cursor && m.seqno <= request.end_seqno)
                .cloned()
                .collect()
        };

        if !batch.is_empty() {
            let marker = StreamEvent::SnapshotMarker {
                vbno,
                start_seqno: batch[0].seqno,
                end_seqno: batch[batch.len() - 1].seqno,
            };
            if events.send(marker).await.is_err() {
                break 'stream;
            }

            for mutation in batch {
                cursor = mutation.seqno;
                if events.send(StreamEvent::Mutation(mutation)).await.is_err() {
                    break 'stream;
                }
            }
        }

        if cursor >= request.end_seqno {
            let _ = events
                .send(StreamEvent::EndOfStream {
                    vbno,
                    seqno: request.end_seqno,
                })
                .await;
            break;
        }

        tokio::select! {
            _ = notified.as_mut() => {}
            _ = token.cancelled() => {
                debug!(vbno, "sim stream closed");
                break;
            }
        }
    }

    // Free the stream slot, but only this stream's own registration; after
    // a close the slot may already belong to a newer stream.
    let mut vb = state.vbs[idx].lock();
    if vb.active_stream.as_ref().is_some_and(|(id, _)| *id == stream_id) {
        vb.active_stream = None;
    }
}

fn initial_vbuuid(vbno: u16) -> u64 {
    0xD1FF_0000_0000_0000 | (u64::from(vbno) + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(
        cluster: &Arc<SimCluster>,
        vbno: u16,
        start: u64,
        end: u64,
    ) -> (Arc<dyn DcpTransport>, mpsc::Receiver<StreamEvent>) {
        let conn = cluster.connect("test").await.expect("connect");
        let (tx, rx) = mpsc::channel(64);
        conn.open_stream(
            StreamRequest {
                vbno,
                vbuuid: initial_vbuuid(vbno),
                start_seqno: start,
                end_seqno: end,
                snapshot_start: start,
                snapshot_end: start,
            },
            tx,
        )
        .await
        .expect("open stream");
        (conn, rx)
    }

    #[tokio::test]
    async fn test_stream_replays_history_then_ends() {
        let cluster = SimCluster::new(4);
        cluster.apply_mutation(1, b"k1", b"v1");
        cluster.apply_mutation(1, b"k2", b"v2");

        let (_conn, mut rx) = open(&cluster, 1, 0, 2).await;

        let marker = rx.recv().await.expect("marker");
        assert!(matches!(
            marker,
            StreamEvent::SnapshotMarker { vbno: 1, start_seqno: 1, end_seqno: 2 }
        ));

        for want in 1..=2u64 {
            match rx.recv().await.expect("mutation") {
                StreamEvent::Mutation(m) => assert_eq!(m.seqno, want),
                other => panic!("unexpected event {other:?}"),
            }
        }

        assert!(matches!(
            rx.recv().await.expect("end"),
            StreamEvent::EndOfStream { vbno: 1, seqno: 2 }
        ));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_follows_live_mutations() {
        let cluster = SimCluster::new(1);
        let (_conn, mut rx) = open(&cluster, 0, 0, 3).await;

        cluster.apply_mutation(0, b"a", b"1");
        cluster.apply_mutation(0, b"b", b"2");
        cluster.apply_mutation(0, b"c", b"3");

        let mut seqnos = Vec::new();
        while let Some(event) = rx.recv().await {
            if let StreamEvent::Mutation(m) = event {
                seqnos.push(m.seqno);
            }
        }
        assert_eq!(seqnos, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_second_open_on_same_vb_rejected() {
        let cluster = SimCluster::new(1);
        cluster.apply_mutation(0, b"k", b"v");
        let (conn, _rx) = open(&cluster, 0, 0, u64::MAX).await;

        let (tx, _rx2) = mpsc::channel(4);
        let err = conn
            .open_stream(
                StreamRequest {
                    vbno: 0,
                    vbuuid: 0,
                    start_seqno: 0,
                    end_seqno: u64::MAX,
                    snapshot_start: 0,
                    snapshot_end: 0,
                },
                tx,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already has an active stream"));
    }

    #[tokio::test]
    async fn test_close_stream_ends_open_ended_stream() {
        let cluster = SimCluster::new(1);
        let (conn, mut rx) = open(&cluster, 0, 0, u64::MAX).await;

        conn.close_stream(0).await.expect("close");
        assert!(rx.recv().await.is_none());

        // The vb is streamable again after close.
        let (_conn2, _rx2) = open(&cluster, 0, 0, u64::MAX).await;
    }

    #[tokio::test]
    async fn test_injected_open_failure_is_one_shot() {
        let cluster = SimCluster::new(2);
        cluster.fail_next_stream_open(1);

        let conn = cluster.connect("test").await.expect("connect");
        let (tx, _rx) = mpsc::channel(4);
        let request = StreamRequest {
            vbno: 1,
            vbuuid: 0,
            start_seqno: 0,
            end_seqno: 1,
            snapshot_start: 0,
            snapshot_end: 0,
        };

        let err = conn.open_stream(request, tx.clone()).await.unwrap_err();
        assert!(err.to_string().contains("injected failure"));

        // The injection clears after one rejection.
        conn.open_stream(request, tx).await.expect("second open");
    }

    #[tokio::test]
    async fn test_high_seqnos_and_failover_log() {
        let cluster = SimCluster::new(2);
        cluster.apply_mutation(1, b"k", b"v");

        let conn = cluster.connect("stats").await.expect("connect");
        let highs = conn.high_seqnos().await.expect("stats");
        assert_eq!(highs[&0], 0);
        assert_eq!(highs[&1], 1);

        let log = conn.failover_log(1).await.expect("failover log");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].seqno, 1, "live branch entry reaches the high seqno");
    }
}
