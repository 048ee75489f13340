//! Cluster transport seam.
//!
//! The capture core never speaks a cluster wire protocol directly. It
//! consumes two collaborator traits: [`ClusterEndpoint`] for per-cluster
//! concerns (credential discovery, vbucket count, opening connections) and
//! [`DcpTransport`] for one connection's stream and stats operations. The
//! transport delivers change-feed events by sending [`StreamEvent`]s into a
//! bounded channel owned by the receiving handler, which turns the
//! callback-driven feed into a pull-based pipeline.

pub mod sim;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::ClusterConfig;
use crate::record::OpKind;

/// Result of credential discovery against a cluster.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Whether the cluster supports role-based auth for streaming.
    pub rbac_supported: bool,
    /// Per-bucket password resolved for pre-RBAC clusters.
    pub bucket_password: String,
}

/// One branch point in a vbucket's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverEntry {
    pub vbuuid: u64,
    pub seqno: u64,
}

/// Parameters for opening one vbucket stream.
#[derive(Debug, Clone, Copy)]
pub struct StreamRequest {
    pub vbno: u16,
    pub vbuuid: u64,
    pub start_seqno: u64,
    pub end_seqno: u64,
    pub snapshot_start: u64,
    pub snapshot_end: u64,
}

/// A document change delivered by the feed.
#[derive(Debug, Clone)]
pub struct MutationEvent {
    pub vbno: u16,
    pub key: Vec<u8>,
    pub seqno: u64,
    pub rev_seqno: u64,
    pub cas: u64,
    pub flags: u32,
    pub expiry: u32,
    pub op: OpKind,
    pub body: Vec<u8>,
}

/// Events a vbucket stream pushes into its handler's queue.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Frames a contiguous batch of seqnos shipped together.
    SnapshotMarker {
        vbno: u16,
        start_seqno: u64,
        end_seqno: u64,
    },
    /// A mutation, deletion, or expiration.
    Mutation(MutationEvent),
    /// The stream reached its end seqno; `seqno` is the terminal cursor.
    EndOfStream { vbno: u16, seqno: u64 },
}

impl StreamEvent {
    pub fn vbno(&self) -> u16 {
        match self {
            StreamEvent::SnapshotMarker { vbno, .. } => *vbno,
            StreamEvent::Mutation(m) => m.vbno,
            StreamEvent::EndOfStream { vbno, .. } => *vbno,
        }
    }
}

/// Per-cluster collaborator: credentials, topology, and connections.
#[async_trait]
pub trait ClusterEndpoint: Send + Sync {
    /// Cluster-wide vbucket count; vbuckets are `[0, num_vbuckets)`.
    fn num_vbuckets(&self) -> u16;

    /// Discover auth mode and the per-bucket password where needed.
    async fn credentials(&self) -> Result<Credentials>;

    /// Open a named connection for one client or the checkpoint manager.
    async fn connect(&self, name: &str) -> Result<Arc<dyn DcpTransport>>;
}

/// One cluster connection: stats queries and stream lifecycle.
#[async_trait]
pub trait DcpTransport: Send + Sync {
    /// Current failover log for a vbucket, newest branch first. Each
    /// entry's seqno is the highest seqno reachable on that branch; the
    /// newest entry reports the branch's current high seqno.
    async fn failover_log(&self, vbno: u16) -> Result<Vec<FailoverEntry>>;

    /// Current high seqno for every vbucket.
    async fn high_seqnos(&self) -> Result<HashMap<u16, u64>>;

    /// Open a change-feed stream; events flow into `events` in seqno order.
    /// At most one stream may be active per (cluster, vbucket).
    async fn open_stream(
        &self,
        request: StreamRequest,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<()>;

    /// Close an open stream. Best-effort; closing an already-ended stream
    /// is not an error.
    async fn close_stream(&self, vbno: u16) -> Result<()>;
}

/// Vbucket count used for `mem://` endpoints resolved from configuration.
const MEM_NUM_VBUCKETS: u16 = 1024;

/// Resolve a cluster URL to an endpoint implementation.
///
/// `mem://` yields a fresh in-process simulated cluster (empty bucket),
/// useful for smoke runs. Production cluster protocols are integrated by
/// implementing [`ClusterEndpoint`] out of tree and wiring it into the
/// driver directly.
pub fn endpoint(cfg: &ClusterConfig) -> Result<Arc<dyn ClusterEndpoint>> {
    if cfg.url.starts_with("mem://") {
        return Ok(sim::SimCluster::new(MEM_NUM_VBUCKETS));
    }

    bail!("unsupported cluster url scheme: {}", cfg.url);
}
