//! Checkpoint manager.
//!
//! Brackets a capture run: computes per-vbucket start cursors from any
//! prior checkpoint file plus the cluster's live failover logs, broadcasts
//! readiness so clients may open streams, persists the in-memory cursor map
//! periodically, and persists once more on stop. Cursors only ever reflect
//! seqnos whose records the handlers have already written, so a persisted
//! checkpoint never runs ahead of the files on disk.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CheckpointConfig, StatsConfig};
use crate::transport::{DcpTransport, FailoverEntry};

/// Checkpoint file magic.
const CHECKPOINT_MAGIC: &[u8; 4] = b"DFCP";

/// Checkpoint file format version.
const CHECKPOINT_VERSION: u16 = 1;

/// One vbucket's capture cursor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Cursor {
    pub vbuuid: u64,
    pub seqno: u64,
    pub snapshot_start: u64,
    pub snapshot_end: u64,
    pub failover_log: Vec<FailoverEntry>,
}

/// Computed starting point for one vbucket stream.
#[derive(Debug, Clone)]
pub struct StartPoint {
    pub cursor: Cursor,
    /// End seqno for the stream request; `u64::MAX` for open-ended runs.
    pub end_seqno: u64,
    /// The vbucket was already caught up at run start; no stream needed.
    pub no_stream_needed: bool,
}

/// Shared in-memory cursor map. Handlers advance it after each acknowledged
/// write; the checkpoint manager snapshots it for persistence.
pub struct CursorStore {
    cursors: RwLock<Vec<Cursor>>,
}

impl CursorStore {
    pub fn new(num_vbuckets: u16) -> Self {
        Self {
            cursors: RwLock::new(vec![Cursor::default(); usize::from(num_vbuckets)]),
        }
    }

    /// Seed a vbucket's cursor at run start.
    pub fn seed(&self, vbno: u16, cursor: Cursor) {
        self.cursors.write()[usize::from(vbno)] = cursor;
    }

    /// Advance the captured seqno after a durably appended record.
    pub fn update_seqno(&self, vbno: u16, seqno: u64) {
        self.cursors.write()[usize::from(vbno)].seqno = seqno;
    }

    /// Update the snapshot window from a snapshot marker.
    pub fn update_snapshot(&self, vbno: u16, start: u64, end: u64) {
        let mut cursors = self.cursors.write();
        let cursor = &mut cursors[usize::from(vbno)];
        cursor.snapshot_start = start;
        cursor.snapshot_end = end;
    }

    pub fn get(&self, vbno: u16) -> Cursor {
        self.cursors.read()[usize::from(vbno)].clone()
    }

    /// Ordered snapshot of every cursor, for persistence.
    fn snapshot(&self) -> BTreeMap<u16, Cursor> {
        let cursors = self.cursors.read();
        cursors
            .iter()
            .enumerate()
            .map(|(vbno, c)| (vbno as u16, c.clone()))
            .collect()
    }
}

/// Compute the effective start `(vbuuid, seqno)` for a vbucket given the
/// cursor loaded from a prior run and the cluster's current failover log.
///
/// If the loaded branch still appears in the log at a seqno at or past the
/// loaded seqno, the capture resumes where it left off; otherwise it rolls
/// back to the newest branch point at or below the loaded seqno.
pub fn compute_start(loaded: Option<&Cursor>, log: &[FailoverEntry]) -> (u64, u64) {
    let newest_vbuuid = log.first().map_or(0, |e| e.vbuuid);

    let Some(cursor) = loaded else {
        return (newest_vbuuid, 0);
    };

    if log
        .iter()
        .any(|e| e.vbuuid == cursor.vbuuid && e.seqno >= cursor.seqno)
    {
        return (cursor.vbuuid, cursor.seqno);
    }

    log.iter()
        .filter(|e| e.seqno <= cursor.seqno)
        .max_by_key(|e| e.seqno)
        .map_or((newest_vbuuid, 0), |e| (e.vbuuid, e.seqno))
}

/// Per-driver checkpoint manager.
pub struct CheckpointManager {
    name: String,
    cfg: CheckpointConfig,
    stats: StatsConfig,
    complete_by_seqno: bool,
    num_vbuckets: u16,
    transport: Arc<dyn DcpTransport>,
    cursors: Arc<CursorStore>,
    start_points: RwLock<Vec<Option<StartPoint>>>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
    persist_task: Mutex<Option<JoinHandle<()>>>,
}

impl CheckpointManager {
    pub fn new(
        name: &str,
        transport: Arc<dyn DcpTransport>,
        cfg: CheckpointConfig,
        stats: StatsConfig,
        complete_by_seqno: bool,
        num_vbuckets: u16,
    ) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        Self {
            name: name.to_string(),
            cfg,
            stats,
            complete_by_seqno,
            num_vbuckets,
            transport,
            cursors: Arc::new(CursorStore::new(num_vbuckets)),
            start_points: RwLock::new(vec![None; usize::from(num_vbuckets)]),
            ready_tx,
            ready_rx,
            cancel: CancellationToken::new(),
            persist_task: Mutex::new(None),
        }
    }

    /// The cursor store handlers write through.
    pub fn cursors(&self) -> Arc<CursorStore> {
        Arc::clone(&self.cursors)
    }

    /// Receiver that flips to `true` once start cursors are computed.
    pub fn subscribe_ready(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }

    /// Starting point for one vbucket. Only valid after initialization.
    pub fn start_point(&self, vbno: u16) -> StartPoint {
        self.start_points.read()[usize::from(vbno)]
            .clone()
            .expect("start points are computed before clients open streams")
    }

    /// Load prior cursors, query the cluster, compute start cursors, seed
    /// the cursor store, and broadcast readiness.
    pub async fn initialize(&self) -> Result<()> {
        let loaded = self.load_old_checkpoint()?;

        let high_seqnos = self
            .with_stats_retry("high seqnos", || self.transport.high_seqnos())
            .await?;

        let mut no_stream = 0u32;
        for vbno in 0..self.num_vbuckets {
            let log = self
                .with_stats_retry("failover log", || self.transport.failover_log(vbno))
                .await
                .with_context(|| format!("fetching failover log for vb {vbno}"))?;

            let prior = loaded.get(&vbno);
            let (vbuuid, seqno) = compute_start(prior, &log);
            let high = high_seqnos.get(&vbno).copied().unwrap_or(0);

            let cursor = Cursor {
                vbuuid,
                seqno,
                snapshot_start: seqno,
                snapshot_end: seqno,
                failover_log: log,
            };

            let no_stream_needed = seqno >= high;
            if no_stream_needed {
                no_stream += 1;
            }

            self.cursors.seed(vbno, cursor.clone());
            self.start_points.write()[usize::from(vbno)] = Some(StartPoint {
                cursor,
                end_seqno: if self.complete_by_seqno { high } else { u64::MAX },
                no_stream_needed,
            });
        }

        info!(
            name = %self.name,
            vbuckets = self.num_vbuckets,
            resumed = loaded.len(),
            no_stream,
            "start cursors ready",
        );

        // Receivers may already have been dropped in teardown races.
        let _ = self.ready_tx.send(true);

        Ok(())
    }

    /// Start periodic persistence, if configured.
    pub fn start(&self) {
        if self.cfg.interval.is_zero() || self.cfg.new_filename.is_empty() {
            debug!(name = %self.name, "periodic checkpointing disabled");
            return;
        }

        let path = self.new_checkpoint_path();
        let cursors = Arc::clone(&self.cursors);
        let interval = self.cfg.interval;
        let cancel = self.cancel.clone();
        let name = self.name.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate first tick would persist the start cursors.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        match persist_cursors(&path, &cursors) {
                            Ok(count) => debug!(name = %name, count, "checkpoint persisted"),
                            Err(e) => warn!(name = %name, error = %format!("{e:#}"), "checkpoint persist failed"),
                        }
                    }
                }
            }
        });

        *self.persist_task.lock() = Some(task);
    }

    /// Stop periodic persistence and write the final checkpoint.
    pub async fn stop(&self) -> Result<()> {
        self.cancel.cancel();

        let task = self.persist_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(name = %self.name, error = %e, "persist task join failed");
            }
        }

        if !self.cfg.new_filename.is_empty() {
            let path = self.new_checkpoint_path();
            let count = persist_cursors(&path, &self.cursors)
                .with_context(|| format!("writing final checkpoint for {}", self.name))?;
            info!(name = %self.name, count, path = %path.display(), "final checkpoint written");
        }

        Ok(())
    }

    fn new_checkpoint_path(&self) -> PathBuf {
        self.cfg
            .file_dir
            .join(format!("{}_{}", self.name, self.cfg.new_filename))
    }

    fn load_old_checkpoint(&self) -> Result<HashMap<u16, Cursor>> {
        let old_filename = match self.name.as_str() {
            "source" => &self.cfg.old_source_filename,
            "target" => &self.cfg.old_target_filename,
            _ => &self.cfg.old_source_filename,
        };

        if old_filename.is_empty() {
            return Ok(HashMap::new());
        }

        let path = self.cfg.file_dir.join(format!("{}_{}", self.name, old_filename));
        let data = std::fs::read(&path)
            .with_context(|| format!("reading checkpoint file {}", path.display()))?;
        let cursors = decode_checkpoint(&data)
            .with_context(|| format!("decoding checkpoint file {}", path.display()))?;

        info!(
            name = %self.name,
            path = %path.display(),
            vbuckets = cursors.len(),
            "loaded prior checkpoint",
        );

        Ok(cursors)
    }

    /// Run a stats query under the per-call timeout with bounded
    /// exponential backoff between attempts.
    async fn with_stats_retry<T, F, Fut>(&self, label: &str, query: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = self.stats.get_stats_retry_interval;
        let mut attempt = 0u32;

        loop {
            let outcome = tokio::time::timeout(self.stats.bucket_op_timeout, query()).await;

            let err = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => anyhow::anyhow!("timed out after {:?}", self.stats.bucket_op_timeout),
            };

            if attempt >= self.stats.max_get_stats_retry {
                return Err(err.context(format!(
                    "{label} query failed after {attempt} retries"
                )));
            }

            attempt += 1;
            warn!(
                name = %self.name,
                label,
                attempt,
                error = %format!("{err:#}"),
                retry_in = ?delay,
                "stats query failed, retrying",
            );

            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.stats.get_stats_max_backoff);
        }
    }
}

/// Snapshot the cursor store and atomically replace the checkpoint file.
/// Returns the number of persisted cursors.
fn persist_cursors(path: &Path, cursors: &CursorStore) -> Result<usize> {
    let snapshot = cursors.snapshot();
    let encoded = encode_checkpoint(&snapshot);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating checkpoint dir {}", parent.display()))?;
    }

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &encoded)
        .with_context(|| format!("writing checkpoint temp file {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("replacing checkpoint file {}", path.display()))?;

    Ok(snapshot.len())
}

/// Encode cursors into the versioned checkpoint format. Entries are written
/// in ascending vbno order so identical state always encodes to identical
/// bytes.
pub fn encode_checkpoint(cursors: &BTreeMap<u16, Cursor>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + cursors.len() * 64);
    buf.extend_from_slice(CHECKPOINT_MAGIC);
    buf.extend_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
    buf.extend_from_slice(&(cursors.len() as u32).to_le_bytes());

    for (vbno, cursor) in cursors {
        buf.extend_from_slice(&vbno.to_le_bytes());
        buf.extend_from_slice(&cursor.vbuuid.to_le_bytes());
        buf.extend_from_slice(&cursor.seqno.to_le_bytes());
        buf.extend_from_slice(&cursor.snapshot_start.to_le_bytes());
        buf.extend_from_slice(&cursor.snapshot_end.to_le_bytes());
        buf.extend_from_slice(&(cursor.failover_log.len() as u16).to_le_bytes());
        for entry in &cursor.failover_log {
            buf.extend_from_slice(&entry.vbuuid.to_le_bytes());
            buf.extend_from_slice(&entry.seqno.to_le_bytes());
        }
    }

    buf
}

/// Decode a checkpoint file produced by [`encode_checkpoint`].
pub fn decode_checkpoint(data: &[u8]) -> Result<HashMap<u16, Cursor>> {
    let mut reader = ByteReader::new(data);

    let magic = reader.bytes(4)?;
    if magic != CHECKPOINT_MAGIC {
        bail!("not a checkpoint file (bad magic)");
    }

    let version = reader.u16()?;
    if version != CHECKPOINT_VERSION {
        bail!("unsupported checkpoint version {version}");
    }

    let count = reader.u32()?;
    let mut cursors = HashMap::with_capacity(count as usize);

    for _ in 0..count {
        let vbno = reader.u16()?;
        let vbuuid = reader.u64()?;
        let seqno = reader.u64()?;
        let snapshot_start = reader.u64()?;
        let snapshot_end = reader.u64()?;

        let log_len = reader.u16()?;
        let mut failover_log = Vec::with_capacity(usize::from(log_len));
        for _ in 0..log_len {
            let entry_vbuuid = reader.u64()?;
            let entry_seqno = reader.u64()?;
            failover_log.push(FailoverEntry {
                vbuuid: entry_vbuuid,
                seqno: entry_seqno,
            });
        }

        cursors.insert(
            vbno,
            Cursor {
                vbuuid,
                seqno,
                snapshot_start,
                snapshot_end,
                failover_log,
            },
        );
    }

    Ok(cursors)
}

/// Bounds-checked little-endian reader over a checkpoint buffer.
struct ByteReader<'a> {
    data: &'a [u8],
    at: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, at: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.at + n;
        if end > self.data.len() {
            bail!("checkpoint file truncated at byte {}", self.at);
        }
        let out = &self.data[self.at..end];
        self.at = end;
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16> {
        let raw = self.bytes(2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let raw = self.bytes(4)?;
        let mut fixed = [0u8; 4];
        fixed.copy_from_slice(raw);
        Ok(u32::from_le_bytes(fixed))
    }

    fn u64(&mut self) -> Result<u64> {
        let raw = self.bytes(8)?;
        let mut fixed = [0u8; 8];
        fixed.copy_from_slice(raw);
        Ok(u64::from_le_bytes(fixed))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    use tempfile::TempDir;

    use crate::transport::sim::SimCluster;
    use crate::transport::ClusterEndpoint;

    fn entry(vbuuid: u64, seqno: u64) -> FailoverEntry {
        FailoverEntry { vbuuid, seqno }
    }

    fn cursor(vbuuid: u64, seqno: u64) -> Cursor {
        Cursor {
            vbuuid,
            seqno,
            snapshot_start: seqno,
            snapshot_end: seqno,
            failover_log: vec![entry(vbuuid, 0)],
        }
    }

    #[test]
    fn test_compute_start_fresh() {
        let log = vec![entry(0xAA, 0)];
        assert_eq!(compute_start(None, &log), (0xAA, 0));
        assert_eq!(compute_start(None, &[]), (0, 0));
    }

    #[test]
    fn test_compute_start_resume_on_shared_branch() {
        // Branch still current and extends past the loaded seqno.
        let log = vec![entry(0xAA, 100)];
        let loaded = cursor(0xAA, 40);
        assert_eq!(compute_start(Some(&loaded), &log), (0xAA, 40));
    }

    #[test]
    fn test_compute_start_rolls_back_after_failover() {
        // The loaded branch is gone; newest surviving branch point at or
        // below the loaded seqno wins.
        let log = vec![entry(0xCC, 90), entry(0xBB, 30), entry(0xAA_FF, 10)];
        let loaded = cursor(0xDD, 50);
        assert_eq!(compute_start(Some(&loaded), &log), (0xBB, 30));
    }

    #[test]
    fn test_compute_start_rollback_is_largest_seqno_at_or_below() {
        // Property: the result is the largest branch seqno <= loaded seqno.
        let log = vec![entry(3, 75), entry(2, 60), entry(1, 20)];
        let loaded = cursor(0xEE, 60);
        assert_eq!(compute_start(Some(&loaded), &log), (2, 60));
    }

    #[test]
    fn test_compute_start_rollback_to_zero_when_no_branch_fits() {
        let log = vec![entry(0xBB, 80)];
        let loaded = cursor(0xDD, 50);
        assert_eq!(compute_start(Some(&loaded), &log), (0xBB, 0));
    }

    #[test]
    fn test_checkpoint_codec_round_trip() {
        let mut cursors = BTreeMap::new();
        cursors.insert(0, cursor(0xAA, 12));
        cursors.insert(
            3,
            Cursor {
                vbuuid: 0xBB,
                seqno: 7,
                snapshot_start: 5,
                snapshot_end: 9,
                failover_log: vec![entry(0xBB, 4), entry(0xAA, 0)],
            },
        );

        let encoded = encode_checkpoint(&cursors);
        let decoded = decode_checkpoint(&encoded).expect("decode");

        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[&0], cursors[&0]);
        assert_eq!(decoded[&3], cursors[&3]);
    }

    #[test]
    fn test_checkpoint_encode_is_deterministic() {
        let mut cursors = BTreeMap::new();
        for vbno in 0..8u16 {
            cursors.insert(vbno, cursor(u64::from(vbno) + 1, u64::from(vbno) * 3));
        }

        // persist -> reload -> persist must be byte-identical.
        let first = encode_checkpoint(&cursors);
        let reloaded: BTreeMap<u16, Cursor> =
            decode_checkpoint(&first).expect("decode").into_iter().collect();
        let second = encode_checkpoint(&reloaded);
        assert_eq!(first, second);
    }

    #[test]
    fn test_checkpoint_decode_rejects_garbage() {
        assert!(decode_checkpoint(b"").is_err());
        assert!(decode_checkpoint(b"NOPE").is_err());

        let mut cursors = BTreeMap::new();
        cursors.insert(0, cursor(1, 1));
        let mut encoded = encode_checkpoint(&cursors);

        // Truncation mid-entry.
        encoded.truncate(encoded.len() - 3);
        let err = decode_checkpoint(&encoded).unwrap_err();
        assert!(err.to_string().contains("truncated"));

        // Wrong version.
        let mut bad_version = encode_checkpoint(&cursors);
        bad_version[4] = 9;
        assert!(decode_checkpoint(&bad_version)
            .unwrap_err()
            .to_string()
            .contains("version"));
    }

    #[tokio::test]
    async fn test_initialize_marks_caught_up_vbuckets() {
        let cluster = SimCluster::new(2);
        cluster.apply_mutation(1, b"k", b"v");

        let transport = cluster.connect("ckpt").await.expect("connect");
        let manager = CheckpointManager::new(
            "source",
            transport,
            CheckpointConfig::default(),
            StatsConfig::default(),
            true,
            2,
        );

        let mut ready = manager.subscribe_ready();
        assert!(!*ready.borrow());

        manager.initialize().await.expect("initialize");
        assert!(*ready.borrow_and_update());

        // vb 0 has no mutations: caught up immediately.
        let sp0 = manager.start_point(0);
        assert!(sp0.no_stream_needed);
        assert_eq!(sp0.cursor.seqno, 0);

        // vb 1 must stream up to its high seqno.
        let sp1 = manager.start_point(1);
        assert!(!sp1.no_stream_needed);
        assert_eq!(sp1.end_seqno, 1);
    }

    #[tokio::test]
    async fn test_final_persist_and_reload() {
        let dir = TempDir::new().expect("tempdir");
        let cluster = SimCluster::new(2);
        cluster.apply_mutation(0, b"k", b"v");

        let cfg = CheckpointConfig {
            file_dir: dir.path().to_path_buf(),
            new_filename: "ckpt".to_string(),
            interval: Duration::ZERO,
            ..Default::default()
        };

        let transport = cluster.connect("ckpt").await.expect("connect");
        let manager = CheckpointManager::new(
            "source",
            transport,
            cfg.clone(),
            StatsConfig::default(),
            true,
            2,
        );
        manager.initialize().await.expect("initialize");
        manager.cursors().update_seqno(0, 1);
        manager.stop().await.expect("stop");

        let data = std::fs::read(dir.path().join("source_ckpt")).expect("read checkpoint");
        let decoded = decode_checkpoint(&data).expect("decode");
        assert_eq!(decoded[&0].seqno, 1);
        assert_eq!(decoded[&1].seqno, 0);
    }
}
