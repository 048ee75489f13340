//! DCP driver.
//!
//! One driver per cluster. It discovers credentials, brings up the
//! checkpoint manager, splits the vbucket space across its client fleet,
//! and tears everything down in order on stop. Completion is aggregated in
//! the vbucket tracker; once every vbucket completes, the tracker's
//! all-done token fires and the driver's owner stops it.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{CaptureConfig, CheckpointConfig, ClusterConfig, StatsConfig};
use crate::dcp::checkpoint::CheckpointManager;
use crate::dcp::client::DcpClient;
use crate::dcp::{balance_load, CaptureContext, ErrorSink, VbState, VbTracker};
use crate::fdpool::FdPool;
use crate::transport::ClusterEndpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    New,
    Started,
    Stopped,
}

pub struct DcpDriver {
    name: String,
    cluster_cfg: ClusterConfig,
    capture_cfg: CaptureConfig,
    checkpoint_cfg: CheckpointConfig,
    stats_cfg: StatsConfig,
    endpoint: Arc<dyn ClusterEndpoint>,
    fd_pool: Arc<FdPool>,
    state: Mutex<DriverState>,
    tracker: Arc<VbTracker>,
    errors: ErrorSink,
    error_rx: Option<mpsc::Receiver<anyhow::Error>>,
    checkpoints: Option<Arc<CheckpointManager>>,
    clients: Vec<DcpClient>,
}

impl DcpDriver {
    pub fn new(
        name: &str,
        cluster_cfg: ClusterConfig,
        capture_cfg: CaptureConfig,
        checkpoint_cfg: CheckpointConfig,
        stats_cfg: StatsConfig,
        endpoint: Arc<dyn ClusterEndpoint>,
        fd_pool: Arc<FdPool>,
    ) -> Self {
        let (errors, error_rx) = ErrorSink::new();
        let tracker = Arc::new(VbTracker::new(endpoint.num_vbuckets()));

        Self {
            name: name.to_string(),
            cluster_cfg,
            capture_cfg,
            checkpoint_cfg,
            stats_cfg,
            endpoint,
            fd_pool,
            state: Mutex::new(DriverState::New),
            tracker,
            errors,
            error_rx: Some(error_rx),
            checkpoints: None,
            clients: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Vbucket state map shared with this driver's clients and handlers.
    pub fn tracker(&self) -> Arc<VbTracker> {
        Arc::clone(&self.tracker)
    }

    /// Token that fires once every vbucket has completed.
    pub fn completion(&self) -> CancellationToken {
        self.tracker.all_done()
    }

    /// Whether any component reported an error during the run.
    pub fn had_errors(&self) -> bool {
        self.errors.any_error()
    }

    /// The driver's error channel. The first errors of the run land here;
    /// every error is also logged at the point of report.
    pub fn take_error_receiver(&mut self) -> Option<mpsc::Receiver<anyhow::Error>> {
        self.error_rx.take()
    }

    /// Bring up the checkpoint manager and the client fleet.
    pub async fn start(&mut self) -> Result<()> {
        let mut state = self.state.lock().await;
        if *state != DriverState::New {
            bail!("dcp driver {} already started", self.name);
        }

        info!(driver = %self.name, url = %self.cluster_cfg.url, "dcp driver starting");

        let credentials = self
            .endpoint
            .credentials()
            .await
            .with_context(|| format!("{}: discovering credentials", self.name))?;
        info!(
            driver = %self.name,
            rbac_supported = credentials.rbac_supported,
            "resolved cluster credentials",
        );

        std::fs::create_dir_all(&self.cluster_cfg.file_dir).with_context(|| {
            format!(
                "{}: creating output dir {}",
                self.name,
                self.cluster_cfg.file_dir.display()
            )
        })?;

        let ckpt_transport = self
            .endpoint
            .connect(&format!("{}_checkpoint", self.name))
            .await
            .with_context(|| format!("{}: connecting checkpoint manager", self.name))?;

        let checkpoints = Arc::new(CheckpointManager::new(
            &self.name,
            ckpt_transport,
            self.checkpoint_cfg.clone(),
            self.stats_cfg.clone(),
            self.capture_cfg.complete_by_seqno,
            self.endpoint.num_vbuckets(),
        ));
        checkpoints
            .initialize()
            .await
            .with_context(|| format!("{}: initializing checkpoint manager", self.name))?;
        checkpoints.start();
        info!(driver = %self.name, "checkpoint manager started");

        let ctx = CaptureContext {
            file_dir: self.cluster_cfg.file_dir.clone(),
            n_bins: self.capture_cfg.n_bins,
            fd_pool: Arc::clone(&self.fd_pool),
            cursors: checkpoints.cursors(),
            tracker: Arc::clone(&self.tracker),
            errors: self.errors.clone(),
        };

        let num_vbuckets = usize::from(self.endpoint.num_vbuckets());
        let split = balance_load(self.cluster_cfg.clients, num_vbuckets);
        for (i, (low, high)) in split.into_iter().enumerate() {
            let vb_list: Vec<u16> = (low..high).map(|vbno| vbno as u16).collect();
            let mut client = DcpClient::new(
                format!("{}_{}", self.name, i),
                vb_list,
                self.cluster_cfg.workers_per_client,
                self.cluster_cfg.handler_chan_size,
                self.capture_cfg.complete_by_seqno,
                Arc::clone(&self.endpoint),
                Arc::clone(&checkpoints),
                ctx.clone(),
            );

            if let Err(e) = client.start().await {
                // Unwind the clients that did come up before failing out.
                for started in &mut self.clients {
                    started.stop().await;
                }
                return Err(e.context(format!("{}: starting dcp client {i}", self.name)));
            }
            self.clients.push(client);
        }

        self.checkpoints = Some(checkpoints);
        *state = DriverState::Started;
        info!(driver = %self.name, clients = self.clients.len(), "dcp driver started");

        Ok(())
    }

    /// Stop clients in order, then the checkpoint manager (which persists
    /// final cursors). A no-op unless the driver is started.
    pub async fn stop(&mut self) -> Result<()> {
        let mut state = self.state.lock().await;
        if *state != DriverState::Started {
            info!(driver = %self.name, "skipping stop, driver not started");
            return Ok(());
        }

        info!(driver = %self.name, "dcp driver stopping");

        for client in &mut self.clients {
            client.stop().await;
        }

        if let Some(checkpoints) = &self.checkpoints {
            if let Err(e) = checkpoints.stop().await {
                error!(driver = %self.name, error = %format!("{e:#}"), "error stopping checkpoint manager");
            }
        }

        *state = DriverState::Stopped;
        info!(driver = %self.name, "dcp driver stopped");

        Ok(())
    }

    /// Current state of one vbucket.
    pub fn vb_state(&self, vbno: u16) -> VbState {
        self.tracker.state(vbno)
    }

    /// Number of completed vbuckets.
    pub fn completed_vbuckets(&self) -> usize {
        self.tracker.completed_count()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::transport::sim::SimCluster;

    fn driver_for(cluster: &Arc<SimCluster>, dir: &TempDir) -> DcpDriver {
        let mut cluster_cfg = ClusterConfig {
            url: "mem://test".to_string(),
            bucket: "b".to_string(),
            ..crate::config::Config::default().source
        };
        cluster_cfg.file_dir = dir.path().join("source");
        cluster_cfg.clients = 2;
        cluster_cfg.workers_per_client = 2;
        cluster_cfg.handler_chan_size = 16;

        let checkpoint_cfg = CheckpointConfig {
            file_dir: dir.path().join("checkpoint"),
            ..Default::default()
        };

        DcpDriver::new(
            "source",
            cluster_cfg,
            CaptureConfig {
                n_bins: 2,
                n_fd: 8,
                ..Default::default()
            },
            checkpoint_cfg,
            StatsConfig::default(),
            Arc::<SimCluster>::clone(cluster),
            Arc::new(FdPool::new(8)),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_driver_completes_on_quiet_cluster() {
        let dir = TempDir::new().expect("tempdir");
        let cluster = SimCluster::new(8);

        let mut driver = driver_for(&cluster, &dir);
        let completion = driver.completion();

        driver.start().await.expect("start");
        completion.cancelled().await;

        assert_eq!(driver.completed_vbuckets(), 8);
        driver.stop().await.expect("stop");
        assert!(!driver.had_errors());
    }

    #[tokio::test]
    async fn test_stop_before_start_is_a_noop() {
        let dir = TempDir::new().expect("tempdir");
        let cluster = SimCluster::new(2);
        let mut driver = driver_for(&cluster, &dir);
        driver.stop().await.expect("stop is a no-op");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_double_start_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let cluster = SimCluster::new(2);
        let mut driver = driver_for(&cluster, &dir);

        driver.start().await.expect("first start");
        let err = driver.start().await.unwrap_err();
        assert!(err.to_string().contains("already started"));
        driver.stop().await.expect("stop");
    }
}
