use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, EnvFilter};

use diffoor::config::Config;
use diffoor::dcp::driver::DcpDriver;
use diffoor::fdpool::FdPool;
use diffoor::transport;

/// Two-cluster mutation capture for replication verification.
#[derive(Parser)]
#[command(name = "diffoor", about, version)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    // Every configuration option is overridable from the command line.
    #[arg(long)]
    source_url: Option<String>,
    #[arg(long)]
    source_bucket: Option<String>,
    #[arg(long)]
    source_username: Option<String>,
    #[arg(long)]
    source_password: Option<String>,
    #[arg(long)]
    source_file_dir: Option<PathBuf>,
    #[arg(long)]
    source_clients: Option<usize>,
    #[arg(long)]
    source_workers_per_client: Option<usize>,
    #[arg(long)]
    source_handler_chan_size: Option<usize>,

    #[arg(long)]
    target_url: Option<String>,
    #[arg(long)]
    target_bucket: Option<String>,
    #[arg(long)]
    target_username: Option<String>,
    #[arg(long)]
    target_password: Option<String>,
    #[arg(long)]
    target_file_dir: Option<PathBuf>,
    #[arg(long)]
    target_clients: Option<usize>,
    #[arg(long)]
    target_workers_per_client: Option<usize>,
    #[arg(long)]
    target_handler_chan_size: Option<usize>,

    #[arg(long)]
    n_bins: Option<u32>,
    #[arg(long)]
    n_fd: Option<usize>,
    #[arg(long)]
    complete_by_seqno: Option<bool>,
    /// Wall-clock bound for the run, in seconds. Zero means unbounded.
    #[arg(long)]
    complete_by_duration_secs: Option<u64>,
    /// Stagger between source and target driver start, in seconds.
    #[arg(long)]
    delay_between_source_and_target_secs: Option<u64>,

    #[arg(long)]
    checkpoint_file_dir: Option<PathBuf>,
    #[arg(long)]
    old_source_checkpoint_filename: Option<String>,
    #[arg(long)]
    old_target_checkpoint_filename: Option<String>,
    #[arg(long)]
    new_checkpoint_filename: Option<String>,
    /// Periodic checkpoint interval, in seconds. Zero disables.
    #[arg(long)]
    checkpoint_interval_secs: Option<u64>,

    /// Bucket stats operation timeout, in seconds.
    #[arg(long)]
    bucket_op_timeout_secs: Option<u64>,
    #[arg(long)]
    max_get_stats_retry: Option<u32>,
    /// Initial stats retry interval, in seconds.
    #[arg(long)]
    get_stats_retry_interval_secs: Option<u64>,
    /// Stats retry backoff cap, in seconds.
    #[arg(long)]
    get_stats_max_backoff_secs: Option<u64>,
}

impl Cli {
    /// Fold command-line overrides into the loaded configuration.
    fn apply(&self, cfg: &mut Config) {
        macro_rules! set {
            ($field:expr, $value:expr) => {
                if let Some(value) = &$value {
                    $field = value.clone();
                }
            };
        }
        macro_rules! set_secs {
            ($field:expr, $value:expr) => {
                if let Some(secs) = $value {
                    $field = Duration::from_secs(secs);
                }
            };
        }

        set!(cfg.log_level, self.log_level);

        set!(cfg.source.url, self.source_url);
        set!(cfg.source.bucket, self.source_bucket);
        set!(cfg.source.username, self.source_username);
        set!(cfg.source.password, self.source_password);
        set!(cfg.source.file_dir, self.source_file_dir);
        set!(cfg.source.clients, self.source_clients);
        set!(cfg.source.workers_per_client, self.source_workers_per_client);
        set!(cfg.source.handler_chan_size, self.source_handler_chan_size);

        set!(cfg.target.url, self.target_url);
        set!(cfg.target.bucket, self.target_bucket);
        set!(cfg.target.username, self.target_username);
        set!(cfg.target.password, self.target_password);
        set!(cfg.target.file_dir, self.target_file_dir);
        set!(cfg.target.clients, self.target_clients);
        set!(cfg.target.workers_per_client, self.target_workers_per_client);
        set!(cfg.target.handler_chan_size, self.target_handler_chan_size);

        set!(cfg.capture.n_bins, self.n_bins);
        set!(cfg.capture.n_fd, self.n_fd);
        set!(cfg.capture.complete_by_seqno, self.complete_by_seqno);
        set_secs!(cfg.capture.complete_by_duration, self.complete_by_duration_secs);
        set_secs!(
            cfg.capture.delay_between_source_and_target,
            self.delay_between_source_and_target_secs
        );

        set!(cfg.checkpoint.file_dir, self.checkpoint_file_dir);
        set!(
            cfg.checkpoint.old_source_filename,
            self.old_source_checkpoint_filename
        );
        set!(
            cfg.checkpoint.old_target_filename,
            self.old_target_checkpoint_filename
        );
        set!(cfg.checkpoint.new_filename, self.new_checkpoint_filename);
        set_secs!(cfg.checkpoint.interval, self.checkpoint_interval_secs);

        set_secs!(cfg.stats.bucket_op_timeout, self.bucket_op_timeout_secs);
        set!(cfg.stats.max_get_stats_retry, self.max_get_stats_retry);
        set_secs!(
            cfg.stats.get_stats_retry_interval,
            self.get_stats_retry_interval_secs
        );
        set_secs!(
            cfg.stats.get_stats_max_backoff,
            self.get_stats_max_backoff_secs
        );
    }
}

fn main() {
    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("diffoor: {e:#}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    cli.apply(&mut cfg);

    let filter = match EnvFilter::try_new(&cfg.log_level) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("diffoor: invalid log level {:?}: {e}", cfg.log_level);
            std::process::exit(1);
        }
    };
    fmt().with_env_filter(filter).with_target(true).init();

    if let Err(e) = cfg.validate() {
        error!(error = %format!("{e:#}"), "invalid configuration");
        std::process::exit(1);
    }

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "building tokio runtime");
            std::process::exit(1);
        }
    };

    let code = match rt.block_on(run(cfg)) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "capture run failed");
            1
        }
    };

    std::process::exit(code);
}

/// Run both capture drivers to completion and return the process exit code.
async fn run(cfg: Config) -> Result<i32> {
    let fd_pool = Arc::new(FdPool::new(cfg.capture.n_fd));

    let source_endpoint =
        transport::endpoint(&cfg.source).context("resolving source cluster endpoint")?;
    let target_endpoint =
        transport::endpoint(&cfg.target).context("resolving target cluster endpoint")?;

    let mut source = DcpDriver::new(
        "source",
        cfg.source.clone(),
        cfg.capture.clone(),
        cfg.checkpoint.clone(),
        cfg.stats.clone(),
        source_endpoint,
        Arc::clone(&fd_pool),
    );
    let mut target = DcpDriver::new(
        "target",
        cfg.target.clone(),
        cfg.capture.clone(),
        cfg.checkpoint.clone(),
        cfg.stats.clone(),
        target_endpoint,
        Arc::clone(&fd_pool),
    );

    spawn_error_logger(&mut source);
    spawn_error_logger(&mut target);

    let source_done = source.completion();
    let target_done = target.completion();

    source.start().await.context("starting source driver")?;

    if !cfg.capture.delay_between_source_and_target.is_zero() {
        debug!(
            delay = ?cfg.capture.delay_between_source_and_target,
            "staggering target driver start",
        );
        tokio::time::sleep(cfg.capture.delay_between_source_and_target).await;
    }

    if let Err(e) = target.start().await.context("starting target driver") {
        let _ = source.stop().await;
        return Err(e);
    }

    let deadline = cfg.capture.complete_by_duration;
    tokio::select! {
        _ = async {
            source_done.cancelled().await;
            target_done.cancelled().await;
        } => {
            info!("both clusters fully captured");
        }
        _ = async {
            if deadline.is_zero() {
                std::future::pending::<()>().await
            } else {
                tokio::time::sleep(deadline).await
            }
        } => {
            info!(?deadline, "complete-by-duration reached");
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    source.stop().await.context("stopping source driver")?;
    target.stop().await.context("stopping target driver")?;
    fd_pool.close_all();

    if source.had_errors() || target.had_errors() {
        info!("capture finished with errors");
        Ok(1)
    } else {
        info!("capture finished");
        Ok(0)
    }
}

/// Surface the first errors of a driver's run on the error channel.
fn spawn_error_logger(driver: &mut DcpDriver) {
    let name = driver.name().to_string();
    let Some(mut rx) = driver.take_error_receiver() else {
        return;
    };

    tokio::spawn(async move {
        while let Some(err) = rx.recv().await {
            debug!(driver = %name, error = %format!("{err:#}"), "error recorded on driver channel");
        }
    });
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    tokio::select! {
        _ = ctrl_c => {}
        _ = sigterm.recv() => {}
    }
}
