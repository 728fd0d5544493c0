//! CaptureRun Control Plane Server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use capturerun_control_plane::config::{Config, QueueLimits};
use capturerun_control_plane::http;
use capturerun_control_plane::stall::{StallConfig, StallThresholds};
use capturerun_control_plane::stub::{StubCapturer, StubConverter, StubProvisioner};
use capturerun_control_plane::AppState;
use capturerun_core::WorkpoolSpec;

/// CaptureRun control plane.
#[derive(Parser, Debug)]
#[command(name = "capturerun-control-plane")]
#[command(about = "Schedules capture jobs onto leased VMs")]
struct Args {
    /// HTTP bind address
    #[arg(long, default_value = "[::1]:50080")]
    http_addr: String,

    /// Maximum concurrently running tasks (0 means 1)
    #[arg(long, default_value_t = 4)]
    max_running: usize,

    /// Finished tasks retained before eviction (0 means 1000)
    #[arg(long, default_value_t = 100)]
    max_finished: usize,

    /// Seconds a job waits for a workpool instance
    #[arg(long, default_value_t = 600)]
    lease_wait_timeout_secs: u64,

    /// Seconds a cancelled job gets to wind down
    #[arg(long, default_value_t = 10)]
    abort_grace_secs: u64,

    /// Seconds between conversion backend polls
    #[arg(long, default_value_t = 5)]
    poll_interval_secs: u64,

    /// Seconds of idleness before a conversion counts as stalled
    #[arg(long, default_value_t = 1200)]
    stall_timeout_secs: u64,

    /// CPU threshold in hundredths of a percent
    #[arg(long, default_value_t = 500)]
    stall_cpu: i64,

    /// Network threshold in KBps
    #[arg(long, default_value_t = 10)]
    stall_net: i64,

    /// Disk threshold in KBps
    #[arg(long, default_value_t = 10)]
    stall_disk: i64,

    /// Name of the growable workpool created at startup
    #[arg(long, default_value = "default")]
    workpool: String,

    /// Instance cap of the startup workpool
    #[arg(long, default_value_t = 2)]
    workpool_size: usize,

    /// Per-step delay of the built-in stub hypervisor, in milliseconds
    #[arg(long, default_value_t = 500)]
    stub_delay_ms: u64,
}

impl Args {
    fn config(&self) -> Config {
        let poll_interval = Duration::from_secs(self.poll_interval_secs.max(1));
        Config {
            http_addr: self.http_addr.clone(),
            limits: QueueLimits::new(self.max_running, self.max_finished),
            abort_grace: Duration::from_secs(self.abort_grace_secs),
            lease_wait_timeout: Duration::from_secs(self.lease_wait_timeout_secs),
            poll_interval,
            stall: StallConfig {
                thresholds: StallThresholds {
                    cpu: self.stall_cpu,
                    net: self.stall_net,
                    disk: self.stall_disk,
                },
                timeout: Duration::from_secs(self.stall_timeout_secs),
                poll_interval,
            },
            ..Config::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("capturerun_control_plane=info".parse()?),
        )
        .with_target(true)
        .init();

    let args = Args::parse();
    let config = args.config();
    let http_addr: SocketAddr = config.http_addr.parse()?;
    let grace = config.abort_grace;

    // Hypervisor and conversion backends
    let delay = Duration::from_millis(args.stub_delay_ms);
    let state = AppState::new(
        config,
        Arc::new(StubProvisioner::new(delay)),
        Arc::new(StubCapturer::new(delay)),
        Arc::new(StubConverter::new(delay)),
    );

    state.pool.create_workpool(
        WorkpoolSpec::new(args.workpool.as_str(), args.workpool_size).growable(),
    )?;
    info!(
        workpool = %args.workpool,
        max_instances = args.workpool_size,
        "Default workpool created"
    );

    let router = http::create_router(Arc::clone(&state));
    let listener = TcpListener::bind(http_addr).await?;
    info!(http_addr = %http_addr, "Starting CaptureRun control plane");

    let result = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    if let Err(e) = &result {
        error!(error = %e, "HTTP server error");
    }

    info!("Shutting down scheduler");
    state.shutdown(grace).await;

    result.map_err(Into::into)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
}
