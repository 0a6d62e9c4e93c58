use anyhow::{Context, Result};
use clap::Parser;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use mcast_perf_core::transport::open_receiver;
use mcast_perf_core::{
    strategy_for, Collector, CollectorConfig, GroupEndpoint, MonotonicClock, ReceiveMode,
    ReportParams, RunStats, StopReason, Summary,
};

#[derive(Parser, Debug)]
#[command(name = "mcast-perf-receiver")]
#[command(about = "Multicast collector measuring throughput, sequence breaks and loss")]
#[command(version)]
struct Args {
    /// Silence (ms) after the last datagram before exiting
    #[arg(short = 'l', long, default_value_t = 100)]
    linger_ms: u64,

    /// Datagrams per receive call via recvmmsg (0 = one recvfrom per call)
    #[arg(short = 'm', long, default_value_t = 0)]
    multi_rcv: usize,

    /// DATA datagrams the sender will emit, for loss reporting (0 = unknown)
    #[arg(short = 'n', long, default_value_t = 0)]
    num_msgs_expected: u64,

    /// Receive socket buffer size (0 = system default)
    #[arg(short = 'r', long, default_value_t = 0x80_0000)]
    rcvbuf_size: usize,

    /// Longest single wait (ms) for the socket to become readable
    #[arg(short = 'w', long, default_value_t = 10)]
    wait_ms: u64,

    /// Log every datagram
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Count receipts per sequence number and list duplicates/gaps at exit
    #[arg(long, default_value = "false")]
    sequence_check: bool,

    /// Also write the summary to this file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Multicast group to join
    group: Ipv4Addr,

    /// Destination port
    port: u16,

    /// IP address of the local interface to join on
    interface: Ipv4Addr,
}

impl Args {
    fn into_config(self) -> Result<(GroupEndpoint, CollectorConfig)> {
        let endpoint = GroupEndpoint {
            group: self.group,
            port: self.port,
            interface: self.interface,
        };
        endpoint.validate()?;

        let config = CollectorConfig {
            linger: Duration::from_millis(self.linger_ms),
            mode: ReceiveMode::from_capacity(self.multi_rcv),
            num_msgs_expected: self.num_msgs_expected,
            rcvbuf_size: self.rcvbuf_size,
            wait: Duration::from_millis(self.wait_ms),
            verbose: self.verbose,
            sequence_check: self.sequence_check,
            output: self.output,
        };
        config.validate()?;
        Ok((endpoint, config))
    }
}

/// Raise `quit` on Ctrl+C or SIGTERM
fn spawn_signal_watcher(quit: Arc<AtomicBool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
                        _ = term.recv() => info!("Received SIGTERM, shutting down"),
                    }
                }
                Err(e) => {
                    warn!("Failed to listen for SIGTERM: {}", e);
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("Received Ctrl+C, shutting down");
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down");
            }
        }
        quit.store(true, Ordering::Relaxed);
    });
}

fn collect(
    endpoint: GroupEndpoint,
    config: &CollectorConfig,
    quit: &AtomicBool,
) -> Result<(RunStats, StopReason)> {
    let mut socket = open_receiver(&endpoint, config.rcvbuf_size)?;
    let mut strategy = strategy_for(config.mode);
    let mut collector = Collector::new(config);

    let reason = collector
        .run(&mut socket, strategy.as_mut(), &MonotonicClock::new(), quit)
        .context("Collector stopped on a fatal error")?;
    Ok((collector.finish(), reason))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .init();

    let (endpoint, config) = args.into_config()?;
    info!(
        "Starting multicast collector on {}:{} via {} ({})",
        endpoint.group, endpoint.port, endpoint.interface, config
    );

    let quit = Arc::new(AtomicBool::new(false));
    spawn_signal_watcher(quit.clone());

    let config = Arc::new(config);
    let (stats, reason) = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || collect(endpoint, &config, &quit))
            .await
            .context("Receive loop panicked")??
    };
    info!("Run ended: {:?}", reason);

    let summary = Summary::from_stats(&stats, &ReportParams::from(&*config));
    let text = format!("\n{}\n{}\n", config, summary);
    print!("{}", text);

    if let Some(path) = &config.output {
        std::fs::write(path, text.trim_start())
            .with_context(|| format!("Failed to write summary to {}", path.display()))?;
        info!("Summary written to {}", path.display());
    }

    Ok(())
}
