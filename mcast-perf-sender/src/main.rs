use anyhow::{Context, Result};
use clap::Parser;
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

use mcast_perf_core::packet::DEFAULT_MSG_LEN;
use mcast_perf_core::report::throughput;
use mcast_perf_core::transport::open_sender;
use mcast_perf_core::{GroupEndpoint, MonotonicClock, SenderConfig, SenderReport, Transmitter};

#[derive(Parser, Debug)]
#[command(name = "mcast-perf-sender")]
#[command(about = "Paced multicast sender for throughput and loss measurement")]
#[command(version)]
struct Args {
    /// Size (bytes) of each UDP datagram
    #[arg(short = 'm', long, default_value_t = DEFAULT_MSG_LEN)]
    msg_len: usize,

    /// Number of measurement (DATA) datagrams to send
    #[arg(short = 'n', long, default_value_t = 1_000_000)]
    num_msgs: u64,

    /// Datagrams per second to send
    #[arg(short = 'r', long, default_value_t = 1_000)]
    rate: u64,

    /// Sender socket buffer size (0 = system default)
    #[arg(short = 's', long, default_value_t = 0)]
    sndbuf_size: usize,

    /// Pin the send loop to this CPU core
    #[arg(long)]
    pin_core: Option<usize>,

    /// Multicast group to send to
    group: Ipv4Addr,

    /// Destination port
    port: u16,

    /// IP address of the local interface to send from
    interface: Ipv4Addr,
}

impl Args {
    fn into_config(self) -> Result<(GroupEndpoint, SenderConfig)> {
        let endpoint = GroupEndpoint {
            group: self.group,
            port: self.port,
            interface: self.interface,
        };
        endpoint.validate()?;

        let config = SenderConfig {
            msg_len: self.msg_len,
            num_msgs: self.num_msgs,
            rate: self.rate,
            sndbuf_size: self.sndbuf_size,
            pin_core: self.pin_core,
        };
        config.validate()?;
        Ok((endpoint, config))
    }
}

/// Pin the calling thread; the busy-wait loop is sensitive to migrations
fn pin_to_core(index: usize) {
    match core_affinity::get_core_ids() {
        Some(cores) if !cores.is_empty() => {
            let core = cores[index % cores.len()];
            if core_affinity::set_for_current(core) {
                info!("Send loop pinned to CPU core {}", core.id);
            } else {
                warn!("Failed to pin send loop to CPU core {}", core.id);
            }
        }
        _ => info!("CPU affinity not supported on this platform, continuing without core pinning"),
    }
}

fn run_session(endpoint: GroupEndpoint, config: SenderConfig) -> Result<SenderReport> {
    if let Some(core) = config.pin_core {
        pin_to_core(core);
    }

    let mut sink = open_sender(&endpoint, config.sndbuf_size)?;
    let mut transmitter = Transmitter::new(MonotonicClock::new(), &config);
    debug!("Session starting against {:?}", sink.dest_addr());
    transmitter.run(&mut sink, config.num_msgs)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let (endpoint, config) = args.into_config()?;
    info!("Starting multicast sender: {}", config);

    let options = config.to_string();
    let msg_len = config.msg_len;

    // The paced loop spins on the clock; keep it off the async workers
    let report = tokio::task::spawn_blocking(move || run_session(endpoint, config))
        .await
        .context("Send loop panicked")??;

    let (msgs_per_sec, bits_per_sec) = throughput(report.num_msgs, msg_len, report.elapsed_ns);
    println!("{}", options);
    println!(
        "{} dgrams at {:.0} dgrams/sec ({:.0} bits/sec), {} max tight sends",
        report.num_msgs,
        msgs_per_sec.unwrap_or(0.0),
        bits_per_sec.unwrap_or(0.0),
        report.max_burst
    );

    info!("Multicast sender shutdown complete");
    Ok(())
}
