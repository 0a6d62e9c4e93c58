use std::io;
use std::time::Duration;

use mcast_perf_core::transmitter::{QUIT_COUNT, WARMUP_COUNT};
use mcast_perf_core::{
    Collector, CollectorConfig, DatagramSink, MonotonicClock, ReportParams, RunPhase,
    SenderConfig, Summary, Transmitter,
};

/// Keeps every payload in send order
#[derive(Default)]
struct RecordingSink {
    datagrams: Vec<Vec<u8>>,
}

impl DatagramSink for RecordingSink {
    fn send_datagram(&mut self, payload: &[u8]) -> io::Result<()> {
        self.datagrams.push(payload.to_vec());
        Ok(())
    }
}

fn transmit(num_msgs: u64) -> RecordingSink {
    let config = SenderConfig {
        msg_len: 200,
        num_msgs,
        rate: 2_000_000,
        ..SenderConfig::default()
    };
    config.validate().unwrap();

    let clock = MonotonicClock::new();
    let mut transmitter = Transmitter::new(clock, &config).with_warmup_spacing(Duration::ZERO);
    let mut sink = RecordingSink::default();
    let report = transmitter.run(&mut sink, config.num_msgs).unwrap();
    assert_eq!(report.num_msgs, num_msgs);
    assert!(report.max_burst >= 1);
    sink
}

fn replay<'a>(collector: &mut Collector, datagrams: impl Iterator<Item = &'a Vec<u8>>) {
    for (t, d) in datagrams.enumerate() {
        collector.on_datagram(d, 1_000 * (t as u64 + 1)).unwrap();
    }
}

#[test]
fn test_clean_session_round_trip() {
    let sink = transmit(5_000);
    assert_eq!(
        sink.datagrams.len() as u64,
        WARMUP_COUNT + 5_000 + QUIT_COUNT
    );

    let mut collector = Collector::new(&CollectorConfig {
        num_msgs_expected: 5_000,
        sequence_check: true,
        ..CollectorConfig::default()
    });
    replay(&mut collector, sink.datagrams.iter());
    assert_eq!(collector.phase(), RunPhase::Quitting);

    let stats = collector.finish();
    assert_eq!(stats.num_msgs, 5_000);
    assert_eq!(stats.warmups, WARMUP_COUNT);
    assert_eq!(stats.quits, QUIT_COUNT);
    assert_eq!(stats.out_of_order, 0);
    assert_eq!(stats.sequence_issues, Some(Vec::new()));
    // last WARMUP at t=100us, first QUIT at t=5101us
    assert_eq!(stats.elapsed_ns, 5_001_000);

    let summary = Summary::from_stats(
        &stats,
        &ReportParams {
            num_msgs_expected: 5_000,
        },
    );
    assert_eq!(summary.loss.unwrap().count, 0);
    assert!(summary.msgs_per_sec.unwrap() > 0.0);
}

#[test]
fn test_lossy_session_counts_gaps() {
    let sink = transmit(1_000);

    // drop every 100th DATA datagram and the whole QUIT burst
    let warmup = WARMUP_COUNT as usize;
    let kept = sink
        .datagrams
        .iter()
        .enumerate()
        .filter(|(i, _)| {
            let data_index = i.wrapping_sub(warmup);
            *i < warmup || (data_index < 1_000 && data_index % 100 != 50)
        })
        .map(|(_, d)| d);

    let mut collector = Collector::new(&CollectorConfig {
        num_msgs_expected: 1_000,
        sequence_check: true,
        ..CollectorConfig::default()
    });
    replay(&mut collector, kept);
    assert_eq!(collector.phase(), RunPhase::Measuring);

    let stats = collector.finish();
    assert_eq!(stats.num_msgs, 990);
    assert_eq!(stats.out_of_order, 10);
    assert_eq!(stats.quits, 0);
    assert!(stats.elapsed_ns > 0);

    let issues = stats.sequence_issues.clone().unwrap();
    assert_eq!(issues.len(), 10);
    assert!(issues.iter().all(|i| i.count == 0 && i.sequence % 100 == 50));

    let summary = Summary::from_stats(
        &stats,
        &ReportParams {
            num_msgs_expected: 1_000,
        },
    );
    let loss = summary.loss.unwrap();
    assert_eq!(loss.count, 10);
    assert!((loss.percent - 1.0).abs() < 1e-9);
}
