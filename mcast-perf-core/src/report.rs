use std::fmt;

use crate::collector::{RunStats, SequenceIssue};
use crate::config::CollectorConfig;

/// UDP header
pub const UDP_HEADER: u64 = 8;
/// IPv4 header without options
pub const IP_HEADER: u64 = 20;
/// Ethernet header
pub const ETHERNET_HEADER: u64 = 14;
/// Ethernet frame check sequence
pub const ETHERNET_FCS: u64 = 4;
/// Inter-frame gap (96 bit times)
pub const INTERFRAME_GAP: u64 = 12;

/// Wire bytes each datagram costs beyond its payload
pub const FRAMING_OVERHEAD: u64 =
    UDP_HEADER + IP_HEADER + ETHERNET_HEADER + ETHERNET_FCS + INTERFRAME_GAP;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// `count * 1e9 / elapsed_ns` from the exact integer product
fn per_second(count: u128, elapsed_ns: u64) -> Option<f64> {
    if elapsed_ns == 0 {
        return None;
    }
    Some((count * NANOS_PER_SEC) as f64 / elapsed_ns as f64)
}

/// Datagrams and bits per second for `num_msgs` payloads of `msg_len` bytes
pub fn throughput(num_msgs: u64, msg_len: usize, elapsed_ns: u64) -> (Option<f64>, Option<f64>) {
    let bits = num_msgs as u128 * 8 * (msg_len as u128 + FRAMING_OVERHEAD as u128);
    (
        per_second(num_msgs as u128, elapsed_ns),
        per_second(bits, elapsed_ns),
    )
}

/// Run facts the counters alone do not carry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportParams {
    /// DATA datagrams the sender announced, 0 when unknown
    pub num_msgs_expected: u64,
}

impl From<&CollectorConfig> for ReportParams {
    fn from(config: &CollectorConfig) -> Self {
        Self {
            num_msgs_expected: config.num_msgs_expected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Loss {
    /// Negative when duplicates pushed the count past the expected total
    pub count: i64,
    pub percent: f64,
}

/// Final numbers derived from a run's counters
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub num_msgs: u64,
    pub msg_len: usize,
    pub elapsed_ns: u64,
    pub msgs_per_sec: Option<f64>,
    pub bits_per_sec: Option<f64>,
    pub max_dgrams_per_wakeup: u64,
    pub warmups: u64,
    pub quits: u64,
    pub out_of_order: u64,
    pub loss: Option<Loss>,
    pub sequence_issues: Option<Vec<SequenceIssue>>,
    pub out_of_range: u64,
}

impl Summary {
    pub fn from_stats(stats: &RunStats, params: &ReportParams) -> Self {
        let expected = params.num_msgs_expected;
        let (msgs_per_sec, bits_per_sec) =
            throughput(stats.num_msgs, stats.msg_len, stats.elapsed_ns);

        let loss = (expected > 0).then(|| {
            let count = expected as i64 - stats.num_msgs as i64;
            Loss {
                count,
                percent: count as f64 * 100.0 / expected as f64,
            }
        });

        Self {
            num_msgs: stats.num_msgs,
            msg_len: stats.msg_len,
            elapsed_ns: stats.elapsed_ns,
            msgs_per_sec,
            bits_per_sec,
            max_dgrams_per_wakeup: stats.max_dgrams_per_wakeup,
            warmups: stats.warmups,
            quits: stats.quits,
            out_of_order: stats.out_of_order,
            loss,
            sequence_issues: stats.sequence_issues.clone(),
            out_of_range: stats.out_of_range,
        }
    }
}

fn rate(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:.0}", v),
        None => "n/a".to_string(),
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(issues) = &self.sequence_issues {
            write!(f, "Sqn issues:")?;
            for issue in issues {
                write!(f, " sqn_cnt[{}]={}", issue.sequence, issue.count)?;
            }
            if self.out_of_range > 0 {
                write!(f, " ({} beyond expected range)", self.out_of_range)?;
            }
            writeln!(f)?;
        }

        write!(
            f,
            "{} dgrams at {} dgrams/sec ({} bits/sec) over {:.6} s, {} max dgrams in loop, {} warmups, {} quits, {} ooo",
            self.num_msgs,
            rate(self.msgs_per_sec),
            rate(self.bits_per_sec),
            self.elapsed_ns as f64 / 1e9,
            self.max_dgrams_per_wakeup,
            self.warmups,
            self.quits,
            self.out_of_order
        )?;

        if let Some(loss) = self.loss {
            write!(f, ", {} loss ({:.2}%)", loss.count, loss.percent)?;
        }
        Ok(())
    }
}
