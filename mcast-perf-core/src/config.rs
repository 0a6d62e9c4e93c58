use anyhow::{ensure, Result};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use crate::packet::{DEFAULT_MSG_LEN, HEADER_LEN, MAX_UDP_PAYLOAD};

/// Upper bound on the batched-receive capacity
pub const MAX_BATCH_CAPACITY: usize = 1024;

/// Where the multicast traffic flows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupEndpoint {
    pub group: Ipv4Addr,
    pub port: u16,
    /// Local interface address used to join / send
    pub interface: Ipv4Addr,
}

impl GroupEndpoint {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.group.is_multicast(),
            "{} is not a multicast group address",
            self.group
        );
        ensure!(self.port != 0, "destination port must be non-zero");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderConfig {
    pub msg_len: usize,
    pub num_msgs: u64,
    /// Target DATA rate in datagrams per second
    pub rate: u64,
    /// SO_SNDBUF request; 0 keeps the system default
    pub sndbuf_size: usize,
    pub pin_core: Option<usize>,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            msg_len: DEFAULT_MSG_LEN,
            num_msgs: 1_000_000,
            rate: 1_000,
            sndbuf_size: 0,
            pin_core: None,
        }
    }
}

impl SenderConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            (HEADER_LEN..=MAX_UDP_PAYLOAD).contains(&self.msg_len),
            "msg_len must be {}..={}, got {}",
            HEADER_LEN,
            MAX_UDP_PAYLOAD,
            self.msg_len
        );
        ensure!(self.rate > 0, "rate must be positive");
        Ok(())
    }
}

impl fmt::Display for SenderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "msg_len={}, num_msgs={}, rate={}, sndbuf_size={}",
            self.msg_len, self.num_msgs, self.rate, self.sndbuf_size
        )
    }
}

/// How the collector pulls datagrams off the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveMode {
    /// One datagram per receive call
    Single,
    /// Up to this many datagrams per receive call
    Batched(usize),
}

impl ReceiveMode {
    /// 0 selects single reads, anything else a batch of that capacity
    pub fn from_capacity(capacity: usize) -> Self {
        match capacity {
            0 => ReceiveMode::Single,
            k => ReceiveMode::Batched(k),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorConfig {
    /// Silence after the last datagram before the run is considered over
    pub linger: Duration,
    pub mode: ReceiveMode,
    /// DATA datagrams the sender will emit; 0 when unknown
    pub num_msgs_expected: u64,
    /// SO_RCVBUF request; 0 keeps the system default
    pub rcvbuf_size: usize,
    /// Upper bound on one readiness wait
    pub wait: Duration,
    /// Per-datagram trace logging
    pub verbose: bool,
    /// Count receipts per sequence number (needs `num_msgs_expected`)
    pub sequence_check: bool,
    pub output: Option<PathBuf>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            linger: Duration::from_millis(100),
            mode: ReceiveMode::Single,
            num_msgs_expected: 0,
            rcvbuf_size: 0x80_0000,
            wait: Duration::from_millis(10),
            verbose: false,
            sequence_check: false,
            output: None,
        }
    }
}

impl CollectorConfig {
    pub fn validate(&self) -> Result<()> {
        if let ReceiveMode::Batched(k) = self.mode {
            ensure!(
                k <= MAX_BATCH_CAPACITY,
                "multi_rcv must be at most {}, got {}",
                MAX_BATCH_CAPACITY,
                k
            );
        }
        ensure!(
            !self.sequence_check || self.num_msgs_expected > 0,
            "sequence checking needs the expected message count"
        );
        Ok(())
    }
}

impl fmt::Display for CollectorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let multi_rcv = match self.mode {
            ReceiveMode::Single => 0,
            ReceiveMode::Batched(k) => k,
        };
        write!(
            f,
            "linger_ms={}, multi_rcv={}, num_msgs_expected={}, rcvbuf_size={}, wait_ms={}, sequence_check={}",
            self.linger.as_millis(),
            multi_rcv,
            self.num_msgs_expected,
            self.rcvbuf_size,
            self.wait.as_millis(),
            self.sequence_check
        )
    }
}
