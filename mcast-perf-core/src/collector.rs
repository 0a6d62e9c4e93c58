use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::CollectorConfig;
use crate::error::CollectorError;
use crate::packet::{DatagramHeader, MessageType};
use crate::receive::ReceiveStrategy;

const SOCKET: Token = Token(0);

/// Receive calls made per wakeup before the quit flag is looked at again.
/// A socket still readable after this many is drained again without waiting.
const MAX_RECEIVES_PER_WAKEUP: usize = 4096;

/// Collector-side view of the sender's progress. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunPhase {
    Init,
    Measuring,
    Quitting,
}

/// Why the receive loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// No traffic for longer than the linger duration
    Linger,
    /// External interrupt
    Interrupted,
}

/// A sequence number whose receipt count was not exactly one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceIssue {
    pub sequence: u32,
    pub count: u8,
}

/// DATA sequence bookkeeping.
///
/// Any arrival other than `previous + 1` counts once, whether it is a gap, a
/// duplicate or a step backwards.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    previous: Option<u32>,
    out_of_order: u64,
    receipts: Option<Vec<u8>>,
    out_of_range: u64,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also count receipts for every sequence in `0..expected`
    pub fn with_receipts(expected: u64) -> Self {
        Self {
            receipts: Some(vec![0u8; expected as usize]),
            ..Self::default()
        }
    }

    /// Returns false when `sequence` broke contiguity
    pub fn record(&mut self, sequence: u32) -> bool {
        let contiguous = match self.previous {
            Some(prev) => sequence == prev.wrapping_add(1),
            None => true,
        };
        if !contiguous {
            self.out_of_order += 1;
        }
        self.previous = Some(sequence);

        if let Some(receipts) = self.receipts.as_mut() {
            match receipts.get_mut(sequence as usize) {
                Some(count) => {
                    *count = count.saturating_add(1);
                    if *count == 2 {
                        debug!("Duplicate DATA sequence {}", sequence);
                    }
                }
                None => self.out_of_range += 1,
            }
        }
        contiguous
    }

    pub fn out_of_order(&self) -> u64 {
        self.out_of_order
    }

    pub fn previous(&self) -> Option<u32> {
        self.previous
    }

    /// Sequences seen zero times or more than once; `None` when receipts
    /// are not being counted
    pub fn issues(&self) -> Option<Vec<SequenceIssue>> {
        self.receipts.as_ref().map(|receipts| {
            receipts
                .iter()
                .enumerate()
                .filter(|&(_, &count)| count != 1)
                .map(|(sequence, &count)| SequenceIssue {
                    sequence: sequence as u32,
                    count,
                })
                .collect()
        })
    }
}

/// Counters for one run, handed to the reporter when the run ends
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub num_msgs: u64,
    /// From the measured start to the QUIT (or last packet) stop
    pub elapsed_ns: u64,
    pub out_of_order: u64,
    pub warmups: u64,
    pub quits: u64,
    pub max_dgrams_per_wakeup: u64,
    /// Length shared by every datagram in the run, 0 if none arrived
    pub msg_len: usize,
    pub sequence_issues: Option<Vec<SequenceIssue>>,
    /// DATA sequences at or past the expected count
    pub out_of_range: u64,
}

/// Single-threaded state for one measurement run
#[derive(Debug)]
pub struct Collector {
    linger_ns: u64,
    wait: Duration,
    verbose: bool,
    phase: RunPhase,
    tracker: SequenceTracker,
    stats: RunStats,
    msg_len: Option<usize>,
    start_ns: Option<u64>,
    stop_ns: Option<u64>,
    last_packet_ns: Option<u64>,
}

impl Collector {
    pub fn new(config: &CollectorConfig) -> Self {
        let tracker = if config.sequence_check {
            SequenceTracker::with_receipts(config.num_msgs_expected)
        } else {
            SequenceTracker::new()
        };

        Self {
            linger_ns: u64::try_from(config.linger.as_nanos()).unwrap_or(u64::MAX),
            wait: config.wait,
            verbose: config.verbose,
            phase: RunPhase::Init,
            tracker,
            stats: RunStats::default(),
            msg_len: None,
            start_ns: None,
            stop_ns: None,
            last_packet_ns: None,
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn tracker(&self) -> &SequenceTracker {
        &self.tracker
    }

    /// Note a wakeup that surfaced `count` datagrams at `now_ns`
    pub fn on_wakeup(&mut self, now_ns: u64, count: u64) {
        if count == 0 {
            return;
        }
        self.last_packet_ns = Some(now_ns);
        self.stats.max_dgrams_per_wakeup = self.stats.max_dgrams_per_wakeup.max(count);
    }

    /// Classify one datagram received at `now_ns` and apply its effects
    pub fn on_datagram(&mut self, payload: &[u8], now_ns: u64) -> Result<(), CollectorError> {
        self.last_packet_ns = Some(now_ns);

        match self.msg_len {
            None => self.msg_len = Some(payload.len()),
            Some(expected) if expected != payload.len() => {
                return Err(CollectorError::LengthMismatch {
                    expected,
                    actual: payload.len(),
                });
            }
            Some(_) => {}
        }

        let header = DatagramHeader::parse(payload)?;
        if self.verbose {
            debug!(
                "Datagram size={} type={} sqn={}",
                payload.len(),
                header.tag,
                header.sequence
            );
        }

        let kind = header.message_type().map_err(|e| {
            error!("Unexpected message 0x{:02x}, quitting", header.tag);
            e
        })?;

        match kind {
            MessageType::Warmup => {
                self.stats.warmups += 1;
                // a WARMUP after DATA leaves the clock and the count alone
                if self.phase == RunPhase::Init {
                    self.start_ns = Some(now_ns);
                }
            }
            MessageType::Data => {
                if !self.tracker.record(header.sequence) && self.verbose {
                    debug!("DATA sequence {} out of order", header.sequence);
                }
                self.stats.num_msgs += 1;
                if self.phase == RunPhase::Init {
                    if self.start_ns.is_none() {
                        warn!("DATA arrived before any WARMUP, starting the clock now");
                        self.start_ns = Some(now_ns);
                    }
                    info!("Measuring");
                    self.phase = RunPhase::Measuring;
                }
            }
            MessageType::Quit => {
                if self.phase == RunPhase::Measuring {
                    self.stop_ns = Some(now_ns);
                    self.phase = RunPhase::Quitting;
                    info!("Quitting after {} DATA datagrams", self.stats.num_msgs);
                }
                self.stats.quits += 1;
            }
        }
        Ok(())
    }

    /// True once traffic has started and then stayed silent past the linger
    pub fn linger_expired(&self, now_ns: u64) -> bool {
        if self.phase == RunPhase::Init {
            return false;
        }
        match self.last_packet_ns {
            Some(last) => now_ns.saturating_sub(last) > self.linger_ns,
            None => false,
        }
    }

    /// Drain `socket` until it would block or the per-wakeup limit is hit.
    /// Returns the datagram count and whether the socket ran dry.
    fn drain<C: Clock>(
        &mut self,
        socket: &UdpSocket,
        strategy: &mut dyn ReceiveStrategy,
        clock: &C,
    ) -> Result<(u64, bool), CollectorError> {
        let mut total = 0u64;
        let mut stamp = None;

        for _ in 0..MAX_RECEIVES_PER_WAKEUP {
            let batch = strategy.receive(socket)?;
            if batch.is_empty() {
                self.on_wakeup(stamp.unwrap_or(0), total);
                return Ok((total, true));
            }
            let now = *stamp.get_or_insert_with(|| clock.now_ns());
            for datagram in batch {
                self.on_datagram(datagram.payload(), now)?;
            }
            total += batch.len() as u64;
        }

        self.on_wakeup(stamp.unwrap_or(0), total);
        Ok((total, false))
    }

    /// Readiness loop: wait up to the configured timeout, drain, repeat.
    ///
    /// Ends on linger expiry or when `quit` is raised; protocol violations and
    /// socket failures come back as errors.
    pub fn run<C: Clock>(
        &mut self,
        socket: &mut UdpSocket,
        strategy: &mut dyn ReceiveStrategy,
        clock: &C,
        quit: &AtomicBool,
    ) -> Result<StopReason, CollectorError> {
        let mut poll = Poll::new()?;
        poll.registry()
            .register(socket, SOCKET, Interest::READABLE)?;
        let mut events = Events::with_capacity(16);

        info!(
            "Collector ready: {} datagrams per receive call, linger {} ms",
            strategy.capacity(),
            self.linger_ns / 1_000_000
        );

        let mut readable = false;
        loop {
            if quit.load(Ordering::Relaxed) {
                info!("Interrupted");
                return Ok(StopReason::Interrupted);
            }

            if !readable {
                match poll.poll(&mut events, Some(self.wait)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
                readable = events
                    .iter()
                    .any(|event| event.token() == SOCKET && event.is_readable());
            }

            let mut received = 0;
            if readable {
                let (count, dry) = self.drain(socket, strategy, clock)?;
                received = count;
                readable = !dry;
            }

            if received == 0 && self.linger_expired(clock.now_ns()) {
                info!("No traffic for {} ms, stopping", self.linger_ns / 1_000_000);
                return Ok(StopReason::Linger);
            }
        }
    }

    /// Close the run and hand over the counters.
    ///
    /// A run that never saw QUIT is stopped at its last received packet so
    /// the elapsed time is always defined.
    pub fn finish(mut self) -> RunStats {
        if self.phase == RunPhase::Measuring {
            self.stop_ns = self.last_packet_ns;
        }

        self.stats.elapsed_ns = match (self.start_ns, self.stop_ns) {
            (Some(start), Some(stop)) => stop.saturating_sub(start),
            _ => 0,
        };
        self.stats.out_of_order = self.tracker.out_of_order;
        self.stats.msg_len = self.msg_len.unwrap_or(0);
        self.stats.sequence_issues = self.tracker.issues();
        self.stats.out_of_range = self.tracker.out_of_range;
        self.stats
    }
}
