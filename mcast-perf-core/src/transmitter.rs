use anyhow::{Context, Result};
use std::io;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::SenderConfig;
use crate::packet::{MessageBuilder, MessageType};
use crate::pacing::CatchUpPacer;

/// WARMUP datagrams sent before measuring, one per millisecond
pub const WARMUP_COUNT: u64 = 100;

/// QUIT datagrams sent after the DATA stream, paced like the data
pub const QUIT_COUNT: u64 = 300;

const WARMUP_SPACING: Duration = Duration::from_millis(1);

/// Destination for outgoing datagrams
pub trait DatagramSink {
    fn send_datagram(&mut self, payload: &[u8]) -> io::Result<()>;
}

impl<S: DatagramSink + ?Sized> DatagramSink for &mut S {
    fn send_datagram(&mut self, payload: &[u8]) -> io::Result<()> {
        (**self).send_datagram(payload)
    }
}

/// Sender-side view of a completed run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderReport {
    pub num_msgs: u64,
    /// Wall time of the DATA phase only
    pub elapsed_ns: u64,
    pub max_burst: u64,
}

/// Drives one WARMUP / DATA / QUIT session against a sink
pub struct Transmitter<C> {
    pacer: CatchUpPacer<C>,
    builder: MessageBuilder,
    warmup_spacing: Duration,
}

impl<C: Clock> Transmitter<C> {
    pub fn new(clock: C, config: &SenderConfig) -> Self {
        Self {
            pacer: CatchUpPacer::new(clock, config.rate),
            builder: MessageBuilder::new(config.msg_len),
            warmup_spacing: WARMUP_SPACING,
        }
    }

    /// Override the gap between WARMUP datagrams
    pub fn with_warmup_spacing(mut self, spacing: Duration) -> Self {
        self.warmup_spacing = spacing;
        self
    }

    /// Send the full session, blocking until the last QUIT datagram is out
    pub fn run<S: DatagramSink>(&mut self, sink: &mut S, num_msgs: u64) -> Result<SenderReport> {
        self.send_warmup(sink)?;

        info!(
            "Sending {} datagrams of {} bytes at {} msgs/sec",
            num_msgs,
            self.builder.payload().len(),
            self.pacer.rate()
        );
        let data = self.send_paced(sink, MessageType::Data, num_msgs)?;
        info!(
            "DATA phase done in {:.3} s, max catch-up burst {}",
            data.elapsed_ns as f64 / 1e9,
            data.max_burst
        );

        let quit = self.send_paced(sink, MessageType::Quit, QUIT_COUNT)?;
        debug!("Sent {} QUIT datagrams", quit.sent);

        Ok(SenderReport {
            num_msgs: data.sent,
            elapsed_ns: data.elapsed_ns,
            max_burst: data.max_burst,
        })
    }

    fn send_warmup<S: DatagramSink>(&mut self, sink: &mut S) -> Result<()> {
        self.builder.set_kind(MessageType::Warmup);
        for _ in 0..WARMUP_COUNT {
            if !self.warmup_spacing.is_zero() {
                thread::sleep(self.warmup_spacing);
            }
            sink.send_datagram(self.builder.payload())
                .context("Failed to send WARMUP datagram")?;
            self.builder.advance();
        }
        debug!("Sent {} WARMUP datagrams", WARMUP_COUNT);
        Ok(())
    }

    fn send_paced<S: DatagramSink>(
        &mut self,
        sink: &mut S,
        kind: MessageType,
        count: u64,
    ) -> Result<crate::pacing::PacingReport> {
        self.builder.set_kind(kind);
        let builder = &mut self.builder;

        self.pacer.run(count, |index| {
            sink.send_datagram(builder.payload())
                .with_context(|| format!("Failed to send {:?} datagram #{}", kind, index))?;
            builder.advance();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SteppingClock;
    use crate::packet::DatagramHeader;

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

    fn config(num_msgs: u64) -> SenderConfig {
        SenderConfig {
            msg_len: 64,
            num_msgs,
            rate: 1_000_000,
            ..SenderConfig::default()
        }
    }

    #[test]
    fn test_session_shape() {
        let clock = SteppingClock::new(1_000);
        let cfg = config(500);
        let mut transmitter = Transmitter::new(&clock, &cfg).with_warmup_spacing(Duration::ZERO);
        let mut sink = RecordingSink::default();

        let report = transmitter.run(&mut sink, cfg.num_msgs).unwrap();
        assert_eq!(report.num_msgs, 500);
        assert_eq!(
            sink.datagrams.len() as u64,
            WARMUP_COUNT + 500 + QUIT_COUNT
        );
        assert!(sink.datagrams.iter().all(|d| d.len() == 64));

        let headers: Vec<DatagramHeader> = sink
            .datagrams
            .iter()
            .map(|d| DatagramHeader::parse(d).unwrap())
            .collect();

        let (warmup, rest) = headers.split_at(WARMUP_COUNT as usize);
        let (data, quit) = rest.split_at(500);

        assert!(warmup.iter().all(|h| h.tag == 0));
        assert!(quit.iter().all(|h| h.tag == 2));
        for (i, h) in data.iter().enumerate() {
            assert_eq!(h.tag, 1);
            assert_eq!(h.sequence, i as u32);
        }
    }

    struct FailingSink {
        remaining: usize,
    }

    impl DatagramSink for FailingSink {
        fn send_datagram(&mut self, _payload: &[u8]) -> io::Result<()> {
            if self.remaining == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "no buffer space"));
            }
            self.remaining -= 1;
            Ok(())
        }
    }

    #[test]
    fn test_send_failure_is_fatal() {
        let clock = SteppingClock::new(1_000);
        let cfg = config(1_000);
        let mut transmitter = Transmitter::new(&clock, &cfg).with_warmup_spacing(Duration::ZERO);
        let mut sink = FailingSink { remaining: 150 };

        let err = transmitter.run(&mut sink, cfg.num_msgs).unwrap_err();
        assert!(format!("{:#}", err).contains("no buffer space"));
    }
}
