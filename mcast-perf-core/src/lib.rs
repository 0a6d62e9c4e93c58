//! Multicast throughput and loss measurement.
//!
//! A paced transmitter emits WARMUP, DATA and QUIT datagrams at a fixed rate;
//! a readiness-driven collector drains them, follows the run phase, counts
//! sequence breaks and reports throughput and loss once traffic stops.

pub mod clock;
pub mod collector;
pub mod config;
pub mod error;
pub mod packet;
pub mod pacing;
pub mod receive;
pub mod report;
pub mod transmitter;
pub mod transport;

pub use clock::{Clock, MonotonicClock};
pub use collector::{Collector, RunPhase, RunStats, SequenceTracker, StopReason};
pub use config::{CollectorConfig, GroupEndpoint, ReceiveMode, SenderConfig};
pub use error::CollectorError;
pub use pacing::{CatchUpPacer, PacingReport};
pub use receive::{strategy_for, BatchReceiver, ReceiveStrategy, SingleReceiver};
pub use report::{ReportParams, Summary};
pub use transmitter::{DatagramSink, SenderReport, Transmitter};
