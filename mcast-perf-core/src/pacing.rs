use anyhow::{ensure, Result};

use crate::clock::Clock;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Outcome of one paced run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacingReport {
    pub sent: u64,
    /// Largest number of sends owed in a single loop iteration
    pub max_burst: u64,
    pub elapsed_ns: u64,
}

/// How many sends should have happened `elapsed_ns` into a run at `rate`
/// per second, capped at `count`.
///
/// The `+ 1` sends first and pauses after, so the first datagram leaves at
/// time zero instead of one interval in.
pub fn should_have_sent(elapsed_ns: u64, rate: u64, count: u64) -> u64 {
    let due = elapsed_ns as u128 * rate as u128 / NANOS_PER_SEC + 1;
    due.min(count as u128) as u64
}

/// Open-loop rate controller using busy-wait catch-up.
///
/// Every iteration recomputes how far behind schedule the loop is and sends
/// that many datagrams back to back. Scheduler stalls turn into a burst on the
/// next iteration, so the long-run average stays on target without sleeping.
pub struct CatchUpPacer<C> {
    clock: C,
    rate: u64,
}

impl<C: Clock> CatchUpPacer<C> {
    pub fn new(clock: C, rate: u64) -> Self {
        Self { clock, rate }
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Call `send_one` exactly `count` times, each with the 0-based send
    /// index. The first error ends the run.
    pub fn run<F>(&self, count: u64, mut send_one: F) -> Result<PacingReport>
    where
        F: FnMut(u64) -> Result<()>,
    {
        ensure!(self.rate > 0, "send rate must be positive");

        let start = self.clock.now_ns();
        let mut now = start;
        let mut sent = 0u64;
        let mut max_burst = 0u64;

        while sent < count {
            let due = should_have_sent(now.saturating_sub(start), self.rate, count);
            max_burst = max_burst.max(due.saturating_sub(sent));

            while sent < due {
                send_one(sent)?;
                sent += 1;
            }

            now = self.clock.now_ns();
        }

        Ok(PacingReport {
            sent,
            max_burst,
            elapsed_ns: now.saturating_sub(start),
        })
    }
}
