use std::time::Instant;

/// Monotonic nanosecond time source.
///
/// The origin is arbitrary; only differences between readings mean anything.
pub trait Clock {
    fn now_ns(&self) -> u64;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_ns(&self) -> u64 {
        (**self).now_ns()
    }
}

/// `Instant`-backed clock (CLOCK_MONOTONIC on Linux)
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Clock that moves forward by a fixed step on every reading
#[cfg(test)]
#[derive(Debug, Default)]
pub struct SteppingClock {
    now: std::cell::Cell<u64>,
    step: u64,
}

#[cfg(test)]
impl SteppingClock {
    pub fn new(step: u64) -> Self {
        Self {
            now: std::cell::Cell::new(0),
            step,
        }
    }

    /// Current time without advancing
    pub fn peek(&self) -> u64 {
        self.now.get()
    }
}

#[cfg(test)]
impl Clock for SteppingClock {
    fn now_ns(&self) -> u64 {
        let now = self.now.get();
        self.now.set(now + self.step);
        now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clock_never_goes_back() {
        let clock = MonotonicClock::new();
        let mut last = clock.now_ns();
        for _ in 0..1000 {
            let now = clock.now_ns();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn test_stepping_clock() {
        let clock = SteppingClock::new(10);
        assert_eq!(clock.now_ns(), 0);
        assert_eq!(clock.now_ns(), 10);
        assert_eq!(clock.peek(), 20);
        assert_eq!((&clock).now_ns(), 20);
    }
}
