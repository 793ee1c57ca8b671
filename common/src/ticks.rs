use std::{
    fmt,
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ticks(u32);

impl Ticks {
    pub const fn from_millis(ms: u32) -> Self {
        Self(ms)
    }

    pub fn as_millis(self) -> u32 {
        self.0
    }

    pub fn wrapping_add_ms(self, ms: u32) -> Self {
        Self(self.0.wrapping_add(ms))
    }

    // Valid while the two ticks are less than 2^31 ms apart.
    pub fn diff(self, earlier: Ticks) -> i32 {
        self.0.wrapping_sub(earlier.0) as i32
    }
}

impl fmt::Display for Ticks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

pub trait Clock {
    fn now(&self) -> Ticks;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Ticks {
        // Truncation is the wrap.
        Ticks(self.start.elapsed().as_millis() as u32)
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Fires once per `interval_ms` measured from the last time it was re-armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    interval_ms: u32,
    last: Ticks,
}

impl Cadence {
    pub fn new(interval_ms: u32, now: Ticks) -> Self {
        Self {
            interval_ms,
            last: now,
        }
    }

    pub fn last(&self) -> Ticks {
        self.last
    }

    pub fn is_due(&self, now: Ticks) -> bool {
        let elapsed = now.diff(self.last);
        // A monotonic clock never runs backwards: a negative difference means
        // more than 2^31 ms have passed since the last re-arm.
        elapsed < 0 || elapsed as u32 >= self.interval_ms
    }

    pub fn rearm(&mut self, now: Ticks) {
        self.last = now;
    }
}
