use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Source of "now" for the playback clock, in seconds from an arbitrary origin.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// A clock that only moves when told to. Used to drive sessions deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
    bits: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock { bits: AtomicU64::new(0f64.to_bits()) }
    }

    pub fn advance(&self, seconds: f64) {
        let now = self.now();
        self.set(now + seconds.max(0.0));
    }

    pub fn set(&self, seconds: f64) {
        self.bits.store(seconds.to_bits(), Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }
}
