//! Microsecond time sources.
//!
//! Block timestamps are written into the shared region and compared by other
//! processes, so the production clock is wall time since the Unix epoch.
//! [`ManualClock`] lets tests step time deterministically.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Microseconds since the Unix epoch.
pub type Micros = u64;

/// A source of microsecond timestamps.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_micros(&self) -> Micros;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[allow(clippy::cast_possible_truncation)]
    fn now_micros(&self) -> Micros {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_micros() as u64)
    }
}

/// Manually advanced clock. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: Micros) -> Self {
        Self {
            micros: Arc::new(AtomicU64::new(start)),
        }
    }

    pub fn set(&self, micros: Micros) {
        self.micros.store(micros, Ordering::Release);
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn advance(&self, by: Duration) {
        self.micros
            .fetch_add(by.as_micros() as u64, Ordering::AcqRel);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        // Non-zero: a zero timestamp means "never updated" in block records.
        Self::new(1_000_000)
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> Micros {
        self.micros.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::new(10);
        let other = clock.clone();
        clock.advance(Duration::from_millis(2));
        assert_eq!(other.now_micros(), 2_010);
        other.set(5);
        assert_eq!(clock.now_micros(), 5);
    }

    #[test]
    fn test_system_clock_is_after_epoch() {
        assert!(SystemClock.now_micros() > 0);
    }
}
