use std::sync::atomic::{AtomicU64, Ordering};

use crate::model::UnixTimeMs;

/// Wall-clock source for record timestamps and backoff deadlines.
pub trait Clock: Send + Sync {
    fn now(&self) -> UnixTimeMs;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs::now()
    }
}

/// Settable clock for deterministic tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start: UnixTimeMs) -> Self {
        Self {
            now_ms: AtomicU64::new(start.0),
        }
    }

    pub fn set(&self, now: UnixTimeMs) {
        self.now_ms.store(now.0, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) -> UnixTimeMs {
        let prev = self.now_ms.fetch_add(ms, Ordering::SeqCst);
        UnixTimeMs(prev.saturating_add(ms))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs(self.now_ms.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(UnixTimeMs(1_000));
        assert_eq!(clock.now(), UnixTimeMs(1_000));
        assert_eq!(clock.advance(500), UnixTimeMs(1_500));
        clock.set(UnixTimeMs(42));
        assert_eq!(clock.now(), UnixTimeMs(42));
    }

    #[test]
    fn system_clock_is_after_epoch() {
        assert!(SystemClock.now().0 > 1_600_000_000_000);
    }
}
