//! Request timestamps
//!
//! The collector keys requests by their Unix-millisecond `timestamp`. Two
//! records produced in the same millisecond would collide, so the clock hands
//! out strictly increasing values: a collision (or a wall clock stepping
//! backwards) bumps the value to one past the last one issued.
//!
//! This is a tie-breaker for the server, not an ordering primitive; the queue
//! orders entries by sequence number.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Strictly increasing Unix-millisecond timestamp source.
#[derive(Debug, Default)]
pub struct TimestampClock {
    last: AtomicI64,
}

impl TimestampClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next timestamp, never equal to or below a previously returned one.
    pub fn next(&self) -> i64 {
        self.next_from(Utc::now().timestamp_millis())
    }

    fn next_from(&self, now: i64) -> i64 {
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = if now > last { now } else { last + 1 };
            match self
                .last
                .compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(actual) => last = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_collision_increments() {
        let clock = TimestampClock::new();
        assert_eq!(clock.next_from(1_000), 1_000);
        assert_eq!(clock.next_from(1_000), 1_001);
        assert_eq!(clock.next_from(1_000), 1_002);
        assert_eq!(clock.next_from(5_000), 5_000);
    }

    #[test]
    fn test_clock_going_backwards() {
        let clock = TimestampClock::new();
        assert_eq!(clock.next_from(2_000), 2_000);
        assert_eq!(clock.next_from(1_500), 2_001);
    }

    #[test]
    fn test_unique_across_threads() {
        let clock = Arc::new(TimestampClock::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let clock = Arc::clone(&clock);
                std::thread::spawn(move || (0..250).map(|_| clock.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total);
    }
}
