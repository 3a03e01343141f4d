// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Sleep schedule for polling a lock that cannot be waited on with a timeout.

use std::thread;
use std::time::Duration;

/// Doubling sleep, starting at 1ms and capped at `max_ms`.
///
/// - sleeps never run past the caller's remaining time
/// - once at the cap, every poll sleeps `max_ms`
#[derive(Debug)]
pub(crate) struct PollBackoff {
    next_ms: u32,
    max_ms: u32,
}

impl PollBackoff {
    pub(crate) fn new(max_ms: u32) -> Self {
        let max_ms = max_ms.max(1);
        Self { next_ms: 1, max_ms }
    }

    /// The interval the next call to `sleep` will use, before clipping.
    pub(crate) fn next_interval(&self) -> Duration {
        Duration::from_millis(self.next_ms as u64)
    }

    /// Sleep for the next interval, or `remaining` if that is shorter.
    pub(crate) fn sleep(&mut self, remaining: Duration) {
        let interval = self.next_interval().min(remaining);
        if !interval.is_zero() {
            thread::sleep(interval);
        }
        self.next_ms = self.next_ms.saturating_mul(2).min(self.max_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn doubles_up_to_cap() {
        let mut b = PollBackoff::new(8);
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(b.next_interval().as_millis());
            b.sleep(Duration::ZERO);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 8, 8]);
    }

    #[test]
    fn sleep_is_clipped_to_remaining() {
        let mut b = PollBackoff::new(1000);
        for _ in 0..12 {
            b.sleep(Duration::ZERO);
        }
        assert_eq!(b.next_interval(), Duration::from_millis(1000));

        let start = Instant::now();
        b.sleep(Duration::from_millis(5));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn zero_cap_is_raised_to_one() {
        let b = PollBackoff::new(0);
        assert_eq!(b.next_interval(), Duration::from_millis(1));
    }
}
