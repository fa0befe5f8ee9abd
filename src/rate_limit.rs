//! Non-blocking rate limiting for the paid adapters.
//!
//! One limiter per upstream service, shared process-wide and injected
//! into the adapters. Denials are soft: the caller treats a denied ASR
//! call as an empty transcript instead of waiting, so a burst of calls
//! degrades to re-prompts rather than queued latency.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Rate limiting error.
#[derive(Debug, Clone, Error)]
pub enum RateLimitError {
    /// Sliding window is full; wait before retrying.
    #[error("rate limit exceeded; retry after {retry_after_secs}s")]
    Exceeded {
        /// Seconds until the oldest call ages out of the window.
        retry_after_secs: u64,
    },
    /// Minimum spacing between calls not yet elapsed.
    #[error("minimum call gap not elapsed; retry after {retry_after_ms}ms")]
    TooSoon {
        /// Milliseconds until the gap opens.
        retry_after_ms: u64,
    },
}

/// Sliding-window limiter with a minimum inter-call gap.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    max_per_minute: u32,
    min_gap: Duration,
    window: VecDeque<Instant>,
}

impl SlidingWindowLimiter {
    #[must_use]
    pub fn new(max_per_minute: u32, min_gap: Duration) -> Self {
        Self {
            max_per_minute,
            min_gap,
            window: VecDeque::new(),
        }
    }

    /// Try to take a slot. Never blocks: on denial the caller decides
    /// whether to drop or defer.
    pub fn try_acquire(&mut self) -> Result<(), RateLimitError> {
        let now = Instant::now();
        let window_start = now - Duration::from_secs(60);

        while let Some(&first) = self.window.front() {
            if first < window_start {
                self.window.pop_front();
            } else {
                break;
            }
        }

        if let Some(&last) = self.window.back() {
            let since_last = now.duration_since(last);
            if since_last < self.min_gap {
                let remaining = self.min_gap - since_last;
                return Err(RateLimitError::TooSoon {
                    retry_after_ms: remaining.as_millis() as u64,
                });
            }
        }

        if self.window.len() >= self.max_per_minute as usize {
            let retry_after_secs = self.window.front().map_or(60, |&oldest| {
                let age = now.duration_since(oldest);
                Duration::from_secs(60)
                    .saturating_sub(age)
                    .as_secs()
                    .saturating_add(1)
            });
            return Err(RateLimitError::Exceeded { retry_after_secs });
        }

        self.window.push_back(now);
        Ok(())
    }

    /// Slots remaining in the current window.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.max_per_minute
            .saturating_sub(self.window.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::thread;

    #[test]
    fn allows_within_limit() {
        let mut limiter = SlidingWindowLimiter::new(5, Duration::ZERO);
        for _ in 0..5 {
            assert!(limiter.try_acquire().is_ok());
        }
    }

    #[test]
    fn blocks_exceeding_limit() {
        let mut limiter = SlidingWindowLimiter::new(3, Duration::ZERO);
        for _ in 0..3 {
            assert!(limiter.try_acquire().is_ok());
        }
        match limiter.try_acquire() {
            Err(RateLimitError::Exceeded { retry_after_secs }) => {
                assert!(retry_after_secs > 0);
                assert!(retry_after_secs <= 61);
            }
            other => unreachable!("expected window exhaustion, got {other:?}"),
        }
    }

    #[test]
    fn enforces_minimum_gap() {
        let mut limiter = SlidingWindowLimiter::new(100, Duration::from_millis(50));
        assert!(limiter.try_acquire().is_ok());
        match limiter.try_acquire() {
            Err(RateLimitError::TooSoon { retry_after_ms }) => {
                assert!(retry_after_ms <= 50);
            }
            other => unreachable!("expected gap denial, got {other:?}"),
        }
        thread::sleep(Duration::from_millis(60));
        assert!(limiter.try_acquire().is_ok());
    }

    #[test]
    fn denial_does_not_consume_a_slot() {
        let mut limiter = SlidingWindowLimiter::new(1, Duration::ZERO);
        assert!(limiter.try_acquire().is_ok());
        assert_eq!(limiter.remaining(), 0);
        assert!(limiter.try_acquire().is_err());
        assert_eq!(limiter.remaining(), 0);
    }

    #[test]
    fn remaining_counts_down() {
        let mut limiter = SlidingWindowLimiter::new(4, Duration::ZERO);
        assert_eq!(limiter.remaining(), 4);
        limiter.try_acquire().unwrap();
        assert_eq!(limiter.remaining(), 3);
    }
}
