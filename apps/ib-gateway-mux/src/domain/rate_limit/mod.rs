//! Fixed Window Rate Limiting
//!
//! Each client owns one `FixedWindow`. A request reserves a slot in the
//! current window before it is dispatched; if the request never reaches the
//! gateway the slot is refunded, so clients are not charged for upstream
//! outages.
//!
//! ```text
//! |<----- window ----->|<----- window ----->|
//! | 1 2 3 4 5 x x      | 1 2 ...            |
//!             ^ rejected, count stays at max
//! ```

use std::time::{Duration, Instant};

/// Window length and request cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Length of one window.
    pub window: Duration,
    /// Requests allowed per window.
    pub max_requests: u32,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 50,
        }
    }
}

/// Proof that a slot was reserved in a particular window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a permit must be dispatched or refunded"]
pub struct RatePermit {
    window_start: Instant,
}

/// The window is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowExhausted {
    /// Time until the current window rolls over.
    pub retry_after: Duration,
}

/// Fixed-window request counter.
#[derive(Debug, Clone)]
pub struct FixedWindow {
    policy: RateLimitPolicy,
    window_start: Instant,
    request_count: u32,
}

impl FixedWindow {
    /// Start a fresh window at `now`.
    #[must_use]
    pub const fn new(policy: RateLimitPolicy, now: Instant) -> Self {
        Self {
            policy,
            window_start: now,
            request_count: 0,
        }
    }

    /// Reserve a slot in the window containing `now`.
    ///
    /// Rolls the window over first if `now` is past its end. A rejected
    /// request does not touch the counter.
    ///
    /// # Errors
    ///
    /// Returns `WindowExhausted` when the counter already sits at the cap.
    pub fn try_acquire(&mut self, now: Instant) -> Result<RatePermit, WindowExhausted> {
        self.roll_over(now);

        if self.request_count >= self.policy.max_requests {
            let elapsed = now.saturating_duration_since(self.window_start);
            return Err(WindowExhausted {
                retry_after: self.policy.window.saturating_sub(elapsed),
            });
        }

        self.request_count += 1;
        Ok(RatePermit {
            window_start: self.window_start,
        })
    }

    /// Return a slot that was reserved but never used.
    ///
    /// A permit from an earlier window is ignored: that window is gone and
    /// the current one never counted it.
    pub fn refund(&mut self, permit: RatePermit) {
        if permit.window_start == self.window_start {
            self.request_count = self.request_count.saturating_sub(1);
        }
    }

    /// Requests charged in the current window.
    #[must_use]
    pub const fn request_count(&self) -> u32 {
        self.request_count
    }

    /// Start of the current window.
    #[must_use]
    pub const fn window_start(&self) -> Instant {
        self.window_start
    }

    /// The policy this window enforces.
    #[must_use]
    pub const fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    fn roll_over(&mut self, now: Instant) {
        if now.saturating_duration_since(self.window_start) >= self.policy.window {
            self.window_start = now;
            self.request_count = 0;
        }
    }
}
