//! Retry decision after a failed forwarding attempt.
//!
//! Failures are counted per request. Attempt `n` fails → the counter becomes `n`;
//! the request is routed again while `n <= retry_on_error`, so
//! `retry_on_error = 2` allows three attempts in total.

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Select a backend again and replay the request.
    Retry,
    /// Retries are allowed but all of them have been used.
    LimitExceeded,
    /// `retry_on_error` is zero.
    Disabled,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    retry_on_error: u32,
}

impl RetryPolicy {
    pub fn new(retry_on_error: u32) -> Self {
        Self { retry_on_error }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry_on_error.saturating_add(1)
    }

    /// Decide given the number of failures observed so far (at least 1).
    pub fn decide(&self, failures: u32) -> RetryDecision {
        if failures <= self.retry_on_error {
            RetryDecision::Retry
        } else if self.retry_on_error == 0 {
            RetryDecision::Disabled
        } else {
            RetryDecision::LimitExceeded
        }
    }
}
