//! Bounded retry with a fixed delay between attempts.

use std::time::Duration;

use tracing::warn;

/// How many times to try an operation and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// `max_attempts` total tries (clamped to at least one) with `delay`
    /// between consecutive tries.
    #[must_use]
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: if max_attempts == 0 { 1 } else { max_attempts },
            delay,
        }
    }

    /// A single try, no waiting.
    #[must_use]
    pub const fn once() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `op` until it succeeds or attempts run out, sleeping with `sleep`
    /// between tries. `op` receives the 1-based attempt number. Returns the
    /// last error when every attempt fails.
    pub fn run<T, E, F, S>(&self, mut sleep: S, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        S: FnMut(Duration),
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts => {
                    warn!(attempt, max_attempts = self.max_attempts, error = %err, "attempt failed, retrying");
                    sleep(self.delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
