use anyhow::Result;
use std::thread;
use std::time::Duration;
use tracing::{error, warn};

/// Bounded retry with fixed backoff, wrapping the single-attempt run.
/// The crawl path is blocking by design, so the backoff is a plain sleep.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Run `attempt` up to `max_attempts` times. Returns the first success
    /// or the last error once the budget is spent.
    pub fn run<T, F>(&self, mut attempt: F) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
    {
        let mut last_err = None;
        for n in 1..=self.max_attempts {
            match attempt(n) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if n < self.max_attempts {
                        warn!(attempt = n, max = self.max_attempts, "attempt failed: {err:#}");
                        thread::sleep(self.backoff);
                    } else {
                        error!(attempt = n, max = self.max_attempts, "final attempt failed: {err:#}");
                    }
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.expect("at least one attempt ran"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::ZERO)
    }

    #[test]
    fn succeeds_on_later_attempt() {
        let mut calls = 0;
        let result = policy(3).run(|_| {
            calls += 1;
            if calls < 3 {
                Err(anyhow!("flaky"))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn returns_last_error_after_exhaustion() {
        let mut calls = 0;
        let result: Result<()> = policy(3).run(|n| {
            calls += 1;
            Err(anyhow!("attempt {n} down"))
        });
        assert_eq!(calls, 3);
        assert!(result.unwrap_err().to_string().contains("attempt 3"));
    }

    #[test]
    fn first_success_stops_retrying() {
        let mut calls = 0;
        let result = policy(5).run(|_| {
            calls += 1;
            Ok("done")
        });
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls, 1);
    }

    #[test]
    fn zero_attempts_clamps_to_one() {
        let mut calls = 0;
        let _ = policy(0).run(|_| -> Result<()> {
            calls += 1;
            Err(anyhow!("no"))
        });
        assert_eq!(calls, 1);
    }
}
