//! Retry wrapper with a constant delay between attempts.
//!
//! Every failed attempt except the last is logged and followed by a sleep of
//! `delay`. Only the final attempt's error reaches the caller.

use crate::types::RetryConfig;
use std::fmt;
use std::future::Future;
use std::time::Duration;

pub const DEFAULT_TRIES: u32 = 3;
pub const DEFAULT_DELAY: Duration = Duration::from_secs(1);

/// Attempt count and constant delay.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Retry {
    tries: u32,
    delay: Duration,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            tries: DEFAULT_TRIES,
            delay: DEFAULT_DELAY,
        }
    }
}

impl From<&RetryConfig> for Retry {
    fn from(cfg: &RetryConfig) -> Self {
        Self::new(cfg.tries, Duration::from_millis(cfg.delay_ms))
    }
}

/// Shorthand for [`Retry::new`].
pub fn retry(tries: u32, delay: Duration) -> Retry {
    Retry::new(tries, delay)
}

impl Retry {
    /// A `tries` of zero is treated as one attempt.
    pub fn new(tries: u32, delay: Duration) -> Self {
        Self {
            tries: tries.max(1),
            delay,
        }
    }

    pub fn tries(&self) -> u32 {
        self.tries
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Calls `f` until it succeeds or the attempts run out, blocking the
    /// current thread between attempts.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use wrapkit_core::retry::Retry;
    ///
    /// let mut calls = 0;
    /// let out: Result<(), String> = Retry::new(3, Duration::ZERO).call(|| {
    ///     calls += 1;
    ///     Err(format!("failure {calls}"))
    /// });
    /// assert_eq!(out, Err("failure 3".to_string()));
    /// assert_eq!(calls, 3);
    /// ```
    pub fn call<T, E, F>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.tries => {
                    self.report(attempt, &err);
                    if !self.delay.is_zero() {
                        std::thread::sleep(self.delay);
                    }
                    attempt += 1;
                }
                Err(err) => {
                    self.exhausted(&err);
                    return Err(err);
                }
            }
        }
    }

    /// Async counterpart of [`Retry::call`]; waits with `tokio::time::sleep`.
    pub async fn call_async<T, E, F, Fut>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.tries => {
                    self.report(attempt, &err);
                    if !self.delay.is_zero() {
                        tokio::time::sleep(self.delay).await;
                    }
                    attempt += 1;
                }
                Err(err) => {
                    self.exhausted(&err);
                    return Err(err);
                }
            }
        }
    }

    /// Wraps `f` so every call through [`Retrying::call`] is retried.
    pub fn wrap<F>(self, f: F) -> Retrying<F> {
        Retrying { policy: self, f }
    }

    fn report(&self, attempt: u32, err: &dyn fmt::Display) {
        tracing::warn!(
            attempt,
            tries = self.tries,
            delay_ms = self.delay.as_millis() as u64,
            error = %err,
            "attempt failed; retrying"
        );
    }

    fn exhausted(&self, err: &dyn fmt::Display) {
        tracing::warn!(tries = self.tries, error = %err, "all attempts failed");
    }
}

/// A callable bound to a [`Retry`] policy.
#[derive(Debug, Clone)]
pub struct Retrying<F> {
    policy: Retry,
    f: F,
}

impl<F> Retrying<F> {
    pub fn policy(&self) -> Retry {
        self.policy
    }

    /// Calls the wrapped function with a clone of `args` on each attempt.
    pub fn call<A, T, E>(&mut self, args: A) -> Result<T, E>
    where
        F: FnMut(A) -> Result<T, E>,
        A: Clone,
        E: fmt::Display,
    {
        let policy = self.policy;
        let f = &mut self.f;
        policy.call(|| f(args.clone()))
    }
}
