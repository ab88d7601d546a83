//! Asynchronous call-logging wrapper.
//!
//! [`Logged`] reports the wrapped function's name and arguments before the
//! call and its result after the call completes. It never intercepts a
//! failure: whatever the wrapped future yields is logged and returned as is.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

/// One observable line produced by [`Logged::call`].
#[derive(Debug, Clone, Copy)]
pub enum LogEvent<'a> {
    Start { name: &'a str, args: &'a str },
    Finish { name: &'a str, result: &'a str },
}

impl fmt::Display for LogEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogEvent::Start { name, args } => write!(f, "calling {name} with {args}"),
            LogEvent::Finish { name, result } => write!(f, "{name} returned {result}"),
        }
    }
}

/// Destination for [`LogEvent`]s.
pub trait LogSink: Send + Sync {
    fn record(&self, event: LogEvent<'_>);
}

/// Emits events through `tracing` at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn record(&self, event: LogEvent<'_>) {
        match event {
            LogEvent::Start { name, args } => {
                tracing::info!(function = name, args, "{event}");
            }
            LogEvent::Finish { name, result } => {
                tracing::info!(function = name, result, "{event}");
            }
        }
    }
}

/// Keeps rendered lines in memory. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Appends a free-form line, for callers interleaving their own output.
    pub fn push(&self, line: impl Into<String>) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.into());
    }
}

impl LogSink for MemorySink {
    fn record(&self, event: LogEvent<'_>) {
        self.push(event.to_string());
    }
}

/// An async function wrapped with start/result logging.
pub struct Logged<F, S = TracingSink> {
    name: String,
    f: F,
    sink: S,
}

/// Wraps `f` so each call is logged through `tracing`.
///
/// # Examples
///
/// ```
/// use wrapkit_core::logging::logged;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let double = logged("double", |n: u32| async move { n * 2 });
/// assert_eq!(double.call(21).await, 42);
/// # }
/// ```
pub fn logged<F>(name: impl Into<String>, f: F) -> Logged<F> {
    Logged::with_sink(name, f, TracingSink)
}

impl<F, S> Logged<F, S>
where
    S: LogSink,
{
    pub fn with_sink(name: impl Into<String>, f: F, sink: S) -> Self {
        Self {
            name: name.into(),
            f,
            sink,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call<A, Fut>(&self, args: A) -> Fut::Output
    where
        F: Fn(A) -> Fut,
        Fut: Future,
        A: fmt::Debug,
        Fut::Output: fmt::Debug,
    {
        let rendered = format!("{args:?}");
        self.sink.record(LogEvent::Start {
            name: &self.name,
            args: &rendered,
        });

        let result = (self.f)(args).await;

        let rendered = format!("{result:?}");
        self.sink.record(LogEvent::Finish {
            name: &self.name,
            result: &rendered,
        });
        result
    }
}

impl<F, S: fmt::Debug> fmt::Debug for Logged<F, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logged")
            .field("name", &self.name)
            .field("sink", &self.sink)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn logs_start_before_and_result_after_the_await() {
        let sink = MemorySink::new();
        let inner = sink.clone();
        let echo = Logged::with_sink(
            "echo",
            move |value: i32| {
                let inner = inner.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    inner.push("inside");
                    value
                }
            },
            sink.clone(),
        );

        assert_eq!(echo.call(42).await, 42);
        assert_eq!(
            sink.lines(),
            vec!["calling echo with 42", "inside", "echo returned 42"]
        );
    }

    #[tokio::test]
    async fn failure_is_returned_unmodified() {
        let sink = MemorySink::new();
        let parse = Logged::with_sink(
            "parse",
            |raw: &'static str| async move { raw.parse::<u8>().map_err(|e| e.to_string()) },
            sink.clone(),
        );

        let err = parse.call("300").await.expect_err("out of range");
        assert_eq!(err, "number too large to fit in target type");
        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "calling parse with \"300\"");
        assert!(lines[1].starts_with("parse returned Err("));
    }

    #[tokio::test]
    async fn each_call_logs_exactly_two_lines() {
        let sink = MemorySink::new();
        let add = Logged::with_sink(
            "add",
            |(a, b): (i64, i64)| async move { a + b },
            sink.clone(),
        );
        assert_eq!(add.call((2, 3)).await, 5);
        assert_eq!(add.call((-1, 1)).await, 0);
        assert_eq!(
            sink.lines(),
            vec![
                "calling add with (2, 3)",
                "add returned 5",
                "calling add with (-1, 1)",
                "add returned 0",
            ]
        );
    }

    #[tokio::test]
    async fn tracing_sink_is_the_default() {
        let greet = logged("greet", |who: String| async move { format!("hello {who}") });
        assert_eq!(greet.name(), "greet");
        assert!(format!("{greet:?}").contains("TracingSink"));
        assert_eq!(greet.call("ada".to_string()).await, "hello ada");
    }
}
