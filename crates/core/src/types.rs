use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonEnvelope {
    pub status: String,
    pub phase: String,
    pub message: String,
    pub details: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub tries: u32,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            tries: 3,
            delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// URL template; `{city}` is replaced by the requested location.
    pub weather_endpoint: String,
    pub timeout_ms: u64,
    pub user_agent: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            weather_endpoint: "https://wttr.in/{city}?format=3".to_string(),
            timeout_ms: 10_000,
            user_agent: format!("wrapkit/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoConfig {
    pub capacity: usize,
    pub unbounded: bool,
}

impl Default for MemoConfig {
    fn default() -> Self {
        Self {
            capacity: 1_024,
            unbounded: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub retry: RetryConfig,
    pub session: SessionConfig,
    pub memo: MemoConfig,
    pub logging: LoggingConfig,
}
