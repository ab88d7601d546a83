//! Asynchronous scoped network session.
//!
//! [`with_session`] opens a session, issues a GET, hands both the session and
//! the in-flight response to a block, then closes the response and the session
//! (in that order) before returning. Failures are logged with the target URL
//! and returned after cleanup has been awaited.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use std::fmt;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("session open failed: {0}")]
    Open(String),
    #[error("request to {url} failed: {reason}")]
    Request { url: String, reason: String },
    #[error("http status {status} from {url}")]
    Status { url: String, status: u16 },
    #[error("response body invalid: {0}")]
    Body(String),
    #[error("response body already consumed")]
    BodyConsumed,
    #[error("session closed")]
    Closed,
}

impl SessionError {
    /// Whether repeating the same request could succeed: connection and
    /// transport failures and 5xx statuses. Bad URLs, client errors and
    /// body problems fail the same way every time.
    pub fn is_transient(&self) -> bool {
        match self {
            SessionError::Open(_) | SessionError::Request { .. } => true,
            SessionError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Opens network sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: NetworkSession;

    async fn open(&self) -> Result<Self::Session, SessionError>;
}

/// An open session able to issue requests until it is closed.
#[async_trait]
pub trait NetworkSession: Send {
    type Response: SessionResponse;

    async fn get(&mut self, url: &Url) -> Result<Self::Response, SessionError>;

    /// Releases the session. Further calls are no-ops.
    async fn close(&mut self);
}

/// A response whose body has not necessarily been read yet.
#[async_trait]
pub trait SessionResponse: Send {
    fn status(&self) -> u16;

    /// Reads the whole body as text. The body can be read once.
    async fn text(&mut self) -> Result<String, SessionError>;

    /// Reads the whole body and decodes it as JSON.
    async fn json<T>(&mut self) -> Result<T, SessionError>
    where
        T: DeserializeOwned + Send,
    {
        let body = self.text().await?;
        serde_json::from_str(&body).map_err(|e| SessionError::Body(e.to_string()))
    }

    /// Releases the response. Further calls are no-ops.
    async fn close(&mut self);
}

type ResponseOf<C> = <<C as Connector>::Session as NetworkSession>::Response;

/// Runs `block` with an open session and the response to a GET on `url`.
///
/// Cleanup order is response, then session. Each is closed exactly once on
/// every path that acquired it: if opening fails nothing is closed; if the
/// request fails only the session is closed. The block's error is returned
/// unchanged after cleanup.
///
/// If the returned future is dropped before completion, the handles are
/// released by their own `Drop` and no async close runs.
///
/// # Examples
///
/// ```no_run
/// use wrapkit_core::session::{with_session, HttpConnector, SessionError, SessionResponse};
/// use std::time::Duration;
///
/// # async fn demo() -> Result<(), SessionError> {
/// let connector = HttpConnector::new(Duration::from_secs(10), "wrapkit-demo");
/// let body = with_session(&connector, "https://wttr.in/Oslo?format=3", |_, response| {
///     Box::pin(async move { response.text().await })
/// })
/// .await?;
/// println!("{body}");
/// # Ok(())
/// # }
/// ```
pub async fn with_session<C, T, E, F>(connector: &C, url: &str, block: F) -> Result<T, E>
where
    C: Connector,
    E: From<SessionError> + fmt::Display,
    F: for<'a> FnOnce(&'a mut C::Session, &'a mut ResponseOf<C>) -> BoxFuture<'a, Result<T, E>>,
{
    let url = Url::parse(url).map_err(|e| SessionError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    let mut session = connector.open().await?;
    tracing::debug!(url = %url, "session opened");

    let mut response = match session.get(&url).await {
        Ok(response) => response,
        Err(err) => {
            session.close().await;
            tracing::error!(url = %url, error = %err, "request failed; session closed");
            return Err(err.into());
        }
    };

    let outcome = block(&mut session, &mut response).await;

    response.close().await;
    session.close().await;
    tracing::debug!(url = %url, "session closed");

    if let Err(err) = &outcome {
        tracing::error!(url = %url, error = %err, "session block failed");
    }
    outcome
}

/// Fetches `url` and returns the body text, failing on non-2xx status.
pub async fn fetch_text<C: Connector>(connector: &C, url: &str) -> Result<String, SessionError> {
    let target = url.to_string();
    with_session(connector, url, move |_, response| {
        Box::pin(async move {
            ensure_success(response.status(), target)?;
            response.text().await
        })
    })
    .await
}

/// Fetches `url` and decodes the body as JSON, failing on non-2xx status.
pub async fn fetch_json<C, T>(connector: &C, url: &str) -> Result<T, SessionError>
where
    C: Connector,
    T: DeserializeOwned + Send + 'static,
{
    let target = url.to_string();
    with_session(connector, url, move |_, response| {
        Box::pin(async move {
            ensure_success(response.status(), target)?;
            response.json::<T>().await
        })
    })
    .await
}

fn ensure_success(status: u16, url: String) -> Result<(), SessionError> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(SessionError::Status { url, status })
    }
}

#[cfg(feature = "http")]
pub use http::{HttpConnector, HttpResponse, HttpSession};

#[cfg(feature = "http")]
mod http {
    use super::{Connector, NetworkSession, SessionError, SessionResponse};
    use crate::types::SessionConfig;
    use async_trait::async_trait;
    use reqwest::Client;
    use std::time::Duration;
    use url::Url;

    /// Opens sessions backed by a fresh `reqwest` client.
    #[derive(Debug, Clone)]
    pub struct HttpConnector {
        timeout: Duration,
        user_agent: String,
    }

    impl HttpConnector {
        pub fn new(timeout: Duration, user_agent: impl Into<String>) -> Self {
            Self {
                timeout,
                user_agent: user_agent.into(),
            }
        }

        pub fn from_config(cfg: &SessionConfig) -> Self {
            Self::new(
                Duration::from_millis(cfg.timeout_ms),
                cfg.user_agent.clone(),
            )
        }
    }

    #[async_trait]
    impl Connector for HttpConnector {
        type Session = HttpSession;

        async fn open(&self) -> Result<HttpSession, SessionError> {
            let client = Client::builder()
                .timeout(self.timeout)
                .user_agent(self.user_agent.clone())
                .build()
                .map_err(|e| SessionError::Open(e.to_string()))?;
            Ok(HttpSession {
                client: Some(client),
            })
        }
    }

    #[derive(Debug)]
    pub struct HttpSession {
        client: Option<Client>,
    }

    impl HttpSession {
        pub fn is_closed(&self) -> bool {
            self.client.is_none()
        }
    }

    #[async_trait]
    impl NetworkSession for HttpSession {
        type Response = HttpResponse;

        async fn get(&mut self, url: &Url) -> Result<HttpResponse, SessionError> {
            let client = self.client.as_ref().ok_or(SessionError::Closed)?;
            let response =
                client
                    .get(url.clone())
                    .send()
                    .await
                    .map_err(|e| SessionError::Request {
                        url: url.to_string(),
                        reason: e.to_string(),
                    })?;
            Ok(HttpResponse {
                status: response.status().as_u16(),
                inner: Some(response),
            })
        }

        async fn close(&mut self) {
            self.client = None;
        }
    }

    #[derive(Debug)]
    pub struct HttpResponse {
        status: u16,
        inner: Option<reqwest::Response>,
    }

    #[async_trait]
    impl SessionResponse for HttpResponse {
        fn status(&self) -> u16 {
            self.status
        }

        async fn text(&mut self) -> Result<String, SessionError> {
            let response = self.inner.take().ok_or(SessionError::BodyConsumed)?;
            response
                .text()
                .await
                .map_err(|e| SessionError::Body(e.to_string()))
        }

        async fn close(&mut self) {
            self.inner = None;
        }
    }
}
