//! HTTP transport seam.
//!
//! The dispatcher never talks to the network directly; it hands a signed URL
//! to a [`Transport`] and gets back the status code and body. Production code
//! uses [`ReqwestTransport`]; tests script replies through
//! [`crate::test_support::ScriptedTransport`].

use std::future::Future;
use std::pin::Pin;
use std::sync::LazyLock;
use std::time::Duration;

use super::QueryError;

/// Boxed future returned by [`Transport::get`].
pub type TransportFuture<'a> = Pin<Box<dyn Future<Output = Result<HttpReply, QueryError>> + Send + 'a>>;

/// A raw HTTP reply.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HttpReply {
    /// HTTP status code.
    pub status: u16,
    /// Response body decoded as UTF-8.
    pub body: String,
}

impl HttpReply {
    /// Creates a reply.
    #[must_use]
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Returns `true` for 2xx statuses.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// Issues `GET` requests against fully signed URLs.
pub trait Transport: Send + Sync {
    /// Fetches `url`.
    ///
    /// Non-2xx statuses are returned as replies; only failures to obtain a
    /// reply at all are errors.
    fn get<'a>(&'a self, url: &'a str) -> TransportFuture<'a>;
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// [`Transport`] backed by a shared `reqwest` client.
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransport;

impl Transport for ReqwestTransport {
    fn get<'a>(&'a self, url: &'a str) -> TransportFuture<'a> {
        Box::pin(async move {
            let response = HTTP_CLIENT
                .get(url)
                .send()
                .await
                .map_err(|err| QueryError::Transport(err.to_string()))?;
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|err| QueryError::Transport(err.to_string()))?;
            Ok(HttpReply { status, body })
        })
    }
}
