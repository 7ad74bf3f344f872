#![forbid(unsafe_code)]

//! HTTP transport seam.
//!
//! The crate never talks to the network itself. A [`Transport`] is supplied
//! by the embedding application; [`Connection`] wraps it with the request
//! timeout and cancellation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::HttpMethod;
use crate::types::{Error, Result};

/// Outgoing request.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    /// HTTP method.
    pub method: HttpMethod,
    /// Absolute URI.
    pub uri: String,
    /// Request headers.
    pub headers: Vec<(String, String)>,
    /// JSON body, when the request carries one.
    pub body: Option<serde_json::Value>,
}

impl Request {
    /// Request without headers or body.
    pub fn new(method: HttpMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Adds a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body.
    pub fn body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Incoming response.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Response {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: String,
}

impl Response {
    /// 200 response with `body`.
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Headers as borrowed pairs.
    pub fn header_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// True for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends requests to an OData service.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Sends one request and waits for the response.
    async fn send(&self, request: Request) -> Result<Response>;
}

/// Transport bound to a request timeout.
#[derive(Clone)]
pub struct Connection {
    transport: Arc<dyn Transport>,
    timeout: Option<Duration>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("transport", &self.transport)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Connection {
    /// Wraps `transport`; `None` disables the timeout.
    pub fn new(transport: Arc<dyn Transport>, timeout: Option<Duration>) -> Self {
        Self { transport, timeout }
    }

    /// Configured request timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Sends `request`, failing with [`Error::Timeout`] when the timeout
    /// elapses first and [`Error::Cancelled`] when `cancel` fires first.
    /// Non-2xx responses become [`Error::Transport`].
    pub async fn send(&self, request: Request, cancel: &CancellationToken) -> Result<Response> {
        let method = request.method;
        let uri = request.uri.clone();
        debug!(%method, uri = %uri, "sending request");
        let exchange = async {
            match self.timeout {
                Some(after) => tokio::time::timeout(after, self.transport.send(request))
                    .await
                    .map_err(|_| Error::Timeout { after })?,
                None => self.transport.send(request).await,
            }
        };
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(uri = %uri, "request cancelled");
                return Err(Error::Cancelled);
            }
            response = exchange => response,
        }
        .map_err(|err| {
            if err.is_timeout() {
                warn!(uri = %uri, "request timed out");
            }
            err
        })?;
        if !response.is_success() {
            return Err(Error::Transport(format!(
                "{method} {uri} returned status {}",
                response.status
            )));
        }
        Ok(response)
    }
}
