//! Request Client Adapter: the boundary between the engine and the network.
//!
//! The engine never speaks HTTP itself. Virtual users issue [`Request`]s through a
//! [`RequestClient`], which returns a [`Response`] (status, body, elapsed time) or a
//! [`TransportError`]. A [`Connector`] hands each virtual user its own client when the
//! user starts; the client is dropped when the user exits, on every exit path.
//!
//! With the `reqwest` feature enabled, [`ReqwestConnector`] provides a ready-made
//! adapter. Tests and custom transports implement the two traits directly.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use typed_builder::TypedBuilder;

#[cfg(feature = "reqwest")]
pub use self::reqwest_adapter::{ReqwestClient, ReqwestConnector};

/// HTTP method of a [`Request`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        };
        f.write_str(s)
    }
}

/// A single request handed to the adapter.
///
/// `url` may be absolute or a path; paths are joined onto the scenario host by the
/// virtual user before the request reaches the adapter.
#[derive(Clone, Debug, TypedBuilder)]
pub struct Request {
    pub method: Method,
    #[builder(setter(into))]
    pub url: String,
    #[builder(default)]
    pub headers: Vec<(String, String)>,
    #[builder(default, setter(strip_option))]
    pub body: Option<Vec<u8>>,
    /// Upper bound for this request. Expiry is reported as a timeout transport error.
    #[builder(default, setter(strip_option))]
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self::builder().method(method).url(url).build()
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::Put, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::Delete, url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body and set the content type.
    pub fn with_json<T: Serialize + ?Sized>(self, value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        Ok(self
            .with_header("content-type", "application/json")
            .with_body(body))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn is_absolute(&self) -> bool {
        self.url.starts_with("http://") || self.url.starts_with("https://")
    }
}

/// What the adapter returns for a completed exchange.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Vec<u8>,
    pub elapsed: Duration,
}

impl Response {
    /// Default success classification: any 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportErrorKind {
    Connect,
    Timeout,
    Other,
}

/// Connectivity-level failure: no response was obtained.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            TransportErrorKind::Timeout,
            format!("no response after {after:?}"),
        )
    }
}

/// Executes requests on behalf of one virtual user.
#[async_trait]
pub trait RequestClient: Send + Sync {
    async fn request(&self, request: Request) -> Result<Response, TransportError>;
}

/// Hands out one [`RequestClient`] per virtual user.
///
/// Called when a user starts; the returned client lives exactly as long as the user.
/// An error here counts as a start failure for that user.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn RequestClient>, TransportError>;
}

#[cfg(feature = "reqwest")]
mod reqwest_adapter {
    use super::*;
    use tokio::time::Instant;

    /// Builds a fresh `reqwest::Client` (own connection pool) for every virtual user.
    #[derive(Clone, Debug, TypedBuilder)]
    pub struct ReqwestConnector {
        /// Applied to every request that does not carry its own timeout.
        #[builder(default, setter(strip_option))]
        pub default_timeout: Option<Duration>,
    }

    impl Default for ReqwestConnector {
        fn default() -> Self {
            Self::builder().build()
        }
    }

    impl Connector for ReqwestConnector {
        fn connect(&self) -> Result<Box<dyn RequestClient>, TransportError> {
            let mut builder = reqwest::Client::builder();
            if let Some(timeout) = self.default_timeout {
                builder = builder.timeout(timeout);
            }
            let client = builder.build().map_err(map_error)?;
            Ok(Box::new(ReqwestClient(client)))
        }
    }

    /// [`RequestClient`] over a shared-nothing `reqwest::Client`.
    pub struct ReqwestClient(pub reqwest::Client);

    #[async_trait]
    impl RequestClient for ReqwestClient {
        async fn request(&self, request: Request) -> Result<Response, TransportError> {
            let method = match request.method {
                Method::Get => reqwest::Method::GET,
                Method::Post => reqwest::Method::POST,
                Method::Put => reqwest::Method::PUT,
                Method::Patch => reqwest::Method::PATCH,
                Method::Delete => reqwest::Method::DELETE,
                Method::Head => reqwest::Method::HEAD,
                Method::Options => reqwest::Method::OPTIONS,
            };
            let mut builder = self.0.request(method, &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }
            if let Some(timeout) = request.timeout {
                builder = builder.timeout(timeout);
            }

            let start = Instant::now();
            let res = builder.send().await.map_err(map_error)?;
            let status = res.status().as_u16();
            let body = res.bytes().await.map_err(map_error)?.to_vec();
            Ok(Response {
                status,
                body,
                elapsed: start.elapsed(),
            })
        }
    }

    fn map_error(err: reqwest::Error) -> TransportError {
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else {
            TransportErrorKind::Other
        };
        TransportError::new(kind, err.to_string())
    }
}
