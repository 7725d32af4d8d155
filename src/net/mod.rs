//! Network boundary.
//!
//! Both layers talk to the network through [`HttpClient`], a minimal
//! request/response trait. Implementations must surface non-2xx responses
//! as [`HuginnError::Server`] carrying status and body, so callers can treat
//! any `Ok` as a successful exchange.
//!
//! - [`ReqwestClient`]: production client backed by reqwest.
//! - [`RetryingHttpClient`]: decorator adding exponential backoff on
//!   transient errors (see [`retry`]).

mod client;
pub mod retry;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{HuginnError, Result};

pub use client::ReqwestClient;
pub use retry::{RetryConfig, RetryingHttpClient};

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }

    /// Whether requests with this method change server state.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Method::Get | Method::Head)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outgoing HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    /// Header names are stored lowercase.
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
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

    /// Set a header (name is lowercased).
    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Attach an `Authorization: Bearer` header.
    pub fn bearer(self, token: impl AsRef<str>) -> Self {
        let value = format!("Bearer {}", token.as_ref());
        self.header("authorization", value)
    }

    /// Serialize `body` as JSON and set the content type.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self> {
        self.body = Some(serde_json::to_vec(body)?);
        Ok(self.header("content-type", "application/json"))
    }

    /// Cache key for this request: method plus full URL.
    pub fn cache_key(&self) -> String {
        format!("{} {}", self.method, self.url)
    }
}

/// A received HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are stored lowercase.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// A response with a JSON body.
    pub fn json_body<T: Serialize + ?Sized>(status: u16, body: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(body)?;
        Ok(Self::new(status, bytes).with_header("content-type", "application/json"))
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Convert a non-2xx response into the error the [`HttpClient`]
    /// contract requires.
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(HuginnError::Server {
                status: self.status,
                body: self.text(),
            })
        }
    }
}

/// Resolve `path` against `base`. Absolute URLs are returned unchanged.
pub fn join_url(base: &str, path: &str) -> String {
    if url::Url::parse(path).is_ok() {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// `endpoint` extended by `id` as a single, percent-encoded path segment.
pub fn record_url(endpoint: &str, id: &str) -> Result<String> {
    let mut url = url::Url::parse(endpoint)
        .map_err(|e| HuginnError::InvalidInput(format!("invalid endpoint URL {endpoint}: {e}")))?;
    url.path_segments_mut()
        .map_err(|()| HuginnError::InvalidInput(format!("endpoint URL {endpoint} has no path")))?
        .pop_if_empty()
        .push(id);
    Ok(url.into())
}

/// Minimal async HTTP client.
///
/// Implementations return `Err(HuginnError::Server { .. })` for non-2xx
/// responses and `Err(HuginnError::Network(..))` for transport failures.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Source of bearer tokens for authenticated sync endpoints.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current token, or `None` to send the request unauthenticated.
    async fn token(&self) -> Result<Option<String>>;
}

/// A fixed token.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<Option<String>> {
        Ok(Some(self.0.clone()))
    }
}

/// No authentication.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoToken;

#[async_trait]
impl TokenProvider for NoToken {
    async fn token(&self) -> Result<Option<String>> {
        Ok(None)
    }
}
