//! The network seam: what the engine calls "the network".
//!
//! Strategies only ever talk to [`Network`]; [`HttpNetwork`] forwards to the
//! upstream origin with `reqwest`, tests substitute a scripted double.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, header};
use bytes::Bytes;
use reqwest::Client;
use thiserror::Error;
use url::Url;

use crate::cache::Snapshot;
use crate::engine::InterceptedRequest;

/// Headers that describe a single connection and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(name))
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("request to `{url}` timed out")]
    Timeout { url: String },
    #[error("could not connect to `{url}`: {message}")]
    Connect { url: String, message: String },
    #[error("failed to read body from `{url}`: {message}")]
    Body { url: String, message: String },
    #[error("network error for `{url}`: {message}")]
    Other { url: String, message: String },
}

impl NetworkError {
    pub fn connect(url: &Url, message: impl Into<String>) -> Self {
        Self::Connect {
            url: url.to_string(),
            message: message.into(),
        }
    }

    pub fn other(url: &Url, message: impl Into<String>) -> Self {
        Self::Other {
            url: url.to_string(),
            message: message.into(),
        }
    }

    /// Short label used in logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            NetworkError::Timeout { .. } => "timeout",
            NetworkError::Connect { .. } => "connect",
            NetworkError::Body { .. } => "body",
            NetworkError::Other { .. } => "other",
        }
    }

    fn classify(url: &Url, err: &reqwest::Error) -> Self {
        let url = url.to_string();
        let message = err.to_string();
        if err.is_timeout() {
            NetworkError::Timeout { url }
        } else if err.is_connect() {
            NetworkError::Connect { url, message }
        } else if err.is_body() || err.is_decode() {
            NetworkError::Body { url, message }
        } else {
            NetworkError::Other { url, message }
        }
    }
}

/// A request as it leaves for the network.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OutboundRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Forward an intercepted GET with its end-to-end headers.
    pub fn from_intercepted(request: &InterceptedRequest) -> Self {
        let mut headers = request.headers.clone();
        strip_hop_by_hop(&mut headers);
        Self {
            method: request.method.clone(),
            url: request.url.clone(),
            headers,
            body: Bytes::new(),
        }
    }

    /// Ask every intermediate cache to skip reuse for this fetch.
    pub fn bypassing_caches(mut self) -> Self {
        self.headers
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        self.headers
            .insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }
}

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let doomed: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name.as_str()))
        .cloned()
        .collect();
    for name in doomed {
        headers.remove(name);
    }
}

#[async_trait]
pub trait Network: Send + Sync {
    /// Perform the fetch and buffer the whole response.
    ///
    /// Any HTTP status is a successful fetch; only transport failures are
    /// errors.
    async fn send(&self, request: OutboundRequest) -> Result<Snapshot, NetworkError>;
}

/// [`Network`] backed by a shared `reqwest` client.
#[derive(Clone, Debug)]
pub struct HttpNetwork {
    client: Client,
}

impl HttpNetwork {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    pub fn user_agent() -> &'static str {
        concat!("sideline/", env!("CARGO_PKG_VERSION"))
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn send(&self, request: OutboundRequest) -> Result<Snapshot, NetworkError> {
        let url = request.url.clone();
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| NetworkError::classify(&url, &err))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|err| NetworkError::classify(&url, &err))?;

        Ok(Snapshot::new(status, headers, body))
    }
}
