//! The intercepted request as seen by the engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::http::{HeaderMap, HeaderValue, Method, header};
use url::Url;

use crate::cache::RequestKey;

const SEC_FETCH_MODE: &str = "sec-fetch-mode";

/// How the page issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    /// Top-level page navigation.
    Navigate,
    /// Anything a loaded page fetches: scripts, styles, XHR, images.
    Subresource,
}

/// Hard-abort signal delivered by the platform for one request.
///
/// Aborting does not stop the strategy already running; it only makes the
/// engine drop the pending cache write for that request.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A request offered to the engine before it reaches the network.
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub mode: RequestMode,
    pub abort: AbortSignal,
}

impl InterceptedRequest {
    /// Build from raw request parts; the mode is read from `Sec-Fetch-Mode`.
    pub fn from_parts(method: Method, url: Url, headers: HeaderMap) -> Self {
        let mode = if headers
            .get(SEC_FETCH_MODE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.eq_ignore_ascii_case("navigate"))
        {
            RequestMode::Navigate
        } else {
            RequestMode::Subresource
        };

        Self {
            method,
            url,
            headers,
            mode,
            abort: AbortSignal::new(),
        }
    }

    /// A plain subresource GET.
    pub fn get(url: Url) -> Self {
        Self::from_parts(Method::GET, url, HeaderMap::new())
    }

    /// A page navigation GET.
    pub fn navigate(url: Url) -> Self {
        let mut request = Self::get(url);
        request.mode = RequestMode::Navigate;
        request
            .headers
            .insert(header::ACCEPT, HeaderValue::from_static("text/html"));
        request
    }

    pub fn with_header(mut self, name: header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    pub fn accepts_html(&self) -> bool {
        self.headers
            .get_all(header::ACCEPT)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .any(|value| value.contains("text/html"))
    }

    pub fn is_same_origin(&self, origin: &Url) -> bool {
        self.url.origin() == origin.origin()
    }

    /// Cache key for this request.
    pub fn key(&self) -> RequestKey {
        RequestKey::from_url(&self.url)
    }
}
