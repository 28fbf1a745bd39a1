//! Resource Classifier.
//!
//! Classification is a static, ordered table of `(matcher, class)` rules;
//! the first matching rule wins. The navigation rules always come first, so a
//! page navigation to `/app.js` is still `navigation-html`.

use std::fmt;

use axum::http::Method;
use serde::{Deserialize, Serialize};

use super::request::InterceptedRequest;

const STATIC_PREFIX: &str = "/static/";

const STATIC_SUFFIXES: &[&str] = &[
    ".css",
    ".js",
    ".mjs",
    ".png",
    ".jpg",
    ".jpeg",
    ".svg",
    ".ico",
    ".webp",
    ".woff",
    ".woff2",
    ".json",
    ".webmanifest",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceClass {
    NavigationHtml,
    StaticAsset,
    ApiLike,
    Unclassified,
}

impl ResourceClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceClass::NavigationHtml => "navigation-html",
            ResourceClass::StaticAsset => "static-asset",
            ResourceClass::ApiLike => "api-like",
            ResourceClass::Unclassified => "unclassified",
        }
    }

    pub fn strategy(self) -> Strategy {
        match self {
            ResourceClass::NavigationHtml => Strategy::NetworkFirst,
            ResourceClass::StaticAsset => Strategy::CacheFirst,
            ResourceClass::ApiLike | ResourceClass::Unclassified => Strategy::StaleWhileRevalidate,
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    NetworkFirst,
    CacheFirst,
    StaleWhileRevalidate,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::NetworkFirst => "network-first",
            Strategy::CacheFirst => "cache-first",
            Strategy::StaleWhileRevalidate => "stale-while-revalidate",
        }
    }
}

/// Predicate half of a route rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// The request is a top-level navigation.
    Navigation,
    /// The `Accept` header mentions `text/html`.
    AcceptsHtml,
    PathPrefix(String),
    /// Case-insensitive suffix of the URL path.
    PathSuffix(String),
    PathExact(String),
}

impl Matcher {
    fn matches(&self, request: &InterceptedRequest) -> bool {
        let path = request.url.path();
        match self {
            Matcher::Navigation => request.is_navigation(),
            Matcher::AcceptsHtml => request.accepts_html(),
            Matcher::PathPrefix(prefix) => path.starts_with(prefix.as_str()),
            Matcher::PathSuffix(suffix) => path
                .len()
                .checked_sub(suffix.len())
                .and_then(|start| path.get(start..))
                .is_some_and(|tail| tail.eq_ignore_ascii_case(suffix)),
            Matcher::PathExact(exact) => path == exact,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pub matcher: Matcher,
    pub class: ResourceClass,
}

impl RouteRule {
    pub fn new(matcher: Matcher, class: ResourceClass) -> Self {
        Self { matcher, class }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::with_rules(Vec::new())
    }
}

impl RouteTable {
    /// Built-in table with `extra` rules slotted between the navigation rules
    /// and the static-asset rules.
    pub fn with_rules(extra: Vec<RouteRule>) -> Self {
        let mut rules = vec![
            RouteRule::new(Matcher::Navigation, ResourceClass::NavigationHtml),
            RouteRule::new(Matcher::AcceptsHtml, ResourceClass::NavigationHtml),
        ];
        rules.extend(extra);
        rules.push(RouteRule::new(
            Matcher::PathPrefix(STATIC_PREFIX.to_string()),
            ResourceClass::StaticAsset,
        ));
        rules.extend(STATIC_SUFFIXES.iter().map(|suffix| {
            RouteRule::new(
                Matcher::PathSuffix((*suffix).to_string()),
                ResourceClass::StaticAsset,
            )
        }));
        Self { rules }
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    /// Classify a request. Non-GET requests are never classified and return
    /// `None`: they bypass the engine entirely.
    pub fn classify(&self, request: &InterceptedRequest) -> Option<ResourceClass> {
        if request.method != Method::GET {
            return None;
        }

        Some(
            self.rules
                .iter()
                .find(|rule| rule.matcher.matches(request))
                .map_or(ResourceClass::Unclassified, |rule| rule.class),
        )
    }
}
