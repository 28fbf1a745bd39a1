//! Cache key definitions.
//!
//! Defines the `Generation` tag, the `RegionName` partitions derived from it and
//! the `RequestKey` descriptor that addresses a snapshot inside a region.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

const PRECACHE_PREFIX: &str = "precache:";
const RUNTIME_PREFIX: &str = "runtime:";

/// Opaque version tag identifying one build of the engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(String);

impl Generation {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The two partitions every generation owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// Bootstrap assets fetched once at install time.
    Precache,
    /// Responses cached opportunistically while serving.
    Runtime,
}

impl RegionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RegionKind::Precache => "precache",
            RegionKind::Runtime => "runtime",
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            RegionKind::Precache => PRECACHE_PREFIX,
            RegionKind::Runtime => RUNTIME_PREFIX,
        }
    }
}

/// Name of a cache region: `precache:<generation>` or `runtime:<generation>`.
///
/// Stores may also report names they did not create (left behind by older
/// deployments); those parse as foreign names with no kind and no generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionName(String);

impl RegionName {
    pub fn for_kind(kind: RegionKind, generation: &Generation) -> Self {
        Self(format!("{}{}", kind.prefix(), generation.as_str()))
    }

    pub fn precache(generation: &Generation) -> Self {
        Self::for_kind(RegionKind::Precache, generation)
    }

    pub fn runtime(generation: &Generation) -> Self {
        Self::for_kind(RegionKind::Runtime, generation)
    }

    /// Wrap a name reported by a store without interpreting it.
    pub fn from_raw(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> Option<RegionKind> {
        self.split().map(|(kind, _)| kind)
    }

    pub fn generation(&self) -> Option<&str> {
        self.split().map(|(_, generation)| generation)
    }

    /// True when this region is one of the two regions owned by `generation`.
    pub fn belongs_to(&self, generation: &Generation) -> bool {
        self.generation() == Some(generation.as_str())
    }

    fn split(&self) -> Option<(RegionKind, &str)> {
        [RegionKind::Precache, RegionKind::Runtime]
            .into_iter()
            .find_map(|kind| {
                self.0
                    .strip_prefix(kind.prefix())
                    .filter(|rest| !rest.is_empty())
                    .map(|rest| (kind, rest))
            })
    }
}

impl fmt::Display for RegionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request descriptor addressing a snapshot inside a region.
///
/// Only GET requests are ever cached, so the method is implied. The URL is
/// normalized by `url::Url` parsing and stripped of its fragment, which makes
/// the key a deterministic function of the request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestKey(String);

impl RequestKey {
    pub const METHOD: &'static str = "GET";

    pub fn from_url(url: &Url) -> Self {
        let mut normalized = url.clone();
        normalized.set_fragment(None);
        Self(normalized.into())
    }

    pub fn url(&self) -> &str {
        &self.0
    }

    /// Stable file-system friendly identifier for this key.
    pub fn storage_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(Self::METHOD.as_bytes());
        hasher.update(b" ");
        hasher.update(self.0.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", Self::METHOD, self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(value: &str) -> Url {
        Url::parse(value).expect("valid url")
    }

    #[test]
    fn region_names_carry_kind_and_generation() {
        let generation = Generation::new("v3");
        let precache = RegionName::precache(&generation);
        let runtime = RegionName::runtime(&generation);

        assert_eq!(precache.as_str(), "precache:v3");
        assert_eq!(runtime.as_str(), "runtime:v3");
        assert_eq!(precache.kind(), Some(RegionKind::Precache));
        assert_eq!(runtime.kind(), Some(RegionKind::Runtime));
        assert!(precache.belongs_to(&generation));
        assert!(!runtime.belongs_to(&Generation::new("v2")));
    }

    #[test]
    fn foreign_region_names_have_no_generation() {
        let foreign = RegionName::from_raw("eurogoals-cache-v8_9m");
        assert_eq!(foreign.kind(), None);
        assert_eq!(foreign.generation(), None);

        let empty = RegionName::from_raw("runtime:");
        assert_eq!(empty.generation(), None);
    }

    #[test]
    fn generation_prefix_does_not_leak_into_other_generations() {
        let region = RegionName::runtime(&Generation::new("v10"));
        assert!(!region.belongs_to(&Generation::new("v1")));
    }

    #[test]
    fn request_key_drops_fragment_and_normalizes() {
        let a = RequestKey::from_url(&url("HTTP://Example.com:80/dashboard?tab=live#odds"));
        let b = RequestKey::from_url(&url("http://example.com/dashboard?tab=live"));
        assert_eq!(a, b);
        assert_eq!(a.url(), "http://example.com/dashboard?tab=live");
        assert_eq!(a.to_string(), "GET http://example.com/dashboard?tab=live");
    }

    #[test]
    fn request_key_keeps_query_distinct() {
        let a = RequestKey::from_url(&url("http://example.com/api/odds?league=1"));
        let b = RequestKey::from_url(&url("http://example.com/api/odds?league=2"));
        assert_ne!(a, b);
        assert_ne!(a.storage_id(), b.storage_id());
    }

    #[test]
    fn storage_id_is_stable_hex() {
        let key = RequestKey::from_url(&url("http://example.com/"));
        let id = key.storage_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, key.clone().storage_id());
    }
}
