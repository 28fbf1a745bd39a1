//! Cache Generation Store: the storage seam and its in-memory backend.
//!
//! A store is partitioned into named regions; each region maps a
//! [`RequestKey`] to an immutable [`Snapshot`]. Writes replace the whole
//! snapshot for a key (last write wins), so a concurrent reader observes either
//! the previous or the new snapshot.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use time::OffsetDateTime;

use super::keys::{RegionName, RequestKey};
use super::lock::mutex_lock;

const LOCK_TARGET: &str = "cache::store";

/// Immutable response snapshot stored in a region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub captured_at: OffsetDateTime,
}

impl Snapshot {
    /// Build a snapshot captured now.
    pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
            captured_at: OffsetDateTime::now_utc(),
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// `206 Partial Content`: the body is a fragment of the resource.
    pub fn is_partial(&self) -> bool {
        self.status == 206
    }

    /// Whether an opportunistic write may keep this response.
    ///
    /// Fragments would be served as the whole resource later. Streams cannot
    /// be snapshotted and responses setting cookies are per-user.
    pub fn is_storable(&self) -> bool {
        if !self.is_success() || self.is_partial() {
            return false;
        }

        if self.header("set-cookie").is_some() {
            return false;
        }

        !self
            .header("content-type")
            .is_some_and(|value| value.starts_with("text/event-stream"))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt entry in region `{region}`: {detail}")]
    Corrupt { region: String, detail: String },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn corrupt(region: &RegionName, detail: impl Into<String>) -> Self {
        Self::Corrupt {
            region: region.to_string(),
            detail: detail.into(),
        }
    }
}

/// Durable key/value store partitioned into regions.
///
/// Every operation may run concurrently with any other. `match_entry` on a
/// region that does not exist is a miss, not an error; `put` opens the region
/// when needed.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Create the region if it does not exist yet.
    async fn open(&self, region: &RegionName) -> Result<(), StoreError>;

    /// Look up the snapshot stored under `key`.
    async fn match_entry(
        &self,
        region: &RegionName,
        key: &RequestKey,
    ) -> Result<Option<Snapshot>, StoreError>;

    /// Store `snapshot` under `key`, replacing any previous snapshot.
    async fn put(
        &self,
        region: &RegionName,
        key: &RequestKey,
        snapshot: Snapshot,
    ) -> Result<(), StoreError>;

    /// Remove a region and everything in it. Returns false if it did not exist.
    async fn delete_region(&self, region: &RegionName) -> Result<bool, StoreError>;

    /// Names of all regions currently present, sorted.
    async fn list_regions(&self) -> Result<Vec<RegionName>, StoreError>;

    /// Keys stored in a region, sorted. Missing regions have no keys.
    async fn keys(&self, region: &RegionName) -> Result<Vec<RequestKey>, StoreError>;

    /// Read the record last written by [`CacheStore::save_record`]. Backends
    /// that keep nothing across restarts may return `None`.
    async fn load_record(&self) -> Result<Option<Bytes>, StoreError> {
        Ok(None)
    }

    /// Replace the lifecycle record kept next to the regions.
    async fn save_record(&self, _record: Bytes) -> Result<(), StoreError> {
        Ok(())
    }
}

type Region = Arc<DashMap<RequestKey, Snapshot>>;

/// In-memory store backed by `dashmap`.
#[derive(Default)]
pub struct MemoryStore {
    regions: DashMap<RegionName, Region>,
    record: Mutex<Option<Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn region(&self, name: &RegionName) -> Option<Region> {
        self.regions.get(name).map(|entry| Arc::clone(entry.value()))
    }

    fn region_or_create(&self, name: &RegionName) -> Region {
        Arc::clone(self.regions.entry(name.clone()).or_default().value())
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn open(&self, region: &RegionName) -> Result<(), StoreError> {
        self.region_or_create(region);
        Ok(())
    }

    async fn match_entry(
        &self,
        region: &RegionName,
        key: &RequestKey,
    ) -> Result<Option<Snapshot>, StoreError> {
        Ok(self
            .region(region)
            .and_then(|entries| entries.get(key).map(|entry| entry.value().clone())))
    }

    async fn put(
        &self,
        region: &RegionName,
        key: &RequestKey,
        snapshot: Snapshot,
    ) -> Result<(), StoreError> {
        self.region_or_create(region).insert(key.clone(), snapshot);
        Ok(())
    }

    async fn delete_region(&self, region: &RegionName) -> Result<bool, StoreError> {
        Ok(self.regions.remove(region).is_some())
    }

    async fn list_regions(&self) -> Result<Vec<RegionName>, StoreError> {
        let mut names: Vec<RegionName> = self
            .regions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn keys(&self, region: &RegionName) -> Result<Vec<RequestKey>, StoreError> {
        let mut keys: Vec<RequestKey> = self
            .region(region)
            .map(|entries| entries.iter().map(|entry| entry.key().clone()).collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }

    async fn load_record(&self) -> Result<Option<Bytes>, StoreError> {
        Ok(mutex_lock(&self.record, LOCK_TARGET, "load_record").clone())
    }

    async fn save_record(&self, record: Bytes) -> Result<(), StoreError> {
        *mutex_lock(&self.record, LOCK_TARGET, "save_record") = Some(record);
        Ok(())
    }
}
