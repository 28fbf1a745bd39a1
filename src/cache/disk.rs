//! Durable file-system backend for the cache store.
//!
//! Layout: one directory per region (hex-encoded region name) under the store
//! root, one JSON file per entry named after [`RequestKey::storage_id`]. Entries
//! are written to a temporary file and renamed into place, so a reader never
//! sees a partially written snapshot. The lifecycle record lives next to the
//! region directories as `lifecycle.json`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::fs;
use tracing::warn;
use uuid::Uuid;

use super::keys::{RegionName, RequestKey};
use super::store::{CacheStore, Snapshot, StoreError};

const ENTRY_EXTENSION: &str = "json";
const RECORD_FILE: &str = "lifecycle.json";

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    key: RequestKey,
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
    captured_at: OffsetDateTime,
}

impl StoredEntry {
    fn new(key: &RequestKey, snapshot: &Snapshot) -> Self {
        Self {
            key: key.clone(),
            status: snapshot.status,
            headers: snapshot.headers.clone(),
            body: STANDARD.encode(&snapshot.body),
            captured_at: snapshot.captured_at,
        }
    }

    fn into_snapshot(self, region: &RegionName) -> Result<Snapshot, StoreError> {
        let body = STANDARD
            .decode(self.body.as_bytes())
            .map_err(|err| StoreError::corrupt(region, format!("body is not base64: {err}")))?;
        Ok(Snapshot {
            status: self.status,
            headers: self.headers,
            body: Bytes::from(body),
            captured_at: self.captured_at,
        })
    }
}

/// Cache store persisted under a directory.
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub async fn open_root(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn region_dir(&self, region: &RegionName) -> PathBuf {
        self.root.join(hex::encode(region.as_str()))
    }

    fn entry_path(&self, region: &RegionName, key: &RequestKey) -> PathBuf {
        self.region_dir(region)
            .join(format!("{}.{ENTRY_EXTENSION}", key.storage_id()))
    }

    /// Write `payload` beside `target` and rename it into place.
    async fn replace_file(
        dir: &Path,
        target: &Path,
        stem: &str,
        payload: &[u8],
    ) -> Result<(), StoreError> {
        let staging = dir.join(format!(".{stem}.{}.tmp", Uuid::new_v4()));
        fs::write(&staging, payload).await?;

        if let Err(err) = fs::rename(&staging, target).await {
            let _ = fs::remove_file(&staging).await;
            return Err(err.into());
        }

        Ok(())
    }

    async fn read_entry(
        &self,
        region: &RegionName,
        path: &Path,
    ) -> Result<Option<StoredEntry>, StoreError> {
        let raw = match fs::read(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|err| StoreError::corrupt(region, err.to_string()))
    }
}

#[async_trait]
impl CacheStore for DiskStore {
    async fn open(&self, region: &RegionName) -> Result<(), StoreError> {
        fs::create_dir_all(self.region_dir(region)).await?;
        Ok(())
    }

    async fn match_entry(
        &self,
        region: &RegionName,
        key: &RequestKey,
    ) -> Result<Option<Snapshot>, StoreError> {
        let path = self.entry_path(region, key);
        let Some(entry) = self.read_entry(region, &path).await? else {
            return Ok(None);
        };

        if &entry.key != key {
            return Err(StoreError::corrupt(
                region,
                format!("entry for `{}` holds `{}`", key, entry.key),
            ));
        }

        entry.into_snapshot(region).map(Some)
    }

    async fn put(
        &self,
        region: &RegionName,
        key: &RequestKey,
        snapshot: Snapshot,
    ) -> Result<(), StoreError> {
        let dir = self.region_dir(region);
        fs::create_dir_all(&dir).await?;

        let payload = serde_json::to_vec(&StoredEntry::new(key, &snapshot))?;
        Self::replace_file(
            &dir,
            &self.entry_path(region, key),
            &key.storage_id(),
            &payload,
        )
        .await
    }

    async fn delete_region(&self, region: &RegionName) -> Result<bool, StoreError> {
        match fs::remove_dir_all(self.region_dir(region)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_regions(&self) -> Result<Vec<RegionName>, StoreError> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }

            let encoded = entry.file_name().to_string_lossy().into_owned();
            match hex::decode(&encoded).ok().and_then(|raw| String::from_utf8(raw).ok()) {
                Some(name) => names.push(RegionName::from_raw(name)),
                None => warn!(
                    root = %self.root.display(),
                    directory = %encoded,
                    "Skipping directory that is not a cache region"
                ),
            }
        }

        names.sort();
        Ok(names)
    }

    async fn keys(&self, region: &RegionName) -> Result<Vec<RequestKey>, StoreError> {
        let mut dir = match fs::read_dir(self.region_dir(region)).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let is_entry = path.extension().is_some_and(|ext| ext == ENTRY_EXTENSION)
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_entry {
                continue;
            }

            match self.read_entry(region, &path).await {
                Ok(Some(stored)) => keys.push(stored.key),
                Ok(None) => {}
                Err(err) => warn!(
                    region = %region,
                    path = %path.display(),
                    error = %err,
                    "Skipping unreadable cache entry"
                ),
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn load_record(&self) -> Result<Option<Bytes>, StoreError> {
        match fs::read(self.root.join(RECORD_FILE)).await {
            Ok(raw) => Ok(Some(Bytes::from(raw))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_record(&self, record: Bytes) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).await?;
        Self::replace_file(&self.root, &self.root.join(RECORD_FILE), "lifecycle", &record).await
    }
}
