//! Time-bounded per-platform snapshot cache with atomic replacement.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vcr_core::CatalogRecord;

pub const CRATE_NAME: &str = "vcr-cache";

const SNAPSHOT_SUFFIX: &str = "_cache.json";

/// Decides whether a snapshot captured at some instant is still usable.
#[derive(Debug, Clone, Copy)]
pub struct FreshnessPolicy {
    ttl: Duration,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self::with_ttl_hours(24)
    }
}

impl FreshnessPolicy {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }

    pub fn with_ttl_hours(hours: i64) -> Self {
        Self {
            ttl: Duration::hours(hours),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh on `[captured_at, captured_at + ttl)`, stale at and beyond.
    pub fn is_fresh(&self, captured_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - captured_at < self.ttl
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid cache key {0:?}")]
    InvalidKey(String),
    #[error("reading snapshot for {platform}: {detail}")]
    Read { platform: String, detail: String },
    #[error("writing snapshot for {platform}")]
    Write {
        platform: String,
        #[source]
        source: std::io::Error,
    },
    #[error("listing cache directory {dir}")]
    List {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// On-disk snapshot layout: one JSON file per platform key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotEntry {
    timestamp: DateTime<Utc>,
    platform: String,
    count: usize,
    movies: Vec<CatalogRecord>,
}

/// Aggregate view of one stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotStats {
    pub record_count: usize,
    pub captured_at: DateTime<Utc>,
}

/// Stores at most one snapshot per platform key under a single directory.
///
/// Writes go to a temp file first and are atomically renamed into place, so a
/// concurrent reader sees either the fully-old or fully-new entry. There is no
/// further coordination: concurrent saves to one key are last-writer-wins.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
    policy: FreshnessPolicy,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>, policy: FreshnessPolicy) -> Self {
        Self {
            root: root.into(),
            policy,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> FreshnessPolicy {
        self.policy
    }

    fn snapshot_path(&self, key: &str) -> Result<PathBuf, CacheError> {
        validate_key(key)?;
        Ok(self.root.join(format!("{key}{SNAPSHOT_SUFFIX}")))
    }

    /// Whether a usable snapshot exists for `key`. Never an error: a missing
    /// or unreadable entry simply reads as invalid.
    pub async fn is_valid(&self, key: &str) -> bool {
        match self.read_entry(key).await {
            Ok(Some(entry)) => {
                let now = Utc::now();
                if self.policy.is_fresh(entry.timestamp, now) {
                    info!(
                        platform = key,
                        captured_at = %entry.timestamp,
                        "cache hit"
                    );
                    true
                } else {
                    info!(
                        platform = key,
                        captured_at = %entry.timestamp,
                        "cache expired"
                    );
                    false
                }
            }
            Ok(None) => {
                debug!(platform = key, "cache miss");
                false
            }
            Err(err) => {
                warn!(platform = key, error = %err, "unreadable snapshot treated as invalid");
                false
            }
        }
    }

    /// Replace (or create) the snapshot for `key`, stamping it with the
    /// current time.
    pub async fn save(&self, key: &str, records: &[CatalogRecord]) -> Result<(), CacheError> {
        let path = self.snapshot_path(key)?;
        let entry = SnapshotEntry {
            timestamp: Utc::now(),
            platform: key.to_string(),
            count: records.len(),
            movies: records.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&entry).map_err(|err| CacheError::Write {
            platform: key.to_string(),
            source: std::io::Error::new(ErrorKind::InvalidData, err),
        })?;

        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| CacheError::Write {
                platform: key.to_string(),
                source,
            })?;

        let temp_path = self.root.join(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&temp_path, &bytes)
            .await
            .map_err(|source| CacheError::Write {
                platform: key.to_string(),
                source,
            })?;

        if let Err(source) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(CacheError::Write {
                platform: key.to_string(),
                source,
            });
        }

        info!(platform = key, records = entry.count, "snapshot saved");
        Ok(())
    }

    /// Load the stored records for `key`. A missing entry is an empty batch,
    /// not an error; a present but corrupt entry is.
    pub async fn load(&self, key: &str) -> Result<Vec<CatalogRecord>, CacheError> {
        match self.read_entry(key).await? {
            Some(entry) => {
                info!(platform = key, records = entry.count, "snapshot loaded");
                Ok(entry.movies)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Remove the snapshot for `key`, or every snapshot when `key` is `None`.
    /// Clearing an absent entry is a no-op.
    pub async fn clear(&self, key: Option<&str>) -> Result<(), CacheError> {
        match key {
            Some(key) => {
                let path = self.snapshot_path(key)?;
                match fs::remove_file(&path).await {
                    Ok(()) => {
                        info!(platform = key, "snapshot cleared");
                        Ok(())
                    }
                    Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
                    Err(source) => Err(CacheError::Write {
                        platform: key.to_string(),
                        source,
                    }),
                }
            }
            None => {
                for path in self.snapshot_paths().await? {
                    if let Err(err) = fs::remove_file(&path).await {
                        if err.kind() != ErrorKind::NotFound {
                            return Err(CacheError::Write {
                                platform: platform_of(&path),
                                source: err,
                            });
                        }
                    }
                }
                info!("all snapshots cleared");
                Ok(())
            }
        }
    }

    /// Aggregate statistics over every currently stored snapshot, keyed by
    /// platform. Corrupt entries are skipped with a warning so one bad file
    /// does not hide the rest.
    pub async fn stats(&self) -> Result<BTreeMap<String, SnapshotStats>, CacheError> {
        let mut stats = BTreeMap::new();
        for path in self.snapshot_paths().await? {
            match parse_entry_file(&path).await {
                Ok(entry) => {
                    stats.insert(
                        entry.platform.clone(),
                        SnapshotStats {
                            record_count: entry.count,
                            captured_at: entry.timestamp,
                        },
                    );
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "skipping corrupt snapshot in stats"
                    );
                }
            }
        }
        Ok(stats)
    }

    async fn read_entry(&self, key: &str) -> Result<Option<SnapshotEntry>, CacheError> {
        let path = self.snapshot_path(key)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(CacheError::Read {
                    platform: key.to_string(),
                    detail: err.to_string(),
                })
            }
        };

        let entry: SnapshotEntry =
            serde_json::from_slice(&bytes).map_err(|err| CacheError::Read {
                platform: key.to_string(),
                detail: err.to_string(),
            })?;

        if entry.count != entry.movies.len() {
            return Err(CacheError::Read {
                platform: key.to_string(),
                detail: format!(
                    "record count mismatch: header {} vs {} records",
                    entry.count,
                    entry.movies.len()
                ),
            });
        }

        Ok(Some(entry))
    }

    async fn snapshot_paths(&self) -> Result<Vec<PathBuf>, CacheError> {
        let mut reader = match fs::read_dir(&self.root).await {
            Ok(reader) => reader,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CacheError::List {
                    dir: self.root.clone(),
                    source,
                })
            }
        };

        let mut paths = Vec::new();
        while let Some(dir_entry) = reader.next_entry().await.map_err(|source| CacheError::List {
            dir: self.root.clone(),
            source,
        })? {
            let path = dir_entry.path();
            let is_snapshot = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.ends_with(SNAPSHOT_SUFFIX))
                .unwrap_or(false);
            if is_snapshot {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

fn validate_key(key: &str) -> Result<(), CacheError> {
    let ok = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(CacheError::InvalidKey(key.to_string()))
    }
}

fn platform_of(path: &Path) -> String {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_suffix(SNAPSHOT_SUFFIX))
        .unwrap_or_default()
        .to_string()
}

async fn parse_entry_file(path: &Path) -> Result<SnapshotEntry, String> {
    let bytes = fs::read(path).await.map_err(|err| err.to_string())?;
    serde_json::from_slice(&bytes).map_err(|err| err.to_string())
}
