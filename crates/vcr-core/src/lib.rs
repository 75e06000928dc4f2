//! Core domain model shared across the VCR crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

pub const CRATE_NAME: &str = "vcr-core";

/// One catalog item as produced by a record source.
///
/// The subsystem only interprets the external identifier; everything else is
/// carried as an opaque payload and passed through to the datastore untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    #[serde(rename = "id")]
    pub external_id: i64,
    #[serde(flatten)]
    pub payload: Map<String, JsonValue>,
}

impl CatalogRecord {
    pub fn new(external_id: i64) -> Self {
        Self {
            external_id,
            payload: Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: JsonValue) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }

    /// Convenience accessor for the record title, when the payload carries one.
    pub fn title(&self) -> Option<&str> {
        self.payload.get("title").and_then(JsonValue::as_str)
    }
}

/// Link between a record and the platform through which it is available,
/// carrying the availability marker reconciliation keys on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformAssociation {
    pub id: Uuid,
    pub platform: String,
    pub record_id: Uuid,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Per-batch reconciliation counts for one platform.
///
/// `failed` counts records whose store operation could not complete; they are
/// reported rather than silently folded into `skipped`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub platform: String,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl SyncReport {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            ..Self::default()
        }
    }

    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.skipped + self.failed
    }
}

/// Outcome of refreshing a single platform within a run.
#[derive(Debug, Clone, Serialize)]
pub struct PlatformRefreshSummary {
    pub platform: String,
    pub cache_hit: bool,
    pub record_count: usize,
    pub sync: SyncReport,
}

/// Run-level summary across all enabled platforms.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub platforms: Vec<PlatformRefreshSummary>,
    pub failed_platforms: Vec<String>,
}

impl RefreshRunSummary {
    pub fn inserted_total(&self) -> usize {
        self.platforms.iter().map(|p| p.sync.inserted).sum()
    }

    pub fn updated_total(&self) -> usize {
        self.platforms.iter().map(|p| p.sync.updated).sum()
    }
}
