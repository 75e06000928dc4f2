//! Record source contract + fixture-first source implementation.
//!
//! How a platform's records are actually obtained (browser automation, HTML
//! parsing, a vendor API) lives behind [`RecordSource`]; this crate only ships
//! the fixture-backed adapter used for local runs and tests.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tracing::info;
use vcr_core::CatalogRecord;

pub const CRATE_NAME: &str = "vcr-sources";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no fixture for platform {0:?}")]
    UnknownPlatform(String),
    #[error("reading fixture {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing fixture {path}: {detail}")]
    Parse { path: PathBuf, detail: String },
    #[error("{0}")]
    Message(String),
}

/// Produces one batch of records for a platform key.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch(&self, platform: &str) -> Result<Vec<CatalogRecord>, SourceError>;
}

/// Reads `fixtures/<platform>.json` — a plain JSON array of records.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    fixtures_dir: PathBuf,
}

impl FixtureSource {
    pub fn new(fixtures_dir: impl Into<PathBuf>) -> Self {
        Self {
            fixtures_dir: fixtures_dir.into(),
        }
    }

    pub fn fixtures_dir(&self) -> &Path {
        &self.fixtures_dir
    }

    fn fixture_path(&self, platform: &str) -> PathBuf {
        self.fixtures_dir.join(format!("{platform}.json"))
    }
}

#[async_trait]
impl RecordSource for FixtureSource {
    async fn fetch(&self, platform: &str) -> Result<Vec<CatalogRecord>, SourceError> {
        let path = self.fixture_path(platform);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(SourceError::UnknownPlatform(platform.to_string()))
            }
            Err(source) => return Err(SourceError::Io { path, source }),
        };

        let records: Vec<CatalogRecord> =
            serde_json::from_slice(&bytes).map_err(|err| SourceError::Parse {
                path: path.clone(),
                detail: err.to_string(),
            })?;

        info!(platform, records = records.len(), "fixture batch loaded");
        Ok(records)
    }
}
