//! Authoritative catalog datastore collaborator: trait + Postgres and
//! in-memory implementations.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;
use vcr_core::{CatalogRecord, PlatformAssociation};

pub const CRATE_NAME: &str = "vcr-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database operation failed")]
    Database(#[from] sqlx::Error),
    #[error("association {0} not found")]
    AssociationNotFound(Uuid),
    #[error("{0}")]
    Backend(String),
}

/// Lookup/insert/update surface the reconciler drives. The store owns its own
/// transactional guarantees per call; the reconciler never batches calls into
/// one transaction.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Association for `external_id` as seen through `platform`, if any.
    async fn find_association(
        &self,
        platform: &str,
        external_id: i64,
    ) -> Result<Option<PlatformAssociation>, StoreError>;

    /// Insert the record, or refresh its payload when the external id is
    /// already known. Returns the canonical record id either way.
    async fn insert_record(&self, record: &CatalogRecord) -> Result<Uuid, StoreError>;

    /// Create the platform link for a record, availability marker set to now.
    async fn insert_association(
        &self,
        platform: &str,
        record_id: Uuid,
    ) -> Result<Uuid, StoreError>;

    /// Refresh the availability marker of an existing association.
    async fn touch_association(
        &self,
        association_id: Uuid,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Postgres-backed catalog store.
#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS catalog_records (
                id UUID PRIMARY KEY,
                external_id BIGINT NOT NULL UNIQUE,
                payload JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS platform_associations (
                id UUID PRIMARY KEY,
                platform TEXT NOT NULL,
                record_id UUID NOT NULL REFERENCES catalog_records(id),
                last_seen_at TIMESTAMPTZ,
                UNIQUE (platform, record_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn find_association(
        &self,
        platform: &str,
        external_id: i64,
    ) -> Result<Option<PlatformAssociation>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT a.id, a.platform, a.record_id, a.last_seen_at
            FROM platform_associations a
            JOIN catalog_records r ON r.id = a.record_id
            WHERE a.platform = $1 AND r.external_id = $2
            "#,
        )
        .bind(platform)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| PlatformAssociation {
            id: row.get("id"),
            platform: row.get("platform"),
            record_id: row.get("record_id"),
            last_seen_at: row.get("last_seen_at"),
        }))
    }

    async fn insert_record(&self, record: &CatalogRecord) -> Result<Uuid, StoreError> {
        let payload = serde_json::Value::Object(record.payload.clone());
        let row = sqlx::query(
            r#"
            INSERT INTO catalog_records (id, external_id, payload, created_at, updated_at)
            VALUES ($1, $2, $3, now(), now())
            ON CONFLICT (external_id)
            DO UPDATE SET payload = EXCLUDED.payload, updated_at = now()
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(record.external_id)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("id"))
    }

    async fn insert_association(
        &self,
        platform: &str,
        record_id: Uuid,
    ) -> Result<Uuid, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO platform_associations (id, platform, record_id, last_seen_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (platform, record_id)
            DO UPDATE SET last_seen_at = now()
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(platform)
        .bind(record_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("id"))
    }

    async fn touch_association(
        &self,
        association_id: Uuid,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE platform_associations SET last_seen_at = $2 WHERE id = $1",
        )
        .bind(association_id)
        .bind(seen_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AssociationNotFound(association_id));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    // external_id -> (record id, payload)
    records: HashMap<i64, (Uuid, CatalogRecord)>,
    associations: HashMap<Uuid, PlatformAssociation>,
}

/// In-memory catalog store for fixture-mode runs and tests.
#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_count(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    pub async fn association_count(&self) -> usize {
        self.inner.lock().await.associations.len()
    }

    pub async fn association_for(
        &self,
        platform: &str,
        external_id: i64,
    ) -> Option<PlatformAssociation> {
        let inner = self.inner.lock().await;
        let (record_id, _) = inner.records.get(&external_id)?;
        inner
            .associations
            .values()
            .find(|a| a.platform == platform && a.record_id == *record_id)
            .cloned()
    }

    /// Back-date an association's availability marker; test hook for
    /// staleness scenarios.
    pub async fn set_last_seen(&self, association_id: Uuid, seen_at: Option<DateTime<Utc>>) {
        let mut inner = self.inner.lock().await;
        if let Some(assoc) = inner.associations.get_mut(&association_id) {
            assoc.last_seen_at = seen_at;
        }
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn find_association(
        &self,
        platform: &str,
        external_id: i64,
    ) -> Result<Option<PlatformAssociation>, StoreError> {
        Ok(self.association_for(platform, external_id).await)
    }

    async fn insert_record(&self, record: &CatalogRecord) -> Result<Uuid, StoreError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .records
            .entry(record.external_id)
            .or_insert_with(|| (Uuid::new_v4(), record.clone()));
        entry.1 = record.clone();
        Ok(entry.0)
    }

    async fn insert_association(
        &self,
        platform: &str,
        record_id: Uuid,
    ) -> Result<Uuid, StoreError> {
        let mut inner = self.inner.lock().await;
        let existing = inner
            .associations
            .values()
            .find(|a| a.platform == platform && a.record_id == record_id)
            .map(|a| a.id);
        if let Some(id) = existing {
            if let Some(assoc) = inner.associations.get_mut(&id) {
                assoc.last_seen_at = Some(Utc::now());
            }
            return Ok(id);
        }

        let assoc = PlatformAssociation {
            id: Uuid::new_v4(),
            platform: platform.to_string(),
            record_id,
            last_seen_at: Some(Utc::now()),
        };
        let id = assoc.id;
        inner.associations.insert(id, assoc);
        Ok(id)
    }

    async fn touch_association(
        &self,
        association_id: Uuid,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.associations.get_mut(&association_id) {
            Some(assoc) => {
                assoc.last_seen_at = Some(seen_at);
                Ok(())
            }
            None => Err(StoreError::AssociationNotFound(association_id)),
        }
    }
}
