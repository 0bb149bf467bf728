/*!
SQLite-backed job store.

Stores each job as one row: the full record serialized through the
persistence models into a JSON payload, plus a denormalized status column so
startup recovery can filter to non-terminal jobs without deserializing every
row.

When the `sqlite-migrations` feature is enabled (default), embedded
migrations (`sqlx::migrate!("./migrations")`) are executed on connect;
disabling the feature assumes external migration orchestration.
*/

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use crate::job::{JobId, JobRecord};

use super::persistence::PersistedJob;
use super::store::{JobStore, Result, StoreError};

/// Durable SQLite store. One row per job, replaced wholesale on save.
pub struct SqliteJobStore {
    pool: Arc<SqlitePool>,
}

impl std::fmt::Debug for SqliteJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteJobStore").finish()
    }
}

impl SqliteJobStore {
    /// Connect (or create) a SQLite database at `database_url`.
    /// Example URL: `sqlite://duraflow.db?mode=rwc`
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| StoreError::Backend(format!("connect error: {e}")))?;
        #[cfg(feature = "sqlite-migrations")]
        {
            if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
                return Err(StoreError::Backend(format!("migration failure: {e}")));
            }
        }
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Connect using `DATABASE_URL` from the environment (or a `.env` file),
    /// defaulting to a local `duraflow.db`.
    pub async fn connect_from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://duraflow.db?mode=rwc".to_string());
        Self::connect(&url).await
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, record), fields(job = %record.job_id), err)]
    async fn save(&self, record: &JobRecord) -> Result<()> {
        let persisted = PersistedJob::from(record);
        let payload = persisted.to_json_string()?;
        let status = record.job_status().label();
        sqlx::query(
            r#"
            INSERT INTO jobs (id, status, payload, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(record.job_id.to_string())
        .bind(status)
        .bind(payload)
        .bind(record.updated_at.to_rfc3339())
        .execute(&*self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("save: {e}")))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn load(&self, job_id: JobId) -> Result<JobRecord> {
        let row = sqlx::query("SELECT payload FROM jobs WHERE id = ?1")
            .bind(job_id.to_string())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("load: {e}")))?
            .ok_or(StoreError::NotFound(job_id))?;
        let payload: String = row
            .try_get("payload")
            .map_err(|e| StoreError::Backend(format!("load column: {e}")))?;
        let persisted = PersistedJob::from_json_str(&payload)?;
        Ok(JobRecord::try_from(persisted)?)
    }

    #[instrument(skip(self), err)]
    async fn list_due(&self) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query("SELECT payload FROM jobs WHERE status = 'running' ORDER BY updated_at")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("list_due: {e}")))?;
        let mut due = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row
                .try_get("payload")
                .map_err(|e| StoreError::Backend(format!("list_due column: {e}")))?;
            let persisted = PersistedJob::from_json_str(&payload)?;
            due.push(JobRecord::try_from(persisted)?);
        }
        Ok(due)
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, job_id: JobId) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(job_id.to_string())
            .execute(&*self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("delete: {e}")))?;
        Ok(())
    }
}
