use crate::config::DatabaseConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Default page size for device listings
pub const DEFAULT_LIMIT: i64 = 100;
/// Largest page size a caller may request
pub const MAX_LIMIT: i64 = 1000;

/// Errors returned by session store backends
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Session {0} not found")]
    NotFound(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Stored emotion tracking session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Session {
    /// Unique session ID
    pub id: Uuid,
    /// Originating device
    pub device_id: String,
    /// Emotion score, 1 (very negative) to 5 (very positive)
    pub emotion_score: i16,
    /// GPS latitude
    pub latitude: Option<f64>,
    /// GPS longitude
    pub longitude: Option<f64>,
    /// Client supplied ISO-8601 event time, stored verbatim
    pub timestamp: String,
    /// Attached video in the blob store
    pub video_id: Option<Uuid>,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// When the record was last modified
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn has_video(&self) -> bool {
        self.video_id.is_some()
    }
}

/// Session fields supplied by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSession {
    pub device_id: String,
    pub emotion_score: i16,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    pub timestamp: String,
}

/// Offset pagination for device listings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub limit: i64,
    pub skip: i64,
}

impl Pagination {
    /// Build a page request, clamping `limit` into `[1, MAX_LIMIT]` and `skip` to `>= 0`
    pub fn new(limit: Option<i64>, skip: Option<i64>) -> Self {
        Self {
            limit: limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT),
            skip: skip.unwrap_or(0).max(0),
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// Summary numbers over all stored sessions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct SessionStats {
    pub total_sessions: i64,
    pub device_count: i64,
    pub sessions_with_video: i64,
}

/// Record store for sessions.
///
/// Listings are ordered by `timestamp` descending. `expire_created_before` is the
/// retention primitive used by the background sweeper, so backends without a
/// native TTL still expire old records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session, assigning its id and timestamps
    async fn insert(&self, session: NewSession) -> Result<Session, StoreError>;

    /// Point lookup by id
    async fn find_by_id(&self, id: Uuid) -> Result<Session, StoreError>;

    /// One page of a device's sessions, newest event first
    async fn find_by_device(
        &self,
        device_id: &str,
        page: Pagination,
    ) -> Result<Vec<Session>, StoreError>;

    /// Every session (optionally for one device), newest event first
    fn stream_all<'a>(
        &'a self,
        device_id: Option<&'a str>,
    ) -> BoxStream<'a, Result<Session, StoreError>>;

    /// Point the session at a new video and refresh `updated_at`
    async fn update_video_reference(
        &self,
        id: Uuid,
        video_id: Uuid,
    ) -> Result<Session, StoreError>;

    /// Remove a session record
    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;

    /// Remove and return every session created before `cutoff`
    async fn expire_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Session>, StoreError>;

    /// Aggregate counts for the stats endpoint
    async fn stats(&self) -> Result<SessionStats, StoreError>;

    /// Connectivity probe for health checks
    async fn ping(&self) -> Result<(), StoreError>;
}

const SESSION_COLUMNS: &str = "id, device_id, emotion_score, latitude, longitude, \
                               timestamp, video_id, created_at, updated_at";

/// PostgreSQL-backed session store
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    /// Create a new session store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Close the pool, waiting for checked-out connections
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    #[instrument(skip(self, session), fields(device_id = %session.device_id))]
    async fn insert(&self, session: NewSession) -> Result<Session, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO sessions (
                id, device_id, emotion_score, latitude, longitude,
                timestamp, video_id, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, NULL, NOW(), NOW()
            )
            RETURNING {SESSION_COLUMNS}
            "#
        );

        let stored = sqlx::query_as::<_, Session>(&sql)
            .bind(Uuid::new_v4())
            .bind(&session.device_id)
            .bind(session.emotion_score)
            .bind(session.latitude)
            .bind(session.longitude)
            .bind(&session.timestamp)
            .fetch_one(&self.pool)
            .await?;

        debug!(session_id = %stored.id, "Session inserted");

        Ok(stored)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Session, StoreError> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1");

        sqlx::query_as::<_, Session>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))
    }

    #[instrument(skip(self))]
    async fn find_by_device(
        &self,
        device_id: &str,
        page: Pagination,
    ) -> Result<Vec<Session>, StoreError> {
        let sql = format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM sessions
            WHERE device_id = $1
            ORDER BY timestamp DESC, created_at DESC, id
            LIMIT $2 OFFSET $3
            "#
        );

        let sessions = sqlx::query_as::<_, Session>(&sql)
            .bind(device_id)
            .bind(page.limit)
            .bind(page.skip)
            .fetch_all(&self.pool)
            .await?;

        Ok(sessions)
    }

    fn stream_all<'a>(
        &'a self,
        device_id: Option<&'a str>,
    ) -> BoxStream<'a, Result<Session, StoreError>> {
        const SQL: &str = r#"
            SELECT id, device_id, emotion_score, latitude, longitude,
                   timestamp, video_id, created_at, updated_at
            FROM sessions
            WHERE ($1::text IS NULL OR device_id = $1)
            ORDER BY timestamp DESC, created_at DESC, id
            "#;

        sqlx::query_as::<_, Session>(SQL)
            .bind(device_id)
            .fetch(&self.pool)
            .map(|row| row.map_err(StoreError::from))
            .boxed()
    }

    #[instrument(skip(self))]
    async fn update_video_reference(
        &self,
        id: Uuid,
        video_id: Uuid,
    ) -> Result<Session, StoreError> {
        let sql = format!(
            r#"
            UPDATE sessions
            SET video_id = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING {SESSION_COLUMNS}
            "#
        );

        sqlx::query_as::<_, Session>(&sql)
            .bind(id)
            .bind(video_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }

        Ok(())
    }

    #[instrument(skip(self))]
    async fn expire_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Session>, StoreError> {
        let sql = format!(
            "DELETE FROM sessions WHERE created_at < $1 RETURNING {SESSION_COLUMNS}"
        );

        let expired = sqlx::query_as::<_, Session>(&sql)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;

        info!(deleted_count = expired.len(), before = %cutoff, "Expired old sessions");

        Ok(expired)
    }

    async fn stats(&self) -> Result<SessionStats, StoreError> {
        let stats = sqlx::query_as::<_, SessionStats>(
            r#"
            SELECT
                COUNT(*) AS total_sessions,
                COUNT(DISTINCT device_id) AS device_count,
                COUNT(video_id) AS sessions_with_video
            FROM sessions
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(stats)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
