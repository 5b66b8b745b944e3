//! Session lifecycle orchestration.
//!
//! `SessionService` owns the rules that span both stores: input validation,
//! linking uploaded videos to sessions, and cascading deletes. The session
//! record is authoritative; blob cleanup is best-effort and never blocks a
//! metadata change.

use crate::blob_store::{BlobError, BlobMetadata, BlobObject, BlobStore};
use crate::config::UploadConfig;
use crate::error::ServiceError;
use crate::session_store::{NewSession, Pagination, Session, SessionStats, SessionStore};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub const MIN_EMOTION_SCORE: i64 = 1;
pub const MAX_EMOTION_SCORE: i64 = 5;

/// Client request to record a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInput {
    /// Unique device identifier
    pub device_id: String,
    /// Emotion score from 1 (very negative) to 5 (very positive)
    pub emotion_score: i64,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    /// ISO-8601 time of the emotional event
    pub timestamp: String,
}

/// Video payload as received from the client
#[derive(Debug, Clone)]
pub struct VideoUpload {
    pub data: Bytes,
    pub filename: Option<String>,
    pub content_type: String,
}

/// Result of a successful video attach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AttachedVideo {
    pub session_id: Uuid,
    pub video_id: Uuid,
}

/// Size and type limits for uploaded videos
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub max_video_size: usize,
    pub allowed_content_types: Vec<String>,
}

impl UploadPolicy {
    pub fn check_content_type(&self, content_type: &str) -> Result<(), ServiceError> {
        if self
            .allowed_content_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(content_type))
        {
            return Ok(());
        }

        Err(ServiceError::validation(format!(
            "Invalid file type. Allowed types: {}",
            self.allowed_content_types.join(", ")
        )))
    }

    pub fn check_size(&self, size: usize) -> Result<(), ServiceError> {
        if size > self.max_video_size {
            return Err(ServiceError::validation(format!(
                "File too large. Maximum size: {:.0}MB",
                self.max_video_size as f64 / (1024.0 * 1024.0)
            )));
        }
        Ok(())
    }
}

impl From<&UploadConfig> for UploadPolicy {
    fn from(config: &UploadConfig) -> Self {
        Self {
            max_video_size: config.max_video_size,
            allowed_content_types: config.allowed_content_types.clone(),
        }
    }
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self::from(&UploadConfig::default())
    }
}

/// Connectivity of the service's dependencies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub services: ServiceHealth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub api: String,
    pub database: String,
    pub blob_store: String,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// Parse a client supplied session id
pub fn parse_session_id(raw: &str) -> Result<Uuid, ServiceError> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| ServiceError::InvalidArgument("Invalid session ID".to_string()))
}

/// Orchestrates the session store and the blob store
#[derive(Clone)]
pub struct SessionService {
    sessions: Arc<dyn SessionStore>,
    blobs: Arc<dyn BlobStore>,
    policy: UploadPolicy,
}

impl SessionService {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        blobs: Arc<dyn BlobStore>,
        policy: UploadPolicy,
    ) -> Self {
        Self {
            sessions,
            blobs,
            policy,
        }
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    pub fn session_store(&self) -> Arc<dyn SessionStore> {
        self.sessions.clone()
    }

    pub fn blob_store(&self) -> Arc<dyn BlobStore> {
        self.blobs.clone()
    }

    /// Record a new session. The score is the only validated field.
    #[instrument(skip(self, input), fields(device_id = %input.device_id))]
    pub async fn create_session(&self, input: SessionInput) -> Result<Session, ServiceError> {
        if !(MIN_EMOTION_SCORE..=MAX_EMOTION_SCORE).contains(&input.emotion_score) {
            return Err(ServiceError::validation(format!(
                "emotion_score must be between {} and {}",
                MIN_EMOTION_SCORE, MAX_EMOTION_SCORE
            )));
        }

        let session = self
            .sessions
            .insert(NewSession {
                device_id: input.device_id,
                // Range checked above
                emotion_score: input.emotion_score as i16,
                latitude: input.latitude,
                longitude: input.longitude,
                timestamp: input.timestamp,
            })
            .await?;

        metrics::counter!("sessions.created").increment(1);
        info!(session_id = %session.id, "Session created");

        Ok(session)
    }

    /// Store a video and link it to an existing session.
    ///
    /// A previous video is deleted only after the session points at the new one,
    /// so the session never references a missing blob. If the session vanishes
    /// before the reference is written, the new blob is removed again.
    #[instrument(skip(self, upload), fields(size_bytes = upload.data.len(), content_type = %upload.content_type))]
    pub async fn attach_video(
        &self,
        session_id: &str,
        upload: VideoUpload,
    ) -> Result<AttachedVideo, ServiceError> {
        let id = parse_session_id(session_id)?;
        let session = self.sessions.find_by_id(id).await?;

        self.policy.check_content_type(&upload.content_type)?;
        self.policy.check_size(upload.data.len())?;

        let size = upload.data.len();
        let metadata = BlobMetadata {
            filename: upload.filename,
            content_type: upload.content_type,
            session_id: id,
            uploaded_at: Utc::now(),
        };

        let video_id = self.blobs.put(upload.data, metadata).await?;

        if let Err(e) = self.sessions.update_video_reference(id, video_id).await {
            warn!(session_id = %id, video_id = %video_id, "Session disappeared during upload");
            self.discard_blob(video_id).await;
            return Err(e.into());
        }

        if let Some(previous) = session.video_id.filter(|prev| *prev != video_id) {
            debug!(session_id = %id, previous_video_id = %previous, "Replacing video");
            self.discard_blob(previous).await;
        }

        metrics::counter!("videos.uploaded").increment(1);
        metrics::counter!("videos.bytes_uploaded").increment(size as u64);
        info!(session_id = %id, video_id = %video_id, size_bytes = size, "Video attached");

        Ok(AttachedVideo {
            session_id: id,
            video_id,
        })
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session, ServiceError> {
        let id = parse_session_id(session_id)?;
        Ok(self.sessions.find_by_id(id).await?)
    }

    #[instrument(skip(self))]
    pub async fn list_by_device(
        &self,
        device_id: &str,
        page: Pagination,
    ) -> Result<Vec<Session>, ServiceError> {
        Ok(self.sessions.find_by_device(device_id, page).await?)
    }

    /// Open the session's video for streaming
    #[instrument(skip(self))]
    pub async fn download_video(&self, session_id: &str) -> Result<BlobObject, ServiceError> {
        let session = self.get_session(session_id).await?;

        let video_id = session
            .video_id
            .ok_or_else(|| ServiceError::not_found("No video found for this session"))?;

        Ok(self.blobs.get(video_id).await?)
    }

    /// Delete a session and, best-effort, its video
    #[instrument(skip(self))]
    pub async fn delete_session(&self, session_id: &str) -> Result<Uuid, ServiceError> {
        let id = parse_session_id(session_id)?;
        let session = self.sessions.find_by_id(id).await?;

        if let Some(video_id) = session.video_id {
            self.discard_blob(video_id).await;
        }

        self.sessions.delete(id).await?;

        metrics::counter!("sessions.deleted").increment(1);
        info!(session_id = %id, "Session deleted");

        Ok(id)
    }

    pub async fn stats(&self) -> Result<SessionStats, ServiceError> {
        Ok(self.sessions.stats().await?)
    }

    /// Probe both stores. Never fails; outages are reported in the report.
    pub async fn health(&self) -> HealthReport {
        let database = match self.sessions.ping().await {
            Ok(()) => "connected".to_string(),
            Err(e) => format!("disconnected: {e}"),
        };
        let blob_store = match self.blobs.ping().await {
            Ok(()) => "operational".to_string(),
            Err(e) => format!("unavailable: {e}"),
        };

        let healthy = database == "connected" && blob_store == "operational";

        HealthReport {
            status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
            timestamp: Utc::now(),
            services: ServiceHealth {
                api: "operational".to_string(),
                database,
                blob_store,
            },
        }
    }

    /// Delete a blob, logging instead of failing
    async fn discard_blob(&self, video_id: Uuid) {
        discard_blob(self.blobs.as_ref(), video_id).await;
    }
}

/// Best-effort blob removal shared by deletes, re-uploads and retention sweeps.
/// Returns whether the blob is gone afterwards.
pub(crate) async fn discard_blob(blobs: &dyn BlobStore, video_id: Uuid) -> bool {
    match blobs.delete(video_id).await {
        Ok(()) => {
            metrics::counter!("videos.deleted").increment(1);
            true
        }
        Err(BlobError::NotFound(_)) => {
            warn!(video_id = %video_id, "Video already missing from storage");
            true
        }
        Err(e) => {
            metrics::counter!("videos.delete_failed").increment(1);
            warn!(video_id = %video_id, error = %e, "Failed to delete video");
            false
        }
    }
}
