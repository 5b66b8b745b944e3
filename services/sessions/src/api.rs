use crate::blob_store::{extension_for, sanitize_filename};
use crate::config::ApiConfig;
use crate::error::ServiceError;
use crate::export::{csv_export, export_filename, videos_archive};
use crate::service::{SessionInput, SessionService, VideoUpload};
use crate::session_store::{Pagination, Session, SessionStats};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{
        multipart::{Field, MultipartRejection},
        rejection::{JsonRejection, QueryRejection},
        DefaultBodyLimit, Multipart, Path, Query, State,
    },
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::BytesMut;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Multipart field carrying the video file
const VIDEO_FIELD: &str = "video";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: SessionService,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self {
            ServiceError::Validation(_) | ServiceError::InvalidArgument(_) => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        ServiceError::validation(rejection.body_text())
    }
}

impl From<QueryRejection> for ServiceError {
    fn from(rejection: QueryRejection) -> Self {
        ServiceError::validation(rejection.body_text())
    }
}

impl From<MultipartRejection> for ServiceError {
    fn from(rejection: MultipartRejection) -> Self {
        ServiceError::validation(rejection.body_text())
    }
}

/// Query parameters for the device listing
#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    /// Device ID to filter sessions
    pub device_id: String,
    /// Maximum number of sessions to return (clamped to 1..=1000)
    pub limit: Option<i64>,
    /// Number of sessions to skip
    pub skip: Option<i64>,
}

/// Query parameters for CSV export
#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    /// Optional device filter
    pub device_id: Option<String>,
}

/// Response for a successful upload
#[derive(Debug, Serialize, Deserialize)]
pub struct VideoUploadResponse {
    pub message: String,
    pub session_id: Uuid,
    pub video_id: Uuid,
}

/// Response for a successful delete
#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub message: String,
    pub session_id: Uuid,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/export/csv", get(export_sessions_csv))
        .route("/api/sessions/export/videos", get(export_videos_archive))
        .route("/api/sessions/stats", get(session_stats))
        .route(
            "/api/sessions/:session_id",
            get(get_session).delete(delete_session),
        )
        .route(
            "/api/sessions/:session_id/video",
            get(download_video)
                .post(upload_video)
                // Size is enforced while reading the multipart field
                .layer(DefaultBodyLimit::disable()),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(config))
        .with_state(state)
}

fn cors_layer(config: &ApiConfig) -> CorsLayer {
    let any_origin = config.cors_origins.is_empty() || config.cors_origins.iter().any(|o| o == "*");

    if any_origin {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Root endpoint with API information
async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "message": "Welcome to Emo Now API",
        "version": env!("CARGO_PKG_VERSION"),
        "health": "/health",
    }))
}

/// Health check endpoint; always 200, the body reports dependency status
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.health().await)
}

/// Create a new emotion tracking session
#[instrument(skip_all)]
async fn create_session(
    State(state): State<AppState>,
    input: Result<Json<SessionInput>, JsonRejection>,
) -> Result<(StatusCode, Json<Session>), ServiceError> {
    let Json(input) = input?;
    let session = state.service.create_session(input).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// Retrieve one page of a device's sessions, newest first
#[instrument(skip(state))]
async fn list_sessions(
    State(state): State<AppState>,
    params: Result<Query<ListSessionsQuery>, QueryRejection>,
) -> Result<Json<Vec<Session>>, ServiceError> {
    let Query(params) = params?;
    let page = Pagination::new(params.limit, params.skip);
    let sessions = state.service.list_by_device(&params.device_id, page).await?;
    Ok(Json(sessions))
}

/// Retrieve a specific session by ID
#[instrument(skip(state))]
async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Session>, ServiceError> {
    Ok(Json(state.service.get_session(&session_id).await?))
}

/// Upload a video for an existing session (multipart field `video`)
#[instrument(skip(state, multipart))]
async fn upload_video(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<VideoUploadResponse>, ServiceError> {
    // Reject unknown sessions before reading the body
    state.service.get_session(&session_id).await?;
    let mut multipart = multipart?;

    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServiceError::validation(format!("Invalid multipart body: {}", e.body_text())))?
    {
        if field.name() == Some(VIDEO_FIELD) {
            upload = Some(read_video_field(&state.service, field).await?);
            break;
        }
    }

    let upload = upload.ok_or_else(|| ServiceError::validation("Missing video file field"))?;
    let attached = state.service.attach_video(&session_id, upload).await?;

    Ok(Json(VideoUploadResponse {
        message: "Video uploaded successfully".to_string(),
        session_id: attached.session_id,
        video_id: attached.video_id,
    }))
}

/// Read a video field, failing as soon as the size limit is exceeded
async fn read_video_field(
    service: &SessionService,
    mut field: Field<'_>,
) -> Result<VideoUpload, ServiceError> {
    let policy = service.policy();
    let content_type = field.content_type().unwrap_or_default().to_string();
    policy.check_content_type(&content_type)?;

    let filename = field.file_name().map(str::to_string);
    let mut data = BytesMut::new();

    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| ServiceError::validation(format!("Failed to read upload: {}", e.body_text())))?
    {
        policy.check_size(data.len() + chunk.len())?;
        data.extend_from_slice(&chunk);
    }

    Ok(VideoUpload {
        data: data.freeze(),
        filename,
        content_type,
    })
}

/// Stream the video attached to a session
#[instrument(skip(state))]
async fn download_video(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Response, ServiceError> {
    let video = state.service.download_video(&session_id).await?;

    let filename = video
        .filename
        .clone()
        .unwrap_or_else(|| format!("{}.{}", video.id, extension_for(&video.content_type)));

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, video.content_type.as_str())
        .header(header::CONTENT_DISPOSITION, attachment(&filename));

    if let Some(size) = video.size {
        response = response.header(header::CONTENT_LENGTH, size);
    }

    response
        .body(Body::from_stream(video.body))
        .map_err(|e| ServiceError::internal(format!("Failed to build response: {e}")))
}

/// Export sessions as CSV, optionally filtered by device
#[instrument(skip(state))]
async fn export_sessions_csv(
    State(state): State<AppState>,
    params: Result<Query<ExportQuery>, QueryRejection>,
) -> Result<Response, ServiceError> {
    let Query(params) = params?;
    let device_id = params.device_id.filter(|d| !d.is_empty());
    let body = Body::from_stream(csv_export(state.service.session_store(), device_id));

    streamed_attachment(
        "text/csv",
        &export_filename("emo_sessions", "csv", Utc::now()),
        body,
    )
}

/// Download every attached video as one ZIP archive
#[instrument(skip(state))]
async fn export_videos_archive(State(state): State<AppState>) -> Result<Response, ServiceError> {
    let body = Body::from_stream(videos_archive(
        state.service.session_store(),
        state.service.blob_store(),
    ));

    streamed_attachment(
        "application/zip",
        &export_filename("videos", "zip", Utc::now()),
        body,
    )
}

/// Summary numbers over all sessions
async fn session_stats(State(state): State<AppState>) -> Result<Json<SessionStats>, ServiceError> {
    Ok(Json(state.service.stats().await?))
}

/// Delete a session and its associated video
#[instrument(skip(state))]
async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<DeleteResponse>, ServiceError> {
    let session_id = state.service.delete_session(&session_id).await?;

    Ok(Json(DeleteResponse {
        message: "Session deleted successfully".to_string(),
        session_id,
    }))
}

fn streamed_attachment(content_type: &str, filename: &str, body: Body) -> Result<Response, ServiceError> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_DISPOSITION, attachment(filename))
        .body(body)
        .map_err(|e| ServiceError::internal(format!("Failed to build response: {e}")))
}

/// `Content-Disposition` value with an ASCII-only file name
fn attachment(filename: &str) -> String {
    let ascii: String = sanitize_filename(filename)
        .chars()
        .map(|c| if c.is_ascii() { c } else { '_' })
        .collect();
    format!("attachment; filename=\"{}\"", ascii)
}

/// Start the HTTP API server, serving until `shutdown` resolves
pub async fn start_api_server<F>(state: AppState, config: &ApiConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting session API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    warn!("API server stopped");
    Ok(())
}
