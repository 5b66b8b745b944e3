//! Emo Now Session Service
//!
//! Backend for the Emo Now emotion-tracking app. Devices record how they feel
//! on a 1-5 scale, optionally with a location and a short video. This service
//! stores the session records in PostgreSQL, keeps the videos in an
//! S3-compatible bucket and serves both over an HTTP API.
//!
//! ## Features
//!
//! - **Session Records**: create, fetch, list per device (newest first, paged)
//!   and delete emotion sessions
//! - **Video Attachments**: upload one video per session with type and size
//!   checks, stream it back, replace it; old blobs are cleaned up
//! - **Exports**: streaming CSV of all sessions and a ZIP archive of all videos
//! - **Retention**: periodic sweep removing sessions (and their videos) older
//!   than the configured window
//!
//! ## Architecture
//!
//! ```text
//!  HTTP API (axum)
//! ┌──────────────┐
//! │ api          │
//! └──────────────┘
//!        │
//!        ▼
//! ┌──────────────┐          ┌──────────────┐       PostgreSQL
//! │ Session      │─────────▶│ SessionStore │──────▶ sessions
//! │ Service      │          └──────────────┘
//! └──────────────┘          ┌──────────────┐       S3 Bucket
//!        │        ─────────▶│ BlobStore    │──────▶ videos/{id}
//!        │                  └──────────────┘
//!        ▼                         ▲
//! ┌──────────────┐                 │
//! │ Retention    │─────────────────┘
//! │ Sweeper      │
//! └──────────────┘
//! ```

pub mod api;
pub mod blob_store;
pub mod config;
pub mod error;
pub mod export;
pub mod memory;
pub mod retention;
pub mod service;
pub mod session_store;

pub use api::{create_router, AppState};
pub use blob_store::{BlobError, BlobMetadata, BlobObject, BlobStore, S3BlobStore};
pub use config::Config;
pub use error::ServiceError;
pub use memory::{MemoryBlobStore, MemorySessionStore};
pub use retention::{RetentionSweeper, SweepReport};
pub use service::{SessionInput, SessionService, UploadPolicy, VideoUpload};
pub use session_store::{
    NewSession, Pagination, PgSessionStore, Session, SessionStats, SessionStore, StoreError,
};
