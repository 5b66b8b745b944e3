use crate::blob_store::BlobStore;
use crate::service::discard_blob;
use crate::session_store::{SessionStore, StoreError};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};

/// Result of one retention sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_sessions: usize,
    pub deleted_videos: usize,
    pub failed_videos: usize,
}

/// Periodic scan-and-delete of sessions older than the retention window.
///
/// Expired sessions' videos are removed as well, so expiry does not leave
/// orphaned blobs behind.
pub struct RetentionSweeper {
    sessions: Arc<dyn SessionStore>,
    blobs: Arc<dyn BlobStore>,
    window: ChronoDuration,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        blobs: Arc<dyn BlobStore>,
        window: ChronoDuration,
        interval: Duration,
    ) -> Self {
        Self {
            sessions,
            blobs,
            window,
            interval,
        }
    }

    /// Expire everything created before `now - window`
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<SweepReport, StoreError> {
        let cutoff = Utc::now() - self.window;
        let expired = self.sessions.expire_created_before(cutoff).await?;

        let mut report = SweepReport {
            expired_sessions: expired.len(),
            ..Default::default()
        };

        for video_id in expired.iter().filter_map(|s| s.video_id) {
            if discard_blob(self.blobs.as_ref(), video_id).await {
                report.deleted_videos += 1;
            } else {
                report.failed_videos += 1;
            }
        }

        metrics::counter!("sessions.expired").increment(report.expired_sessions as u64);

        Ok(report)
    }

    /// Run sweeps on a fixed interval until the task is aborted
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                retention_days = self.window.num_days(),
                interval_secs = self.interval.as_secs(),
                "Retention sweeper started"
            );

            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                match self.sweep_once().await {
                    Ok(report) if report.expired_sessions > 0 => {
                        info!(
                            expired_sessions = report.expired_sessions,
                            deleted_videos = report.deleted_videos,
                            failed_videos = report.failed_videos,
                            "Retention sweep completed"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Retention sweep failed"),
                }
            }
        })
    }
}
