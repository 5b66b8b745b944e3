//! Streaming exports.
//!
//! Both exports run in a spawned task that feeds a bounded pipe, so the
//! response body is produced while the store is still being read and memory use
//! does not grow with the number of sessions or the size of the videos.

use crate::blob_store::{extension_for, sanitize_filename, BlobStore};
use crate::session_store::{Session, SessionStore};
use anyhow::{Context, Result};
use async_zip::tokio::write::ZipFileWriter;
use async_zip::{Compression, ZipEntryBuilder};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::io::AsyncWriteExt;
use futures::stream::{Stream, StreamExt};
use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, instrument, warn};

/// Rows buffered between the store reader and the HTTP body
const CSV_CHANNEL_CAPACITY: usize = 64;
/// Bytes buffered between the archive writer and the HTTP body
const ARCHIVE_PIPE_CAPACITY: usize = 256 * 1024;

pub const CSV_HEADER: [&str; 8] = [
    "session_id",
    "device_id",
    "emotion_score",
    "latitude",
    "longitude",
    "timestamp",
    "has_video",
    "created_at",
];

/// Attachment name for an export, e.g. `emo_sessions_20240101_120000.csv`
pub fn export_filename(prefix: &str, extension: &str, now: DateTime<Utc>) -> String {
    format!("{}_{}.{}", prefix, now.format("%Y%m%d_%H%M%S"), extension)
}

fn encode_record<I, T>(record: I) -> Result<Bytes, csv::Error>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(record)?;
    let buffer = writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))?;
    Ok(Bytes::from(buffer))
}

/// CSV header line
pub fn csv_header() -> Result<Bytes, csv::Error> {
    encode_record(CSV_HEADER)
}

/// One CSV line for a session. Missing coordinates are left empty.
pub fn csv_row(session: &Session) -> Result<Bytes, csv::Error> {
    let optional = |value: Option<f64>| value.map(|v| v.to_string()).unwrap_or_default();

    encode_record([
        session.id.to_string(),
        session.device_id.clone(),
        session.emotion_score.to_string(),
        optional(session.latitude),
        optional(session.longitude),
        session.timestamp.clone(),
        if session.has_video() { "yes" } else { "no" }.to_string(),
        session.created_at.to_rfc3339(),
    ])
}

/// Stream every matching session as CSV, newest event first
pub fn csv_export(
    sessions: Arc<dyn SessionStore>,
    device_id: Option<String>,
) -> impl Stream<Item = io::Result<Bytes>> {
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(CSV_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let header = csv_header().map_err(io::Error::from);
        if tx.send(header).await.is_err() {
            return;
        }

        let mut rows = sessions.stream_all(device_id.as_deref());
        let mut count = 0usize;

        while let Some(row) = rows.next().await {
            let chunk = match row {
                Ok(session) => csv_row(&session).map_err(io::Error::from),
                Err(e) => {
                    error!(error = %e, "CSV export aborted by store failure");
                    Err(io::Error::new(io::ErrorKind::Other, e.to_string()))
                }
            };

            let failed = chunk.is_err();
            if tx.send(chunk).await.is_err() {
                debug!("CSV export client went away");
                return;
            }
            if failed {
                return;
            }
            count += 1;
        }

        metrics::counter!("exports.csv").increment(1);
        info!(rows = count, device_id = ?device_id, "CSV export completed");
    });

    ReceiverStream::new(rx)
}

/// Outcome of an archive export
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveSummary {
    /// Complete entries
    pub entries: usize,
    /// Videos left out because they could not be opened
    pub skipped: usize,
    /// Entries cut short by a failing blob stream
    pub truncated: usize,
}

/// Stream a ZIP archive holding every attached video
pub fn videos_archive(
    sessions: Arc<dyn SessionStore>,
    blobs: Arc<dyn BlobStore>,
) -> ReaderStream<DuplexStream> {
    let (writer, reader) = tokio::io::duplex(ARCHIVE_PIPE_CAPACITY);

    tokio::spawn(async move {
        match write_archive(sessions.as_ref(), blobs.as_ref(), writer).await {
            Ok(summary) => {
                metrics::counter!("exports.archive").increment(1);
                info!(
                    entries = summary.entries,
                    skipped = summary.skipped,
                    truncated = summary.truncated,
                    "Video archive export completed"
                );
            }
            // Dropping the writer ends the body; the client sees a truncated archive
            Err(e) => error!(error = %e, "Video archive export failed"),
        }
    });

    ReaderStream::new(reader)
}

/// Entry name for a video: the stored file name, else `<video_id>.<ext>`
fn entry_name(
    filename: Option<&str>,
    video_id: uuid::Uuid,
    content_type: &str,
    used: &mut HashSet<String>,
) -> String {
    let base = filename
        .map(sanitize_filename)
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| format!("{}.{}", video_id, extension_for(content_type)));

    let name = if used.contains(&base) {
        format!("{}_{}", video_id, base)
    } else {
        base
    };

    used.insert(name.clone());
    name
}

/// Write the archive into `out`. Videos that cannot be read are skipped.
#[instrument(skip_all)]
pub async fn write_archive(
    sessions: &dyn SessionStore,
    blobs: &dyn BlobStore,
    out: DuplexStream,
) -> Result<ArchiveSummary> {
    let mut zip = ZipFileWriter::with_tokio(out);
    let mut summary = ArchiveSummary::default();
    let mut used_names = HashSet::new();

    let mut rows = sessions.stream_all(None);

    while let Some(row) = rows.next().await {
        let session = row.context("Failed to read sessions for archive")?;
        let Some(video_id) = session.video_id else {
            continue;
        };

        let blob = match blobs.get(video_id).await {
            Ok(blob) => blob,
            Err(e) => {
                warn!(video_id = %video_id, error = %e, "Skipping unreadable video");
                metrics::counter!("exports.archive.skipped").increment(1);
                summary.skipped += 1;
                continue;
            }
        };

        let name = entry_name(
            blob.filename.as_deref(),
            video_id,
            &blob.content_type,
            &mut used_names,
        );
        let builder = ZipEntryBuilder::new(name.clone().into(), Compression::Deflate);
        let mut entry = zip
            .write_entry_stream(builder)
            .await
            .context("Failed to start archive entry")?;

        let mut body = blob.body;
        let mut interrupted = false;
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => entry
                    .write_all(&bytes)
                    .await
                    .context("Failed to write archive entry")?,
                Err(e) => {
                    warn!(video_id = %video_id, entry = %name, error = %e, "Video stream interrupted, entry truncated");
                    interrupted = true;
                    break;
                }
            }
        }

        // The local header is already out, so a partial entry stays in the archive
        entry.close().await.context("Failed to finish archive entry")?;

        if interrupted {
            metrics::counter!("exports.archive.truncated").increment(1);
            summary.truncated += 1;
        } else {
            debug!(video_id = %video_id, entry = %name, "Added video to archive");
            summary.entries += 1;
        }
    }

    zip.close().await.context("Failed to finish archive")?;

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::{BlobError, BlobMetadata, BlobObject, MockBlobStore};
    use crate::memory::{MemoryBlobStore, MemorySessionStore};
    use crate::session_store::NewSession;
    use futures::TryStreamExt;
    use uuid::Uuid;

    async fn seed(store: &MemorySessionStore, device_id: &str, timestamp: &str) -> Session {
        store
            .insert(NewSession {
                device_id: device_id.to_string(),
                emotion_score: 4,
                latitude: Some(25.033),
                longitude: None,
                timestamp: timestamp.to_string(),
            })
            .await
            .unwrap()
    }

    async fn attach(
        sessions: &MemorySessionStore,
        blobs: &MemoryBlobStore,
        session: &Session,
        filename: Option<&str>,
        data: &'static [u8],
    ) -> Uuid {
        let video_id = blobs
            .put(
                Bytes::from_static(data),
                BlobMetadata {
                    filename: filename.map(str::to_string),
                    content_type: "video/mp4".to_string(),
                    session_id: session.id,
                    uploaded_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        sessions
            .update_video_reference(session.id, video_id)
            .await
            .unwrap();
        video_id
    }

    async fn collect_csv(sessions: Arc<MemorySessionStore>, device_id: Option<&str>) -> String {
        let chunks: Vec<Bytes> = csv_export(sessions, device_id.map(str::to_string))
            .try_collect()
            .await
            .unwrap();
        String::from_utf8(chunks.concat()).unwrap()
    }

    #[test]
    fn test_export_filename() {
        let now = DateTime::parse_from_rfc3339("2024-01-15T10:30:45Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            export_filename("emo_sessions", "csv", now),
            "emo_sessions_20240115_103045.csv"
        );
    }

    #[tokio::test]
    async fn test_csv_rows_match_sessions_and_flag_videos() {
        let sessions = Arc::new(MemorySessionStore::new());
        let blobs = MemoryBlobStore::new();

        let with_video = seed(&sessions, "d1", "2024-01-02T00:00:00Z").await;
        seed(&sessions, "d1", "2024-01-01T00:00:00Z").await;
        seed(&sessions, "d2", "2024-01-03T00:00:00Z").await;
        attach(&sessions, &blobs, &with_video, Some("a.mp4"), b"video").await;

        let csv = collect_csv(sessions.clone(), Some("d1")).await;
        let mut reader = csv::Reader::from_reader(csv.as_bytes());

        let headers: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(headers, CSV_HEADER);

        let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
        assert_eq!(rows.len(), 2);

        assert_eq!(&rows[0][0], with_video.id.to_string());
        assert_eq!(&rows[0][5], "2024-01-02T00:00:00Z");
        assert_eq!(&rows[0][6], "yes");
        assert_eq!(&rows[1][6], "no");
        assert_eq!(&rows[1][3], "25.033");
        assert_eq!(&rows[1][4], "");

        let all = collect_csv(sessions, None).await;
        assert_eq!(all.lines().count(), 4);
    }

    #[tokio::test]
    async fn test_csv_quotes_awkward_device_ids() {
        let sessions = Arc::new(MemorySessionStore::new());
        seed(&sessions, "device, \"one\"", "2024-01-01T00:00:00Z").await;

        let csv = collect_csv(sessions, None).await;
        let mut reader = csv::Reader::from_reader(csv.as_bytes());
        let row = reader.records().next().unwrap().unwrap();

        assert_eq!(&row[1], "device, \"one\"");
    }

    #[test]
    fn test_entry_name_fallbacks_and_duplicates() {
        let mut used = HashSet::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert_eq!(
            entry_name(Some("clip.mp4"), first, "video/mp4", &mut used),
            "clip.mp4"
        );
        assert_eq!(
            entry_name(Some("clip.mp4"), second, "video/mp4", &mut used),
            format!("{}_clip.mp4", second)
        );
        assert_eq!(
            entry_name(None, first, "video/quicktime", &mut used),
            format!("{}.mov", first)
        );
        assert_eq!(
            entry_name(Some("../../etc/x.avi"), first, "video/x-msvideo", &mut used),
            ".._.._etc_x.avi"
        );
    }

    #[tokio::test]
    async fn test_archive_skips_missing_videos() {
        let sessions = Arc::new(MemorySessionStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());

        let kept = seed(&sessions, "d1", "2024-01-02T00:00:00Z").await;
        let broken = seed(&sessions, "d1", "2024-01-01T00:00:00Z").await;
        seed(&sessions, "d2", "2024-01-03T00:00:00Z").await;

        attach(&sessions, &blobs, &kept, Some("kept-video.mp4"), b"kept bytes").await;
        let broken_id = attach(&sessions, &blobs, &broken, None, b"gone").await;
        blobs.delete(broken_id).await.unwrap();

        let (writer, reader) = tokio::io::duplex(ARCHIVE_PIPE_CAPACITY);
        let collector = tokio::spawn(async move {
            let chunks: Vec<Bytes> = ReaderStream::new(reader).try_collect().await.unwrap();
            chunks.concat()
        });

        let summary = write_archive(sessions.as_ref(), blobs.as_ref(), writer)
            .await
            .unwrap();
        let archive = collector.await.unwrap();

        assert_eq!(
            summary,
            ArchiveSummary {
                entries: 1,
                skipped: 1,
                truncated: 0
            }
        );
        assert!(archive.starts_with(b"PK\x03\x04"));

        let contains = |needle: &[u8]| archive.windows(needle.len()).any(|w| w == needle);
        assert!(contains(b"kept-video.mp4"));
        assert!(!contains(broken_id.to_string().as_bytes()));
    }

    #[tokio::test]
    async fn test_archive_reports_interrupted_streams_as_truncated() {
        let sessions = Arc::new(MemorySessionStore::new());
        let session = seed(&sessions, "d1", "2024-01-01T00:00:00Z").await;
        let video_id = Uuid::new_v4();
        sessions
            .update_video_reference(session.id, video_id)
            .await
            .unwrap();

        let mut blobs = MockBlobStore::new();
        blobs.expect_get().returning(|id| {
            let chunks: Vec<Result<Bytes, BlobError>> = vec![
                Ok(Bytes::from_static(b"first half")),
                Err(BlobError::Backend("connection reset".to_string())),
            ];
            Ok(BlobObject {
                id,
                content_type: "video/mp4".to_string(),
                filename: Some("cut.mp4".to_string()),
                size: None,
                body: futures::stream::iter(chunks).boxed(),
            })
        });

        let (writer, reader) = tokio::io::duplex(ARCHIVE_PIPE_CAPACITY);
        let collector = tokio::spawn(async move {
            let chunks: Vec<Bytes> = ReaderStream::new(reader).try_collect().await.unwrap();
            chunks.concat()
        });

        let summary = write_archive(sessions.as_ref(), &blobs, writer)
            .await
            .unwrap();
        collector.await.unwrap();

        assert_eq!(summary.entries, 0);
        assert_eq!(summary.truncated, 1);
        assert_eq!(summary.skipped, 0);
    }
}
