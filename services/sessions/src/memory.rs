//! In-memory store backends.
//!
//! These provide the same contracts as the PostgreSQL and S3 backends, backed by
//! `HashMap`s, so the service can run without external infrastructure (local
//! development, tests). All data is lost on restart.

use crate::blob_store::{BlobError, BlobMetadata, BlobObject, BlobStore};
use crate::session_store::{NewSession, Pagination, Session, SessionStats, SessionStore, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Listing order shared with the SQL backend: newest event first
fn by_timestamp_desc(a: &Session, b: &Session) -> Ordering {
    b.timestamp
        .cmp(&a.timestamp)
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<Uuid, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Overwrite a record's creation time (used to simulate aged data)
    pub fn set_created_at(&self, id: Uuid, created_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        session.created_at = created_at;
        Ok(())
    }

    fn sorted(&self, device_id: Option<&str>) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .read()
            .values()
            .filter(|s| device_id.map_or(true, |d| s.device_id == d))
            .cloned()
            .collect();
        sessions.sort_by(by_timestamp_desc);
        sessions
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: NewSession) -> Result<Session, StoreError> {
        let now = Utc::now();
        let stored = Session {
            id: Uuid::new_v4(),
            device_id: session.device_id,
            emotion_score: session.emotion_score,
            latitude: session.latitude,
            longitude: session.longitude,
            timestamp: session.timestamp,
            video_id: None,
            created_at: now,
            updated_at: now,
        };
        self.sessions.write().insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Session, StoreError> {
        self.sessions
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn find_by_device(
        &self,
        device_id: &str,
        page: Pagination,
    ) -> Result<Vec<Session>, StoreError> {
        Ok(self
            .sorted(Some(device_id))
            .into_iter()
            .skip(page.skip as usize)
            .take(page.limit as usize)
            .collect())
    }

    fn stream_all<'a>(
        &'a self,
        device_id: Option<&'a str>,
    ) -> BoxStream<'a, Result<Session, StoreError>> {
        stream::iter(self.sorted(device_id).into_iter().map(Ok)).boxed()
    }

    async fn update_video_reference(
        &self,
        id: Uuid,
        video_id: Uuid,
    ) -> Result<Session, StoreError> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        session.video_id = Some(video_id);
        session.updated_at = Utc::now();
        Ok(session.clone())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.sessions
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }

    async fn expire_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Session>, StoreError> {
        let mut sessions = self.sessions.write();
        let expired_ids: Vec<Uuid> = sessions
            .values()
            .filter(|s| s.created_at < cutoff)
            .map(|s| s.id)
            .collect();

        Ok(expired_ids
            .into_iter()
            .filter_map(|id| sessions.remove(&id))
            .collect())
    }

    async fn stats(&self) -> Result<SessionStats, StoreError> {
        let sessions = self.sessions.read();
        let devices: HashSet<&str> = sessions.values().map(|s| s.device_id.as_str()).collect();

        Ok(SessionStats {
            total_sessions: sessions.len() as i64,
            device_count: devices.len() as i64,
            sessions_with_video: sessions.values().filter(|s| s.has_video()).count() as i64,
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Bytes,
    metadata: BlobMetadata,
}

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<Uuid, StoredBlob>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.blobs.read().contains_key(&id)
    }

    /// Metadata recorded for a blob
    pub fn metadata(&self, id: Uuid) -> Option<BlobMetadata> {
        self.blobs.read().get(&id).map(|b| b.metadata.clone())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, data: Bytes, metadata: BlobMetadata) -> Result<Uuid, BlobError> {
        let id = Uuid::new_v4();
        self.blobs.write().insert(id, StoredBlob { data, metadata });
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<BlobObject, BlobError> {
        let blob = self
            .blobs
            .read()
            .get(&id)
            .cloned()
            .ok_or(BlobError::NotFound(id))?;

        Ok(BlobObject {
            id,
            content_type: blob.metadata.content_type,
            filename: blob.metadata.filename,
            size: Some(blob.data.len() as u64),
            body: stream::once(async move { Ok(blob.data) }).boxed(),
        })
    }

    async fn delete(&self, id: Uuid) -> Result<(), BlobError> {
        self.blobs
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(BlobError::NotFound(id))
    }

    async fn ping(&self) -> Result<(), BlobError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use futures::TryStreamExt;

    fn new_session(device_id: &str, timestamp: &str) -> NewSession {
        NewSession {
            device_id: device_id.to_string(),
            emotion_score: 3,
            latitude: None,
            longitude: None,
            timestamp: timestamp.to_string(),
        }
    }

    #[tokio::test]
    async fn test_timestamps_compare_by_bytes() {
        let store = MemorySessionStore::new();
        let upper = store
            .insert(new_session("d1", "2024-01-01T10:00:00Z"))
            .await
            .unwrap();
        let lower = store
            .insert(new_session("d1", "2024-01-01t10:00:00z"))
            .await
            .unwrap();

        let page = store
            .find_by_device("d1", Pagination::default())
            .await
            .unwrap();
        assert_eq!(
            page.iter().map(|s| s.id).collect::<Vec<_>>(),
            vec![lower.id, upper.id]
        );
    }

    #[tokio::test]
    async fn test_find_by_device_orders_and_paginates() {
        let store = MemorySessionStore::new();
        for ts in [
            "2024-01-02T00:00:00Z",
            "2024-01-04T00:00:00Z",
            "2024-01-01T00:00:00Z",
            "2024-01-03T00:00:00Z",
        ] {
            store.insert(new_session("d1", ts)).await.unwrap();
        }
        store
            .insert(new_session("d2", "2024-01-05T00:00:00Z"))
            .await
            .unwrap();

        let page = store
            .find_by_device("d1", Pagination::new(Some(2), Some(1)))
            .await
            .unwrap();

        let timestamps: Vec<&str> = page.iter().map(|s| s.timestamp.as_str()).collect();
        assert_eq!(timestamps, vec!["2024-01-03T00:00:00Z", "2024-01-02T00:00:00Z"]);
        assert!(page.iter().all(|s| s.device_id == "d1"));
    }

    #[tokio::test]
    async fn test_stream_all_filters_by_device() {
        let store = MemorySessionStore::new();
        store.insert(new_session("d1", "2024-01-01T00:00:00Z")).await.unwrap();
        store.insert(new_session("d2", "2024-01-02T00:00:00Z")).await.unwrap();
        store.insert(new_session("d1", "2024-01-03T00:00:00Z")).await.unwrap();

        let all: Vec<Session> = store.stream_all(None).try_collect().await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].timestamp, "2024-01-03T00:00:00Z");

        let d1: Vec<Session> = store.stream_all(Some("d1")).try_collect().await.unwrap();
        assert_eq!(d1.len(), 2);
    }

    #[tokio::test]
    async fn test_update_and_delete_missing_session() {
        let store = MemorySessionStore::new();
        let id = Uuid::new_v4();

        assert!(matches!(
            store.update_video_reference(id, Uuid::new_v4()).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(store.delete(id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_expire_created_before() {
        let store = MemorySessionStore::new();
        let old = store.insert(new_session("d1", "2023-01-01T00:00:00Z")).await.unwrap();
        let fresh = store.insert(new_session("d1", "2024-01-01T00:00:00Z")).await.unwrap();
        store
            .set_created_at(old.id, Utc::now() - Duration::days(120))
            .unwrap();

        let expired = store
            .expire_created_before(Utc::now() - Duration::days(90))
            .await
            .unwrap();

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, old.id);
        assert!(store.find_by_id(fresh.id).await.is_ok());
        assert!(store.find_by_id(old.id).await.is_err());
    }

    #[tokio::test]
    async fn test_blob_put_get_delete() {
        let store = MemoryBlobStore::new();
        let metadata = BlobMetadata {
            filename: Some("clip.mp4".to_string()),
            content_type: "video/mp4".to_string(),
            session_id: Uuid::new_v4(),
            uploaded_at: Utc::now(),
        };

        let first = store.put(Bytes::from_static(b"abc"), metadata.clone()).await.unwrap();
        let second = store.put(Bytes::from_static(b"abc"), metadata).await.unwrap();
        assert_ne!(first, second);

        let blob = store.get(first).await.unwrap();
        assert_eq!(blob.filename.as_deref(), Some("clip.mp4"));
        assert_eq!(blob.size, Some(3));
        assert_eq!(blob.into_bytes().await.unwrap(), Bytes::from_static(b"abc"));

        store.delete(first).await.unwrap();
        assert!(matches!(store.get(first).await, Err(BlobError::NotFound(_))));
        assert!(matches!(store.delete(first).await, Err(BlobError::NotFound(_))));
    }
}
