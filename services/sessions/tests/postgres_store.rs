//! PostgreSQL store tests. Skipped unless `DATABASE_URL` points at a scratch database.

use chrono::{Duration, Utc};
use futures::TryStreamExt;
use session_service::config::DatabaseConfig;
use session_service::{NewSession, Pagination, PgSessionStore, SessionStore, StoreError};
use uuid::Uuid;

async fn store() -> Option<PgSessionStore> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let config = DatabaseConfig {
        url,
        max_connections: 4,
        min_connections: 1,
        connect_timeout_secs: 5,
        idle_timeout_secs: 60,
        run_migrations: true,
    };

    let store = PgSessionStore::new(&config).await.unwrap();
    store.run_migrations().await.unwrap();
    Some(store)
}

fn new_session(device_id: &str, timestamp: &str) -> NewSession {
    NewSession {
        device_id: device_id.to_string(),
        emotion_score: 3,
        latitude: Some(52.52),
        longitude: None,
        timestamp: timestamp.to_string(),
    }
}

#[tokio::test]
async fn test_session_crud_and_listing() {
    let Some(store) = store().await else {
        return;
    };
    let device = format!("pg-test-{}", Uuid::new_v4());

    let older = store
        .insert(new_session(&device, "2024-01-01T00:00:00Z"))
        .await
        .unwrap();
    let newer = store
        .insert(new_session(&device, "2024-06-01T00:00:00Z"))
        .await
        .unwrap();

    assert_eq!(store.find_by_id(older.id).await.unwrap(), older);
    assert_eq!(older.latitude, Some(52.52));
    assert_eq!(older.longitude, None);

    let page = store
        .find_by_device(&device, Pagination::default())
        .await
        .unwrap();
    assert_eq!(
        page.iter().map(|s| s.id).collect::<Vec<_>>(),
        vec![newer.id, older.id]
    );

    let second = store
        .find_by_device(&device, Pagination::new(Some(1), Some(1)))
        .await
        .unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].id, older.id);

    let streamed: Vec<_> = store
        .stream_all(Some(&device))
        .try_collect()
        .await
        .unwrap();
    assert_eq!(streamed.len(), 2);

    let video_id = Uuid::new_v4();
    let updated = store
        .update_video_reference(older.id, video_id)
        .await
        .unwrap();
    assert_eq!(updated.video_id, Some(video_id));
    assert!(updated.updated_at >= older.updated_at);

    store.delete(older.id).await.unwrap();
    store.delete(newer.id).await.unwrap();
    assert!(matches!(
        store.find_by_id(older.id).await,
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        store.delete(older.id).await,
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        store.update_video_reference(older.id, video_id).await,
        Err(StoreError::NotFound(_))
    ));

    store.close().await;
}

#[tokio::test]
async fn test_expire_created_before_and_ping() {
    let Some(store) = store().await else {
        return;
    };
    let device = format!("pg-test-{}", Uuid::new_v4());

    store.ping().await.unwrap();

    let session = store
        .insert(new_session(&device, "2024-01-01T00:00:00Z"))
        .await
        .unwrap();

    let cutoff = Utc::now() - Duration::days(90);

    let nothing = store.expire_created_before(cutoff).await.unwrap();
    assert!(nothing.iter().all(|s| s.id != session.id));

    sqlx::query("UPDATE sessions SET created_at = $2 WHERE id = $1")
        .bind(session.id)
        .bind(Utc::now() - Duration::days(200))
        .execute(store.pool())
        .await
        .unwrap();

    let expired = store.expire_created_before(cutoff).await.unwrap();
    assert!(expired.iter().any(|s| s.id == session.id));
    assert!(store.find_by_id(session.id).await.is_err());

    store.close().await;
}

#[tokio::test]
async fn test_listing_orders_timestamps_bytewise() {
    let Some(store) = store().await else {
        return;
    };
    let device = format!("pg-test-{}", Uuid::new_v4());

    // 't' sorts after 'T' by byte value but before it in most locale collations
    let upper = store
        .insert(new_session(&device, "2024-01-01T10:00:00Z"))
        .await
        .unwrap();
    let lower = store
        .insert(new_session(&device, "2024-01-01t10:00:00z"))
        .await
        .unwrap();

    let page = store
        .find_by_device(&device, Pagination::default())
        .await
        .unwrap();
    assert_eq!(
        page.iter().map(|s| s.id).collect::<Vec<_>>(),
        vec![lower.id, upper.id]
    );

    store.delete(upper.id).await.unwrap();
    store.delete(lower.id).await.unwrap();
    store.close().await;
}
