mod common;

use common::{eventually, setup};
use offsync::store::MemoryStore;
use offsync::sync::FailureReason;
use offsync::{FetchError, RequestDescriptor, SqliteStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_cached_read_expires() {
  let s = setup(true, Arc::new(MemoryStore::new()));
  let cache = s.service.cache();

  cache.put("p1", json!({"x": 1}), Duration::from_millis(1000));
  assert_eq!(cache.get("p1").unwrap().value, json!({"x": 1}));

  s.clock.advance(1001);
  assert!(cache.get("p1").is_none());
}

#[tokio::test]
async fn test_offline_post_replayed_on_reconnect() {
  let mut s = setup(false, Arc::new(MemoryStore::new()));

  let err = s
    .service
    .request(&RequestDescriptor::post("/api/orders", json!({"qty": 2})))
    .await
    .unwrap_err();
  assert!(err.is_queued());
  assert_eq!(s.service.queue().len(), 1);

  s.server.set_up(true);
  s.service.set_online(true);

  let queue = s.service.queue().clone();
  eventually(|| queue.is_empty()).await;

  let received = s.server.received();
  assert_eq!(received.len(), 1);
  assert_eq!(received[0].body, Some(json!({"qty": 2})));

  let titles = s.titles();
  assert!(titles.contains(&"Request Queued".to_string()));
  assert!(titles.contains(&"Connection Restored".to_string()));
  eventually(|| s.service.sync_engine().last_sync().is_some()).await;
}

#[tokio::test]
async fn test_retry_ceiling_evicts() {
  let s = setup(false, Arc::new(MemoryStore::new()));
  s.service
    .request(&RequestDescriptor::post("/api/orders", json!({})))
    .await
    .unwrap_err();

  // Reported reachable, but every replay hits a server error
  s.server.set_up(true);
  s.server.set_status(503);
  s.service.monitor().set_online(true);
  let engine = s.service.sync_engine().clone();
  eventually(|| !engine.is_draining() && engine.last_sync().is_some()).await;
  assert_eq!(s.service.queue().list()[0].retry_count, 1);

  let second = s.service.sync_now().await;
  assert_eq!(second.retained, 1);

  let third = s.service.sync_now().await;
  assert_eq!(third.failed.len(), 1);
  assert!(matches!(
    third.failed[0].reason,
    FailureReason::RetriesExhausted { .. }
  ));
  assert!(s.service.queue().is_empty());
  assert_eq!(s.server.received().len(), 3);
}

#[tokio::test]
async fn test_queue_survives_restart() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("store.db");

  {
    let s = setup(false, Arc::new(SqliteStore::open(&path).unwrap()));
    s.service
      .request(&RequestDescriptor::post("/api/orders", json!({"n": 1})))
      .await
      .unwrap_err();
    s.service
      .request(&RequestDescriptor::post("/api/orders", json!({"n": 2})))
      .await
      .unwrap_err();
    s.service.dispose();
  }

  let s = setup(true, Arc::new(SqliteStore::open(&path).unwrap()));
  let queue = s.service.queue().clone();
  eventually(|| queue.is_empty()).await;

  let bodies: Vec<_> = s.server.received().into_iter().map(|r| r.body).collect();
  assert_eq!(bodies, vec![Some(json!({"n": 1})), Some(json!({"n": 2}))]);
}

#[tokio::test]
async fn test_cache_serves_reads_across_restart() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("store.db");
  let read = RequestDescriptor::get("/api/catalog");

  {
    let s = setup(true, Arc::new(SqliteStore::open(&path).unwrap()));
    s.service.request(&read).await.unwrap();
  }

  let s = setup(false, Arc::new(SqliteStore::open(&path).unwrap()));
  let response = s.service.request(&read).await.unwrap();
  assert!(response.is_from_cache());
  assert_eq!(response.body, json!({"ok": true}));

  let other = s
    .service
    .request(&RequestDescriptor::get("/api/other"))
    .await
    .unwrap_err();
  assert!(matches!(other, FetchError::OfflineNoCache { .. }));
}
