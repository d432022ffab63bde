//! Write-once content population through the registry.

mod common;

use std::sync::Arc;

use common::{
    body, file_registry, memory_registry, registration, wait_for_content_state, BytesResponse,
    FailingResponse, UnreadableResponse,
};
use http::header::IF_NONE_MATCH;
use sworker_registry::{
    ContentConfig, ContentHash, ContentState, ContentStreamWriter, ErrorKind, RegistryConfig,
    WorkerError, WorkerRecord, WorkerStore,
};
use tempfile::TempDir;

const URL: &str = "https://example.com/sw.js";

#[tokio::test]
async fn test_populate_stores_bytes_headers_and_hash() {
    let registry = memory_registry().await;
    let worker = registry.create(URL, &registration("reg-a")).await.unwrap();
    let bytes = body(1024);

    let response = BytesResponse::new(bytes.clone())
        .with_header("ETag", "\"v1\"")
        .with_header("Content-Type", "application/javascript");
    let populated = registry.update_content(&worker, &response).await.unwrap();

    assert_eq!(populated.size, 1024);
    assert_eq!(populated.hash, ContentHash::of(&bytes));

    let record = registry
        .store()
        .select_by_id(worker.id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.content_state(), ContentState::Populated);
    assert_eq!(record.content_size, Some(1024));
    assert_eq!(record.content_hash, Some(ContentHash::of(&bytes)));
    let headers = record.headers.unwrap();
    assert_eq!(headers.get("etag"), Some("\"v1\""));
    assert_eq!(headers.get("content-type"), Some("application/javascript"));

    let stored = registry.store().read_content(worker.id()).await.unwrap();
    assert_eq!(stored, Some(bytes));
}

#[tokio::test]
async fn test_multi_chunk_body_is_copied_in_order() {
    let config = RegistryConfig::default().with_content(ContentConfig {
        chunk_size: 1000,
        scratch_dir: None,
    });
    let (_tmp, registry) = file_registry(config).await;
    let worker = registry.create(URL, &registration("reg-a")).await.unwrap();

    // Not a multiple of the chunk size, so the last chunk is short.
    let bytes = body(100_003);
    let populated = registry
        .update_content(&worker, &BytesResponse::new(bytes.clone()))
        .await
        .unwrap();

    assert_eq!(populated.size, 100_003);
    assert_eq!(populated.hash, ContentHash::of(&bytes));
    let stored = registry.store().read_content(worker.id()).await.unwrap();
    assert_eq!(stored.as_deref(), Some(bytes.as_slice()));
}

#[tokio::test]
async fn test_empty_body_is_valid_content() {
    let registry = memory_registry().await;
    let worker = registry.create(URL, &registration("reg-a")).await.unwrap();

    let populated = registry
        .update_content(&worker, &BytesResponse::new(Vec::new()))
        .await
        .unwrap();

    assert_eq!(populated.size, 0);
    assert_eq!(populated.hash, ContentHash::of(b""));
    assert_eq!(
        populated.hash.as_str(),
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
    let state = registry.store().content_state(worker.id()).await.unwrap();
    assert_eq!(state, ContentState::Populated);
}

#[tokio::test]
async fn test_second_population_is_rejected() {
    let registry = memory_registry().await;
    let worker = registry.create(URL, &registration("reg-a")).await.unwrap();
    let first = body(512);

    registry
        .update_content(&worker, &BytesResponse::new(first.clone()).with_header("ETag", "\"a\""))
        .await
        .unwrap();

    let err = registry
        .update_content(&worker, &BytesResponse::new(body(64)).with_header("ETag", "\"b\""))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyPopulated);
    assert!(matches!(err, WorkerError::AlreadyPopulated(ref id) if id == worker.id()));

    let record = registry
        .store()
        .select_by_id(worker.id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.content_hash, Some(ContentHash::of(&first)));
    assert_eq!(record.headers.unwrap().get("ETag"), Some("\"a\""));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_populations_have_one_winner() {
    let registry = Arc::new(memory_registry().await);
    let worker = registry.create(URL, &registration("reg-a")).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..6u8 {
        let registry = registry.clone();
        let worker = worker.clone();
        handles.push(tokio::spawn(async move {
            let response = BytesResponse::new(vec![i; 4096]);
            registry.update_content(&worker, &response).await
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(populated) => winners.push(populated),
            Err(err) => assert_eq!(err.kind(), ErrorKind::AlreadyPopulated),
        }
    }
    assert_eq!(winners.len(), 1);

    let record = registry
        .store()
        .select_by_id(worker.id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.content_hash, Some(winners[0].hash.clone()));
}

#[tokio::test]
async fn test_failed_download_leaves_no_trace() {
    let registry = memory_registry().await;
    let worker = registry.create(URL, &registration("reg-a")).await.unwrap();

    let err = registry
        .update_content(&worker, &FailingResponse)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IoFailure);

    let record = registry
        .store()
        .select_by_id(worker.id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.content_state(), ContentState::Empty);
    assert!(record.headers.is_none());

    // A later attempt starts from scratch.
    let bytes = body(300);
    let populated = registry
        .update_content(&worker, &BytesResponse::new(bytes.clone()))
        .await
        .unwrap();
    assert_eq!(populated.hash, ContentHash::of(&bytes));
}

#[tokio::test]
async fn test_failure_after_allocation_discards_slot() {
    let registry = memory_registry().await;
    let worker = registry.create(URL, &registration("reg-a")).await.unwrap();

    let err = registry
        .update_content(&worker, &UnreadableResponse)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IoFailure);

    let record = registry
        .store()
        .select_by_id(worker.id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.content_state(), ContentState::Empty);
    assert!(record.content_size.is_none());
    assert!(record.headers.is_none());
    assert!(registry
        .store()
        .read_content(worker.id())
        .await
        .unwrap()
        .is_none());

    let bytes = body(2048);
    registry
        .update_content(&worker, &BytesResponse::new(bytes.clone()))
        .await
        .unwrap();
    let stored = registry.store().read_content(worker.id()).await.unwrap();
    assert_eq!(stored, Some(bytes));
}

#[tokio::test]
async fn test_scratch_space_is_cleaned_up() {
    let scratch = TempDir::new().unwrap();
    let config = RegistryConfig::default().with_content(ContentConfig {
        chunk_size: 256,
        scratch_dir: Some(scratch.path().join("bodies")),
    });
    let (_tmp, registry) = file_registry(config).await;

    let ok = registry.create(URL, &registration("reg-a")).await.unwrap();
    registry
        .update_content(&ok, &BytesResponse::new(body(1000)))
        .await
        .unwrap();

    let broken = registry.create(URL, &registration("reg-a")).await.unwrap();
    registry
        .update_content(&broken, &UnreadableResponse)
        .await
        .unwrap_err();

    let leftovers = std::fs::read_dir(scratch.path().join("bodies"))
        .unwrap()
        .count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_populate_deleted_worker_is_not_found() {
    let registry = memory_registry().await;
    let worker = registry.create(URL, &registration("reg-a")).await.unwrap();
    registry.delete(&worker).await.unwrap();

    let err = registry
        .update_content(&worker, &BytesResponse::new(body(10)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_content_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("workers.sqlite3");
    let reg = registration("reg-a");
    let bytes = body(5000);

    let id = {
        let store = sworker_registry::WorkerStore::open(&path).await.unwrap();
        let registry = sworker_registry::WorkerRegistry::new(store, RegistryConfig::default());
        let worker = registry.create(URL, &reg).await.unwrap();
        registry
            .update_content(&worker, &BytesResponse::new(bytes.clone()))
            .await
            .unwrap();
        worker.id().clone()
    };

    let store = sworker_registry::WorkerStore::open(&path).await.unwrap();
    let record = store.select_by_id(&id).await.unwrap().unwrap();
    assert_eq!(record.content_hash, Some(ContentHash::of(&bytes)));
    assert_eq!(store.read_content(&id).await.unwrap(), Some(bytes));
}

/// Small chunks over a large body keep the stream stage busy long enough to
/// interrupt it.
fn slow_stream_config() -> ContentConfig {
    ContentConfig {
        chunk_size: 16,
        scratch_dir: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropped_population_is_discarded_before_retry() {
    let (_tmp, registry) =
        file_registry(RegistryConfig::default().with_content(slow_stream_config())).await;
    let registry = Arc::new(registry);
    assert_eq!(registry.config().content.chunk_size, 16);
    let worker = registry.create(URL, &registration("reg-a")).await.unwrap();

    let populating = {
        let registry = registry.clone();
        let worker = worker.clone();
        tokio::spawn(async move {
            let response =
                BytesResponse::new(body(4 * 1024 * 1024)).with_header("ETag", "\"v1\"");
            registry.update_content(&worker, &response).await
        })
    };
    wait_for_content_state(registry.store(), worker.id(), ContentState::Unfinished).await;

    // Validators of half-written content never make the request conditional.
    let request = registry.build_update_request(&worker).await.unwrap();
    assert!(request.headers().get(IF_NONE_MATCH).is_none());

    populating.abort();
    assert!(populating.await.unwrap_err().is_cancelled());

    // Waits for the background discard, then starts from an empty record.
    let bytes = body(700);
    let populated = registry
        .update_content(&worker, &BytesResponse::new(bytes.clone()).with_header("ETag", "\"v2\""))
        .await
        .unwrap();
    assert_eq!(populated.hash, ContentHash::of(&bytes));

    let request = registry.build_update_request(&worker).await.unwrap();
    assert_eq!(request.headers().get(IF_NONE_MATCH).unwrap(), "\"v2\"");
}

#[tokio::test]
async fn test_dropped_writer_future_discards_allocation() {
    let store = WorkerStore::in_memory().await.unwrap();
    let record = WorkerRecord::new(URL, registration("reg-a"));
    store.insert(&record).await.unwrap();
    let config = slow_stream_config();
    let response = BytesResponse::new(body(4 * 1024 * 1024)).with_header("ETag", "\"v1\"");

    {
        let writer = ContentStreamWriter::new(&store, &config);
        let populate = writer.populate(&record.id, &response);
        tokio::pin!(populate);
        tokio::select! {
            result = &mut populate => panic!("population finished early: {result:?}"),
            _ = wait_for_content_state(&store, &record.id, ContentState::Unfinished) => {}
        }
    }

    wait_for_content_state(&store, &record.id, ContentState::Empty).await;
    let loaded = store.select_by_id(&record.id).await.unwrap().unwrap();
    assert!(loaded.headers.is_none());
    assert!(loaded.content_size.is_none());
}
