//! Shared fixtures for the registry integration tests.
#![allow(dead_code)]

use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sworker_registry::{
    ContentState, DownloadedBody, RegistrationId, RegistryConfig, ResponseHeaders,
    ScriptResponse, WorkerId, WorkerRegistry, WorkerStore,
};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn registration(name: &str) -> RegistrationId {
    RegistrationId::parse(name).unwrap()
}

/// Registry over a SQLite file inside a fresh temp directory.
pub async fn file_registry(config: RegistryConfig) -> (TempDir, WorkerRegistry) {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let store = WorkerStore::open(tmp.path().join("workers.sqlite3"))
        .await
        .unwrap();
    (tmp, WorkerRegistry::new(store, config))
}

/// Registry over an in-memory database.
pub async fn memory_registry() -> WorkerRegistry {
    init_tracing();
    let store = WorkerStore::in_memory().await.unwrap();
    WorkerRegistry::new(store, RegistryConfig::default())
}

/// Poll the store until the worker's content reaches `state`.
pub async fn wait_for_content_state(store: &WorkerStore, id: &WorkerId, state: ContentState) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if store.content_state(id).await.unwrap() == state {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "worker {id} never reached {state:?}"
        );
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Deterministic script body of `len` bytes.
pub fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Response whose body is held in memory and written out on download.
pub struct BytesResponse {
    pub headers: ResponseHeaders,
    pub body: Vec<u8>,
}

impl BytesResponse {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            headers: ResponseHeaders::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name, value);
        self
    }
}

#[async_trait]
impl ScriptResponse for BytesResponse {
    fn headers(&self) -> ResponseHeaders {
        self.headers.clone()
    }

    async fn download_to(&self, dir: &Path) -> io::Result<DownloadedBody> {
        let path = dir.join("body.js");
        tokio::fs::write(&path, &self.body).await?;
        Ok(DownloadedBody {
            path,
            size: self.body.len() as u64,
        })
    }
}

/// Response whose download is interrupted.
pub struct FailingResponse;

#[async_trait]
impl ScriptResponse for FailingResponse {
    fn headers(&self) -> ResponseHeaders {
        [("ETag", "\"never\"")].into_iter().collect()
    }

    async fn download_to(&self, _dir: &Path) -> io::Result<DownloadedBody> {
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"))
    }
}

/// Response that "downloads" to something that cannot be read back as a
/// file, so the failure happens after the content slot is allocated.
pub struct UnreadableResponse;

#[async_trait]
impl ScriptResponse for UnreadableResponse {
    fn headers(&self) -> ResponseHeaders {
        [("ETag", "\"broken\"")].into_iter().collect()
    }

    async fn download_to(&self, dir: &Path) -> io::Result<DownloadedBody> {
        let path = dir.join("body.js");
        tokio::fs::create_dir(&path).await?;
        tokio::fs::write(path.join("placeholder"), b"x").await?;
        Ok(DownloadedBody { path, size: 1 })
    }
}
