//! Write-once population of a worker's script bytes.
//!
//! The body is downloaded to a scratch file first so its exact length is
//! known, then copied into a pre-sized BLOB chunk by chunk while a SHA-256 is
//! accumulated. Nothing holds the whole script in memory.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sworker_ids::WorkerId;
use tokio::io::AsyncReadExt;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use crate::config::ContentConfig;
use crate::error::{Result, WorkerError};
use crate::record::{ContentHash, ContentState, ResponseHeaders, RowHandle};
use crate::store::WorkerStore;

/// A body materialized on local disk by [`ScriptResponse::download_to`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedBody {
    pub path: PathBuf,
    /// Size as reported by the downloader. The file's own length wins if
    /// they disagree.
    pub size: u64,
}

/// Fetch response handed in by the network layer.
#[async_trait]
pub trait ScriptResponse: Send + Sync {
    /// Response headers, flattened.
    fn headers(&self) -> ResponseHeaders;

    /// Write the full body into a new file inside `dir`.
    async fn download_to(&self, dir: &Path) -> std::io::Result<DownloadedBody>;
}

/// Outcome of a successful population.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopulatedContent {
    pub size: u64,
    pub hash: ContentHash,
}

/// Stages of the population pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopulateStage {
    Guard,
    Materialize,
    Allocate,
    Stream,
    Finalize,
}

impl PopulateStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Guard => "guard",
            Self::Materialize => "materialize",
            Self::Allocate => "allocate",
            Self::Stream => "stream",
            Self::Finalize => "finalize",
        }
    }

    /// Whether a failure at this stage can leave an allocated slot behind.
    fn after_allocation(&self) -> bool {
        matches!(self, Self::Stream | Self::Finalize)
    }
}

impl fmt::Display for PopulateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Streams a script response into a worker record exactly once.
///
/// Callers must serialize populations per worker id; the registry does this
/// with its per-id lock. The store's conditional allocation backs that up.
pub struct ContentStreamWriter<'a> {
    store: &'a WorkerStore,
    config: &'a ContentConfig,
}

impl<'a> ContentStreamWriter<'a> {
    pub fn new(store: &'a WorkerStore, config: &'a ContentConfig) -> Self {
        Self { store, config }
    }

    /// Run guard, materialize, allocate, stream and finalize for `worker_id`.
    ///
    /// On a stream or finalize failure the allocated slot is discarded so the
    /// record returns to having no content. The same happens in a background
    /// task when the returned future is dropped once allocation has started.
    /// If that cleanup fails too, the record stays unfinished and must be
    /// deleted before a retry.
    pub async fn populate<R>(&self, worker_id: &WorkerId, response: &R) -> Result<PopulatedContent>
    where
        R: ScriptResponse + ?Sized,
    {
        self.populate_holding(worker_id, response, None).await
    }

    /// Like [`Self::populate`], keeping `lock` until the population is over,
    /// including a discard that outlives a dropped future.
    pub(crate) async fn populate_holding<R>(
        &self,
        worker_id: &WorkerId,
        response: &R,
        lock: Option<OwnedMutexGuard<()>>,
    ) -> Result<PopulatedContent>
    where
        R: ScriptResponse + ?Sized,
    {
        let mut pending = PendingDiscard::new(self.store.clone(), worker_id.clone(), lock);
        let mut stage = PopulateStage::Guard;
        let result = self.run(worker_id, response, &mut stage, &mut pending).await;

        match &result {
            Ok(populated) => {
                info!(
                    worker_id = %worker_id,
                    size = populated.size,
                    hash = %populated.hash,
                    "Worker content stored"
                );
            }
            Err(err) => {
                warn!(worker_id = %worker_id, stage = %stage, error = %err, "Content population failed");
                if stage.after_allocation() {
                    discard(self.store, worker_id).await;
                }
            }
        }

        pending.disarm();
        result
    }

    async fn run<R>(
        &self,
        worker_id: &WorkerId,
        response: &R,
        stage: &mut PopulateStage,
        pending: &mut PendingDiscard,
    ) -> Result<PopulatedContent>
    where
        R: ScriptResponse + ?Sized,
    {
        *stage = PopulateStage::Guard;
        match self.store.content_state(worker_id).await? {
            ContentState::Empty => {}
            ContentState::Unfinished | ContentState::Populated => {
                return Err(WorkerError::AlreadyPopulated(worker_id.clone()));
            }
        }

        *stage = PopulateStage::Materialize;
        // Removed on drop, whichever way this function exits.
        let scratch = self.scratch_dir()?;
        let body = response.download_to(scratch.path()).await?;
        let size = tokio::fs::metadata(&body.path).await?.len();
        if size != body.size {
            warn!(
                worker_id = %worker_id,
                reported = body.size,
                actual = size,
                "Downloaded body size differs from reported size"
            );
        }
        debug!(worker_id = %worker_id, size, "Materialized response body");

        *stage = PopulateStage::Allocate;
        let headers = response.headers();
        // Armed before the request is sent: a dropped reply may still commit.
        pending.arm();
        let handle = self
            .store
            .update_headers_and_allocate_content(worker_id, &headers, size)
            .await?;

        *stage = PopulateStage::Stream;
        let hash = self.stream(handle, &body.path, size).await?;

        *stage = PopulateStage::Finalize;
        self.store.update_content_hash(worker_id, &hash).await?;

        Ok(PopulatedContent { size, hash })
    }

    fn scratch_dir(&self) -> Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("sworker-body-");
        let dir = match &self.config.scratch_dir {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    /// Copy `path` into the slot behind `handle`, returning the digest.
    async fn stream(&self, handle: RowHandle, path: &Path, size: u64) -> Result<ContentHash> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; self.config.chunk_size.max(1)];
        let mut offset: u64 = 0;

        loop {
            let filled = read_chunk(&mut file, &mut buf).await?;
            if filled == 0 {
                break;
            }
            if offset + filled as u64 > size {
                return Err(WorkerError::corrupt(format!(
                    "body grew past its allocated {size} bytes"
                )));
            }

            let chunk = &buf[..filled];
            hasher.update(chunk);
            self.store
                .write_content_chunk(handle, offset, chunk.to_vec())
                .await?;
            offset += filled as u64;
        }

        if offset != size {
            return Err(WorkerError::corrupt(format!(
                "body ended after {offset} of {size} allocated bytes"
            )));
        }

        Ok(ContentHash::from_hasher(hasher))
    }
}

async fn discard(store: &WorkerStore, worker_id: &WorkerId) {
    match store.discard_unfinished_content(worker_id).await {
        Ok(true) => debug!(worker_id = %worker_id, "Discarded unfinished content"),
        Ok(false) => {}
        Err(err) => error!(
            worker_id = %worker_id,
            error = %err,
            "Failed to discard unfinished content; record must be deleted"
        ),
    }
}

/// Discards an allocated slot when a population future is dropped midway.
///
/// Holds the caller's per-id lock, if any, and hands it to the cleanup task
/// so no new population for the id starts before the discard lands.
struct PendingDiscard {
    store: WorkerStore,
    worker_id: WorkerId,
    lock: Option<OwnedMutexGuard<()>>,
    armed: bool,
}

impl PendingDiscard {
    fn new(store: WorkerStore, worker_id: WorkerId, lock: Option<OwnedMutexGuard<()>>) -> Self {
        Self {
            store,
            worker_id,
            lock,
            armed: false,
        }
    }

    fn arm(&mut self) {
        self.armed = true;
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingDiscard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(
                worker_id = %self.worker_id,
                "Population dropped outside a runtime; unfinished content left behind"
            );
            return;
        };

        warn!(worker_id = %self.worker_id, "Population dropped after allocation, discarding");
        let store = self.store.clone();
        let worker_id = self.worker_id.clone();
        let lock = self.lock.take();
        runtime.spawn(async move {
            let _lock = lock;
            discard(&store, &worker_id).await;
        });
    }
}

/// Fill `buf` from `file`, stopping early only at end of file.
async fn read_chunk(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
