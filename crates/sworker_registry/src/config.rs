//! Registry configuration.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;

use crate::instance::{ClientsDelegate, NoopDelegate, WorkerDelegate};

/// Reference copy granularity when streaming a body into storage.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

const CHUNK_SIZE_ENV: &str = "SWORKER_CHUNK_SIZE";
const SCRATCH_DIR_ENV: &str = "SWORKER_SCRATCH_DIR";
const HOME_ENV: &str = "SWORKER_HOME";

/// Settings for the content population pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentConfig {
    /// Bytes copied per chunk from the scratch file into the content BLOB.
    pub chunk_size: usize,
    /// Parent directory for download scratch space. `None` uses the system
    /// temp directory.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            scratch_dir: None,
        }
    }
}

impl ContentConfig {
    /// Defaults overridden by `SWORKER_CHUNK_SIZE` and `SWORKER_SCRATCH_DIR`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var(CHUNK_SIZE_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(size) if size > 0 => config.chunk_size = size,
                _ => warn!(value = %raw, "Ignoring invalid {}", CHUNK_SIZE_ENV),
            }
        }
        if let Ok(dir) = std::env::var(SCRATCH_DIR_ENV) {
            if !dir.trim().is_empty() {
                config.scratch_dir = Some(PathBuf::from(dir));
            }
        }

        config
    }
}

/// Everything a [`crate::WorkerRegistry`] threads into the instances it builds.
#[derive(Clone)]
pub struct RegistryConfig {
    pub clients_delegate: Arc<dyn ClientsDelegate>,
    pub worker_delegate: Arc<dyn WorkerDelegate>,
    pub content: ContentConfig,
}

impl RegistryConfig {
    pub fn new(
        clients_delegate: Arc<dyn ClientsDelegate>,
        worker_delegate: Arc<dyn WorkerDelegate>,
    ) -> Self {
        Self {
            clients_delegate,
            worker_delegate,
            content: ContentConfig::default(),
        }
    }

    pub fn with_content(mut self, content: ContentConfig) -> Self {
        self.content = content;
        self
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        let noop = Arc::new(NoopDelegate);
        Self::new(noop.clone(), noop)
    }
}

impl std::fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("content", &self.content)
            .finish_non_exhaustive()
    }
}

/// Get the sworker home directory: `$SWORKER_HOME` or `~/.sworker`.
pub fn sworker_home() -> Option<PathBuf> {
    if let Ok(override_path) = std::env::var(HOME_ENV) {
        if !override_path.trim().is_empty() {
            return Some(PathBuf::from(override_path));
        }
    }
    dirs::home_dir().map(|home| home.join(".sworker"))
}

/// Default location of the worker database: `<home>/workers.sqlite3`.
pub fn default_store_path() -> Option<PathBuf> {
    sworker_home().map(|home| home.join("workers.sqlite3"))
}
