//! Worker script registry.
//!
//! Tracks downloadable worker scripts for a host application: one live
//! [`WorkerInstance`] per worker id, durable records in SQLite, write-once
//! script content streamed in with its SHA-256, and conditional update
//! requests built from the validators recorded with that content.
//!
//! # Usage
//!
//! ```rust,ignore
//! use sworker_registry::{
//!     default_store_path, InstallState, RegistryConfig, WorkerRegistry, WorkerStore,
//! };
//!
//! let store = WorkerStore::open(default_store_path().unwrap()).await?;
//! let registry = WorkerRegistry::new(store, RegistryConfig::default());
//!
//! let worker = registry.create("https://example.com/worker.js", &registration).await?;
//! registry.update_content(&worker, &response).await?;
//! registry.update_state(&worker, InstallState::Installed).await?;
//!
//! // Later, from the update orchestrator:
//! let request = registry.build_update_request(&worker).await?;
//! ```
//!
//! Fetching, executing scripts and deciding when to check for updates are the
//! host's business.

mod compare;
mod config;
mod content;
mod error;
mod instance;
mod locks;
mod record;
mod registry;
mod store;
mod update_request;

pub use compare::is_byte_identical;
pub use config::{
    default_store_path, sworker_home, ContentConfig, RegistryConfig, DEFAULT_CHUNK_SIZE,
};
pub use content::{
    ContentStreamWriter, DownloadedBody, PopulateStage, PopulatedContent, ScriptResponse,
};
pub use error::{ErrorKind, Result, WorkerError};
pub use instance::{
    ClientsDelegate, NoopDelegate, Registration, WorkerDelegate, WorkerInstance,
};
pub use record::{
    ContentHash, ContentState, InstallState, ResponseHeaders, RowHandle, WorkerRecord,
};
pub use registry::WorkerRegistry;
pub use store::WorkerStore;
pub use update_request::build_update_request;

pub use sworker_ids::{RegistrationId, WorkerId};
