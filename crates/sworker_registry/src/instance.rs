//! Live worker instances and the collaborators injected into them.

use std::sync::{Arc, PoisonError, RwLock};

use sworker_ids::{RegistrationId, WorkerId};
use tokio::sync::Mutex;

use crate::record::{InstallState, WorkerRecord};

/// The registration a caller is acting for. Only its id is consulted.
pub trait Registration: Send + Sync {
    fn id(&self) -> &RegistrationId;
}

impl Registration for RegistrationId {
    fn id(&self) -> &RegistrationId {
        self
    }
}

/// Host-side handle for the clients a worker controls. Never invoked here.
pub trait ClientsDelegate: Send + Sync {}

/// Host-side handle used by the worker's execution environment. Never
/// invoked here.
pub trait WorkerDelegate: Send + Sync {}

/// Delegate that does nothing; the default for hosts without one.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDelegate;

impl ClientsDelegate for NoopDelegate {}
impl WorkerDelegate for NoopDelegate {}

/// In-memory representation of a stored worker.
///
/// Obtained from [`crate::WorkerRegistry`], which hands out at most one live
/// instance per id. Only the install state changes after construction.
pub struct WorkerInstance {
    id: WorkerId,
    registration_id: RegistrationId,
    url: String,
    state: RwLock<InstallState>,
    clients_delegate: Arc<dyn ClientsDelegate>,
    worker_delegate: Arc<dyn WorkerDelegate>,
    // Serializes persist-then-set state updates.
    pub(crate) update_lock: Mutex<()>,
}

impl WorkerInstance {
    pub(crate) fn from_record(
        record: WorkerRecord,
        clients_delegate: Arc<dyn ClientsDelegate>,
        worker_delegate: Arc<dyn WorkerDelegate>,
    ) -> Self {
        Self {
            id: record.id,
            registration_id: record.registration_id,
            url: record.url,
            state: RwLock::new(record.install_state),
            clients_delegate,
            worker_delegate,
            update_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn registration_id(&self) -> &RegistrationId {
        &self.registration_id
    }

    /// The originally requested script URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn install_state(&self) -> InstallState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_install_state(&self, state: InstallState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn clients_delegate(&self) -> &Arc<dyn ClientsDelegate> {
        &self.clients_delegate
    }

    pub fn worker_delegate(&self) -> &Arc<dyn WorkerDelegate> {
        &self.worker_delegate
    }
}

impl std::fmt::Debug for WorkerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerInstance")
            .field("id", &self.id)
            .field("registration_id", &self.registration_id)
            .field("url", &self.url)
            .field("install_state", &self.install_state())
            .finish_non_exhaustive()
    }
}
