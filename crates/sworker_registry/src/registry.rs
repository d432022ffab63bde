//! The worker registry: entry point for every worker operation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use http::Request;
use sworker_ids::{RegistrationId, WorkerId};
use tracing::{debug, info};

use crate::compare::is_byte_identical;
use crate::config::RegistryConfig;
use crate::content::{ContentStreamWriter, PopulatedContent, ScriptResponse};
use crate::error::{Result, WorkerError};
use crate::instance::{Registration, WorkerInstance};
use crate::locks::WorkerLocks;
use crate::record::{InstallState, WorkerRecord};
use crate::store::WorkerStore;
use crate::update_request::build_update_request;

/// Deduplicating factory for [`WorkerInstance`]s over a [`WorkerStore`].
///
/// The store is the source of truth. The registry only remembers instances
/// through weak handles, so dropping the last `Arc` releases an instance and
/// the next `get` rebuilds it from the store.
pub struct WorkerRegistry {
    store: WorkerStore,
    config: RegistryConfig,
    live: Mutex<HashMap<WorkerId, Weak<WorkerInstance>>>,
    locks: WorkerLocks,
}

impl WorkerRegistry {
    pub fn new(store: WorkerStore, config: RegistryConfig) -> Self {
        Self {
            store,
            config,
            live: Mutex::new(HashMap::new()),
            locks: WorkerLocks::default(),
        }
    }

    pub fn store(&self) -> &WorkerStore {
        &self.store
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Return the live instance for `id`, loading it from the store if needed.
    pub async fn get(
        &self,
        id: &WorkerId,
        registration: &dyn Registration,
    ) -> Result<Arc<WorkerInstance>> {
        if let Some(instance) = self.live_instance(id) {
            check_registration(id, instance.registration_id(), registration.id())?;
            return Ok(instance);
        }

        let _guard = self.locks.acquire(id).await;

        let record = self
            .store
            .select_by_id(id)
            .await?
            .ok_or_else(|| WorkerError::NotFound(id.clone()))?;
        check_registration(id, &record.registration_id, registration.id())?;

        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = live.get(id).and_then(Weak::upgrade) {
            check_registration(id, existing.registration_id(), registration.id())?;
            return Ok(existing);
        }

        live.retain(|_, entry| entry.strong_count() > 0);
        let instance = Arc::new(WorkerInstance::from_record(
            record,
            self.config.clients_delegate.clone(),
            self.config.worker_delegate.clone(),
        ));
        live.insert(id.clone(), Arc::downgrade(&instance));
        debug!(worker_id = %id, "Constructed worker instance");

        Ok(instance)
    }

    /// Insert a new installing worker for `url` and return its instance.
    pub async fn create(
        &self,
        url: &str,
        registration: &dyn Registration,
    ) -> Result<Arc<WorkerInstance>> {
        let record = WorkerRecord::new(url, registration.id().clone());
        let id = record.id.clone();
        self.store.insert(&record).await?;

        info!(worker_id = %id, registration_id = %registration.id(), url, "Created worker");
        self.get(&id, registration).await
    }

    /// Persist a new install state, then mirror it on the instance.
    ///
    /// If persisting fails the instance keeps its previous state.
    pub async fn update_state(&self, instance: &WorkerInstance, state: InstallState) -> Result<()> {
        let _guard = instance.update_lock.lock().await;
        self.store.update_install_state(instance.id(), state).await?;
        instance.set_install_state(state);

        info!(worker_id = %instance.id(), state = %state, "Worker state changed");
        Ok(())
    }

    /// Store the script body of `response` as this worker's content.
    ///
    /// Succeeds once per worker; later calls fail with `AlreadyPopulated`.
    /// Calls for the same worker run one at a time. Dropping the future after
    /// the content slot is allocated discards the slot in the background
    /// before the next call for this worker can start.
    pub async fn update_content<R>(
        &self,
        instance: &WorkerInstance,
        response: &R,
    ) -> Result<PopulatedContent>
    where
        R: ScriptResponse + ?Sized,
    {
        let guard = self.locks.acquire(instance.id()).await;
        ContentStreamWriter::new(&self.store, &self.config.content)
            .populate_holding(instance.id(), response, Some(guard))
            .await
    }

    /// Delete the worker's record and forget its instance.
    ///
    /// Callers still holding the instance may keep using it in memory, but
    /// no `get` will return it or find the record again.
    pub async fn delete(&self, instance: &WorkerInstance) -> Result<()> {
        let id = instance.id();
        let _guard = self.locks.acquire(id).await;

        let existed = self.store.delete(id).await?;
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);

        info!(worker_id = %id, existed, "Deleted worker");
        Ok(())
    }

    /// Conditional GET for refreshing this worker's script.
    pub async fn build_update_request(&self, instance: &WorkerInstance) -> Result<Request<()>> {
        let record = self
            .store
            .select_by_id(instance.id())
            .await?
            .ok_or_else(|| WorkerError::NotFound(instance.id().clone()))?;
        build_update_request(&record)
    }

    /// Whether two stored workers hold the same script bytes.
    pub async fn is_byte_identical(&self, a: &WorkerId, b: &WorkerId) -> Result<bool> {
        is_byte_identical(&self.store, a, b).await
    }

    /// Number of instances currently alive somewhere in the host.
    pub fn live_instances(&self) -> usize {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        live.retain(|_, entry| entry.strong_count() > 0);
        live.len()
    }

    fn live_instance(&self, id: &WorkerId) -> Option<Arc<WorkerInstance>> {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .and_then(Weak::upgrade)
    }
}

fn check_registration(
    id: &WorkerId,
    expected: &RegistrationId,
    actual: &RegistrationId,
) -> Result<()> {
    if expected != actual {
        return Err(WorkerError::IdentityMismatch {
            worker_id: id.clone(),
            expected: expected.clone(),
            actual: actual.clone(),
        });
    }
    Ok(())
}
