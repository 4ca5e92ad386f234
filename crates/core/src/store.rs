use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::instance::{InstanceId, InstanceStatus, WorkflowInstance};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("instance `{0}` not found")]
    NotFound(InstanceId),
    #[error("instance `{instance_id}` is at version {actual}, expected {expected}")]
    VersionConflict { instance_id: InstanceId, expected: u64, actual: u64 },
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Persistence collaborator. `save` is an optimistic write: it succeeds only when the
/// stored version still equals `expected_version` (0 means "not stored yet").
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn load(&self, id: &InstanceId) -> Result<WorkflowInstance, StoreError>;
    async fn save(
        &self,
        instance: &WorkflowInstance,
        expected_version: u64,
    ) -> Result<(), StoreError>;
    async fn list_by_status(
        &self,
        status: InstanceStatus,
    ) -> Result<Vec<WorkflowInstance>, StoreError>;
}

#[derive(Clone, Default)]
pub struct InMemoryInstanceStore {
    instances: Arc<Mutex<HashMap<InstanceId, WorkflowInstance>>>,
}

impl InMemoryInstanceStore {
    fn guard(&self) -> MutexGuard<'_, HashMap<InstanceId, WorkflowInstance>> {
        match self.instances.lock() {
            Ok(instances) => instances,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn load(&self, id: &InstanceId) -> Result<WorkflowInstance, StoreError> {
        self.guard().get(id).cloned().ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn save(
        &self,
        instance: &WorkflowInstance,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let mut instances = self.guard();
        let actual = instances.get(&instance.id).map(|stored| stored.version).unwrap_or(0);
        if actual != expected_version {
            return Err(StoreError::VersionConflict {
                instance_id: instance.id.clone(),
                expected: expected_version,
                actual,
            });
        }
        instances.insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn list_by_status(
        &self,
        status: InstanceStatus,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let mut matching: Vec<WorkflowInstance> = self
            .guard()
            .values()
            .filter(|instance| instance.status == status)
            .cloned()
            .collect();
        matching.sort_by(|left, right| left.id.cmp(&right.id));
        Ok(matching)
    }
}
