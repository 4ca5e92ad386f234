use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use tierflow_core::audit::{seal, verify_events, AuditEvent, ChainVerification};
use tierflow_core::domain::delegation::{DelegationId, DelegationRecord};
use tierflow_core::domain::instance::InstanceId;

use super::{AuditRepository, DelegationRepository, RepositoryError};

#[derive(Default)]
pub struct InMemoryDelegationRepository {
    records: RwLock<HashMap<String, DelegationRecord>>,
}

#[async_trait::async_trait]
impl DelegationRepository for InMemoryDelegationRepository {
    async fn find_by_id(
        &self,
        id: &DelegationId,
    ) -> Result<Option<DelegationRecord>, RepositoryError> {
        let records = self.records.read().await;
        Ok(records.get(id.as_str()).cloned())
    }

    async fn save(&self, record: DelegationRecord) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        records.insert(record.id.0.clone(), record);
        Ok(())
    }

    async fn list_for_delegator(
        &self,
        delegator_id: &str,
    ) -> Result<Vec<DelegationRecord>, RepositoryError> {
        let records = self.records.read().await;
        let mut matching: Vec<DelegationRecord> = records
            .values()
            .filter(|record| record.delegator_id == delegator_id)
            .cloned()
            .collect();
        matching.sort_by(|left, right| {
            right.created_at.cmp(&left.created_at).then_with(|| right.id.cmp(&left.id))
        });
        Ok(matching)
    }

    async fn list_active_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<DelegationRecord>, RepositoryError> {
        let records = self.records.read().await;
        let mut active: Vec<DelegationRecord> =
            records.values().filter(|record| record.is_effective_at(now)).cloned().collect();
        active.sort_by(|left, right| left.id.cmp(&right.id));
        Ok(active)
    }
}

#[derive(Default)]
pub struct InMemoryAuditRepository {
    chains: RwLock<HashMap<String, Vec<AuditEvent>>>,
}

#[async_trait::async_trait]
impl AuditRepository for InMemoryAuditRepository {
    async fn append(&self, event: AuditEvent) -> Result<AuditEvent, RepositoryError> {
        let mut chains = self.chains.write().await;
        let chain = chains.entry(event.chain_key().to_string()).or_default();
        let sealed = seal(event, chain.last());
        chain.push(sealed.clone());
        Ok(sealed)
    }

    async fn list_chain(&self, chain_key: &str) -> Result<Vec<AuditEvent>, RepositoryError> {
        let chains = self.chains.read().await;
        Ok(chains.get(chain_key).cloned().unwrap_or_default())
    }

    async fn list_for_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Vec<AuditEvent>, RepositoryError> {
        self.list_chain(instance_id.as_str()).await
    }

    async fn verify_chain(&self, chain_key: &str) -> Result<ChainVerification, RepositoryError> {
        let chains = self.chains.read().await;
        let events = chains.get(chain_key).map(Vec::as_slice).unwrap_or_default();
        Ok(verify_events(chain_key, events))
    }
}
