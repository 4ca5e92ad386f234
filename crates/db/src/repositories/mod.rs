use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use tierflow_core::audit::{AuditEvent, ChainVerification};
use tierflow_core::domain::delegation::{DelegationId, DelegationRecord};
use tierflow_core::domain::instance::InstanceId;
use tierflow_core::store::StoreError;

pub mod audit;
pub mod delegation;
pub mod instance;
pub mod memory;

pub use audit::SqlAuditRepository;
pub use delegation::SqlDelegationRepository;
pub use instance::SqlInstanceStore;
pub use memory::{InMemoryAuditRepository, InMemoryDelegationRepository};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for StoreError {
    fn from(error: RepositoryError) -> Self {
        StoreError::Backend(error.to_string())
    }
}

#[async_trait]
pub trait DelegationRepository: Send + Sync {
    async fn find_by_id(
        &self,
        id: &DelegationId,
    ) -> Result<Option<DelegationRecord>, RepositoryError>;
    /// Inserts or updates; revocation is a save with `active = false`, never a delete.
    async fn save(&self, record: DelegationRecord) -> Result<(), RepositoryError>;
    async fn list_for_delegator(
        &self,
        delegator_id: &str,
    ) -> Result<Vec<DelegationRecord>, RepositoryError>;
    async fn list_active_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<DelegationRecord>, RepositoryError>;
}

#[async_trait]
pub trait AuditRepository: Send + Sync {
    /// Seals `event` against the latest entry of its chain and stores it.
    async fn append(&self, event: AuditEvent) -> Result<AuditEvent, RepositoryError>;
    async fn list_chain(&self, chain_key: &str) -> Result<Vec<AuditEvent>, RepositoryError>;
    async fn list_for_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Vec<AuditEvent>, RepositoryError>;
    async fn verify_chain(&self, chain_key: &str) -> Result<ChainVerification, RepositoryError>;
}

pub(crate) fn decode<E: std::fmt::Display>(error: E) -> RepositoryError {
    RepositoryError::Decode(error.to_string())
}

pub(crate) fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("{column}: {error}")))
}
