use std::collections::BTreeMap;

use sqlx::Row;
use tracing::debug;

use tierflow_core::audit::{
    seal, verify_events, AuditCategory, AuditEvent, AuditOutcome, ChainVerification,
};
use tierflow_core::domain::instance::InstanceId;

use super::{decode, parse_timestamp, AuditRepository, RepositoryError};
use crate::DbPool;

const SELECT_COLUMNS: &str = "SELECT id, sequence, instance_id, subject_id, correlation_id,
                                     event_type, category, actor, outcome, metadata_json,
                                     occurred_at, prev_hash, entry_hash
                              FROM audit_event";

/// Hash-chained audit log. Appends run in a transaction so two writers cannot take the
/// same sequence number; the `(chain_key, sequence)` unique index backs that up.
pub struct SqlAuditRepository {
    pool: DbPool,
}

impl SqlAuditRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<AuditEvent, RepositoryError> {
    let event_id: String = row.try_get("id").map_err(decode)?;
    let sequence: i64 = row.try_get("sequence").map_err(decode)?;
    let instance_id: Option<String> = row.try_get("instance_id").map_err(decode)?;
    let subject_id: Option<String> = row.try_get("subject_id").map_err(decode)?;
    let correlation_id: String = row.try_get("correlation_id").map_err(decode)?;
    let event_type: String = row.try_get("event_type").map_err(decode)?;
    let category: String = row.try_get("category").map_err(decode)?;
    let actor: String = row.try_get("actor").map_err(decode)?;
    let outcome: String = row.try_get("outcome").map_err(decode)?;
    let metadata_json: String = row.try_get("metadata_json").map_err(decode)?;
    let occurred_at: String = row.try_get("occurred_at").map_err(decode)?;
    let prev_hash: Option<String> = row.try_get("prev_hash").map_err(decode)?;
    let entry_hash: String = row.try_get("entry_hash").map_err(decode)?;

    let category = AuditCategory::parse(&category)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown audit category `{category}`")))?;
    let outcome = AuditOutcome::parse(&outcome)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown audit outcome `{outcome}`")))?;
    let metadata: BTreeMap<String, String> =
        serde_json::from_str(&metadata_json).map_err(decode)?;

    Ok(AuditEvent {
        event_id,
        instance_id: instance_id.map(InstanceId),
        subject_id,
        correlation_id,
        event_type,
        category,
        actor,
        outcome,
        metadata,
        occurred_at: parse_timestamp("occurred_at", &occurred_at)?,
        sequence: sequence as u64,
        prev_hash,
        entry_hash: Some(entry_hash),
    })
}

#[async_trait::async_trait]
impl AuditRepository for SqlAuditRepository {
    async fn append(&self, event: AuditEvent) -> Result<AuditEvent, RepositoryError> {
        let chain_key = event.chain_key().to_string();
        let mut tx = self.pool.begin().await?;

        let previous = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE chain_key = ? ORDER BY sequence DESC LIMIT 1"
        ))
        .bind(&chain_key)
        .fetch_optional(&mut *tx)
        .await?
        .as_ref()
        .map(row_to_event)
        .transpose()?;

        let sealed = seal(event, previous.as_ref());
        let metadata_json = serde_json::to_string(&sealed.metadata).map_err(decode)?;
        let entry_hash = sealed
            .entry_hash
            .clone()
            .ok_or_else(|| RepositoryError::Decode("sealed event has no entry hash".to_string()))?;

        sqlx::query(
            "INSERT INTO audit_event (id, chain_key, sequence, instance_id, subject_id,
                                      correlation_id, event_type, category, actor, outcome,
                                      metadata_json, occurred_at, prev_hash, entry_hash)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&sealed.event_id)
        .bind(&chain_key)
        .bind(sealed.sequence as i64)
        .bind(sealed.instance_id.as_ref().map(InstanceId::as_str))
        .bind(sealed.subject_id.as_deref())
        .bind(&sealed.correlation_id)
        .bind(&sealed.event_type)
        .bind(sealed.category.as_str())
        .bind(&sealed.actor)
        .bind(sealed.outcome.as_str())
        .bind(&metadata_json)
        .bind(sealed.occurred_at.to_rfc3339())
        .bind(sealed.prev_hash.as_deref())
        .bind(&entry_hash)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(
            event_name = "audit.appended",
            chain_key = %chain_key,
            sequence = sealed.sequence,
            event_type = %sealed.event_type,
            "audit event appended"
        );
        Ok(sealed)
    }

    async fn list_chain(&self, chain_key: &str) -> Result<Vec<AuditEvent>, RepositoryError> {
        let sql = format!("{SELECT_COLUMNS} WHERE chain_key = ? ORDER BY sequence ASC");
        let rows = sqlx::query(&sql)
            .bind(chain_key)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_event).collect::<Result<Vec<_>, _>>()
    }

    async fn list_for_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Vec<AuditEvent>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE instance_id = ? ORDER BY sequence ASC"
        ))
        .bind(instance_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect::<Result<Vec<_>, _>>()
    }

    async fn verify_chain(&self, chain_key: &str) -> Result<ChainVerification, RepositoryError> {
        let events = self.list_chain(chain_key).await?;
        Ok(verify_events(chain_key, &events))
    }
}
