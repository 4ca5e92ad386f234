use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use sqlx::Row;

use tierflow_core::domain::delegation::{DelegationId, DelegationRecord};

use super::{decode, parse_timestamp, DelegationRepository, RepositoryError};
use crate::DbPool;

const SELECT_COLUMNS: &str = "SELECT id, delegator_id, delegate_id, start_date, end_date,
                                     categories_json, active, created_at, revoked_at
                              FROM delegation_record";

pub struct SqlDelegationRepository {
    pool: DbPool,
}

impl SqlDelegationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<DelegationRecord, RepositoryError> {
    let id: String = row.try_get("id").map_err(decode)?;
    let delegator_id: String = row.try_get("delegator_id").map_err(decode)?;
    let delegate_id: String = row.try_get("delegate_id").map_err(decode)?;
    let start_date: String = row.try_get("start_date").map_err(decode)?;
    let end_date: String = row.try_get("end_date").map_err(decode)?;
    let categories_json: String = row.try_get("categories_json").map_err(decode)?;
    let active: i64 = row.try_get("active").map_err(decode)?;
    let created_at: String = row.try_get("created_at").map_err(decode)?;
    let revoked_at: Option<String> = row.try_get("revoked_at").map_err(decode)?;

    let categories: BTreeSet<String> = serde_json::from_str(&categories_json).map_err(decode)?;

    Ok(DelegationRecord {
        id: DelegationId(id),
        delegator_id,
        delegate_id,
        start_date: parse_timestamp("start_date", &start_date)?,
        end_date: parse_timestamp("end_date", &end_date)?,
        categories,
        active: active != 0,
        created_at: parse_timestamp("created_at", &created_at)?,
        revoked_at: revoked_at.map(|value| parse_timestamp("revoked_at", &value)).transpose()?,
    })
}

#[async_trait::async_trait]
impl DelegationRepository for SqlDelegationRepository {
    async fn find_by_id(
        &self,
        id: &DelegationId,
    ) -> Result<Option<DelegationRecord>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn save(&self, record: DelegationRecord) -> Result<(), RepositoryError> {
        let categories_json = serde_json::to_string(&record.categories).map_err(decode)?;

        sqlx::query(
            "INSERT INTO delegation_record (id, delegator_id, delegate_id, start_date, end_date,
                                            categories_json, active, created_at, revoked_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 start_date = excluded.start_date,
                 end_date = excluded.end_date,
                 categories_json = excluded.categories_json,
                 active = excluded.active,
                 revoked_at = excluded.revoked_at",
        )
        .bind(record.id.as_str())
        .bind(&record.delegator_id)
        .bind(&record.delegate_id)
        .bind(record.start_date.to_rfc3339())
        .bind(record.end_date.to_rfc3339())
        .bind(&categories_json)
        .bind(i64::from(record.active))
        .bind(record.created_at.to_rfc3339())
        .bind(record.revoked_at.map(|at| at.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_for_delegator(
        &self,
        delegator_id: &str,
    ) -> Result<Vec<DelegationRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE delegator_id = ? ORDER BY created_at DESC, id DESC"
        ))
        .bind(delegator_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect::<Result<Vec<_>, _>>()
    }

    async fn list_active_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<DelegationRecord>, RepositoryError> {
        // Timestamps are compared after decoding; RFC3339 offsets make string order unsafe.
        let rows = sqlx::query(&format!("{SELECT_COLUMNS} WHERE active = 1 ORDER BY id ASC"))
            .fetch_all(&self.pool)
            .await?;

        let records = rows.iter().map(row_to_record).collect::<Result<Vec<_>, _>>()?;
        Ok(records.into_iter().filter(|record| record.is_effective_at(now)).collect())
    }
}
