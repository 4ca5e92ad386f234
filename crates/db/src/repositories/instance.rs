use async_trait::async_trait;
use sqlx::Row;
use tracing::debug;

use tierflow_core::domain::instance::{InstanceId, InstanceStatus, WorkflowInstance};
use tierflow_core::store::{InstanceStore, StoreError};

use super::{decode, RepositoryError};
use crate::DbPool;

/// Instances are stored as a JSON body plus the columns needed for filtering and for
/// the optimistic version check.
pub struct SqlInstanceStore {
    pool: DbPool,
}

impl SqlInstanceStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn stored_version(&self, id: &InstanceId) -> Result<Option<u64>, RepositoryError> {
        let row = sqlx::query("SELECT version FROM workflow_instance WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            row.try_get::<i64, _>("version").map(|version| version as u64).map_err(decode)
        })
        .transpose()
    }
}

fn row_to_instance(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowInstance, RepositoryError> {
    let body: String = row.try_get("body").map_err(decode)?;
    let version: i64 = row.try_get("version").map_err(decode)?;
    let mut instance: WorkflowInstance = serde_json::from_str(&body).map_err(decode)?;
    instance.version = version as u64;
    Ok(instance)
}

#[async_trait]
impl InstanceStore for SqlInstanceStore {
    async fn load(&self, id: &InstanceId) -> Result<WorkflowInstance, StoreError> {
        let row = sqlx::query("SELECT body, version FROM workflow_instance WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(RepositoryError::from)?;

        match row {
            Some(ref row) => Ok(row_to_instance(row)?),
            None => Err(StoreError::NotFound(id.clone())),
        }
    }

    async fn save(
        &self,
        instance: &WorkflowInstance,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let body = serde_json::to_string(instance).map_err(decode)?;
        let version = instance.version as i64;

        let result = if expected_version == 0 {
            sqlx::query(
                "INSERT INTO workflow_instance (id, document_kind, document_id, requested_by,
                                                status, current_step_order, version, body,
                                                created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                     status = excluded.status,
                     current_step_order = excluded.current_step_order,
                     version = excluded.version,
                     body = excluded.body,
                     updated_at = excluded.updated_at
                 WHERE workflow_instance.version = 0",
            )
            .bind(instance.id.as_str())
            .bind(&instance.document_ref.kind)
            .bind(&instance.document_ref.id)
            .bind(&instance.requested_by)
            .bind(instance.status.as_str())
            .bind(instance.current_step_order)
            .bind(version)
            .bind(&body)
            .bind(instance.created_at.to_rfc3339())
            .bind(instance.updated_at.to_rfc3339())
            .execute(&self.pool)
            .await
        } else {
            sqlx::query(
                "UPDATE workflow_instance
                 SET status = ?, current_step_order = ?, version = ?, body = ?, updated_at = ?
                 WHERE id = ? AND version = ?",
            )
            .bind(instance.status.as_str())
            .bind(instance.current_step_order)
            .bind(version)
            .bind(&body)
            .bind(instance.updated_at.to_rfc3339())
            .bind(instance.id.as_str())
            .bind(expected_version as i64)
            .execute(&self.pool)
            .await
        }
        .map_err(RepositoryError::from)?;

        if result.rows_affected() == 0 {
            let actual = self.stored_version(&instance.id).await?.unwrap_or(0);
            debug!(
                event_name = "store.version_conflict",
                instance_id = %instance.id,
                expected = expected_version,
                actual,
                "optimistic write rejected"
            );
            return Err(StoreError::VersionConflict {
                instance_id: instance.id.clone(),
                expected: expected_version,
                actual,
            });
        }

        Ok(())
    }

    async fn list_by_status(
        &self,
        status: InstanceStatus,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let rows = sqlx::query(
            "SELECT body, version FROM workflow_instance WHERE status = ? ORDER BY id ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.iter().map(row_to_instance).collect::<Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use tierflow_core::domain::instance::{
        ApproverSlot, DocumentRef, InstanceId, InstanceStatus, Step, StepType, WorkflowInstance,
    };
    use tierflow_core::store::{InstanceStore, StoreError};

    use super::SqlInstanceStore;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn started_instance(id: &str) -> WorkflowInstance {
        let now = Utc::now();
        let mut instance = WorkflowInstance::new(
            id,
            DocumentRef::new("capex", format!("CX-{id}")),
            "u-requestor",
            vec![Step::new("s1", 1, "Controller", StepType::Approval, 1)
                .with_approver(ApproverSlot::new("u-controller", "Controller"))],
            now,
        )
        .expect("valid chain");
        instance.start(now).expect("start");
        instance
    }

    #[tokio::test]
    async fn save_and_load_round_trips_the_instance() {
        let store = SqlInstanceStore::new(setup().await);
        let instance = started_instance("WF-1");

        store.save(&instance, 0).await.expect("insert");
        let loaded = store.load(&instance.id).await.expect("load");

        assert_eq!(loaded, instance);
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn stale_write_reports_the_stored_version() {
        let store = SqlInstanceStore::new(setup().await);
        let mut instance = started_instance("WF-2");
        store.save(&instance, 0).await.expect("insert");

        let mut concurrent = instance.clone();
        concurrent.touch(Utc::now());
        store.save(&concurrent, 1).await.expect("first writer wins");

        instance.touch(Utc::now());
        let error = store.save(&instance, 1).await.expect_err("second writer is stale");
        assert_eq!(
            error,
            StoreError::VersionConflict { instance_id: instance.id.clone(), expected: 1, actual: 2 }
        );
    }

    #[tokio::test]
    async fn insert_over_an_existing_row_conflicts() {
        let store = SqlInstanceStore::new(setup().await);
        let instance = started_instance("WF-3");
        store.save(&instance, 0).await.expect("insert");

        assert!(matches!(
            store.save(&instance, 0).await,
            Err(StoreError::VersionConflict { actual: 1, .. })
        ));
    }

    #[tokio::test]
    async fn missing_instance_is_not_found() {
        let store = SqlInstanceStore::new(setup().await);
        let missing = InstanceId::new("WF-missing");
        assert_eq!(store.load(&missing).await, Err(StoreError::NotFound(missing.clone())));
    }

    #[tokio::test]
    async fn list_by_status_filters_rows() {
        let store = SqlInstanceStore::new(setup().await);
        let first = started_instance("WF-a");
        let mut second = started_instance("WF-b");
        store.save(&first, 0).await.expect("insert a");
        store.save(&second, 0).await.expect("insert b");

        second.status = InstanceStatus::Cancelled;
        second.touch(Utc::now());
        store.save(&second, 1).await.expect("cancel b");

        let in_progress = store.list_by_status(InstanceStatus::InProgress).await.expect("list");
        assert_eq!(in_progress.len(), 1);
        assert_eq!(in_progress[0].id, first.id);
    }
}
