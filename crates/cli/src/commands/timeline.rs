use tierflow_core::{timeline, InstanceId, InstanceStore, StoreError};
use tierflow_db::SqlInstanceStore;

use crate::commands::{load_config, open_database, runtime, CommandFailure, CommandResult};

pub fn run(instance_id: &str) -> CommandResult {
    let result = load_config().and_then(|config| {
        runtime()?.block_on(async {
            let pool = open_database(&config).await?;
            let store = SqlInstanceStore::new(pool.clone());
            let loaded = store.load(&InstanceId::new(instance_id)).await;
            pool.close().await;

            let instance = loaded.map_err(|error| match error {
                StoreError::NotFound(id) => CommandFailure::new(
                    "not_found",
                    format!("workflow instance `{id}` not found"),
                    7,
                ),
                other => CommandFailure::new("db_connectivity", other.to_string(), 4),
            })?;
            serde_json::to_string(&timeline(&instance))
                .map_err(|error| CommandFailure::new("serialization", error.to_string(), 6))
        })
    });

    match result {
        Ok(message) => CommandResult::success("timeline", message),
        Err(failure) => CommandResult::from_failure("timeline", failure),
    }
}
