use chrono::Utc;
use serde::Serialize;
use tracing::warn;

use tierflow_core::config::AppConfig;
use tierflow_core::{EscalationMonitor, InMemoryAuditSink, SweepReport, TracingNotifier};
use tierflow_db::{AuditRepository, DbPool, SqlAuditRepository, SqlInstanceStore};

use crate::commands::{load_config, open_database, runtime, CommandFailure, CommandResult};

#[derive(Debug, Serialize)]
pub(crate) struct SweepSummary {
    #[serde(flatten)]
    pub report: SweepReport,
    pub audit_events_persisted: usize,
}

pub fn run() -> CommandResult {
    let result = load_config().and_then(|config| {
        runtime()?.block_on(async {
            let pool = open_database(&config).await?;
            let summary = sweep_once(&pool, &config).await;
            pool.close().await;
            summary
        })
    });

    match result {
        Ok(summary) => match serde_json::to_string(&summary) {
            Ok(message) => CommandResult::success("sweep", message),
            Err(error) => CommandResult::failure("sweep", "serialization", error.to_string(), 6),
        },
        Err(failure) => CommandResult::from_failure("sweep", failure),
    }
}

/// Runs one escalation pass over the stored instances and appends the resulting audit
/// events to the hash-chained log.
pub(crate) async fn sweep_once(
    pool: &DbPool,
    config: &AppConfig,
) -> Result<SweepSummary, CommandFailure> {
    let store = SqlInstanceStore::new(pool.clone());
    let monitor = EscalationMonitor::from_config(config);
    let sink = InMemoryAuditSink::default();

    let report = monitor
        .sweep_store(&store, &sink, &TracingNotifier, Utc::now())
        .await
        .map_err(|error| CommandFailure::new("sweep", error.to_string(), 6))?;

    let audit = SqlAuditRepository::new(pool.clone());
    let mut persisted = 0;
    for event in sink.events() {
        let event_type = event.event_type.clone();
        if let Err(error) = audit.append(event).await {
            warn!(
                event_name = "escalation.sweep.audit_failed",
                event_type = %event_type,
                error = %error,
                "failed to persist sweep audit event"
            );
            return Err(CommandFailure::new("audit", error.to_string(), 6));
        }
        persisted += 1;
    }

    Ok(SweepSummary { report, audit_events_persisted: persisted })
}
