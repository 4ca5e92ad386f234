use std::env;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use chrono::{Duration, Utc};
use serde_json::Value;
use tierflow_cli::commands::{config, migrate, sweep, timeline, watch};
use tierflow_core::config::ENV_KEYS;
use tierflow_core::domain::instance::{
    ApproverSlot, DocumentRef, EscalationAction, Step, StepEscalation, StepType, WorkflowInstance,
};
use tierflow_core::store::InstanceStore;
use tierflow_db::{connect_with_settings, migrations, SqlInstanceStore};

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(&[("TIERFLOW_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn migrate_rejects_non_sqlite_url() {
    with_env(&[("TIERFLOW_DATABASE_URL", "postgres://localhost/tierflow")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn config_reports_env_sources() {
    with_env(
        &[
            ("TIERFLOW_DATABASE_URL", "sqlite::memory:"),
            ("TIERFLOW_ESCALATION_SWEEP_INTERVAL_SECS", "60"),
            ("TIERFLOW_LOG_LEVEL", "debug"),
        ],
        || {
            let result = config::run();
            assert_eq!(result.exit_code, 0);

            let payload = parse_payload(&result.output);
            let message = payload["message"].as_str().expect("message should be a string");
            assert!(message.contains(
                "- escalation.sweep_interval_secs = 60 (source: env (TIERFLOW_ESCALATION_SWEEP_INTERVAL_SECS))"
            ));
            assert!(message.contains("- logging.level = debug (source: env (TIERFLOW_LOG_LEVEL))"));
            assert!(message.contains("- dispatch.critical_hours = 4 (source: "));
        },
    );
}

#[test]
fn config_reports_invalid_log_level() {
    with_env(&[("TIERFLOW_LOGGING_LEVEL", "chatty")], || {
        let result = config::run();
        assert_eq!(result.exit_code, 2);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "config");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn sweep_on_empty_database_scans_nothing() {
    with_env(&[("TIERFLOW_DATABASE_URL", "sqlite::memory:")], || {
        let result = sweep::run();
        assert_eq!(result.exit_code, 0, "{}", result.output);

        let summary = parse_message(&result.output);
        assert_eq!(summary["scanned"], 0);
        assert_eq!(summary["escalated"].as_array().map(Vec::len), Some(0));
        assert_eq!(summary["audit_events_persisted"], 0);
    });
}

#[test]
fn sweep_escalates_overdue_instance_and_persists_audit() {
    let dir = tempfile::tempdir().expect("temp dir");
    let url = file_url(&dir.path().join("tierflow.db"));
    seed_overdue_instance(&url, "WF-1");

    let vars = [
        ("TIERFLOW_DATABASE_URL", url.as_str()),
        ("TIERFLOW_ESCALATION_SYSTEM_ACTOR_ID", "svc-sweeper"),
    ];
    with_env(&vars, || {
        let result = sweep::run();
        assert_eq!(result.exit_code, 0, "{}", result.output);

        let summary = parse_message(&result.output);
        assert_eq!(summary["scanned"], 1);
        assert_eq!(summary["escalated"][0], "WF-1");
        assert_eq!(summary["audit_events_persisted"], 1);

        // The latch holds: a second pass finds nothing new to escalate.
        let second = parse_message(&sweep::run().output);
        assert_eq!(second["scanned"], 1);
        assert_eq!(second["escalated"].as_array().map(Vec::len), Some(0));

        let timeline = timeline::run("WF-1");
        assert_eq!(timeline.exit_code, 0, "{}", timeline.output);
        let entries = parse_message(&timeline.output);
        let kinds: Vec<&str> = entries
            .as_array()
            .expect("timeline should be an array")
            .iter()
            .filter_map(|entry| entry["kind"].as_str())
            .collect();
        assert_eq!(kinds.first(), Some(&"requested"));
        assert!(kinds.contains(&"step_escalated"));
    });
}

#[test]
fn timeline_reports_missing_instance() {
    with_env(&[("TIERFLOW_DATABASE_URL", "sqlite::memory:")], || {
        let result = timeline::run("WF-missing");
        assert_eq!(result.exit_code, 7);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "timeline");
        assert_eq!(payload["error_class"], "not_found");
    });
}

#[test]
fn watch_stops_after_requested_sweeps() {
    with_env(
        &[
            ("TIERFLOW_DATABASE_URL", "sqlite::memory:"),
            ("TIERFLOW_ESCALATION_SWEEP_INTERVAL_SECS", "1"),
        ],
        || {
            let result = watch::run(Some(2));
            assert_eq!(result.exit_code, 0, "{}", result.output);

            let payload = parse_payload(&result.output);
            assert_eq!(payload["command"], "watch");
            assert_eq!(payload["message"], "completed 2 sweep(s); escalated 0 step(s)");
        },
    );
}

fn file_url(path: &Path) -> String {
    format!("sqlite://{}?mode=rwc", path.display())
}

fn seed_overdue_instance(url: &str, id: &str) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime should build");
    runtime.block_on(async {
        let pool = connect_with_settings(url, 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");

        let started_at = Utc::now() - Duration::hours(10);
        let mut instance = WorkflowInstance::new(
            id,
            DocumentRef::new("purchase_order", "PO-881"),
            "u-buyer",
            vec![
                Step::new("s1", 1, "Department head", StepType::Approval, 1)
                    .with_approver(ApproverSlot::new("u-head", "Department head"))
                    .with_escalation(StepEscalation::new(4, EscalationAction::NotifyOnly)),
                Step::new("s2", 2, "Finance", StepType::Approval, 2)
                    .with_approver(ApproverSlot::new("u-finance", "Finance")),
            ],
            started_at,
        )
        .expect("valid chain");
        instance.start(started_at).expect("start");

        SqlInstanceStore::new(pool.clone()).save(&instance, 0).await.expect("save");
        pool.close().await;
    });
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn parse_message(output: &str) -> Value {
    let payload = parse_payload(output);
    let message = payload["message"].as_str().expect("message should be a string");
    serde_json::from_str(message).expect("message should carry JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys: Vec<&str> = ENV_KEYS
        .iter()
        .map(|(_, env_key)| *env_key)
        .chain(["TIERFLOW_LOG_LEVEL", "TIERFLOW_LOG_FORMAT"])
        .collect();

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        match value {
            Some(value) => env::set_var(key, value),
            None => env::remove_var(key),
        }
    }
}
