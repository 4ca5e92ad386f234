use chrono::{Duration, Utc};
use tierflow_core::audit::InMemoryAuditSink;
use tierflow_core::domain::instance::{
    ApproverSlot, DocumentRef, EscalationAction, InstanceId, InstanceStatus, Step,
    StepEscalation, StepStatus, StepType, WorkflowInstance,
};
use tierflow_core::escalation::EscalationMonitor;
use tierflow_core::notify::InMemoryNotifier;
use tierflow_core::store::InstanceStore;
use tierflow_db::repositories::{AuditRepository, SqlAuditRepository, SqlInstanceStore};
use tierflow_db::{connect_with_settings, migrations};

async fn setup() -> sqlx::SqlitePool {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
    migrations::run_pending(&pool).await.expect("migrations");
    pool
}

fn overdue_instance(id: &str, action: EscalationAction) -> WorkflowInstance {
    let started_at = Utc::now() - Duration::hours(30);
    let mut instance = WorkflowInstance::new(
        id,
        DocumentRef::new("maintenance", format!("MO-{id}")),
        "u-planner",
        vec![
            Step::new("s1", 1, "Supervisor", StepType::Approval, 1)
                .with_approver(ApproverSlot::new("u-supervisor", "Supervisor"))
                .with_escalation(StepEscalation::new(24, action).with_recipient("u-area-lead")),
            Step::new("s2", 2, "Plant manager", StepType::Approval, 2)
                .with_approver(ApproverSlot::new("u-plant", "Plant manager")),
        ],
        started_at,
    )
    .expect("valid chain");
    instance.start(started_at).expect("start");
    instance
}

#[tokio::test]
async fn sweep_persists_escalations_and_audit_chain() {
    let pool = setup().await;
    let store = SqlInstanceStore::new(pool.clone());
    let audit = SqlAuditRepository::new(pool);

    store.save(&overdue_instance("WF-10", EscalationAction::NotifyOnly), 0).await.expect("save");
    store.save(&overdue_instance("WF-11", EscalationAction::AutoApprove), 0).await.expect("save");

    let sink = InMemoryAuditSink::default();
    let notifier = InMemoryNotifier::default();
    let monitor = EscalationMonitor::default();
    let report =
        monitor.sweep_store(&store, &sink, &notifier, Utc::now()).await.expect("sweep");
    assert_eq!(report.scanned, 2);
    assert_eq!(report.escalated.len(), 2);

    for event in sink.events() {
        audit.append(event).await.expect("append audit");
    }

    let notified = store.load(&InstanceId::new("WF-10")).await.expect("load");
    assert_eq!(notified.status, InstanceStatus::Escalated);
    assert_eq!(notified.steps[0].status, StepStatus::Escalated);

    let auto = store.load(&InstanceId::new("WF-11")).await.expect("load");
    assert_eq!(auto.current_step_order, 2);
    assert_eq!(auto.steps[0].status, StepStatus::Completed);
    let slot = auto.steps[0].slot("u-supervisor").expect("slot");
    assert!(slot.has_approved());
    assert!(slot.comments.as_deref().is_some_and(|comments| comments.starts_with("auto-approved")));

    let verification = audit.verify_chain("WF-11").await.expect("verify");
    assert!(verification.valid);

    let again = monitor.sweep_store(&store, &sink, &notifier, Utc::now()).await.expect("sweep");
    assert!(again.escalated.is_empty());
}

#[tokio::test]
async fn human_write_wins_over_a_concurrent_sweep() {
    let pool = setup().await;
    let store = SqlInstanceStore::new(pool);
    let instance = overdue_instance("WF-20", EscalationAction::NotifyOnly);
    store.save(&instance, 0).await.expect("save");

    // A human action lands between the sweep's read and its write.
    let mut human = store.load(&instance.id).await.expect("load");
    let observed = human.version;
    human.touch(Utc::now());
    store.save(&human, observed).await.expect("human write");

    let mut stale = instance.clone();
    stale.touch(Utc::now());
    assert!(store.save(&stale, observed).await.is_err());
    assert_eq!(store.load(&instance.id).await.expect("load").version, human.version);
}
