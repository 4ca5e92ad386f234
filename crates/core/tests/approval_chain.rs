use chrono::{DateTime, Duration, Utc};
use tierflow_core::{
    ApproverSlot, AuditTrail, DelegationWindow, DepartmentCode, DepartmentCoordinator,
    DispatchPriority, DispatchRequest, Disposition, DocumentRef, EscalationAction,
    EscalationMonitor, InMemoryInstanceStore, InMemoryNotifier, InstanceStatus, InstanceStore,
    Intent, IntentRequest, NotificationKind, ResponseWindows, Step, StepEscalation, StepStatus,
    StepType, TaskId, WorkflowError, WorkflowInstance, WorkflowOrchestrator,
};

fn approver_step(id: &str, order: u32, tier: u32, approvers: &[&str]) -> Step {
    approvers.iter().fold(
        Step::new(id, order, format!("Tier {tier} review"), StepType::Approval, tier),
        |step, approver| step.with_approver(ApproverSlot::new(*approver, *approver)),
    )
}

fn started(
    orchestrator: &WorkflowOrchestrator,
    steps: Vec<Step>,
    at: DateTime<Utc>,
) -> WorkflowInstance {
    let mut instance = WorkflowInstance::new(
        "WF-100",
        DocumentRef::new("purchase_request", "PR-100"),
        "u-requestor",
        steps,
        at,
    )
    .expect("valid chain");
    orchestrator.start(&mut instance, "u-requestor", "corr-start", at).expect("start");
    instance
}

fn approve(instance: &WorkflowInstance, actor: &str) -> IntentRequest {
    let step = instance.current_step().expect("current step");
    IntentRequest::new(step, actor, Intent::Approve { comments: None })
}

#[test]
fn three_tier_rejection_returns_to_previous_tier() {
    let mut orchestrator = WorkflowOrchestrator::default();
    let now = Utc::now();
    let mut instance = started(
        &orchestrator,
        vec![
            approver_step("s1", 1, 1, &["u-buyer"]),
            approver_step("s2", 2, 2, &["u-manager"]),
            approver_step("s3", 3, 3, &["u-director"]),
        ],
        now,
    );

    let request = approve(&instance, "u-buyer");
    orchestrator.apply_intent(&mut instance, request, now).expect("tier 1 approves");
    assert_eq!(instance.steps[0].status, StepStatus::Completed);
    assert_eq!(instance.steps[1].status, StepStatus::Current);

    let step = instance.current_step().expect("current step");
    let request = IntentRequest::new(
        step,
        "u-manager",
        Intent::Reject { reason: "insufficient detail".to_string() },
    );
    let outcome = orchestrator.apply_intent(&mut instance, request, now).expect("tier 2 rejects");

    let entry = outcome.rejection.expect("rejection entry");
    assert_eq!(entry.tier_level, 2);
    assert_eq!(entry.returned_to_tier, Some(1));
    assert!(!entry.returned_to_requestor);
    assert_eq!(instance.current_step_order, 1);
    assert_eq!(instance.steps[0].status, StepStatus::Current);
    assert_eq!(instance.steps[0].completed_approvals, 0);
    assert_eq!(instance.rejection_history.len(), 1);
    assert_eq!(instance.status, InstanceStatus::InProgress);
}

#[test]
fn rejection_discards_partial_approvals_on_the_rejected_step() {
    let mut orchestrator = WorkflowOrchestrator::default();
    let now = Utc::now();
    let mut instance = started(
        &orchestrator,
        vec![
            approver_step("s1", 1, 1, &["u-buyer"]),
            approver_step("s2", 2, 2, &["u-a", "u-b"]).with_required_approvals(2),
        ],
        now,
    );

    let approval = approve(&instance, "u-buyer");
    orchestrator
        .apply_intent(&mut instance, approval, now)
        .expect("tier 1 approves");
    let approval = approve(&instance, "u-a");
    orchestrator
        .apply_intent(&mut instance, approval, now)
        .expect("A approves");
    assert_eq!(instance.steps[1].completed_approvals, 1);

    let step = instance.current_step().expect("current step");
    let request =
        IntentRequest::new(step, "u-b", Intent::Reject { reason: "quote is stale".to_string() });
    let outcome = orchestrator.apply_intent(&mut instance, request, now).expect("B rejects");
    assert_eq!(outcome.rejection.expect("entry").returned_to_tier, Some(1));

    let rejected = &instance.steps[1];
    assert_eq!(rejected.status, StepStatus::Pending);
    assert_eq!(rejected.completed_approvals, 0);
    assert!(rejected.approvers.iter().all(|slot| slot.action.is_none()));
    assert_eq!(rejected.slot("u-a").and_then(|slot| slot.action_at), None);

    assert_eq!(instance.current_step_order, 1);
    assert_eq!(instance.steps[0].status, StepStatus::Current);
    assert_eq!(instance.steps[0].completed_approvals, 0);
    assert!(instance.steps[0].slot("u-buyer").is_some_and(|slot| slot.action.is_none()));

    let approval = approve(&instance, "u-buyer");
    orchestrator
        .apply_intent(&mut instance, approval, now)
        .expect("tier 1 approves again");
    let approval = approve(&instance, "u-a");
    orchestrator
        .apply_intent(&mut instance, approval, now)
        .expect("A approves again");
    assert_eq!(instance.steps[1].completed_approvals, 1);
    assert_eq!(instance.steps[1].status, StepStatus::Current);
}

#[test]
fn tier_one_rejection_terminates_the_instance() {
    let mut orchestrator = WorkflowOrchestrator::default();
    let now = Utc::now();
    let mut instance =
        started(&orchestrator, vec![approver_step("s1", 1, 1, &["u-buyer"])], now);

    let step = instance.current_step().expect("current step");
    let request =
        IntentRequest::new(step, "u-buyer", Intent::Reject { reason: "duplicate order".into() });
    let outcome = orchestrator.apply_intent(&mut instance, request, now).expect("reject");

    assert!(outcome.rejection.expect("entry").returned_to_requestor);
    assert_eq!(instance.status, InstanceStatus::Rejected);

    let request = approve(&instance, "u-buyer");
    assert!(matches!(
        orchestrator.apply_intent(&mut instance, request, now),
        Err(WorkflowError::InstanceTerminal { .. })
    ));
}

#[test]
fn two_of_two_quorum_ignores_repeat_approvals() {
    let mut orchestrator = WorkflowOrchestrator::default();
    let now = Utc::now();
    let mut instance = started(
        &orchestrator,
        vec![approver_step("s1", 1, 1, &["u-a", "u-b"]).with_required_approvals(2)],
        now,
    );

    let approval = approve(&instance, "u-a");
    let first = orchestrator
        .apply_intent(&mut instance, approval, now)
        .expect("A approves");
    assert_eq!(first.disposition, Disposition::Applied);
    assert_eq!(instance.steps[0].completed_approvals, 1);
    assert_eq!(instance.steps[0].status, StepStatus::Current);

    let version_before_repeat = instance.version;
    let approval = approve(&instance, "u-a");
    let repeat = orchestrator
        .apply_intent(&mut instance, approval, now)
        .expect("A approves again");
    assert_eq!(repeat.disposition, Disposition::Duplicate);
    assert_eq!(instance.steps[0].completed_approvals, 1);
    assert_eq!(instance.version, version_before_repeat);

    let approval = approve(&instance, "u-b");
    orchestrator
        .apply_intent(&mut instance, approval, now)
        .expect("B approves");
    assert_eq!(instance.steps[0].completed_approvals, 2);
    assert_eq!(instance.steps[0].status, StepStatus::Completed);
    assert_eq!(instance.status, InstanceStatus::Approved);
}

#[test]
fn stale_step_version_is_refused() {
    let mut orchestrator = WorkflowOrchestrator::default();
    let now = Utc::now();
    let mut instance = started(
        &orchestrator,
        vec![approver_step("s1", 1, 1, &["u-a", "u-b"]).with_required_approvals(2)],
        now,
    );

    let from_a = approve(&instance, "u-a");
    let from_b = approve(&instance, "u-b");
    orchestrator.apply_intent(&mut instance, from_a, now).expect("A approves");

    let error = orchestrator.apply_intent(&mut instance, from_b, now).expect_err("stale");
    assert!(matches!(error, WorkflowError::StaleStepState { .. }));
    assert!(error.is_retryable());
    assert_eq!(instance.steps[0].completed_approvals, 1);

    let approval = approve(&instance, "u-b");
    orchestrator
        .apply_intent(&mut instance, approval, now)
        .expect("B retries with a fresh version");
    assert_eq!(instance.status, InstanceStatus::Approved);
}

#[test]
fn delegate_acts_for_nominal_approver() {
    let mut orchestrator = WorkflowOrchestrator::default();
    let now = Utc::now();
    let mut instance = started(
        &orchestrator,
        vec![approver_step("s1", 1, 1, &["u-manager"]), approver_step("s2", 2, 2, &["u-cfo"])],
        now,
    );

    let step = instance.current_step().expect("current step");
    let request = IntentRequest::new(
        step,
        "u-manager",
        Intent::Delegate {
            to_id: "u-deputy".to_string(),
            window: DelegationWindow {
                start_date: now - Duration::hours(1),
                end_date: now + Duration::days(7),
                categories: Vec::new(),
            },
        },
    );
    let delegated = orchestrator.apply_intent(&mut instance, request, now).expect("delegate");
    assert!(delegated.delegation.is_some());

    let approval = approve(&instance, "u-deputy");
    let outcome = orchestrator
        .apply_intent(&mut instance, approval, now)
        .expect("deputy approves");
    let slot = instance.steps[0].slot("u-manager").expect("slot");
    assert_eq!(slot.delegated_from.as_deref(), Some("u-manager"));
    assert_eq!(
        outcome.audit_event.metadata.get("delegated_from").map(String::as_str),
        Some("u-manager")
    );
    assert_eq!(instance.current_step_order, 2);

    let approval = approve(&instance, "u-stranger");
    let error = orchestrator
        .apply_intent(&mut instance, approval, now)
        .expect_err("not an approver");
    assert!(matches!(error, WorkflowError::StaleActor { .. }));
}

#[tokio::test]
async fn overdue_step_escalates_exactly_once() {
    let orchestrator = WorkflowOrchestrator::default();
    let started_at = Utc::now() - Duration::hours(25);
    let instance = started(
        &orchestrator,
        vec![approver_step("s1", 1, 1, &["u-buyer"]).with_escalation(
            StepEscalation::new(24, EscalationAction::NotifyOnly).with_recipient("u-lead"),
        )],
        started_at,
    );
    let instance_id = instance.id.clone();

    let store = InMemoryInstanceStore::default();
    store.save(&instance, 0).await.expect("insert");
    let trail = AuditTrail::default();
    let notifier = InMemoryNotifier::default();
    let monitor = EscalationMonitor::default();

    let now = Utc::now();
    let first = monitor.sweep_store(&store, &trail, &notifier, now).await.expect("first sweep");
    assert_eq!(first.escalated, vec![instance_id.clone()]);

    let stored = store.load(&instance_id).await.expect("load");
    assert_eq!(stored.status, InstanceStatus::Escalated);
    assert_eq!(stored.steps[0].status, StepStatus::Escalated);
    assert!(stored.steps[0].escalation.as_ref().is_some_and(|policy| policy.triggered));
    assert!(notifier.sent().iter().any(|event| {
        event.kind == NotificationKind::StepEscalated && event.recipient_id == "u-lead"
    }));

    let version = stored.version;
    let second = monitor.sweep_store(&store, &trail, &notifier, now).await.expect("second sweep");
    assert!(second.escalated.is_empty());
    assert_eq!(store.load(&instance_id).await.expect("load").version, version);

    let verification = trail.verify_chain(instance_id.as_str());
    assert!(verification.valid);
    assert_eq!(verification.verified_entries, 1);
}

#[test]
fn audit_trail_chains_every_transition() {
    let mut orchestrator = WorkflowOrchestrator::default();
    let trail = AuditTrail::default();
    let notifier = InMemoryNotifier::default();
    let now = Utc::now();
    let mut instance = WorkflowInstance::new(
        "WF-200",
        DocumentRef::new("purchase_request", "PR-200"),
        "u-requestor",
        vec![approver_step("s1", 1, 1, &["u-a"]), approver_step("s2", 2, 2, &["u-b"])],
        now,
    )
    .expect("valid chain");
    let started = orchestrator.start(&mut instance, "u-requestor", "corr-1", now).expect("start");
    trail.record(started.audit_event);

    for actor in ["u-a", "u-b"] {
        let request = approve(&instance, actor);
        orchestrator
            .apply_intent_with_audit(&mut instance, request, now, &trail, &notifier)
            .expect("approve");
    }

    let verification = trail.verify_chain("WF-200");
    assert!(verification.valid, "{:?}", verification.failure_reason);
    assert_eq!(verification.verified_entries, 3);
    assert!(notifier
        .sent()
        .iter()
        .any(|event| event.kind == NotificationKind::InstanceApproved));
}

#[test]
fn signoff_department_gates_origin_task_resolution() {
    let now = Utc::now();
    let mut coordinator = DepartmentCoordinator::new(ResponseWindows::default());
    let task_id = TaskId::new("TASK-7");
    coordinator.register_task(task_id.clone(), DepartmentCode::new("OPS"), now).expect("task");

    let outcome = coordinator
        .dispatch(
            DispatchRequest {
                from_task_id: task_id.clone(),
                target_departments: vec![DepartmentCode::new("LEGAL"), DepartmentCode::new("FIN")],
                reason: "contract exposure".to_string(),
                priority: DispatchPriority::Critical,
                requires_signoff: true,
                signoff_department_code: Some(DepartmentCode::new("LEGAL")),
                dispatched_by: "u-ops".to_string(),
                correlation_id: "corr-d".to_string(),
            },
            now,
        )
        .expect("dispatch");
    let due_at = now + Duration::hours(4);
    assert!(outcome.assignments.iter().all(|assignment| assignment.due_at == due_at));

    assert!(matches!(
        coordinator.resolve_task(&task_id, "u-ops", "corr-r1", now),
        Err(WorkflowError::SignoffPending { .. })
    ));

    let legal = outcome
        .assignments
        .iter()
        .find(|assignment| assignment.department_code.as_str() == "LEGAL")
        .expect("legal assignment");
    coordinator
        .complete_assignment(&legal.id, "u-counsel", None, "corr-c", now)
        .expect("legal signs off");

    coordinator.resolve_task(&task_id, "u-ops", "corr-r2", now).expect("resolves after sign-off");
}
