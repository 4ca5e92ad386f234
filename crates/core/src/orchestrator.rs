use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::cascade::RejectionCascadeResolver;
use crate::config::AppConfig;
use crate::delegation::DelegationResolver;
use crate::domain::delegation::{DelegationId, DelegationRecord};
use crate::domain::instance::{
    AdvanceOutcome, ApproverAction, InstanceStatus, Step, StepId, StepStatus, StepVersion,
    WorkflowInstance,
};
use crate::domain::rejection::RejectionHistoryEntry;
use crate::errors::WorkflowError;
use crate::escalation::DEFAULT_SYSTEM_ACTOR;
use crate::notify::{deliver_all, NotificationEvent, NotificationKind, Notifier};
use crate::quorum::{QuorumOutcome, StepQuorumEvaluator};
use crate::timeline::{timeline, TimelineEntry};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationWindow {
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// Empty means every category.
    #[serde(default)]
    pub categories: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum Intent {
    Approve { comments: Option<String> },
    Reject { reason: String },
    Escalate { comments: Option<String> },
    Delegate { to_id: String, window: DelegationWindow },
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve { .. } => "approve",
            Self::Reject { .. } => "reject",
            Self::Escalate { .. } => "escalate",
            Self::Delegate { .. } => "delegate",
        }
    }

    fn audit_category(&self) -> AuditCategory {
        match self {
            Self::Approve { .. } => AuditCategory::Approval,
            Self::Reject { .. } => AuditCategory::Rejection,
            Self::Escalate { .. } => AuditCategory::Escalation,
            Self::Delegate { .. } => AuditCategory::Delegation,
        }
    }
}

/// An actor's intent against a step, carrying the step version the actor observed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentRequest {
    pub step_id: StepId,
    pub actor_id: String,
    pub expected: StepVersion,
    pub intent: Intent,
    pub correlation_id: String,
}

impl IntentRequest {
    pub fn new(step: &Step, actor_id: impl Into<String>, intent: Intent) -> Self {
        Self {
            step_id: step.id.clone(),
            actor_id: actor_id.into(),
            expected: step.version(),
            intent,
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Applied,
    /// Repeated approval from the same resolved actor; nothing changed.
    Duplicate,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntentOutcome {
    pub disposition: Disposition,
    pub audit_event: AuditEvent,
    pub advance: Option<AdvanceOutcome>,
    pub rejection: Option<RejectionHistoryEntry>,
    pub delegation: Option<DelegationRecord>,
    pub notifications: Vec<NotificationEvent>,
    pub timeline: Vec<TimelineEntry>,
}

/// Result of lifecycle operations outside the actor-intent path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LifecycleOutcome {
    pub audit_event: AuditEvent,
    pub advance: Option<AdvanceOutcome>,
    pub notifications: Vec<NotificationEvent>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct SlotMatch {
    slot_id: String,
    delegated_from: Option<String>,
    delegation_id: Option<DelegationId>,
    ambiguous: Vec<DelegationId>,
}

/// Entry point for every change to a workflow instance. All validation runs before
/// the first mutation, so a failed call leaves the instance untouched.
#[derive(Clone, Debug)]
pub struct WorkflowOrchestrator {
    quorum: StepQuorumEvaluator,
    cascade: RejectionCascadeResolver,
    delegations: DelegationResolver,
    system_actor_id: String,
}

impl Default for WorkflowOrchestrator {
    fn default() -> Self {
        Self::new(DelegationResolver::default())
    }
}

impl WorkflowOrchestrator {
    pub fn new(delegations: DelegationResolver) -> Self {
        Self {
            quorum: StepQuorumEvaluator,
            cascade: RejectionCascadeResolver,
            delegations,
            system_actor_id: DEFAULT_SYSTEM_ACTOR.to_string(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(DelegationResolver::from_config(config))
            .with_system_actor(config.escalation.system_actor_id.clone())
    }

    pub fn with_system_actor(mut self, system_actor_id: impl Into<String>) -> Self {
        self.system_actor_id = system_actor_id.into();
        self
    }

    pub fn delegations(&self) -> &DelegationResolver {
        &self.delegations
    }

    pub fn delegations_mut(&mut self) -> &mut DelegationResolver {
        &mut self.delegations
    }

    pub fn start(
        &self,
        instance: &mut WorkflowInstance,
        actor_id: &str,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<LifecycleOutcome, WorkflowError> {
        instance.start(now)?;

        let mut notifications = Vec::new();
        push_approval_requests(instance, &mut notifications);

        let audit_event = AuditContext::new(Some(instance.id.clone()), correlation_id, actor_id)
            .event("workflow.started", AuditCategory::Lifecycle, AuditOutcome::Success)
            .at(now)
            .with_metadata("document_kind", instance.document_ref.kind.as_str())
            .with_metadata("document_id", instance.document_ref.id.as_str())
            .with_metadata("steps", instance.steps.len().to_string());

        info!(
            event_name = "workflow.started",
            instance_id = %instance.id,
            correlation_id,
            "workflow instance started"
        );
        Ok(LifecycleOutcome { audit_event, advance: None, notifications })
    }

    /// Cancels any non-terminal instance. Quorum and delegation are not consulted.
    pub fn cancel(
        &self,
        instance: &mut WorkflowInstance,
        actor_id: &str,
        reason: Option<&str>,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<LifecycleOutcome, WorkflowError> {
        if instance.status.is_terminal() {
            return Err(WorkflowError::InstanceTerminal {
                instance_id: instance.id.clone(),
                status: instance.status,
            });
        }

        let previous_status = instance.status;
        if previous_status != InstanceStatus::Pending {
            if let Some(step) = instance.current_step_mut() {
                step.status = StepStatus::Skipped;
            }
        }
        instance.status = InstanceStatus::Cancelled;
        instance.touch(now);

        let mut notification = NotificationEvent::new(
            NotificationKind::InstanceCancelled,
            instance.requested_by.clone(),
        )
        .with("instance_id", instance.id.as_str())
        .with("cancelled_by", actor_id);
        let mut audit_event = AuditContext::new(Some(instance.id.clone()), correlation_id, actor_id)
            .event("workflow.cancelled", AuditCategory::Lifecycle, AuditOutcome::Success)
            .at(now)
            .with_metadata("previous_status", previous_status.as_str());
        if let Some(reason) = reason.map(str::trim).filter(|reason| !reason.is_empty()) {
            notification = notification.with("reason", reason);
            audit_event = audit_event.with_metadata("reason", reason);
        }

        info!(
            event_name = "workflow.cancelled",
            instance_id = %instance.id,
            correlation_id,
            "workflow instance cancelled"
        );
        Ok(LifecycleOutcome { audit_event, advance: None, notifications: vec![notification] })
    }

    /// Completes the current condition step when `predicate` holds. A false predicate
    /// changes nothing and returns `None`.
    pub fn resolve_condition(
        &self,
        instance: &mut WorkflowInstance,
        step_id: &StepId,
        predicate: bool,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LifecycleOutcome>, WorkflowError> {
        instance.ensure_accepts_intents()?;
        let step = current_step_named(instance, step_id)?;
        if !self.quorum.satisfy_condition(step, predicate)? {
            debug!(
                event_name = "workflow.condition.unsatisfied",
                instance_id = %instance.id,
                step_id = %step_id,
                "condition predicate is false; step stays current"
            );
            return Ok(None);
        }

        let advance = instance.advance_from_current(now);
        instance.touch(now);

        let mut notifications = Vec::new();
        notify_advance(instance, advance, &mut notifications);

        let context = AuditContext::new(
            Some(instance.id.clone()),
            correlation_id,
            self.system_actor_id.clone(),
        );
        let audit_event = context
            .event("workflow.condition.satisfied", AuditCategory::Approval, AuditOutcome::Success)
            .at(now)
            .with_metadata("step_id", step_id.as_str())
            .with_metadata("instance_status", instance.status.as_str());

        Ok(Some(LifecycleOutcome { audit_event, advance: Some(advance), notifications }))
    }

    pub fn apply_intent(
        &mut self,
        instance: &mut WorkflowInstance,
        request: IntentRequest,
        now: DateTime<Utc>,
    ) -> Result<IntentOutcome, WorkflowError> {
        instance.ensure_accepts_intents()?;
        let step = current_step_named(instance, &request.step_id)?;
        if !step.step_type.has_human_approvers() {
            return Err(WorkflowError::ConditionStepRequiresPredicate { step_id: step.id.clone() });
        }

        if let Intent::Reject { reason } = &request.intent {
            self.cascade.validate_reason(reason)?;
        }

        let category = instance.category_for(step).to_string();
        let matched = self.match_slot(step, &request.actor_id, &category, now)?;

        let context = AuditContext::new(
            Some(instance.id.clone()),
            request.correlation_id.clone(),
            request.actor_id.clone(),
        );
        let already_approved = step.slot(&matched.slot_id).is_some_and(|slot| slot.has_approved());
        if matches!(request.intent, Intent::Approve { .. }) && already_approved {
            debug!(
                event_name = "workflow.intent.duplicate",
                instance_id = %instance.id,
                step_id = %step.id,
                actor_id = %request.actor_id,
                "approval already recorded for this actor"
            );
            let audit_event = context
                .event("workflow.intent.approve", AuditCategory::Approval, AuditOutcome::NoOp)
                .at(now)
                .with_metadata("step_id", step.id.as_str())
                .with_metadata("slot_id", matched.slot_id.as_str());
            return Ok(IntentOutcome {
                disposition: Disposition::Duplicate,
                audit_event,
                advance: None,
                rejection: None,
                delegation: None,
                notifications: Vec::new(),
                timeline: timeline(instance),
            });
        }

        let actual = step.version();
        if actual != request.expected {
            return Err(WorkflowError::StaleStepState { expected: request.expected, actual });
        }

        if matches!(request.intent, Intent::Escalate { .. } | Intent::Delegate { .. })
            && already_approved
        {
            return Err(WorkflowError::SlotAlreadyApproved {
                step_id: request.step_id.clone(),
                approver_id: matched.slot_id.clone(),
            });
        }

        if let Intent::Delegate { to_id, .. } = &request.intent {
            if matched.delegated_from.is_some() {
                return Err(WorkflowError::InvalidDelegation(format!(
                    "`{}` acts under delegation and cannot delegate further",
                    request.actor_id
                )));
            }
            if to_id.trim().is_empty() {
                return Err(WorkflowError::InvalidDelegation("delegate id is required".to_string()));
            }
        }

        let cascade_plan = match &request.intent {
            Intent::Reject { reason } => Some(self.cascade.plan(
                instance,
                &matched.slot_id,
                &request.actor_id,
                matched.delegated_from.clone(),
                reason,
                now,
            )?),
            _ => None,
        };

        // Validation is complete; everything below mutates.
        let delegation = match &request.intent {
            Intent::Delegate { to_id, window } => Some(self.delegations.create(
                DelegationId::new(Uuid::new_v4().to_string()),
                &request.actor_id,
                to_id,
                window.start_date,
                window.end_date,
                window.categories.iter().cloned(),
                now,
            )?),
            _ => None,
        };

        let mut notifications = self.delegations.observe(&matched.slot_id, &category, now);
        let step_id = request.step_id.clone();
        let mut advance = None;
        let mut rejection = None;

        match (&request.intent, cascade_plan) {
            (Intent::Approve { comments }, _) => {
                let step = current_step_mut(instance)?;
                let was_escalated = step.status == StepStatus::Escalated;
                let outcome = self.quorum.record_approval(
                    step,
                    &matched.slot_id,
                    matched.delegated_from.clone(),
                    comments.clone(),
                    now,
                )?;
                match outcome {
                    QuorumOutcome::Satisfied => {
                        let advanced = instance.advance_from_current(now);
                        notify_advance(instance, advanced, &mut notifications);
                        advance = Some(advanced);
                    }
                    QuorumOutcome::Recorded { .. } | QuorumOutcome::AlreadyRecorded => {
                        if was_escalated {
                            step.status = StepStatus::Current;
                        }
                        if instance.status == InstanceStatus::Escalated {
                            instance.status = InstanceStatus::InProgress;
                        }
                    }
                }
            }
            (Intent::Reject { .. }, Some(plan)) => {
                let outcome = self.cascade.apply(instance, plan, now);
                notifications.extend(outcome.notifications);
                rejection = Some(outcome.entry);
            }
            (Intent::Reject { .. }, None) => {}
            (Intent::Escalate { comments }, _) => {
                let step = current_step_mut(instance)?;
                if let Some(slot) = step.slot_mut(&matched.slot_id) {
                    slot.record(
                        ApproverAction::Escalated,
                        now,
                        comments.clone(),
                        matched.delegated_from.clone(),
                    );
                }
                step.status = StepStatus::Escalated;
                let recipients = step
                    .escalation
                    .as_ref()
                    .map(|policy| policy.escalate_to.clone())
                    .unwrap_or_default();
                instance.status = InstanceStatus::Escalated;
                for recipient in recipients {
                    notifications.push(
                        NotificationEvent::new(NotificationKind::StepEscalated, recipient)
                            .with("instance_id", instance.id.as_str())
                            .with("step_id", step_id.as_str())
                            .with("escalated_by", request.actor_id.as_str()),
                    );
                }
            }
            (Intent::Delegate { to_id, .. }, _) => {
                let step = current_step_mut(instance)?;
                if let Some(slot) = step.slot_mut(&matched.slot_id) {
                    slot.record(ApproverAction::Delegated, now, None, None);
                    slot.comments = Some(format!("delegated to {to_id}"));
                }
                if delegation.as_ref().is_some_and(|record| record.is_effective_at(now)) {
                    notifications.push(
                        NotificationEvent::new(NotificationKind::ApprovalRequested, to_id.as_str())
                            .with("instance_id", instance.id.as_str())
                            .with("step_id", step_id.as_str())
                            .with("on_behalf_of", request.actor_id.as_str()),
                    );
                }
            }
        }
        instance.touch(now);

        let audit_event = self.intent_audit_event(
            &context,
            &request,
            &matched,
            instance,
            delegation.as_ref(),
            rejection.as_ref(),
            now,
        );

        info!(
            event_name = "workflow.intent.applied",
            instance_id = %instance.id,
            step_id = %step_id,
            intent = request.intent.as_str(),
            actor_id = %request.actor_id,
            delegated = matched.delegated_from.is_some(),
            instance_status = instance.status.as_str(),
            correlation_id = %request.correlation_id,
            "workflow intent applied"
        );

        Ok(IntentOutcome {
            disposition: Disposition::Applied,
            audit_event,
            advance,
            rejection,
            delegation,
            notifications,
            timeline: timeline(instance),
        })
    }

    /// Applies an intent, then records the audit entry and delivers notifications.
    /// Notification failures are logged and never undo the transition.
    pub fn apply_intent_with_audit(
        &mut self,
        instance: &mut WorkflowInstance,
        request: IntentRequest,
        now: DateTime<Utc>,
        sink: &dyn AuditSink,
        notifier: &dyn Notifier,
    ) -> Result<IntentOutcome, WorkflowError> {
        let outcome = self.apply_intent(instance, request, now)?;
        sink.emit(outcome.audit_event.clone());
        deliver_all(notifier, &outcome.notifications);
        Ok(outcome)
    }

    /// Finds the approver slot `actor_id` may act on: their own slot, or a slot whose
    /// approver currently delegates to them.
    fn match_slot(
        &self,
        step: &Step,
        actor_id: &str,
        category: &str,
        now: DateTime<Utc>,
    ) -> Result<SlotMatch, WorkflowError> {
        if step.slot(actor_id).is_some() {
            return Ok(SlotMatch {
                slot_id: actor_id.to_string(),
                delegated_from: None,
                delegation_id: None,
                ambiguous: Vec::new(),
            });
        }

        step.approvers
            .iter()
            .find_map(|slot| {
                let resolution = self.delegations.resolve(&slot.id, category, now);
                (resolution.acting_id == actor_id && resolution.is_delegated()).then(|| SlotMatch {
                    slot_id: slot.id.clone(),
                    delegated_from: resolution.delegated_from,
                    delegation_id: resolution.record_id,
                    ambiguous: resolution.ambiguous,
                })
            })
            .ok_or_else(|| WorkflowError::StaleActor {
                actor_id: actor_id.to_string(),
                step_id: step.id.clone(),
            })
    }

    #[allow(clippy::too_many_arguments)]
    fn intent_audit_event(
        &self,
        context: &AuditContext,
        request: &IntentRequest,
        matched: &SlotMatch,
        instance: &WorkflowInstance,
        delegation: Option<&DelegationRecord>,
        rejection: Option<&RejectionHistoryEntry>,
        now: DateTime<Utc>,
    ) -> AuditEvent {
        let outcome = if matched.ambiguous.is_empty() {
            AuditOutcome::Success
        } else {
            AuditOutcome::Warning
        };
        let mut event = context
            .event(
                format!("workflow.intent.{}", request.intent.as_str()),
                request.intent.audit_category(),
                outcome,
            )
            .at(now)
            .with_metadata("step_id", request.step_id.as_str())
            .with_metadata("slot_id", matched.slot_id.as_str())
            .with_metadata("instance_status", instance.status.as_str())
            .with_metadata("current_step_order", instance.current_step_order.to_string());

        if let Some(step) = instance.step(&request.step_id) {
            event = event
                .with_metadata("step_status", step.status.as_str())
                .with_metadata("completed_approvals", step.completed_approvals.to_string())
                .with_metadata("required_approvals", step.required_approvals.to_string());
        }
        if let Some(delegated_from) = &matched.delegated_from {
            event = event.with_metadata("delegated_from", delegated_from.as_str());
        }
        if let Some(delegation_id) = &matched.delegation_id {
            event = event.with_metadata("acting_delegation_id", delegation_id.as_str());
        }
        if !matched.ambiguous.is_empty() {
            let overlapping: Vec<&str> =
                matched.ambiguous.iter().map(DelegationId::as_str).collect();
            event = event.with_metadata("ambiguous_delegations", overlapping.join(","));
        }
        if let Some(record) = delegation {
            event = event
                .with_metadata("delegation_id", record.id.as_str())
                .with_metadata("delegate_id", record.delegate_id.as_str())
                .with_metadata("end_date", record.end_date.to_rfc3339());
        }
        if let Some(entry) = rejection {
            event = event
                .with_metadata("reason", entry.reason.as_str())
                .with_metadata("tier_level", entry.tier_level.to_string())
                .with_metadata("previous_status", entry.previous_status.as_str());
            event = match entry.returned_to_tier {
                Some(tier) => event.with_metadata("returned_to_tier", tier.to_string()),
                None => event.with_metadata("returned_to_requestor", "true"),
            };
        }
        event
    }
}

fn current_step_named<'a>(
    instance: &'a WorkflowInstance,
    step_id: &StepId,
) -> Result<&'a Step, WorkflowError> {
    let step = instance.step(step_id).ok_or_else(|| WorkflowError::StepNotFound {
        instance_id: instance.id.clone(),
        step_id: step_id.clone(),
    })?;
    if step.step_order != instance.current_step_order || !step.status.is_awaiting_action() {
        return Err(WorkflowError::NotCurrentStep {
            requested: step_id.clone(),
            current: instance.current_step().map(|current| current.id.clone()),
        });
    }
    Ok(step)
}

fn current_step_mut(instance: &mut WorkflowInstance) -> Result<&mut Step, WorkflowError> {
    let instance_id = instance.id.clone();
    let order = instance.current_step_order;
    instance.current_step_mut().ok_or_else(|| {
        WorkflowError::InvalidDefinition(format!(
            "instance `{instance_id}` has no step at order {order}"
        ))
    })
}

fn push_approval_requests(instance: &WorkflowInstance, notifications: &mut Vec<NotificationEvent>) {
    if let Some(step) = instance.current_step() {
        for slot in &step.approvers {
            notifications.push(
                NotificationEvent::new(NotificationKind::ApprovalRequested, slot.id.as_str())
                    .with("instance_id", instance.id.as_str())
                    .with("step_id", step.id.as_str()),
            );
        }
    }
}

fn notify_advance(
    instance: &WorkflowInstance,
    advance: AdvanceOutcome,
    notifications: &mut Vec<NotificationEvent>,
) {
    match advance {
        AdvanceOutcome::Advanced { .. } => push_approval_requests(instance, notifications),
        AdvanceOutcome::ChainApproved => notifications.push(
            NotificationEvent::new(
                NotificationKind::InstanceApproved,
                instance.requested_by.clone(),
            )
            .with("instance_id", instance.id.as_str()),
        ),
    }
}
