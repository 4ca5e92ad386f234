use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::config::AppConfig;
use crate::domain::instance::{
    AdvanceOutcome, ApproverAction, EscalationAction, InstanceId, InstanceStatus, StepId,
    StepStatus, WorkflowInstance,
};
use crate::errors::ApplicationError;
use crate::notify::{deliver_all, NotificationEvent, NotificationKind, Notifier};
use crate::quorum::{QuorumOutcome, StepQuorumEvaluator};
use crate::store::{InstanceStore, StoreError};

pub const DEFAULT_SYSTEM_ACTOR: &str = "system";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EscalationOutcome {
    pub instance_id: InstanceId,
    pub step_id: StepId,
    pub action: EscalationAction,
    pub elapsed_hours: i64,
    /// Set when auto-approval completed the step.
    pub advanced: Option<AdvanceOutcome>,
    /// Step order that became current after a reassignment.
    pub reassigned_to_order: Option<u32>,
    pub audit_event: AuditEvent,
    pub notifications: Vec<NotificationEvent>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub escalated: Vec<InstanceId>,
    pub skipped_conflicts: Vec<InstanceId>,
}

/// Latched timeout evaluator. Each step escalates at most once; the latch survives
/// later human actions and rejection resets.
#[derive(Clone, Debug)]
pub struct EscalationMonitor {
    system_actor_id: String,
    quorum: StepQuorumEvaluator,
}

impl Default for EscalationMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_SYSTEM_ACTOR)
    }
}

impl EscalationMonitor {
    pub fn new(system_actor_id: impl Into<String>) -> Self {
        Self { system_actor_id: system_actor_id.into(), quorum: StepQuorumEvaluator }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.escalation.system_actor_id.clone())
    }

    pub fn system_actor_id(&self) -> &str {
        &self.system_actor_id
    }

    /// Escalates the current step when it is overdue, returning `None` otherwise.
    pub fn evaluate(
        &self,
        instance: &mut WorkflowInstance,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Option<EscalationOutcome> {
        if !matches!(instance.status, InstanceStatus::InProgress | InstanceStatus::Escalated) {
            return None;
        }

        let step = instance.current_step()?;
        if step.status != StepStatus::Current || step.step_type.is_escalation_exempt() {
            return None;
        }
        let escalation = step.escalation.as_ref()?;
        if escalation.triggered {
            return None;
        }
        let became_current_at = step.became_current_at?;
        let elapsed = now - became_current_at;
        if elapsed < Duration::hours(i64::from(escalation.timeout_hours)) {
            return None;
        }

        let action = escalation.action;
        let step_id = step.id.clone();
        let step_order = step.step_order;
        let tier_level = step.tier_level;
        let recipients = escalation.escalate_to.clone();

        let mut notifications = Vec::new();
        let step = instance.current_step_mut()?;
        if let Some(latch) = step.escalation.as_mut() {
            latch.triggered = true;
            latch.triggered_at = Some(now);
        }
        step.status = StepStatus::Escalated;
        // Delegated or escalated slots still owe an approval.
        let pending_slots: Vec<String> = step
            .approvers
            .iter()
            .filter(|slot| !slot.has_approved())
            .map(|slot| slot.id.clone())
            .collect();
        instance.status = InstanceStatus::Escalated;

        for recipient in pending_slots.iter().chain(recipients.iter()) {
            notifications.push(
                NotificationEvent::new(NotificationKind::StepEscalated, recipient.as_str())
                    .with("instance_id", instance.id.as_str())
                    .with("step_id", step_id.as_str())
                    .with("action", action.as_str()),
            );
        }

        let mut advanced = None;
        let mut reassigned_to_order = None;
        match action {
            EscalationAction::NotifyOnly => {}
            EscalationAction::Reassign => {
                reassigned_to_order = self.reassign_to_next_tier(
                    instance,
                    step_order,
                    tier_level,
                    &pending_slots,
                    now,
                );
                if let Some(order) = reassigned_to_order {
                    push_approval_requests(instance, order, &mut notifications);
                }
            }
            EscalationAction::AutoApprove => {
                advanced = self.auto_approve(instance, &pending_slots, now);
                match advanced {
                    Some(AdvanceOutcome::ChainApproved) => notifications.push(
                        NotificationEvent::new(
                            NotificationKind::InstanceApproved,
                            instance.requested_by.clone(),
                        )
                        .with("instance_id", instance.id.as_str()),
                    ),
                    Some(AdvanceOutcome::Advanced { to_step_order }) => {
                        push_approval_requests(instance, to_step_order, &mut notifications);
                    }
                    None => {}
                }
            }
        }

        instance.touch(now);

        let elapsed_hours = elapsed.num_hours();
        let mut audit_event = AuditContext::new(
            Some(instance.id.clone()),
            correlation_id,
            self.system_actor_id.clone(),
        )
        .event("escalation.triggered", AuditCategory::Escalation, AuditOutcome::Success)
        .at(now)
        .with_metadata("step_id", step_id.as_str())
        .with_metadata("action", action.as_str())
        .with_metadata("elapsed_hours", elapsed_hours.to_string())
        .with_metadata("instance_status", instance.status.as_str());
        if let Some(order) = reassigned_to_order {
            audit_event = audit_event.with_metadata("reassigned_to_order", order.to_string());
        }

        info!(
            event_name = "escalation.triggered",
            instance_id = %instance.id,
            step_id = %step_id,
            action = action.as_str(),
            elapsed_hours,
            "step escalated after timeout"
        );

        Some(EscalationOutcome {
            instance_id: instance.id.clone(),
            step_id,
            action,
            elapsed_hours,
            advanced,
            reassigned_to_order,
            audit_event,
            notifications,
        })
    }

    /// Evaluates a batch of instances in place.
    pub fn sweep(
        &self,
        instances: &mut [WorkflowInstance],
        now: DateTime<Utc>,
    ) -> (SweepReport, Vec<EscalationOutcome>) {
        let correlation_id = format!("sweep-{}", Uuid::new_v4());
        let mut report = SweepReport { scanned: instances.len(), ..SweepReport::default() };
        let mut outcomes = Vec::new();
        for instance in instances.iter_mut() {
            if let Some(outcome) = self.evaluate(instance, &correlation_id, now) {
                report.escalated.push(outcome.instance_id.clone());
                outcomes.push(outcome);
            }
        }
        (report, outcomes)
    }

    /// Loads every active instance, escalates overdue steps and saves with the observed
    /// version. A concurrent human write wins; the instance is left for the next sweep.
    pub async fn sweep_store(
        &self,
        store: &dyn InstanceStore,
        sink: &dyn AuditSink,
        notifier: &dyn Notifier,
        now: DateTime<Utc>,
    ) -> Result<SweepReport, ApplicationError> {
        let correlation_id = format!("sweep-{}", Uuid::new_v4());
        let mut candidates = store.list_by_status(InstanceStatus::InProgress).await?;
        candidates.extend(store.list_by_status(InstanceStatus::Escalated).await?);

        let mut report = SweepReport { scanned: candidates.len(), ..SweepReport::default() };
        for mut instance in candidates {
            let observed_version = instance.version;
            let Some(outcome) = self.evaluate(&mut instance, &correlation_id, now) else {
                continue;
            };

            match store.save(&instance, observed_version).await {
                Ok(()) => {
                    sink.emit(outcome.audit_event);
                    deliver_all(notifier, &outcome.notifications);
                    report.escalated.push(outcome.instance_id);
                }
                Err(StoreError::VersionConflict { instance_id, expected, actual }) => {
                    warn!(
                        event_name = "escalation.sweep.conflict",
                        instance_id = %instance_id,
                        expected,
                        actual,
                        "instance changed during sweep; escalation deferred"
                    );
                    report.skipped_conflicts.push(instance_id);
                }
                Err(error) => return Err(error.into()),
            }
        }

        info!(
            event_name = "escalation.sweep.completed",
            correlation_id = %correlation_id,
            scanned = report.scanned,
            escalated = report.escalated.len(),
            conflicts = report.skipped_conflicts.len(),
            "escalation sweep completed"
        );
        Ok(report)
    }

    fn reassign_to_next_tier(
        &self,
        instance: &mut WorkflowInstance,
        step_order: u32,
        tier_level: u32,
        pending_slots: &[String],
        now: DateTime<Utc>,
    ) -> Option<u32> {
        let target_order = instance
            .steps
            .iter()
            .filter(|step| {
                step.tier_level == tier_level + 1
                    && step.step_order > step_order
                    && step.status == StepStatus::Pending
            })
            .map(|step| step.step_order)
            .min()?;

        let reassigned_by = self.system_actor_id.clone();
        for step in instance.steps.iter_mut() {
            if step.step_order == step_order {
                let reassigned =
                    step.approvers.iter_mut().filter(|slot| pending_slots.contains(&slot.id));
                for slot in reassigned {
                    slot.record(ApproverAction::Reassigned, now, None, None);
                    slot.comments = Some(format!("reassigned by {reassigned_by} after timeout"));
                }
            } else if step.step_order > step_order && step.step_order < target_order {
                step.status = StepStatus::Skipped;
            } else if step.step_order == target_order {
                step.activate(now);
            }
        }
        instance.current_step_order = target_order;
        Some(target_order)
    }

    fn auto_approve(
        &self,
        instance: &mut WorkflowInstance,
        pending_slots: &[String],
        now: DateTime<Utc>,
    ) -> Option<AdvanceOutcome> {
        let step = instance.current_step_mut()?;
        let comments = format!("auto-approved by {} after timeout", self.system_actor_id);
        let mut satisfied = self.quorum.is_satisfied(step);
        for slot_id in pending_slots {
            if satisfied {
                break;
            }
            match self.quorum.record_approval(step, slot_id, None, Some(comments.clone()), now) {
                Ok(QuorumOutcome::Satisfied) => satisfied = true,
                Ok(_) => {}
                Err(error) => {
                    warn!(
                        event_name = "escalation.auto_approve_failed",
                        step_id = %step.id,
                        error = %error,
                        "system approval could not be recorded"
                    );
                    return None;
                }
            }
        }

        satisfied.then(|| instance.advance_from_current(now))
    }
}

fn push_approval_requests(
    instance: &WorkflowInstance,
    step_order: u32,
    notifications: &mut Vec<NotificationEvent>,
) {
    if let Some(step) = instance.step_by_order(step_order) {
        for slot in &step.approvers {
            notifications.push(
                NotificationEvent::new(NotificationKind::ApprovalRequested, slot.id.as_str())
                    .with("instance_id", instance.id.as_str())
                    .with("step_id", step.id.as_str()),
            );
        }
    }
}
