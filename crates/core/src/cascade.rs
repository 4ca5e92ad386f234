use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::instance::{ApproverAction, InstanceStatus, StepStatus, WorkflowInstance};
use crate::domain::rejection::{RejectionDestination, RejectionHistoryEntry, RejectionId};
use crate::errors::WorkflowError;
use crate::notify::{NotificationEvent, NotificationKind};

/// A validated rejection, computed before anything is mutated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CascadePlan {
    pub entry: RejectionHistoryEntry,
    pub destination: RejectionDestination,
    pub rejected_step_order: u32,
    /// Approver slot that cast the rejection.
    pub slot_id: String,
    /// First step of the destination tier, when returning to a tier.
    pub rewind_to_order: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CascadeOutcome {
    pub entry: RejectionHistoryEntry,
    pub destination: RejectionDestination,
    pub notifications: Vec<NotificationEvent>,
}

/// Decides where a rejection sends the chain. Tier 1 goes back to the requestor and
/// ends the instance; tier k goes back to the first step of tier k-1.
#[derive(Clone, Copy, Debug, Default)]
pub struct RejectionCascadeResolver;

impl RejectionCascadeResolver {
    pub fn validate_reason(&self, reason: &str) -> Result<String, WorkflowError> {
        let trimmed = reason.trim();
        if trimmed.is_empty() {
            return Err(WorkflowError::InvalidRejectionReason);
        }
        Ok(trimmed.to_string())
    }

    pub fn plan(
        &self,
        instance: &WorkflowInstance,
        slot_id: &str,
        rejected_by: &str,
        delegated_from: Option<String>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<CascadePlan, WorkflowError> {
        let reason = self.validate_reason(reason)?;
        let step = instance.current_step().ok_or_else(|| {
            WorkflowError::InvalidDefinition(format!(
                "instance `{}` has no step at order {}",
                instance.id, instance.current_step_order
            ))
        })?;

        let (destination, rewind_to_order) = if step.tier_level <= 1 {
            (RejectionDestination::Requestor, None)
        } else {
            let tier_level = step.tier_level - 1;
            let target = instance.first_step_of_tier(tier_level).ok_or_else(|| {
                WorkflowError::InvalidDefinition(format!(
                    "instance `{}` has no steps in tier {tier_level}",
                    instance.id
                ))
            })?;
            (RejectionDestination::Tier { tier_level }, Some(target.step_order))
        };

        let entry = RejectionHistoryEntry::new(
            RejectionId::new(Uuid::new_v4().to_string()),
            step.tier_level,
            rejected_by,
            delegated_from,
            now,
            reason,
            instance.status,
            Some(step.step_name.clone()),
            destination,
        );

        Ok(CascadePlan {
            entry,
            destination,
            rejected_step_order: step.step_order,
            slot_id: slot_id.to_string(),
            rewind_to_order,
        })
    }

    /// Appends the history entry, then rewinds or terminates the instance. Partial
    /// approvals on the rejected step are discarded. The caller bumps the version.
    pub fn apply(
        &self,
        instance: &mut WorkflowInstance,
        plan: CascadePlan,
        now: DateTime<Utc>,
    ) -> CascadeOutcome {
        instance.rejection_history.push(plan.entry.clone());

        let mut notifications = Vec::new();
        match plan.rewind_to_order {
            None => {
                if let Some(step) = instance.step_by_order_mut(plan.rejected_step_order) {
                    step.status = StepStatus::Rejected;
                    step.completed_at = Some(now);
                    step.completed_approvals = 0;
                    if let Some(slot) = step.slot_mut(&plan.slot_id) {
                        slot.record(
                            ApproverAction::Rejected,
                            now,
                            Some(plan.entry.reason.clone()),
                            plan.entry.delegated_from.clone(),
                        );
                    }
                }
                instance.status = InstanceStatus::Rejected;
                notifications.push(
                    NotificationEvent::new(
                        NotificationKind::InstanceRejected,
                        instance.requested_by.clone(),
                    )
                    .with("instance_id", instance.id.as_str())
                    .with("reason", plan.entry.reason.clone()),
                );
            }
            Some(rewind_to_order) => {
                let rewound = rewind_to_order..=plan.rejected_step_order;
                for step in
                    instance.steps.iter_mut().filter(|step| rewound.contains(&step.step_order))
                {
                    step.reset();
                }
                if let Some(step) = instance.step_by_order_mut(rewind_to_order) {
                    step.activate(now);
                }
                instance.current_step_order = rewind_to_order;
                instance.status = InstanceStatus::InProgress;

                if let Some(step) = instance.step_by_order(rewind_to_order) {
                    for slot in &step.approvers {
                        notifications.push(
                            NotificationEvent::new(NotificationKind::InstanceReturned, &slot.id)
                                .with("instance_id", instance.id.as_str())
                                .with("step_id", step.id.as_str())
                                .with("reason", plan.entry.reason.clone()),
                        );
                    }
                }
            }
        }

        CascadeOutcome { entry: plan.entry, destination: plan.destination, notifications }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::RejectionCascadeResolver;
    use crate::domain::instance::{
        ApproverAction, ApproverSlot, DocumentRef, InstanceStatus, Step, StepStatus, StepType,
        WorkflowInstance,
    };
    use crate::domain::rejection::RejectionDestination;
    use crate::errors::WorkflowError;

    fn step(id: &str, order: u32, tier: u32) -> Step {
        Step::new(id, order, format!("Tier {tier} step {order}"), StepType::Approval, tier)
            .with_approver(ApproverSlot::new(format!("u-{id}"), "Approver"))
    }

    fn started(steps: Vec<Step>) -> WorkflowInstance {
        let now = Utc::now();
        let mut instance = WorkflowInstance::new(
            "WF-1",
            DocumentRef::new("work_order", "WO-1"),
            "u-requestor",
            steps,
            now,
        )
        .expect("valid chain");
        instance.start(now).expect("start");
        instance
    }

    #[test]
    fn blank_reason_is_refused_before_planning() {
        let instance = started(vec![step("s1", 1, 1)]);
        let resolver = RejectionCascadeResolver;

        let error = resolver
            .plan(&instance, "u-s1", "u-s1", None, "   ", Utc::now())
            .expect_err("blank reason");
        assert_eq!(error, WorkflowError::InvalidRejectionReason);
        assert!(instance.rejection_history.is_empty());
    }

    #[test]
    fn tier_one_rejection_returns_to_requestor_and_terminates() {
        let mut instance = started(vec![step("s1", 1, 1), step("s2", 2, 2)]);
        let resolver = RejectionCascadeResolver;
        let now = Utc::now();

        let plan = resolver
            .plan(&instance, "u-s1", "u-s1", None, "wrong cost center", now)
            .expect("plan");
        let outcome = resolver.apply(&mut instance, plan, now);

        assert_eq!(outcome.destination, RejectionDestination::Requestor);
        assert!(outcome.entry.returned_to_requestor);
        assert_eq!(outcome.entry.previous_status, InstanceStatus::InProgress);
        assert_eq!(instance.status, InstanceStatus::Rejected);
        assert_eq!(instance.steps[0].status, StepStatus::Rejected);
        assert_eq!(
            instance.steps[0].slot("u-s1").and_then(|slot| slot.action),
            Some(ApproverAction::Rejected)
        );
        assert_eq!(outcome.notifications[0].recipient_id, "u-requestor");
    }

    #[test]
    fn later_tier_rejection_rewinds_to_first_step_of_previous_tier() {
        let mut instance = started(vec![
            step("s1", 1, 1),
            step("s2", 2, 2),
            step("s3", 3, 2),
            step("s4", 4, 3),
        ]);
        let now = Utc::now();
        for _ in 0..3 {
            let current = instance.current_step_mut().expect("current");
            current.completed_approvals = 1;
            instance.advance_from_current(now);
        }
        assert_eq!(instance.current_step_order, 4);

        let resolver = RejectionCascadeResolver;
        let plan = resolver
            .plan(&instance, "u-s4", "u-s4", None, "insufficient detail", now)
            .expect("plan");
        let outcome = resolver.apply(&mut instance, plan, now);

        assert_eq!(outcome.destination, RejectionDestination::Tier { tier_level: 2 });
        assert_eq!(outcome.entry.tier_level, 3);
        assert_eq!(instance.current_step_order, 2);
        assert_eq!(instance.status, InstanceStatus::InProgress);
        assert_eq!(instance.steps[0].status, StepStatus::Completed);
        assert_eq!(instance.steps[1].status, StepStatus::Current);
        assert_eq!(instance.steps[1].completed_approvals, 0);
        assert_eq!(instance.steps[2].status, StepStatus::Pending);
        assert_eq!(instance.steps[3].status, StepStatus::Pending);
        assert_eq!(instance.rejection_history.len(), 1);
        assert_eq!(outcome.notifications[0].recipient_id, "u-s2");
    }
}
