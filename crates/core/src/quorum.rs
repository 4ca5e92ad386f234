use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::instance::{ApproverAction, Step, StepType};
use crate::errors::WorkflowError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuorumOutcome {
    /// Counted, quorum not yet reached.
    Recorded { completed: u32, required: u32 },
    /// The step has everything it needs; the caller advances the instance.
    Satisfied,
    /// The resolved approver had already approved this step.
    AlreadyRecorded,
}

impl QuorumOutcome {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Satisfied)
    }
}

/// Counts approvals on a step. Approvals are additive: every required approver
/// acts, there is no majority rule.
#[derive(Clone, Copy, Debug, Default)]
pub struct StepQuorumEvaluator;

impl StepQuorumEvaluator {
    /// Checks that an approval could be recorded on `slot_id` without mutating anything.
    pub fn check_approval(&self, step: &Step, slot_id: &str) -> Result<(), WorkflowError> {
        if !step.step_type.has_human_approvers() {
            return Err(WorkflowError::ConditionStepRequiresPredicate { step_id: step.id.clone() });
        }
        if !step.status.is_awaiting_action() {
            return Err(WorkflowError::NotCurrentStep {
                requested: step.id.clone(),
                current: None,
            });
        }
        if step.slot(slot_id).is_none() {
            return Err(WorkflowError::StaleActor {
                actor_id: slot_id.to_string(),
                step_id: step.id.clone(),
            });
        }
        Ok(())
    }

    pub fn record_approval(
        &self,
        step: &mut Step,
        slot_id: &str,
        delegated_from: Option<String>,
        comments: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<QuorumOutcome, WorkflowError> {
        self.check_approval(step, slot_id)?;

        let step_type = step.step_type;
        let step_id = step.id.clone();
        let slot = step
            .slot_mut(slot_id)
            .ok_or_else(|| WorkflowError::StaleActor { actor_id: slot_id.to_string(), step_id })?;
        if slot.has_approved() {
            return Ok(QuorumOutcome::AlreadyRecorded);
        }
        slot.record(ApproverAction::Approved, now, comments, delegated_from);
        step.completed_approvals = approved_slots(step);

        if step_type.completes_on_first_action() || self.is_satisfied(step) {
            return Ok(QuorumOutcome::Satisfied);
        }

        Ok(QuorumOutcome::Recorded {
            completed: step.completed_approvals,
            required: step.required_approvals,
        })
    }

    pub fn is_satisfied(&self, step: &Step) -> bool {
        let approved = approved_slots(step);
        match step.step_type {
            StepType::Condition => false,
            StepType::Review | StepType::Notification => approved >= 1,
            StepType::Approval | StepType::Parallel => approved >= step.required_approvals,
        }
    }

    /// A condition step completes only when the caller reports its predicate true.
    pub fn satisfy_condition(&self, step: &Step, predicate: bool) -> Result<bool, WorkflowError> {
        if step.step_type != StepType::Condition {
            return Err(WorkflowError::NotConditionStep { step_id: step.id.clone() });
        }
        if !step.status.is_awaiting_action() {
            return Err(WorkflowError::NotCurrentStep {
                requested: step.id.clone(),
                current: None,
            });
        }
        Ok(predicate)
    }
}

/// Approvals are counted from the slots, so one approver can never count twice.
fn approved_slots(step: &Step) -> u32 {
    step.approvers.iter().filter(|slot| slot.has_approved()).count() as u32
}
