use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::instance::{ApproverAction, StepId, StepStatus, WorkflowInstance};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineKind {
    Requested,
    ApproverAction,
    StepEscalated,
    Rejected,
    StepCompleted,
    StepActivated,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub at: DateTime<Utc>,
    pub kind: TimelineKind,
    pub step_id: Option<StepId>,
    pub step_name: Option<String>,
    pub tier_level: Option<u32>,
    pub actor_id: Option<String>,
    pub action: Option<ApproverAction>,
    pub delegated_from: Option<String>,
    pub detail: Option<String>,
}

impl TimelineEntry {
    fn new(at: DateTime<Utc>, kind: TimelineKind) -> Self {
        Self {
            at,
            kind,
            step_id: None,
            step_name: None,
            tier_level: None,
            actor_id: None,
            action: None,
            delegated_from: None,
            detail: None,
        }
    }
}

/// Chronological view of an instance: request, step activations, approver actions,
/// escalations, completions and rejections. Prior rounds erased by a rejection reset
/// survive only through the rejection history.
pub fn timeline(instance: &WorkflowInstance) -> Vec<TimelineEntry> {
    let mut entries = vec![TimelineEntry {
        actor_id: Some(instance.requested_by.clone()),
        detail: Some(format!("{} {}", instance.document_ref.kind, instance.document_ref.id)),
        ..TimelineEntry::new(instance.created_at, TimelineKind::Requested)
    }];

    for step in &instance.steps {
        let for_step = |at: DateTime<Utc>, kind: TimelineKind| TimelineEntry {
            step_id: Some(step.id.clone()),
            step_name: Some(step.step_name.clone()),
            tier_level: Some(step.tier_level),
            ..TimelineEntry::new(at, kind)
        };

        if let Some(at) = step.became_current_at {
            entries.push(for_step(at, TimelineKind::StepActivated));
        }
        for slot in &step.approvers {
            if let (Some(action), Some(at)) = (slot.action, slot.action_at) {
                entries.push(TimelineEntry {
                    actor_id: Some(slot.id.clone()),
                    action: Some(action),
                    delegated_from: slot.delegated_from.clone(),
                    detail: slot.comments.clone(),
                    ..for_step(at, TimelineKind::ApproverAction)
                });
            }
        }
        if let Some(at) = step.escalation.as_ref().and_then(|latch| latch.triggered_at) {
            entries.push(for_step(at, TimelineKind::StepEscalated));
        }
        if step.status == StepStatus::Completed {
            if let Some(at) = step.completed_at {
                entries.push(for_step(at, TimelineKind::StepCompleted));
            }
        }
    }

    for rejection in &instance.rejection_history {
        let destination = match rejection.returned_to_tier {
            Some(tier) => format!("returned to tier {tier}"),
            None => "returned to requestor".to_string(),
        };
        entries.push(TimelineEntry {
            step_name: rejection.step_name.clone(),
            tier_level: Some(rejection.tier_level),
            actor_id: Some(rejection.rejected_by.clone()),
            action: Some(ApproverAction::Rejected),
            delegated_from: rejection.delegated_from.clone(),
            detail: Some(format!("{}: {destination}", rejection.reason)),
            ..TimelineEntry::new(rejection.rejected_at, TimelineKind::Rejected)
        });
    }

    entries.sort_by(|left, right| left.at.cmp(&right.at).then(left.kind.cmp(&right.kind)));
    entries
}
