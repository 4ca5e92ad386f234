use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::rejection::RejectionHistoryEntry;
use crate::domain::string_id;
use crate::errors::WorkflowError;

string_id!(InstanceId, StepId);

/// The record an approval chain is attached to (work order, purchase request, ...).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub kind: String,
    pub id: String,
}

impl DocumentRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self { kind: kind.into(), id: id.into() }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    InProgress,
    Approved,
    Rejected,
    Cancelled,
    Escalated,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Escalated => "escalated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "cancelled" => Some(Self::Cancelled),
            "escalated" => Some(Self::Escalated),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Cancelled)
    }

    /// Escalated instances still accept actor intents; a human action supersedes the escalation.
    pub fn accepts_intents(&self) -> bool {
        matches!(self, Self::InProgress | Self::Escalated)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Approval,
    Review,
    Notification,
    Condition,
    Parallel,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approval => "approval",
            Self::Review => "review",
            Self::Notification => "notification",
            Self::Condition => "condition",
            Self::Parallel => "parallel",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approval" => Some(Self::Approval),
            "review" => Some(Self::Review),
            "notification" => Some(Self::Notification),
            "condition" => Some(Self::Condition),
            "parallel" => Some(Self::Parallel),
            _ => None,
        }
    }

    /// Informational steps complete on the first recorded action.
    pub fn completes_on_first_action(&self) -> bool {
        matches!(self, Self::Review | Self::Notification)
    }

    pub fn has_human_approvers(&self) -> bool {
        !matches!(self, Self::Condition)
    }

    pub fn is_escalation_exempt(&self) -> bool {
        matches!(self, Self::Notification)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Current,
    Completed,
    Rejected,
    Skipped,
    Escalated,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Current => "current",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Skipped => "skipped",
            Self::Escalated => "escalated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "current" => Some(Self::Current),
            "completed" => Some(Self::Completed),
            "rejected" => Some(Self::Rejected),
            "skipped" => Some(Self::Skipped),
            "escalated" => Some(Self::Escalated),
            _ => None,
        }
    }

    /// A step the chain is currently waiting on.
    pub fn is_awaiting_action(&self) -> bool {
        matches!(self, Self::Current | Self::Escalated)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApproverAction {
    Approved,
    Rejected,
    Delegated,
    Escalated,
    Skipped,
    Reassigned,
}

impl ApproverAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Delegated => "delegated",
            Self::Escalated => "escalated",
            Self::Skipped => "skipped",
            Self::Reassigned => "reassigned",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproverSlot {
    pub id: String,
    pub name: String,
    pub role: Option<String>,
    pub action: Option<ApproverAction>,
    pub action_at: Option<DateTime<Utc>>,
    pub comments: Option<String>,
    pub delegated_from: Option<String>,
}

impl ApproverSlot {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: None,
            action: None,
            action_at: None,
            comments: None,
            delegated_from: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn has_approved(&self) -> bool {
        matches!(self.action, Some(ApproverAction::Approved))
    }

    pub fn record(
        &mut self,
        action: ApproverAction,
        at: DateTime<Utc>,
        comments: Option<String>,
        delegated_from: Option<String>,
    ) {
        self.action = Some(action);
        self.action_at = Some(at);
        self.comments = comments;
        self.delegated_from = delegated_from;
    }

    pub fn clear(&mut self) {
        self.action = None;
        self.action_at = None;
        self.comments = None;
        self.delegated_from = None;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationAction {
    Reassign,
    NotifyOnly,
    AutoApprove,
}

impl EscalationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reassign => "reassign",
            Self::NotifyOnly => "notify_only",
            Self::AutoApprove => "auto_approve",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reassign" => Some(Self::Reassign),
            "notify_only" => Some(Self::NotifyOnly),
            "auto_approve" => Some(Self::AutoApprove),
            _ => None,
        }
    }
}

/// Timeout policy attached to a step. `triggered` is a one-shot latch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepEscalation {
    pub timeout_hours: u32,
    pub action: EscalationAction,
    pub triggered: bool,
    pub triggered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub escalate_to: Vec<String>,
}

impl StepEscalation {
    pub fn new(timeout_hours: u32, action: EscalationAction) -> Self {
        Self {
            timeout_hours,
            action,
            triggered: false,
            triggered_at: None,
            escalate_to: Vec::new(),
        }
    }

    pub fn with_recipient(mut self, recipient_id: impl Into<String>) -> Self {
        self.escalate_to.push(recipient_id.into());
        self
    }
}

/// Optimistic-concurrency token for a step: the `(completedApprovals, status)` pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepVersion {
    pub completed_approvals: u32,
    pub status: StepStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub step_order: u32,
    pub step_name: String,
    pub step_type: StepType,
    pub tier_level: u32,
    pub category: Option<String>,
    pub status: StepStatus,
    pub approvers: Vec<ApproverSlot>,
    pub required_approvals: u32,
    pub completed_approvals: u32,
    pub escalation: Option<StepEscalation>,
    pub became_current_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(
        id: impl Into<String>,
        step_order: u32,
        step_name: impl Into<String>,
        step_type: StepType,
        tier_level: u32,
    ) -> Self {
        Self {
            id: StepId(id.into()),
            step_order,
            step_name: step_name.into(),
            step_type,
            tier_level,
            category: None,
            status: StepStatus::Pending,
            approvers: Vec::new(),
            required_approvals: 1,
            completed_approvals: 0,
            escalation: None,
            became_current_at: None,
            completed_at: None,
        }
    }

    pub fn with_approver(mut self, slot: ApproverSlot) -> Self {
        self.approvers.push(slot);
        self
    }

    pub fn with_required_approvals(mut self, required_approvals: u32) -> Self {
        self.required_approvals = required_approvals;
        self
    }

    pub fn with_escalation(mut self, escalation: StepEscalation) -> Self {
        self.escalation = Some(escalation);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn version(&self) -> StepVersion {
        StepVersion { completed_approvals: self.completed_approvals, status: self.status }
    }

    pub fn slot(&self, approver_id: &str) -> Option<&ApproverSlot> {
        self.approvers.iter().find(|slot| slot.id == approver_id)
    }

    pub fn slot_mut(&mut self, approver_id: &str) -> Option<&mut ApproverSlot> {
        self.approvers.iter_mut().find(|slot| slot.id == approver_id)
    }

    pub fn activate(&mut self, now: DateTime<Utc>) {
        self.status = StepStatus::Current;
        self.became_current_at = Some(now);
    }

    /// Returns the step to `pending`, discarding approvals and slot actions.
    /// The escalation latch is historical and survives the reset.
    pub fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.completed_approvals = 0;
        self.became_current_at = None;
        self.completed_at = None;
        for slot in &mut self.approvers {
            slot.clear();
        }
    }

    fn validate(&self) -> Result<(), WorkflowError> {
        if self.step_name.trim().is_empty() {
            return Err(WorkflowError::InvalidDefinition(format!(
                "step `{}` must have a name",
                self.id
            )));
        }

        if !self.step_type.has_human_approvers() {
            if !self.approvers.is_empty() {
                return Err(WorkflowError::InvalidDefinition(format!(
                    "condition step `{}` cannot carry approvers",
                    self.id
                )));
            }
            return Ok(());
        }

        if self.approvers.is_empty() {
            return Err(WorkflowError::InvalidDefinition(format!(
                "step `{}` requires at least one approver",
                self.id
            )));
        }

        if self.required_approvals == 0 {
            return Err(WorkflowError::InvalidDefinition(format!(
                "step `{}` must require at least one approval",
                self.id
            )));
        }

        let gating = matches!(self.step_type, StepType::Approval | StepType::Parallel);
        if gating && self.required_approvals as usize > self.approvers.len() {
            return Err(WorkflowError::InvalidDefinition(format!(
                "step `{}` requires {} approvals but only has {} approvers",
                self.id,
                self.required_approvals,
                self.approvers.len()
            )));
        }

        let mut seen = HashSet::new();
        for slot in &self.approvers {
            if !seen.insert(slot.id.as_str()) {
                return Err(WorkflowError::InvalidDefinition(format!(
                    "approver `{}` appears twice on step `{}`",
                    slot.id, self.id
                )));
            }
        }

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdvanceOutcome {
    Advanced { to_step_order: u32 },
    ChainApproved,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub document_ref: DocumentRef,
    pub requested_by: String,
    pub status: InstanceStatus,
    pub current_step_order: u32,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub rejection_history: Vec<RejectionHistoryEntry>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// Builds a fresh instance from a chain definition.
    ///
    /// Steps are ordered by `step_order`, which must be dense and 1-based. Tier levels
    /// start at 1 and never decrease or skip a level along the chain.
    pub fn new(
        id: impl Into<String>,
        document_ref: DocumentRef,
        requested_by: impl Into<String>,
        mut steps: Vec<Step>,
        now: DateTime<Utc>,
    ) -> Result<Self, WorkflowError> {
        if steps.is_empty() {
            return Err(WorkflowError::InvalidDefinition(
                "an approval chain needs at least one step".to_string(),
            ));
        }

        steps.sort_by_key(|step| step.step_order);
        let mut step_ids = HashSet::new();
        let mut previous_tier = 0;
        for (index, step) in steps.iter_mut().enumerate() {
            let expected_order = index as u32 + 1;
            if step.step_order != expected_order {
                return Err(WorkflowError::InvalidDefinition(format!(
                    "step orders must be dense and 1-based; expected {expected_order}, found {}",
                    step.step_order
                )));
            }
            if !step_ids.insert(step.id.clone()) {
                return Err(WorkflowError::InvalidDefinition(format!(
                    "duplicate step id `{}`",
                    step.id
                )));
            }
            let tier_ok = if index == 0 {
                step.tier_level == 1
            } else {
                step.tier_level == previous_tier || step.tier_level == previous_tier + 1
            };
            if !tier_ok {
                return Err(WorkflowError::InvalidDefinition(format!(
                    "step `{}` has tier {} after tier {previous_tier}; tiers start at 1 and advance by one",
                    step.id, step.tier_level
                )));
            }
            previous_tier = step.tier_level;

            step.validate()?;
            step.reset();
        }

        Ok(Self {
            id: InstanceId(id.into()),
            document_ref,
            requested_by: requested_by.into(),
            status: InstanceStatus::Pending,
            current_step_order: 1,
            steps,
            rejection_history: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Moves a pending instance into `in_progress` with its first step current.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), WorkflowError> {
        if self.status != InstanceStatus::Pending {
            return Err(self.not_pending_error());
        }

        let first = self.steps.first_mut().ok_or_else(|| {
            WorkflowError::InvalidDefinition("an approval chain needs at least one step".into())
        })?;
        first.activate(now);
        self.current_step_order = first.step_order;
        self.status = InstanceStatus::InProgress;
        self.touch(now);
        Ok(())
    }

    pub fn current_step(&self) -> Option<&Step> {
        self.steps.iter().find(|step| step.step_order == self.current_step_order)
    }

    pub fn current_step_mut(&mut self) -> Option<&mut Step> {
        let order = self.current_step_order;
        self.steps.iter_mut().find(|step| step.step_order == order)
    }

    pub fn step(&self, step_id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|step| &step.id == step_id)
    }

    pub fn step_by_order(&self, step_order: u32) -> Option<&Step> {
        self.steps.iter().find(|step| step.step_order == step_order)
    }

    pub fn step_by_order_mut(&mut self, step_order: u32) -> Option<&mut Step> {
        self.steps.iter_mut().find(|step| step.step_order == step_order)
    }

    pub fn first_step_of_tier(&self, tier_level: u32) -> Option<&Step> {
        self.steps.iter().filter(|step| step.tier_level == tier_level).min_by_key(|s| s.step_order)
    }

    /// Category used to scope delegations: the step override, else the document kind.
    pub fn category_for<'a>(&'a self, step: &'a Step) -> &'a str {
        step.category.as_deref().unwrap_or(self.document_ref.kind.as_str())
    }

    /// Completes the current step and moves to the next pending one, or approves the chain.
    pub fn advance_from_current(&mut self, now: DateTime<Utc>) -> AdvanceOutcome {
        let current_order = self.current_step_order;
        if let Some(step) = self.current_step_mut() {
            step.status = StepStatus::Completed;
            step.completed_at = Some(now);
        }

        let next = self
            .steps
            .iter_mut()
            .filter(|step| step.step_order > current_order && step.status == StepStatus::Pending)
            .min_by_key(|step| step.step_order);

        match next {
            Some(step) => {
                step.activate(now);
                let to_step_order = step.step_order;
                self.current_step_order = to_step_order;
                self.status = InstanceStatus::InProgress;
                AdvanceOutcome::Advanced { to_step_order }
            }
            None => {
                self.status = InstanceStatus::Approved;
                AdvanceOutcome::ChainApproved
            }
        }
    }

    /// Records a mutation for optimistic persistence.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }

    /// Validates that actor intents may be applied to this instance.
    pub fn ensure_accepts_intents(&self) -> Result<(), WorkflowError> {
        if self.status.accepts_intents() {
            return Ok(());
        }
        if self.status == InstanceStatus::Pending {
            return Err(WorkflowError::InstanceNotStarted { instance_id: self.id.clone() });
        }
        Err(WorkflowError::InstanceTerminal { instance_id: self.id.clone(), status: self.status })
    }

    fn not_pending_error(&self) -> WorkflowError {
        if self.status.is_terminal() {
            WorkflowError::InstanceTerminal { instance_id: self.id.clone(), status: self.status }
        } else {
            WorkflowError::InvalidDefinition(format!(
                "instance `{}` was already started (status {})",
                self.id,
                self.status.as_str()
            ))
        }
    }
}
