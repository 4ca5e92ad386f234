use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ApprovalRequested,
    StepEscalated,
    InstanceApproved,
    InstanceRejected,
    InstanceReturned,
    InstanceCancelled,
    DelegationActivated,
    DelegationExpiring,
    DelegationExpired,
    DepartmentDispatched,
    SignoffCompleted,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApprovalRequested => "approval_requested",
            Self::StepEscalated => "step_escalated",
            Self::InstanceApproved => "instance_approved",
            Self::InstanceRejected => "instance_rejected",
            Self::InstanceReturned => "instance_returned",
            Self::InstanceCancelled => "instance_cancelled",
            Self::DelegationActivated => "delegation_activated",
            Self::DelegationExpiring => "delegation_expiring",
            Self::DelegationExpired => "delegation_expired",
            Self::DepartmentDispatched => "department_dispatched",
            Self::SignoffCompleted => "signoff_completed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub kind: NotificationKind,
    pub recipient_id: String,
    pub payload: BTreeMap<String, String>,
}

impl NotificationEvent {
    pub fn new(kind: NotificationKind, recipient_id: impl Into<String>) -> Self {
        Self { kind, recipient_id: recipient_id.into(), payload: BTreeMap::new() }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("notification `{kind}` to `{recipient_id}` failed: {reason}")]
pub struct NotifyError {
    pub kind: &'static str,
    pub recipient_id: String,
    pub reason: String,
}

/// Outbound notification collaborator. Delivery is fire-and-forget from the
/// engine's point of view.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &NotificationEvent) -> Result<(), NotifyError>;
}

/// Delivers every event, logging failures. Returns the number delivered.
pub fn deliver_all(notifier: &dyn Notifier, events: &[NotificationEvent]) -> usize {
    let mut delivered = 0;
    for event in events {
        match notifier.notify(event) {
            Ok(()) => delivered += 1,
            Err(error) => warn!(
                event_name = "notification.delivery_failed",
                kind = event.kind.as_str(),
                recipient_id = %event.recipient_id,
                error = %error,
                "notification delivery failed; workflow state is unaffected"
            ),
        }
    }
    delivered
}

#[derive(Clone, Default)]
pub struct InMemoryNotifier {
    sent: Arc<Mutex<Vec<NotificationEvent>>>,
    failing: Arc<Mutex<bool>>,
}

impl InMemoryNotifier {
    pub fn sent(&self) -> Vec<NotificationEvent> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Makes every subsequent delivery fail, for exercising best-effort paths.
    pub fn set_failing(&self, failing: bool) {
        match self.failing.lock() {
            Ok(mut flag) => *flag = failing,
            Err(poisoned) => *poisoned.into_inner() = failing,
        }
    }

    fn is_failing(&self) -> bool {
        match self.failing.lock() {
            Ok(flag) => *flag,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl Notifier for InMemoryNotifier {
    fn notify(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        if self.is_failing() {
            return Err(NotifyError {
                kind: event.kind.as_str(),
                recipient_id: event.recipient_id.clone(),
                reason: "notifier unavailable".to_string(),
            });
        }
        match self.sent.lock() {
            Ok(mut sent) => sent.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
        Ok(())
    }
}

/// Writes notifications to the log instead of a delivery channel.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        info!(
            event_name = "notification.emitted",
            kind = event.kind.as_str(),
            recipient_id = %event.recipient_id,
            payload = ?event.payload,
            "notification emitted"
        );
        Ok(())
    }
}
