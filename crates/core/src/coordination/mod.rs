//! Cross-department escalation.
//!
//! Dispatches create sibling assignments outside the approval chain. They never touch
//! a `WorkflowInstance`; the only coupling is the sign-off gate on the origin task.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome};
use crate::config::AppConfig;
use crate::domain::dispatch::{
    AssignmentId, AssignmentStatus, DepartmentAssignment, DepartmentCode, DispatchId,
    DispatchPriority, EscalationDispatch, OriginTask, OriginTaskStatus, TaskId,
};
use crate::domain::normalize_key;
use crate::errors::WorkflowError;
use crate::notify::{NotificationEvent, NotificationKind};

/// Response-due table for department assignments, by priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseWindows {
    pub medium_hours: u32,
    pub high_hours: u32,
    pub critical_hours: u32,
    pub emergency_hours: u32,
}

impl Default for ResponseWindows {
    fn default() -> Self {
        Self { medium_hours: 72, high_hours: 24, critical_hours: 4, emergency_hours: 1 }
    }
}

impl ResponseWindows {
    pub fn due_in(&self, priority: DispatchPriority) -> Duration {
        let hours = match priority {
            DispatchPriority::Medium => self.medium_hours,
            DispatchPriority::High => self.high_hours,
            DispatchPriority::Critical => self.critical_hours,
            DispatchPriority::Emergency => self.emergency_hours,
        };
        Duration::hours(i64::from(hours))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub from_task_id: TaskId,
    pub target_departments: Vec<DepartmentCode>,
    pub reason: String,
    pub priority: DispatchPriority,
    pub requires_signoff: bool,
    /// Defaults to the only target when exactly one department is dispatched.
    pub signoff_department_code: Option<DepartmentCode>,
    pub dispatched_by: String,
    pub correlation_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub dispatch: EscalationDispatch,
    pub assignments: Vec<DepartmentAssignment>,
    pub audit_event: AuditEvent,
    pub notifications: Vec<NotificationEvent>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssignmentOutcome {
    pub assignment: DepartmentAssignment,
    pub audit_event: AuditEvent,
    pub notifications: Vec<NotificationEvent>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskResolution {
    pub task: OriginTask,
    pub audit_event: AuditEvent,
}

#[derive(Clone, Debug, Default)]
pub struct DepartmentCoordinator {
    windows: ResponseWindows,
    tasks: HashMap<TaskId, OriginTask>,
    dispatches: Vec<EscalationDispatch>,
    assignments: Vec<DepartmentAssignment>,
    signoff_gates: HashMap<TaskId, Vec<AssignmentId>>,
}

impl DepartmentCoordinator {
    pub fn new(windows: ResponseWindows) -> Self {
        Self { windows, ..Self::default() }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.dispatch)
    }

    pub fn register_task(
        &mut self,
        task_id: TaskId,
        department_code: DepartmentCode,
        now: DateTime<Utc>,
    ) -> Result<OriginTask, WorkflowError> {
        if self.tasks.contains_key(&task_id) {
            return Err(WorkflowError::InvalidDispatch(format!(
                "task `{task_id}` is already registered"
            )));
        }
        let task = OriginTask {
            id: task_id.clone(),
            department_code,
            status: OriginTaskStatus::Open,
            resolved_by: None,
            resolved_at: None,
            created_at: now,
        };
        self.tasks.insert(task_id, task.clone());
        Ok(task)
    }

    pub fn task(&self, task_id: &TaskId) -> Option<&OriginTask> {
        self.tasks.get(task_id)
    }

    pub fn dispatch(
        &mut self,
        request: DispatchRequest,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, WorkflowError> {
        let task = self
            .tasks
            .get(&request.from_task_id)
            .ok_or_else(|| WorkflowError::TaskNotFound(request.from_task_id.clone()))?;
        if task.status == OriginTaskStatus::Resolved {
            return Err(WorkflowError::InvalidDispatch(format!(
                "task `{}` is already resolved",
                task.id
            )));
        }
        let reason = request.reason.trim();
        if reason.is_empty() {
            return Err(WorkflowError::InvalidDispatch("a dispatch requires a reason".to_string()));
        }
        // Codes compare case-insensitively; the first spelling given is kept.
        let mut target_keys = BTreeSet::new();
        let targets: BTreeSet<DepartmentCode> = request
            .target_departments
            .iter()
            .filter(|department| {
                let key = normalize_key(department.as_str());
                !key.is_empty() && target_keys.insert(key)
            })
            .cloned()
            .collect();
        if targets.is_empty() {
            return Err(WorkflowError::InvalidDispatch(
                "at least one target department is required".to_string(),
            ));
        }

        let origin_key = normalize_key(task.department_code.as_str());
        let assigned: BTreeSet<String> = self
            .assignments
            .iter()
            .filter(|assignment| assignment.origin_task_id == task.id)
            .map(|assignment| normalize_key(assignment.department_code.as_str()))
            .collect();
        if let Some(department) = targets.iter().find(|department| {
            let key = normalize_key(department.as_str());
            key == origin_key || assigned.contains(&key)
        }) {
            return Err(WorkflowError::DuplicateAssignment {
                task_id: task.id.clone(),
                department: department.clone(),
            });
        }

        let signoff_department_code = match (
            request.requires_signoff,
            &request.signoff_department_code,
        ) {
            (false, None) => None,
            (false, Some(_)) => {
                return Err(WorkflowError::InvalidDispatch(
                    "a sign-off department was named but sign-off is not required".to_string(),
                ))
            }
            (true, Some(department)) => {
                let key = normalize_key(department.as_str());
                match targets.iter().find(|target| normalize_key(target.as_str()) == key) {
                    Some(target) => Some(target.clone()),
                    None => {
                        return Err(WorkflowError::InvalidDispatch(format!(
                            "sign-off department `{department}` is not among the dispatch targets"
                        )))
                    }
                }
            }
            (true, None) if targets.len() == 1 => targets.iter().next().cloned(),
            (true, None) => {
                return Err(WorkflowError::InvalidDispatch(
                    "sign-off department is required when dispatching to several departments"
                        .to_string(),
                ))
            }
        };
        let origin_department = task.department_code.clone();
        let dispatch = EscalationDispatch {
            id: DispatchId::new(Uuid::new_v4().to_string()),
            from_department_code: origin_department.clone(),
            from_task_id: request.from_task_id.clone(),
            target_departments: targets,
            priority: request.priority,
            reason: reason.to_string(),
            requires_signoff: request.requires_signoff,
            signoff_department_code,
            dispatched_by: request.dispatched_by.clone(),
            created_at: now,
        };

        let due_at = now + self.windows.due_in(request.priority);
        let mut assignments = Vec::with_capacity(dispatch.target_departments.len());
        let mut notifications = Vec::with_capacity(dispatch.target_departments.len());
        for department in &dispatch.target_departments {
            let assignment = DepartmentAssignment {
                id: AssignmentId::new(Uuid::new_v4().to_string()),
                dispatch_id: dispatch.id.clone(),
                origin_task_id: dispatch.from_task_id.clone(),
                department_code: department.clone(),
                priority: dispatch.priority,
                status: AssignmentStatus::Open,
                due_at,
                acknowledged_by: None,
                acknowledged_at: None,
                completed_by: None,
                completed_at: None,
                notes: None,
                created_at: now,
            };
            if dispatch.signoff_department_code.as_ref() == Some(department) {
                self.signoff_gates
                    .entry(dispatch.from_task_id.clone())
                    .or_default()
                    .push(assignment.id.clone());
            }
            notifications.push(
                NotificationEvent::new(NotificationKind::DepartmentDispatched, department.as_str())
                    .with("task_id", dispatch.from_task_id.as_str())
                    .with("assignment_id", assignment.id.as_str())
                    .with("priority", dispatch.priority.as_str())
                    .with("due_at", due_at.to_rfc3339())
                    .with("reason", dispatch.reason.as_str()),
            );
            assignments.push(assignment);
        }

        let targets_label: Vec<&str> =
            dispatch.target_departments.iter().map(DepartmentCode::as_str).collect();
        let mut audit_event = dispatch_context(&request.correlation_id, &request.dispatched_by)
            .event("dispatch.created", AuditCategory::Dispatch, AuditOutcome::Success)
            .at(now)
            .with_subject(dispatch.from_task_id.as_str())
            .with_metadata("dispatch_id", dispatch.id.as_str())
            .with_metadata("from_department", origin_department.as_str())
            .with_metadata("targets", targets_label.join(","))
            .with_metadata("priority", dispatch.priority.as_str())
            .with_metadata("reason", dispatch.reason.as_str());
        if let Some(department) = &dispatch.signoff_department_code {
            audit_event = audit_event.with_metadata("signoff_department", department.as_str());
        }

        info!(
            event_name = "dispatch.created",
            task_id = %dispatch.from_task_id,
            dispatch_id = %dispatch.id,
            targets = assignments.len(),
            priority = dispatch.priority.as_str(),
            requires_signoff = dispatch.requires_signoff,
            "cross-department escalation dispatched"
        );

        self.assignments.extend(assignments.iter().cloned());
        self.dispatches.push(dispatch.clone());
        Ok(DispatchOutcome { dispatch, assignments, audit_event, notifications })
    }

    pub fn acknowledge(
        &mut self,
        assignment_id: &AssignmentId,
        actor_id: &str,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AssignmentOutcome, WorkflowError> {
        let assignment = self.assignment_mut(assignment_id)?;
        if assignment.status != AssignmentStatus::Open {
            return Err(WorkflowError::InvalidAssignmentTransition {
                assignment_id: assignment_id.clone(),
                from: assignment.status,
                to: AssignmentStatus::Acknowledged,
            });
        }
        assignment.status = AssignmentStatus::Acknowledged;
        assignment.acknowledged_by = Some(actor_id.to_string());
        assignment.acknowledged_at = Some(now);
        let assignment = assignment.clone();

        let audit_event = assignment_event(
            &assignment,
            "dispatch.assignment.acknowledged",
            correlation_id,
            actor_id,
            now,
        );
        Ok(AssignmentOutcome { assignment, audit_event, notifications: Vec::new() })
    }

    /// Completes an open or acknowledged assignment. Completing a sign-off gate
    /// notifies the origin department.
    pub fn complete_assignment(
        &mut self,
        assignment_id: &AssignmentId,
        actor_id: &str,
        notes: Option<String>,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AssignmentOutcome, WorkflowError> {
        let assignment = self.assignment_mut(assignment_id)?;
        if assignment.is_completed() {
            return Err(WorkflowError::InvalidAssignmentTransition {
                assignment_id: assignment_id.clone(),
                from: assignment.status,
                to: AssignmentStatus::Completed,
            });
        }
        assignment.status = AssignmentStatus::Completed;
        assignment.completed_by = Some(actor_id.to_string());
        assignment.completed_at = Some(now);
        assignment.notes = notes;
        let assignment = assignment.clone();

        let mut notifications = Vec::new();
        let is_gate = self
            .signoff_gates
            .get(&assignment.origin_task_id)
            .is_some_and(|gates| gates.contains(&assignment.id));
        if is_gate {
            if let Some(task) = self.tasks.get(&assignment.origin_task_id) {
                notifications.push(
                    NotificationEvent::new(
                        NotificationKind::SignoffCompleted,
                        task.department_code.as_str(),
                    )
                    .with("task_id", task.id.as_str())
                    .with("signoff_department", assignment.department_code.as_str())
                    .with("completed_by", actor_id),
                );
            }
        }

        let audit_event = assignment_event(
            &assignment,
            "dispatch.assignment.completed",
            correlation_id,
            actor_id,
            now,
        )
        .with_metadata("signoff_gate", is_gate.to_string());
        info!(
            event_name = "dispatch.assignment.completed",
            assignment_id = %assignment.id,
            department = %assignment.department_code,
            signoff_gate = is_gate,
            "department assignment completed"
        );
        Ok(AssignmentOutcome { assignment, audit_event, notifications })
    }

    /// Resolves the origin task. Blocked while any sign-off assignment is incomplete.
    pub fn resolve_task(
        &mut self,
        task_id: &TaskId,
        actor_id: &str,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TaskResolution, WorkflowError> {
        let task =
            self.tasks.get(task_id).ok_or_else(|| WorkflowError::TaskNotFound(task_id.clone()))?;
        if task.status == OriginTaskStatus::Resolved {
            return Err(WorkflowError::InvalidDispatch(format!(
                "task `{task_id}` is already resolved"
            )));
        }

        if let Some(gates) = self.signoff_gates.get(task_id) {
            if let Some(pending) = self
                .assignments
                .iter()
                .find(|assignment| gates.contains(&assignment.id) && !assignment.is_completed())
            {
                return Err(WorkflowError::SignoffPending {
                    task_id: task_id.clone(),
                    department: pending.department_code.clone(),
                });
            }
        }

        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| WorkflowError::TaskNotFound(task_id.clone()))?;
        task.status = OriginTaskStatus::Resolved;
        task.resolved_by = Some(actor_id.to_string());
        task.resolved_at = Some(now);
        let task = task.clone();

        let audit_event = dispatch_context(correlation_id, actor_id)
            .event("dispatch.task.resolved", AuditCategory::Dispatch, AuditOutcome::Success)
            .at(now)
            .with_subject(task.id.as_str())
            .with_metadata("department", task.department_code.as_str());
        Ok(TaskResolution { task, audit_event })
    }

    pub fn assignments_for(&self, task_id: &TaskId) -> Vec<&DepartmentAssignment> {
        self.assignments.iter().filter(|assignment| &assignment.origin_task_id == task_id).collect()
    }

    pub fn dispatches_for(&self, task_id: &TaskId) -> Vec<&EscalationDispatch> {
        self.dispatches.iter().filter(|dispatch| &dispatch.from_task_id == task_id).collect()
    }

    /// Assignments past their response due time that are not yet completed.
    pub fn overdue(&self, now: DateTime<Utc>) -> Vec<&DepartmentAssignment> {
        let mut overdue: Vec<&DepartmentAssignment> = self
            .assignments
            .iter()
            .filter(|assignment| !assignment.is_completed() && assignment.due_at < now)
            .collect();
        overdue.sort_by_key(|assignment| assignment.due_at);
        overdue
    }

    fn assignment_mut(
        &mut self,
        assignment_id: &AssignmentId,
    ) -> Result<&mut DepartmentAssignment, WorkflowError> {
        self.assignments
            .iter_mut()
            .find(|assignment| &assignment.id == assignment_id)
            .ok_or_else(|| WorkflowError::AssignmentNotFound(assignment_id.clone()))
    }
}

fn dispatch_context(correlation_id: &str, actor_id: &str) -> AuditContext {
    AuditContext::new(None, correlation_id, actor_id)
}

fn assignment_event(
    assignment: &DepartmentAssignment,
    event_type: &str,
    correlation_id: &str,
    actor_id: &str,
    now: DateTime<Utc>,
) -> AuditEvent {
    dispatch_context(correlation_id, actor_id)
        .event(event_type, AuditCategory::Dispatch, AuditOutcome::Success)
        .at(now)
        .with_subject(assignment.origin_task_id.as_str())
        .with_metadata("assignment_id", assignment.id.as_str())
        .with_metadata("department", assignment.department_code.as_str())
        .with_metadata("status", assignment.status.as_str())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{DepartmentCoordinator, DispatchRequest, ResponseWindows};
    use crate::config::AppConfig;
    use crate::domain::dispatch::{
        AssignmentStatus, DepartmentCode, DispatchPriority, OriginTaskStatus, TaskId,
    };
    use crate::errors::WorkflowError;
    use crate::notify::NotificationKind;

    fn dept(code: &str) -> DepartmentCode {
        DepartmentCode::new(code)
    }

    fn request(targets: &[&str], requires_signoff: bool, signoff: Option<&str>) -> DispatchRequest {
        DispatchRequest {
            from_task_id: TaskId::new("T-100"),
            target_departments: targets.iter().map(|code| dept(code)).collect(),
            reason: "hydraulic leak needs safety and quality review".to_string(),
            priority: DispatchPriority::High,
            requires_signoff,
            signoff_department_code: signoff.map(dept),
            dispatched_by: "u-maint-lead".to_string(),
            correlation_id: "req-1".to_string(),
        }
    }

    fn coordinator() -> DepartmentCoordinator {
        let mut coordinator = DepartmentCoordinator::new(ResponseWindows::default());
        coordinator
            .register_task(TaskId::new("T-100"), dept("MAINT"), Utc::now())
            .expect("register");
        coordinator
    }

    #[test]
    fn signoff_gate_blocks_resolution_until_completed() {
        let mut coordinator = coordinator();
        let now = Utc::now();
        let outcome = coordinator
            .dispatch(request(&["SAFETY", "QUALITY"], true, Some("SAFETY")), now)
            .expect("dispatch");
        assert_eq!(outcome.assignments.len(), 2);
        assert_eq!(outcome.notifications.len(), 2);
        assert!(outcome
            .notifications
            .iter()
            .all(|event| event.kind == NotificationKind::DepartmentDispatched));

        let task_id = TaskId::new("T-100");
        let error = coordinator
            .resolve_task(&task_id, "u-maint-lead", "req-2", now)
            .expect_err("safety has not signed off");
        assert_eq!(
            error,
            WorkflowError::SignoffPending { task_id: task_id.clone(), department: dept("SAFETY") }
        );

        let safety = outcome
            .assignments
            .iter()
            .find(|assignment| assignment.department_code == dept("SAFETY"))
            .expect("safety assignment");
        let completed = coordinator
            .complete_assignment(
                &safety.id,
                "u-safety",
                Some("lockout verified".into()),
                "req-3",
                now,
            )
            .expect("complete");
        assert_eq!(completed.notifications[0].kind, NotificationKind::SignoffCompleted);
        assert_eq!(completed.notifications[0].recipient_id, "MAINT");

        let resolved =
            coordinator.resolve_task(&task_id, "u-maint-lead", "req-4", now).expect("resolve");
        assert_eq!(resolved.task.status, OriginTaskStatus::Resolved);
    }

    #[test]
    fn origin_and_already_assigned_departments_are_duplicates() {
        let mut coordinator = coordinator();
        let now = Utc::now();

        assert!(matches!(
            coordinator.dispatch(request(&["MAINT"], false, None), now),
            Err(WorkflowError::DuplicateAssignment { ref department, .. })
                if *department == dept("MAINT")
        ));

        coordinator.dispatch(request(&["SAFETY"], false, None), now).expect("first dispatch");
        assert!(matches!(
            coordinator.dispatch(request(&["QUALITY", "SAFETY"], false, None), now),
            Err(WorkflowError::DuplicateAssignment { ref department, .. })
                if *department == dept("SAFETY")
        ));
        assert_eq!(coordinator.assignments_for(&TaskId::new("T-100")).len(), 1);
    }

    #[test]
    fn department_codes_compare_case_insensitively() {
        let mut coordinator = coordinator();
        let now = Utc::now();

        assert!(matches!(
            coordinator.dispatch(request(&["maint"], false, None), now),
            Err(WorkflowError::DuplicateAssignment { ref department, .. })
                if *department == dept("maint")
        ));

        let outcome = coordinator
            .dispatch(request(&["SAFETY", " safety "], true, Some("Safety")), now)
            .expect("dispatch");
        assert_eq!(outcome.assignments.len(), 1);
        assert_eq!(outcome.dispatch.signoff_department_code, Some(dept("SAFETY")));

        assert!(matches!(
            coordinator.dispatch(request(&["Safety"], false, None), now),
            Err(WorkflowError::DuplicateAssignment { ref department, .. })
                if *department == dept("Safety")
        ));
    }

    #[test]
    fn configured_response_windows_set_due_dates() {
        let mut config = AppConfig::default();
        config.dispatch.high_hours = 6;
        let mut coordinator = DepartmentCoordinator::from_config(&config);
        let now = Utc::now();
        coordinator.register_task(TaskId::new("T-100"), dept("MAINT"), now).expect("register");

        let outcome =
            coordinator.dispatch(request(&["SAFETY"], false, None), now).expect("dispatch");
        assert_eq!(outcome.assignments[0].due_at, now + Duration::hours(6));
    }

    #[test]
    fn dispatch_validates_reason_and_signoff_target() {
        let mut coordinator = coordinator();
        let now = Utc::now();

        let mut blank = request(&["SAFETY"], false, None);
        blank.reason = " ".to_string();
        assert!(matches!(coordinator.dispatch(blank, now), Err(WorkflowError::InvalidDispatch(_))));

        assert!(matches!(
            coordinator.dispatch(request(&["SAFETY", "QUALITY"], true, None), now),
            Err(WorkflowError::InvalidDispatch(_))
        ));
        assert!(matches!(
            coordinator.dispatch(request(&["SAFETY"], true, Some("QUALITY")), now),
            Err(WorkflowError::InvalidDispatch(_))
        ));

        let single = coordinator.dispatch(request(&["SAFETY"], true, None), now).expect("dispatch");
        assert_eq!(single.dispatch.signoff_department_code, Some(dept("SAFETY")));
    }

    #[test]
    fn assignment_lifecycle_and_overdue_listing() {
        let mut coordinator = coordinator();
        let now = Utc::now();
        let outcome =
            coordinator.dispatch(request(&["SAFETY"], false, None), now).expect("dispatch");
        let assignment = &outcome.assignments[0];
        assert_eq!(assignment.due_at, now + Duration::hours(24));

        assert!(coordinator.overdue(now + Duration::hours(23)).is_empty());
        assert_eq!(coordinator.overdue(now + Duration::hours(25)).len(), 1);

        let acknowledged =
            coordinator.acknowledge(&assignment.id, "u-safety", "req-2", now).expect("ack");
        assert_eq!(acknowledged.assignment.status, AssignmentStatus::Acknowledged);
        assert!(matches!(
            coordinator.acknowledge(&assignment.id, "u-safety", "req-3", now),
            Err(WorkflowError::InvalidAssignmentTransition { .. })
        ));

        coordinator
            .complete_assignment(&assignment.id, "u-safety", None, "req-4", now)
            .expect("complete");
        assert!(coordinator.overdue(now + Duration::hours(25)).is_empty());
        assert!(matches!(
            coordinator.complete_assignment(&assignment.id, "u-safety", None, "req-5", now),
            Err(WorkflowError::InvalidAssignmentTransition { .. })
        ));
    }
}
