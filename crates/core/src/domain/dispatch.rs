use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::string_id;

string_id!(DispatchId, AssignmentId, TaskId, DepartmentCode);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPriority {
    Medium,
    High,
    Critical,
    Emergency,
}

impl DispatchPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
            Self::Emergency => "emergency",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            "emergency" => Some(Self::Emergency),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationDispatch {
    pub id: DispatchId,
    pub from_department_code: DepartmentCode,
    pub from_task_id: TaskId,
    pub target_departments: BTreeSet<DepartmentCode>,
    pub priority: DispatchPriority,
    pub reason: String,
    pub requires_signoff: bool,
    pub signoff_department_code: Option<DepartmentCode>,
    pub dispatched_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Open,
    Acknowledged,
    Completed,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Acknowledged => "acknowledged",
            Self::Completed => "completed",
        }
    }
}

/// A unit of work handed to a department outside the primary approval chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepartmentAssignment {
    pub id: AssignmentId,
    pub dispatch_id: DispatchId,
    pub origin_task_id: TaskId,
    pub department_code: DepartmentCode,
    pub priority: DispatchPriority,
    pub status: AssignmentStatus,
    pub due_at: DateTime<Utc>,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub completed_by: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DepartmentAssignment {
    pub fn is_completed(&self) -> bool {
        self.status == AssignmentStatus::Completed
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginTaskStatus {
    Open,
    Resolved,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginTask {
    pub id: TaskId,
    pub department_code: DepartmentCode,
    pub status: OriginTaskStatus,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
