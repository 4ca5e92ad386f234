use thiserror::Error;

use crate::domain::dispatch::{AssignmentId, AssignmentStatus, DepartmentCode, TaskId};
use crate::domain::instance::{InstanceId, InstanceStatus, StepId, StepVersion};
use crate::store::StoreError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("step `{requested}` is not the current step of the instance")]
    NotCurrentStep { requested: StepId, current: Option<StepId> },
    #[error("actor `{actor_id}` is not an approver on step `{step_id}` and holds no delegation for it")]
    StaleActor { actor_id: String, step_id: StepId },
    #[error("step state changed since it was read (expected {expected:?}, found {actual:?})")]
    StaleStepState { expected: StepVersion, actual: StepVersion },
    #[error("department `{department}` already holds an assignment for task `{task_id}`")]
    DuplicateAssignment { task_id: TaskId, department: DepartmentCode },
    #[error("task `{task_id}` is waiting on sign-off from department `{department}`")]
    SignoffPending { task_id: TaskId, department: DepartmentCode },
    #[error("approver `{approver_id}` already approved step `{step_id}`; the approval stands")]
    SlotAlreadyApproved { step_id: StepId, approver_id: String },
    #[error("a rejection requires a non-empty reason")]
    InvalidRejectionReason,
    #[error("instance `{instance_id}` is already {}", status.as_str())]
    InstanceTerminal { instance_id: InstanceId, status: InstanceStatus },
    #[error("instance `{instance_id}` has not been started")]
    InstanceNotStarted { instance_id: InstanceId },
    #[error("step `{step_id}` does not exist on instance `{instance_id}`")]
    StepNotFound { instance_id: InstanceId, step_id: StepId },
    #[error("step `{step_id}` is not a condition step")]
    NotConditionStep { step_id: StepId },
    #[error("condition step `{step_id}` completes from its predicate, not from approver actions")]
    ConditionStepRequiresPredicate { step_id: StepId },
    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),
    #[error("invalid delegation: {0}")]
    InvalidDelegation(String),
    #[error("invalid dispatch: {0}")]
    InvalidDispatch(String),
    #[error("task `{0}` is not registered")]
    TaskNotFound(TaskId),
    #[error("assignment `{0}` does not exist")]
    AssignmentNotFound(AssignmentId),
    #[error("assignment `{assignment_id}` cannot move from {} to {}", from.as_str(), to.as_str())]
    InvalidAssignmentTransition {
        assignment_id: AssignmentId,
        from: AssignmentStatus,
        to: AssignmentStatus,
    },
}

impl WorkflowError {
    /// Concurrency conflicts the caller should resolve by refetching and retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StaleStepState { .. })
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error("instance `{instance_id}` was modified concurrently (expected version {expected}, found {actual})")]
    VersionConflict { instance_id: InstanceId, expected: u64, actual: u64 },
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl From<StoreError> for ApplicationError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::VersionConflict { instance_id, expected, actual } => {
                Self::VersionConflict { instance_id, expected, actual }
            }
            StoreError::NotFound(instance_id) => {
                Self::Persistence(format!("instance `{instance_id}` not found"))
            }
            StoreError::Backend(message) => Self::Persistence(message),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Conflict { .. } => "This item changed while you were working. Refresh and retry.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let unassigned = || "unassigned".to_owned();
        match value {
            ApplicationError::Workflow(error) if error.is_retryable() => {
                Self::Conflict { message: error.to_string(), correlation_id: unassigned() }
            }
            ApplicationError::Workflow(error) => {
                Self::BadRequest { message: error.to_string(), correlation_id: unassigned() }
            }
            conflict @ ApplicationError::VersionConflict { .. } => {
                Self::Conflict { message: conflict.to_string(), correlation_id: unassigned() }
            }
            ApplicationError::Persistence(message) | ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id: unassigned() }
            }
            ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: unassigned() }
            }
        }
    }
}
