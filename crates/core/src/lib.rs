pub mod audit;
pub mod cascade;
pub mod config;
pub mod coordination;
pub mod delegation;
pub mod domain;
pub mod errors;
pub mod escalation;
pub mod notify;
pub mod orchestrator;
pub mod quorum;
pub mod store;
pub mod timeline;

pub use audit::{
    AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink, AuditTrail,
    ChainVerification, InMemoryAuditSink,
};
pub use cascade::{CascadeOutcome, CascadePlan, RejectionCascadeResolver};
pub use coordination::{
    AssignmentOutcome, DepartmentCoordinator, DispatchOutcome, DispatchRequest, ResponseWindows,
    TaskResolution,
};
pub use delegation::{ActorResolution, DelegationResolver, ResolutionReport};
pub use domain::delegation::{DelegationId, DelegationPhase, DelegationRecord};
pub use domain::dispatch::{
    AssignmentId, AssignmentStatus, DepartmentAssignment, DepartmentCode, DispatchId,
    DispatchPriority, EscalationDispatch, OriginTask, OriginTaskStatus, TaskId,
};
pub use domain::instance::{
    AdvanceOutcome, ApproverAction, ApproverSlot, DocumentRef, EscalationAction, InstanceId,
    InstanceStatus, Step, StepEscalation, StepId, StepStatus, StepType, StepVersion,
    WorkflowInstance,
};
pub use domain::rejection::{RejectionDestination, RejectionHistoryEntry, RejectionId};
pub use errors::{ApplicationError, InterfaceError, WorkflowError};
pub use escalation::{EscalationMonitor, EscalationOutcome, SweepReport};
pub use notify::{InMemoryNotifier, NotificationEvent, NotificationKind, Notifier, TracingNotifier};
pub use orchestrator::{
    DelegationWindow, Disposition, Intent, IntentOutcome, IntentRequest, LifecycleOutcome,
    WorkflowOrchestrator,
};
pub use quorum::{QuorumOutcome, StepQuorumEvaluator};
pub use store::{InMemoryInstanceStore, InstanceStore, StoreError};
pub use timeline::{timeline, TimelineEntry, TimelineKind};
