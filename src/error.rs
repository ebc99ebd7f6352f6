use crate::types::{DocumentType, StepOrder};
use sled::transaction::TransactionError;

/// Rejections raised while validating workflow definitions and caller input.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Workflow definition has no steps")]
    NoSteps,
    #[error("Steps must be contiguous from 0: expected step_order {expected}, found {found}")]
    NonContiguousSteps { expected: StepOrder, found: StepOrder },
    #[error("Duplicate step_order {0}")]
    DuplicateStepOrder(StepOrder),
    #[error("Step {0} has an empty approver set")]
    EmptyApproverSet(StepOrder),
    #[error("Field '{0}' must not be empty")]
    EmptyField(&'static str),
    #[error("Workflow code '{code}' is already used for {document_type} in this scope")]
    DuplicateCode {
        code: String,
        document_type: DocumentType,
    },
    #[error("An active system-wide default workflow already exists for {0}")]
    DuplicateSystemDefault(DocumentType),
    #[error("Enterprise workspace requires a company_id")]
    MissingCompany,
    #[error("Invalid delegation: {0}")]
    InvalidDelegate(String),
    #[error("Unknown document type '{0}'")]
    UnknownDocumentType(String),
    #[error("Unknown action '{0}'")]
    UnknownAction(String),
}

/// Engine error taxonomy. Every variant is recoverable by the caller except
/// `Storage` and `Codec`, which abort the surrounding transaction.
#[derive(thiserror::Error, Debug)]
pub enum ApprovalError {
    #[error("No active workflow is configured for {document_type} documents")]
    NoWorkflowConfigured {
        document_type: DocumentType,
        company_id: Option<u64>,
    },
    #[error("Invalid approver: {0}")]
    InvalidApprover(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("User {actor_id} already acted on step {step_order} of instance {instance_id}")]
    AlreadyProcessed {
        instance_id: u64,
        step_order: StepOrder,
        actor_id: u64,
    },
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
    #[error("Step {step_order} of instance {instance_id} has no eligible approvers")]
    BlockedStep { instance_id: u64, step_order: StepOrder },
    #[error("{document_type} document {document_id} already has an active approval (instance {instance_id})")]
    ActiveInstanceExists {
        document_type: DocumentType,
        document_id: u64,
        instance_id: u64,
    },
    #[error("Approval instance {0} not found")]
    InstanceNotFound(u64),
    #[error("Workflow definition {0} not found")]
    WorkflowNotFound(u64),
    #[error("Notification {0} not found")]
    NotificationNotFound(u64),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("Record encoding failure: {0}")]
    Codec(String),
}

impl ApprovalError {
    /// Machine-readable kind, stable across releases.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoWorkflowConfigured { .. } => "no_workflow_configured",
            Self::InvalidApprover(_) => "invalid_approver",
            Self::PermissionDenied(_) => "permission_denied",
            Self::AlreadyProcessed { .. } => "already_processed",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::BlockedStep { .. } => "blocked_step",
            Self::ActiveInstanceExists { .. } => "active_instance_exists",
            Self::InstanceNotFound(_) => "instance_not_found",
            Self::WorkflowNotFound(_) => "workflow_not_found",
            Self::NotificationNotFound(_) => "notification_not_found",
            Self::Validation(_) => "validation",
            Self::Storage(_) => "storage",
            Self::Codec(_) => "codec",
        }
    }

    /// Internal failures are the only ones that are not the caller's fault.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Codec(_))
    }
}

impl From<TransactionError<ApprovalError>> for ApprovalError {
    fn from(value: TransactionError<ApprovalError>) -> Self {
        match value {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => ApprovalError::Storage(e),
        }
    }
}

pub type Result<T, E = ApprovalError> = std::result::Result<T, E>;
