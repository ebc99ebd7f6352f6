//! Workflow templates: ordered steps, approver rules and approval modes
use crate::error::ValidationError;
use crate::types::{CompanyId, DocumentType, RoleId, StepOrder, TimeStamp, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Who may act on a step. Role ids are resolved against the company directory
/// when the step becomes current; user ids are taken literally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode)]
#[serde(tag = "approver_type", content = "approver_ids", rename_all = "snake_case")]
pub enum ApproverRule {
    #[n(0)]
    Role(#[n(0)] Vec<RoleId>),
    #[n(1)]
    #[serde(rename = "user")]
    Users(#[n(0)] Vec<UserId>),
}

impl ApproverRule {
    pub fn ids(&self) -> &[u64] {
        match self {
            ApproverRule::Role(ids) | ApproverRule::Users(ids) => ids,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode,
)]
#[serde(rename_all = "lowercase")]
#[cbor(index_only)]
pub enum ApprovalMode {
    /// First qualifying approve satisfies the step
    #[n(0)]
    Any,
    /// Every resolved approver must approve
    #[n(1)]
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode)]
pub struct StepDefinition {
    #[n(0)]
    pub step_order: StepOrder,
    #[n(1)]
    pub step_name: String,
    #[n(2)]
    #[serde(flatten)]
    pub approvers: ApproverRule,
    #[n(3)]
    pub approval_mode: ApprovalMode,
    #[n(4)]
    #[serde(default)]
    pub time_limit_hours: Option<u32>,
}

impl StepDefinition {
    /// A step with `any` mode and no time limit. `step_order` is assigned by
    /// [`NewWorkflowDefinition::step`].
    pub fn new(step_name: &str, approvers: ApproverRule) -> Self {
        Self {
            step_order: 0,
            step_name: step_name.to_string(),
            approvers,
            approval_mode: ApprovalMode::Any,
            time_limit_hours: None,
        }
    }
    pub fn set_mode(mut self, mode: ApprovalMode) -> Self {
        self.approval_mode = mode;
        self
    }
    pub fn set_time_limit_hours(mut self, hours: u32) -> Self {
        self.time_limit_hours = Some(hours);
        self
    }
    pub fn set_order(mut self, order: StepOrder) -> Self {
        self.step_order = order;
        self
    }
}

/// A persisted, versioned workflow template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode)]
pub struct WorkflowDefinition {
    #[n(0)]
    pub id: u64,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub code: String,
    #[n(3)]
    pub document_type: DocumentType,
    #[n(4)]
    pub company_id: Option<CompanyId>,
    #[n(5)]
    pub is_active: bool,
    #[n(6)]
    pub is_default: bool,
    #[n(7)]
    pub steps: Vec<StepDefinition>,
    #[n(8)]
    pub version: u32,
    #[n(9)]
    pub created_at: TimeStamp,
    #[n(10)]
    pub updated_at: TimeStamp,
}

impl WorkflowDefinition {
    pub fn is_system_wide(&self) -> bool {
        self.company_id.is_none()
    }

    pub fn step(&self, order: StepOrder) -> Option<&StepDefinition> {
        self.steps.get(order as usize)
    }
}

/// Draft of a workflow definition as submitted by a tenant admin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewWorkflowDefinition {
    pub name: String,
    pub code: String,
    pub document_type: DocumentType,
    #[serde(default)]
    pub company_id: Option<CompanyId>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

impl NewWorkflowDefinition {
    pub fn new(name: &str, code: &str, document_type: DocumentType) -> Self {
        Self {
            name: name.to_string(),
            code: code.to_string(),
            document_type,
            company_id: None,
            is_default: false,
            steps: vec![],
        }
    }
    pub fn for_company(mut self, company_id: CompanyId) -> Self {
        self.company_id = Some(company_id);
        self
    }
    pub fn set_default(mut self, is_default: bool) -> Self {
        self.is_default = is_default;
        self
    }
    /// Appends a step, numbering it after the ones already present.
    pub fn step(mut self, step: StepDefinition) -> Self {
        let order = self.steps.len() as StepOrder;
        self.steps.push(step.set_order(order));
        self
    }

    /// Checks the draft and returns its steps sorted by step_order.
    pub fn validate_and_finalise(&self) -> Result<Vec<StepDefinition>, ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyField("name"));
        }
        if self.code.trim().is_empty() {
            return Err(ValidationError::EmptyField("code"));
        }
        validate_steps(&self.steps)
    }
}

/// Steps must be non-empty, carry unique step_order values contiguous from 0,
/// and name at least one approver each.
pub fn validate_steps(steps: &[StepDefinition]) -> Result<Vec<StepDefinition>, ValidationError> {
    if steps.is_empty() {
        return Err(ValidationError::NoSteps);
    }

    let mut sorted = steps.to_vec();
    sorted.sort_by_key(|s| s.step_order);

    let mut seen = HashSet::new();
    for step in &sorted {
        if !seen.insert(step.step_order) {
            return Err(ValidationError::DuplicateStepOrder(step.step_order));
        }
    }
    for (expected, step) in sorted.iter().enumerate() {
        let expected = expected as StepOrder;
        if step.step_order != expected {
            return Err(ValidationError::NonContiguousSteps {
                expected,
                found: step.step_order,
            });
        }
        if step.step_name.trim().is_empty() {
            return Err(ValidationError::EmptyField("step_name"));
        }
        if step.approvers.ids().is_empty() {
            return Err(ValidationError::EmptyApproverSet(step.step_order));
        }
    }

    Ok(sorted)
}
