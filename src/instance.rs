//! Approval instances and their state machine.
//!
//! An instance carries an immutable copy of the workflow steps it was created
//! from, together with the approvers resolved when each step became current and
//! the decisions recorded against it. Everything here is pure: storage, locking
//! and directory lookups happen in the service layer, which hands in the
//! effective approver set for the current step.
use crate::collaborators::ApprovalOutcome;
use crate::context::{WorkspaceContext, WorkspaceType};
use crate::definition::{ApprovalMode, ApproverRule, StepDefinition, WorkflowDefinition};
use crate::error::{ApprovalError, ValidationError};
use crate::resolver::EffectiveApprovers;
use crate::types::{CompanyId, DocumentType, FactoryId, StepOrder, TimeStamp, UserId};
use chrono::Duration;
use serde::{Deserialize, Serialize};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    minicbor::Encode,
    minicbor::Decode,
)]
#[serde(rename_all = "snake_case")]
#[cbor(index_only)]
pub enum InstanceStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    InProgress,
    #[n(2)]
    Approved,
    #[n(3)]
    Rejected,
    #[n(4)]
    Cancelled,
}

impl InstanceStatus {
    pub const ALL: [InstanceStatus; 5] = [
        InstanceStatus::Pending,
        InstanceStatus::InProgress,
        InstanceStatus::Approved,
        InstanceStatus::Rejected,
        InstanceStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Approved | InstanceStatus::Rejected | InstanceStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::InProgress => "in_progress",
            InstanceStatus::Approved => "approved",
            InstanceStatus::Rejected => "rejected",
            InstanceStatus::Cancelled => "cancelled",
        }
    }
}

/// What an approver does to the current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Approve,
    Reject,
    Delegate { to: UserId },
    Comment,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Approve => "approve",
            Action::Reject => "reject",
            Action::Delegate { .. } => "delegate",
            Action::Comment => "comment",
        }
    }

    /// Decisive actions count once per actor and step; comments do not.
    pub fn is_decisive(&self) -> bool {
        !matches!(self, Action::Comment)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    #[n(0)]
    Approve,
    #[n(1)]
    Reject,
    #[n(2)]
    Delegate {
        #[n(0)]
        to: UserId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode)]
pub struct StepDecision {
    #[n(0)]
    pub actor_id: UserId,
    #[n(1)]
    pub decision: Decision,
    #[n(2)]
    pub at: TimeStamp,
}

/// One snapshotted step of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode)]
pub struct StepState {
    #[n(0)]
    pub definition: StepDefinition,
    /// Approvers resolved when the step became current. Empty until then.
    #[n(1)]
    pub eligible: Vec<UserId>,
    #[n(2)]
    pub decisions: Vec<StepDecision>,
    #[n(3)]
    pub entered_at: Option<TimeStamp>,
    #[n(4)]
    pub completed_at: Option<TimeStamp>,
}

impl StepState {
    fn from_definition(definition: StepDefinition) -> Self {
        Self {
            definition,
            eligible: vec![],
            decisions: vec![],
            entered_at: None,
            completed_at: None,
        }
    }

    pub fn decided_by(&self, actor_id: UserId) -> Option<&StepDecision> {
        self.decisions.iter().find(|d| d.actor_id == actor_id)
    }

    pub fn approved_by(&self) -> Vec<UserId> {
        self.decisions
            .iter()
            .filter(|d| d.decision == Decision::Approve)
            .map(|d| d.actor_id)
            .collect()
    }

    /// Users who handed their obligation on this step to someone else.
    pub fn delegators(&self) -> Vec<UserId> {
        self.decisions
            .iter()
            .filter(|d| matches!(d.decision, Decision::Delegate { .. }))
            .map(|d| d.actor_id)
            .collect()
    }
}

/// Outcome of a successfully applied action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A comment was added; nothing else changed.
    Commented,
    /// An approval was counted but the step still waits for others.
    Recorded,
    Delegated { to: UserId },
    /// The step was satisfied and the next one must be entered.
    StepCompleted { from: StepOrder, next: StepOrder },
    Finalized(ApprovalOutcome),
}

pub struct NewInstance<'a> {
    pub id: u64,
    pub definition: &'a WorkflowDefinition,
    pub document_id: u64,
    pub company_id: Option<CompanyId>,
    pub factory_id: Option<FactoryId>,
    pub submitter_id: UserId,
    pub first_step_approvers: Vec<UserId>,
    pub now: TimeStamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode)]
pub struct ApprovalInstance {
    #[n(0)]
    pub id: u64,
    /// Informational back-reference; step data always comes from `steps`.
    #[n(1)]
    pub workflow_id: u64,
    #[n(2)]
    pub workflow_version: u32,
    #[n(3)]
    pub document_type: DocumentType,
    #[n(4)]
    pub document_id: u64,
    #[n(5)]
    pub company_id: Option<CompanyId>,
    #[n(6)]
    pub factory_id: Option<FactoryId>,
    #[n(7)]
    pub submitter_id: UserId,
    #[n(8)]
    pub status: InstanceStatus,
    #[n(9)]
    pub current_step: StepOrder,
    #[n(10)]
    pub current_step_name: String,
    #[n(11)]
    pub step_entered_at: TimeStamp,
    #[n(12)]
    pub created_at: TimeStamp,
    #[n(13)]
    pub completed_at: Option<TimeStamp>,
    #[n(14)]
    pub steps: Vec<StepState>,
    /// Set when the current step resolved to nobody at entry.
    #[n(15)]
    pub blocked: bool,
}

impl ApprovalInstance {
    /// Creates a pending instance positioned on step 0 of `definition`.
    pub fn submit(params: NewInstance<'_>) -> Result<Self, ApprovalError> {
        let Some(first) = params.definition.steps.first() else {
            return Err(ValidationError::NoSteps.into());
        };
        let current_step_name = first.step_name.clone();
        let mut steps: Vec<StepState> = params
            .definition
            .steps
            .iter()
            .cloned()
            .map(StepState::from_definition)
            .collect();
        steps[0].eligible = params.first_step_approvers.clone();
        steps[0].entered_at = Some(params.now);

        Ok(Self {
            id: params.id,
            workflow_id: params.definition.id,
            workflow_version: params.definition.version,
            document_type: params.definition.document_type,
            document_id: params.document_id,
            company_id: params.company_id,
            factory_id: params.factory_id,
            submitter_id: params.submitter_id,
            status: InstanceStatus::Pending,
            current_step: 0,
            current_step_name,
            step_entered_at: params.now,
            created_at: params.now,
            completed_at: None,
            blocked: params.first_step_approvers.is_empty(),
            steps,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn current(&self) -> Option<&StepState> {
        self.steps.get(self.current_step as usize)
    }

    fn current_mut(&mut self) -> Result<&mut StepState, ApprovalError> {
        let idx = self.current_step as usize;
        let id = self.id;
        self.steps
            .get_mut(idx)
            .ok_or_else(|| ApprovalError::InvalidTransition(format!("instance {} has no step {}", id, idx)))
    }

    fn current_or_err(&self) -> Result<&StepState, ApprovalError> {
        self.current().ok_or_else(|| {
            ApprovalError::InvalidTransition(format!(
                "instance {} has no step {}",
                self.id, self.current_step
            ))
        })
    }

    pub fn is_last_step(&self) -> bool {
        self.current_step as usize + 1 >= self.steps.len()
    }

    fn ensure_active(&self) -> Result<(), ApprovalError> {
        if self.is_terminal() {
            return Err(ApprovalError::InvalidTransition(format!(
                "instance {} is already {}",
                self.id,
                self.status.as_str()
            )));
        }
        Ok(())
    }

    /// Guards that do not need the directory: terminal state and requests
    /// aimed at a step other than the current one.
    pub fn precheck(
        &self,
        actor_id: UserId,
        expected_step: Option<StepOrder>,
    ) -> Result<(), ApprovalError> {
        self.ensure_active()?;

        if let Some(expected) = expected_step {
            if expected > self.current_step || expected as usize >= self.steps.len() {
                return Err(ApprovalError::InvalidTransition(format!(
                    "step {} of instance {} is not current",
                    expected, self.id
                )));
            }
            if expected < self.current_step {
                return Err(self.stale_step_error(expected, actor_id));
            }
        }
        Ok(())
    }

    fn stale_step_error(&self, step_order: StepOrder, actor_id: UserId) -> ApprovalError {
        match self.steps.get(step_order as usize) {
            Some(step) if step.decided_by(actor_id).is_some() => ApprovalError::AlreadyProcessed {
                instance_id: self.id,
                step_order,
                actor_id,
            },
            _ => ApprovalError::InvalidTransition(format!(
                "step {} of instance {} has already been completed",
                step_order, self.id
            )),
        }
    }

    /// Checks that `actor_id` may take `action` given the effective approvers
    /// of the current step.
    pub fn authorize(
        &self,
        actor_id: UserId,
        action: Action,
        expected_step: Option<StepOrder>,
        effective: &EffectiveApprovers,
    ) -> Result<(), ApprovalError> {
        if !action.is_decisive() {
            return if self.may_comment(actor_id, effective) {
                Ok(())
            } else {
                Err(ApprovalError::PermissionDenied(format!(
                    "user {} is not a participant of instance {}",
                    actor_id, self.id
                )))
            };
        }

        let current = self.current_or_err()?;
        let already_processed = ApprovalError::AlreadyProcessed {
            instance_id: self.id,
            step_order: self.current_step,
            actor_id,
        };
        if !effective.contains(actor_id) {
            // Delegating is what took the actor out of the set.
            if current.delegators().contains(&actor_id) {
                return Err(already_processed);
            }
            // A retried or late request for a step that has since passed.
            if expected_step.is_none() {
                if let Some(passed) = self.steps[..self.current_step as usize]
                    .iter()
                    .rposition(|s| s.decided_by(actor_id).is_some() || s.eligible.contains(&actor_id))
                {
                    return Err(self.stale_step_error(passed as StepOrder, actor_id));
                }
            }
        }

        if effective.is_blocked() {
            return Err(ApprovalError::BlockedStep {
                instance_id: self.id,
                step_order: self.current_step,
            });
        }
        if !effective.contains(actor_id) {
            return Err(ApprovalError::PermissionDenied(format!(
                "user {} is not an eligible approver for step {} of instance {}",
                actor_id, self.current_step, self.id
            )));
        }
        if current.decided_by(actor_id).is_some() {
            return Err(already_processed);
        }
        Ok(())
    }

    fn may_comment(&self, actor_id: UserId, effective: &EffectiveApprovers) -> bool {
        actor_id == self.submitter_id
            || effective.contains(actor_id)
            || self
                .steps
                .iter()
                .any(|s| s.eligible.contains(&actor_id) || s.decided_by(actor_id).is_some())
    }

    /// Applies an already authorized action.
    pub fn apply(
        &mut self,
        actor_id: UserId,
        action: Action,
        effective: &EffectiveApprovers,
        now: TimeStamp,
    ) -> Result<Transition, ApprovalError> {
        self.ensure_active()?;
        if effective.refreshed {
            self.current_mut()?.eligible = effective.approvers.clone();
            self.blocked = false;
        }

        match action {
            Action::Comment => Ok(Transition::Commented),
            Action::Reject => {
                let step = self.current_mut()?;
                step.decisions.push(StepDecision {
                    actor_id,
                    decision: Decision::Reject,
                    at: now,
                });
                step.completed_at = Some(now);
                self.finish(InstanceStatus::Rejected, now);
                Ok(Transition::Finalized(ApprovalOutcome::Rejected))
            }
            Action::Delegate { to } => {
                if to == actor_id {
                    return Err(ValidationError::InvalidDelegate("cannot delegate to yourself".into()).into());
                }
                if effective.contains(to) {
                    return Err(ValidationError::InvalidDelegate(format!(
                        "user {} is already an approver of this step",
                        to
                    ))
                    .into());
                }
                if self.current_or_err()?.decided_by(to).is_some() {
                    return Err(ValidationError::InvalidDelegate(format!(
                        "user {} already acted on this step",
                        to
                    ))
                    .into());
                }
                let step = self.current_mut()?;
                if !effective.refreshed {
                    step.eligible = effective.approvers.clone();
                }
                step.eligible.retain(|u| *u != actor_id);
                step.eligible.push(to);
                step.decisions.push(StepDecision {
                    actor_id,
                    decision: Decision::Delegate { to },
                    at: now,
                });
                self.status = InstanceStatus::InProgress;
                Ok(Transition::Delegated { to })
            }
            Action::Approve => {
                let step = self.current_mut()?;
                step.decisions.push(StepDecision {
                    actor_id,
                    decision: Decision::Approve,
                    at: now,
                });
                let satisfied = match step.definition.approval_mode {
                    ApprovalMode::Any => true,
                    ApprovalMode::All => covered(step, effective),
                };
                if !satisfied {
                    self.status = InstanceStatus::InProgress;
                    return Ok(Transition::Recorded);
                }
                Ok(self.complete_current(now))
            }
        }
    }

    fn complete_current(&mut self, now: TimeStamp) -> Transition {
        let from = self.current_step;
        if let Some(step) = self.steps.get_mut(from as usize) {
            step.completed_at = Some(now);
        }
        if self.is_last_step() {
            self.finish(InstanceStatus::Approved, now);
            Transition::Finalized(ApprovalOutcome::Approved)
        } else {
            self.status = InstanceStatus::InProgress;
            Transition::StepCompleted { from, next: from + 1 }
        }
    }

    /// Completes an `all` step whose remaining approvers have all approved
    /// already. This happens when approvers who had not acted yet drop out of
    /// the effective set, so no further approve will arrive to close the step.
    pub fn settle(&mut self, effective: &EffectiveApprovers, now: TimeStamp) -> Option<Transition> {
        if !self.status.is_active() {
            return None;
        }
        let step = self.current()?;
        if step.definition.approval_mode != ApprovalMode::All || !covered(step, effective) {
            return None;
        }
        if let Some(step) = self.steps.get_mut(self.current_step as usize) {
            step.eligible = effective.approvers.clone();
        }
        Some(self.complete_current(now))
    }

    /// Makes `order` the current step with the approvers resolved for it now.
    pub fn enter_step(&mut self, order: StepOrder, approvers: Vec<UserId>, now: TimeStamp) -> Result<(), ApprovalError> {
        self.ensure_active()?;
        let id = self.id;
        let step = self.steps.get_mut(order as usize).ok_or_else(|| {
            ApprovalError::InvalidTransition(format!("instance {} has no step {}", id, order))
        })?;
        step.eligible = approvers;
        step.entered_at = Some(now);
        self.blocked = step.eligible.is_empty();
        self.current_step_name = step.definition.step_name.clone();
        self.current_step = order;
        self.step_entered_at = now;
        self.status = InstanceStatus::InProgress;
        Ok(())
    }

    pub fn cancel(&mut self, now: TimeStamp) -> Result<(), ApprovalError> {
        self.ensure_active()?;
        if let Ok(step) = self.current_mut() {
            step.completed_at = Some(now);
        }
        self.finish(InstanceStatus::Cancelled, now);
        Ok(())
    }

    /// Replaces the approver rule of the current step. Approvals already given
    /// by users who remain eligible keep counting.
    pub fn reassign_current(
        &mut self,
        rule: ApproverRule,
        approvers: Vec<UserId>,
    ) -> Result<(), ApprovalError> {
        self.ensure_active()?;
        let step = self.current_mut()?;
        step.definition.approvers = rule;
        step.eligible = approvers;
        self.blocked = self.current().is_none_or(|s| s.eligible.is_empty());
        Ok(())
    }

    fn finish(&mut self, status: InstanceStatus, now: TimeStamp) {
        self.status = status;
        self.completed_at = Some(now);
        self.blocked = false;
    }

    /// Eligible approvers of the current step who have not approved yet.
    pub fn outstanding(&self, effective: &EffectiveApprovers) -> Vec<UserId> {
        let approved = self.current().map(|s| s.approved_by()).unwrap_or_default();
        effective
            .approvers
            .iter()
            .copied()
            .filter(|u| !approved.contains(u))
            .collect()
    }

    /// Whether the current step has been open longer than its time limit.
    pub fn is_overdue(&self, now: TimeStamp) -> bool {
        if !self.status.is_active() {
            return false;
        }
        match self.current().and_then(|s| s.definition.time_limit_hours) {
            Some(hours) => self.step_entered_at.elapsed_until(now) > Duration::hours(hours as i64),
            None => false,
        }
    }

    /// Whether the caller's workspace may see this instance.
    pub fn visible_to(&self, ctx: &WorkspaceContext) -> bool {
        match ctx.workspace_type {
            WorkspaceType::Enterprise => {
                self.company_id.is_some()
                    && self.company_id == ctx.company_id
                    && ctx.factory_id.is_none_or(|f| self.factory_id == Some(f))
            }
            WorkspaceType::Personal => {
                self.company_id.is_none()
                    && (self.submitter_id == ctx.user_id
                        || self.steps.iter().any(|s| {
                            s.eligible.contains(&ctx.user_id) || s.decided_by(ctx.user_id).is_some()
                        }))
            }
        }
    }
}

/// Every effective approver has approved. An empty set covers nothing.
fn covered(step: &StepState, effective: &EffectiveApprovers) -> bool {
    let approved = step.approved_by();
    !effective.is_blocked() && effective.approvers.iter().all(|u| approved.contains(u))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::NewWorkflowDefinition;

    fn definition() -> WorkflowDefinition {
        let draft = NewWorkflowDefinition::new("Review", "wps-std", DocumentType::Wps)
            .step(StepDefinition::new("Check", ApproverRule::Users(vec![1, 2])))
            .step(
                StepDefinition::new("Sign", ApproverRule::Users(vec![3, 4]))
                    .set_mode(ApprovalMode::All)
                    .set_time_limit_hours(24),
            );
        let now = TimeStamp::now();
        WorkflowDefinition {
            id: 1,
            name: draft.name.clone(),
            code: draft.code.clone(),
            document_type: draft.document_type,
            company_id: None,
            is_active: true,
            is_default: true,
            steps: draft.validate_and_finalise().unwrap(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    fn instance() -> ApprovalInstance {
        let def = definition();
        ApprovalInstance::submit(NewInstance {
            id: 9,
            definition: &def,
            document_id: 100,
            company_id: None,
            factory_id: None,
            submitter_id: 50,
            first_step_approvers: vec![1, 2],
            now: TimeStamp::now(),
        })
        .unwrap()
    }

    fn eff(ids: &[UserId]) -> EffectiveApprovers {
        EffectiveApprovers {
            approvers: ids.to_vec(),
            refreshed: false,
        }
    }

    #[test]
    fn any_mode_then_all_mode() {
        let mut inst = instance();
        assert_eq!(inst.status, InstanceStatus::Pending);

        let t = inst.apply(1, Action::Approve, &eff(&[1, 2]), TimeStamp::now()).unwrap();
        assert_eq!(t, Transition::StepCompleted { from: 0, next: 1 });
        inst.enter_step(1, vec![3, 4], TimeStamp::now()).unwrap();
        assert_eq!(inst.current_step_name, "Sign");

        let t = inst.apply(3, Action::Approve, &eff(&[3, 4]), TimeStamp::now()).unwrap();
        assert_eq!(t, Transition::Recorded);
        assert_eq!(inst.status, InstanceStatus::InProgress);

        let t = inst.apply(4, Action::Approve, &eff(&[3, 4]), TimeStamp::now()).unwrap();
        assert_eq!(t, Transition::Finalized(ApprovalOutcome::Approved));
        assert!(inst.completed_at.is_some());
    }

    #[test]
    fn replay_on_current_step_is_already_processed() {
        let mut inst = instance();
        inst.apply(1, Action::Approve, &eff(&[1, 2]), TimeStamp::now()).unwrap();
        inst.enter_step(1, vec![3, 4], TimeStamp::now()).unwrap();
        inst.apply(3, Action::Approve, &eff(&[3, 4]), TimeStamp::now()).unwrap();

        assert!(matches!(
            inst.authorize(3, Action::Approve, None, &eff(&[3, 4])),
            Err(ApprovalError::AlreadyProcessed { step_order: 1, .. })
        ));
        // comments are never deduplicated
        assert!(inst.authorize(3, Action::Comment, None, &eff(&[3, 4])).is_ok());
        // eligibility is checked before the replay guard
        assert!(matches!(
            inst.authorize(3, Action::Approve, None, &eff(&[4])),
            Err(ApprovalError::PermissionDenied(_))
        ));
    }

    #[test]
    fn delegator_replay_is_already_processed() {
        let mut inst = instance();
        inst.apply(1, Action::Delegate { to: 8 }, &eff(&[1, 2]), TimeStamp::now()).unwrap();
        assert!(matches!(
            inst.authorize(1, Action::Delegate { to: 8 }, None, &eff(&[2, 8])),
            Err(ApprovalError::AlreadyProcessed { step_order: 0, .. })
        ));
    }

    #[test]
    fn all_step_settles_once_the_rest_drop_out() {
        let mut inst = instance();
        inst.apply(1, Action::Approve, &eff(&[1, 2]), TimeStamp::now()).unwrap();
        inst.enter_step(1, vec![3, 4], TimeStamp::now()).unwrap();
        // nobody has approved yet
        assert_eq!(inst.settle(&eff(&[3, 4]), TimeStamp::now()), None);
        inst.apply(3, Action::Approve, &eff(&[3, 4]), TimeStamp::now()).unwrap();
        assert_eq!(inst.settle(&eff(&[3, 4]), TimeStamp::now()), None);
        assert_eq!(inst.settle(&eff(&[]), TimeStamp::now()), None);

        let t = inst.settle(&eff(&[3]), TimeStamp::now());
        assert_eq!(t, Some(Transition::Finalized(ApprovalOutcome::Approved)));
        assert_eq!(inst.status, InstanceStatus::Approved);
        assert_eq!(inst.steps[1].eligible, vec![3]);
        assert_eq!(inst.settle(&eff(&[3]), TimeStamp::now()), None);
    }

    #[test]
    fn passed_step_distinguishes_replay_from_late_racer() {
        let mut inst = instance();
        inst.apply(1, Action::Approve, &eff(&[1, 2]), TimeStamp::now()).unwrap();
        inst.enter_step(1, vec![3, 4], TimeStamp::now()).unwrap();
        let current = eff(&[3, 4]);

        assert!(matches!(
            inst.authorize(1, Action::Approve, None, &current),
            Err(ApprovalError::AlreadyProcessed { step_order: 0, .. })
        ));
        assert!(matches!(
            inst.authorize(2, Action::Reject, None, &current),
            Err(ApprovalError::InvalidTransition(_))
        ));
        assert!(matches!(
            inst.precheck(2, Some(0)),
            Err(ApprovalError::InvalidTransition(_))
        ));
        assert!(matches!(
            inst.authorize(77, Action::Approve, None, &current),
            Err(ApprovalError::PermissionDenied(_))
        ));
    }

    #[test]
    fn blocked_step_rejects_decisions() {
        let inst = instance();
        assert!(matches!(
            inst.authorize(1, Action::Approve, None, &eff(&[])),
            Err(ApprovalError::BlockedStep { step_order: 0, .. })
        ));
    }

    #[test]
    fn delegation_swaps_the_obligation() {
        let mut inst = instance();
        let t = inst
            .apply(1, Action::Delegate { to: 8 }, &eff(&[1, 2]), TimeStamp::now())
            .unwrap();
        assert_eq!(t, Transition::Delegated { to: 8 });
        assert_eq!(inst.current_step, 0);
        assert_eq!(inst.steps[0].eligible, vec![2, 8]);
        assert_eq!(inst.steps[0].delegators(), vec![1]);

        let err = inst
            .apply(2, Action::Delegate { to: 8 }, &eff(&[2, 8]), TimeStamp::now())
            .unwrap_err();
        assert_eq!(err.kind(), "validation");

        // handing it back to someone who already acted would strand the step
        let err = inst
            .apply(8, Action::Delegate { to: 1 }, &eff(&[2, 8]), TimeStamp::now())
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert_eq!(inst.steps[0].eligible, vec![2, 8]);
    }

    #[test]
    fn terminal_states_are_final() {
        let mut inst = instance();
        inst.apply(2, Action::Reject, &eff(&[1, 2]), TimeStamp::now()).unwrap();
        assert_eq!(inst.status, InstanceStatus::Rejected);
        assert!(matches!(
            inst.precheck(1, None),
            Err(ApprovalError::InvalidTransition(_))
        ));
        assert!(inst.cancel(TimeStamp::now()).is_err());
        assert!(inst.enter_step(1, vec![3], TimeStamp::now()).is_err());
    }

    #[test]
    fn overdue_uses_current_step_limit() {
        let mut inst = instance();
        let later = TimeStamp::now().plus(Duration::hours(100));
        // step 0 has no limit
        assert!(!inst.is_overdue(later));

        let entered = TimeStamp::now();
        inst.apply(1, Action::Approve, &eff(&[1, 2]), entered).unwrap();
        inst.enter_step(1, vec![3, 4], entered).unwrap();
        assert!(!inst.is_overdue(entered.plus(Duration::hours(23))));
        assert!(inst.is_overdue(entered.plus(Duration::hours(25))));
    }

    #[test]
    fn cbor_record_round_trips() {
        let inst = instance();
        let bytes = minicbor::to_vec(&inst).unwrap();
        let back: ApprovalInstance = minicbor::decode(&bytes).unwrap();
        assert_eq!(inst, back);
    }
}
