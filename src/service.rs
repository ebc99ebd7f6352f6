//! Service layer API for approval workflow operations
//!
//! Every mutation is a single sled transaction over the trees it touches.
//! Notification requests and the document-status callback are only fired
//! after the transaction commits.
use crate::collaborators::{ApprovalOutcome, CompanyDirectory, DocumentStatusCallback};
use crate::context::WorkspaceContext;
use crate::definition::{ApproverRule, NewWorkflowDefinition, StepDefinition, WorkflowDefinition};
use crate::error::{ApprovalError, ValidationError};
use crate::escalation::clear_overdue_marks;
use crate::history::{ApprovalHistory, HistoryAction, HistoryLog};
use crate::instance::{Action, ApprovalInstance, InstanceStatus, NewInstance, Transition};
use crate::notify::{ApprovalNotification, NotificationEvent, NotificationRequest, Notifier};
use crate::resolver::{EffectiveApprovers, StepResolver};
use crate::store::WorkflowDefinitionStore;
use crate::types::{CompanyId, DocumentType, FactoryId, StepOrder, TimeStamp, UserId};
use crate::utils::{self, OrAbort, TxResult, abort};
use serde::Serialize;
use serde_json::json;
use sled::Transactional;
use sled::transaction::TransactionalTree;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// An action as submitted by an approver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    pub action: Action,
    pub comment: Option<String>,
    /// The step the caller believes is current. Lets late callers learn that
    /// the step has already moved on.
    pub expected_step: Option<StepOrder>,
}

impl ActionRequest {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            comment: None,
            expected_step: None,
        }
    }
    pub fn with_comment(mut self, comment: &str) -> Self {
        self.comment = Some(comment.to_string());
        self
    }
    pub fn expect_step(mut self, step_order: StepOrder) -> Self {
        self.expected_step = Some(step_order);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub instance: ApprovalInstance,
    pub entry: ApprovalHistory,
    pub transition: Transition,
}

/// An instance together with who can act on it right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceView {
    #[serde(flatten)]
    pub instance: ApprovalInstance,
    pub current_approvers: Vec<UserId>,
    pub outstanding_approvers: Vec<UserId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_document_type: BTreeMap<String, u64>,
    pub blocked: u64,
    pub overdue: u64,
}

pub type BatchResults<T> = Vec<(u64, Result<T, ApprovalError>)>;

/// Notification rows written inside a transaction, plus the requests to hand
/// to the notifier once it commits.
pub(crate) struct Outbox<'a> {
    tree: &'a TransactionalTree,
    now: TimeStamp,
    requests: Vec<NotificationRequest>,
}

impl<'a> Outbox<'a> {
    pub(crate) fn new(tree: &'a TransactionalTree, now: TimeStamp) -> Self {
        Self {
            tree,
            now,
            requests: vec![],
        }
    }

    pub(crate) fn push(
        &mut self,
        instance: &ApprovalInstance,
        recipient_id: UserId,
        event: NotificationEvent,
    ) -> TxResult<()> {
        let id = utils::fresh_id(self.tree)?;
        let record = ApprovalNotification {
            id,
            instance_id: instance.id,
            recipient_id,
            event,
            is_read: false,
            created_at: self.now,
        };
        self.tree
            .insert(utils::pair_key(recipient_id, id), utils::encode(&record).or_abort()?)?;
        self.requests.push(NotificationRequest {
            notification_id: id,
            recipient_id,
            event,
            payload: payload(instance),
        });
        Ok(())
    }

    pub(crate) fn into_requests(self) -> Vec<NotificationRequest> {
        self.requests
    }
}

fn payload(instance: &ApprovalInstance) -> serde_json::Value {
    json!({
        "instance_id": instance.id,
        "document_type": instance.document_type,
        "document_id": instance.document_id,
        "status": instance.status,
        "step_order": instance.current_step,
        "step_name": instance.current_step_name,
    })
}

pub(crate) fn load_instance(tree: &TransactionalTree, id: u64) -> TxResult<ApprovalInstance> {
    match tree.get(utils::id_key(id))? {
        Some(bytes) => utils::decode(&bytes).or_abort(),
        None => abort(ApprovalError::InstanceNotFound(id)),
    }
}

pub(crate) fn save_instance(tree: &TransactionalTree, instance: &ApprovalInstance) -> TxResult<()> {
    tree.insert(utils::id_key(instance.id), utils::encode(instance).or_abort()?)?;
    Ok(())
}

fn history_action(action: Action) -> HistoryAction {
    match action {
        Action::Approve => HistoryAction::Approve,
        Action::Reject => HistoryAction::Reject,
        Action::Delegate { .. } => HistoryAction::Delegate,
        Action::Comment => HistoryAction::Comment,
    }
}

fn outcome_event(outcome: ApprovalOutcome) -> NotificationEvent {
    match outcome {
        ApprovalOutcome::Approved => NotificationEvent::Approved,
        ApprovalOutcome::Rejected => NotificationEvent::Rejected,
        ApprovalOutcome::Cancelled => NotificationEvent::Cancelled,
    }
}

fn log_failure(operation: &'static str, instance_id: u64, actor_id: UserId, err: &ApprovalError) {
    if err.is_internal() {
        error!(operation, instance_id, actor_id, error = %err, "Approval operation failed");
    } else {
        debug!(
            operation,
            instance_id,
            actor_id,
            kind = err.kind(),
            error = %err,
            "Approval operation rejected"
        );
    }
}

pub struct ApprovalService {
    db: Arc<sled::Db>,
    definitions: WorkflowDefinitionStore,
    instances: sled::Tree,
    history: HistoryLog,
    active_docs: sled::Tree,
    notifications: sled::Tree,
    overdue_marks: sled::Tree,
    resolver: StepResolver,
    notifier: Arc<dyn Notifier>,
    callback: Arc<dyn DocumentStatusCallback>,
}

impl ApprovalService {
    pub fn new(
        db: Arc<sled::Db>,
        directory: Arc<dyn CompanyDirectory>,
        notifier: Arc<dyn Notifier>,
        callback: Arc<dyn DocumentStatusCallback>,
    ) -> Result<Self, ApprovalError> {
        let resolver = StepResolver::new(directory);
        Ok(Self {
            definitions: WorkflowDefinitionStore::open(&db, resolver.clone())?,
            instances: db.open_tree("instances")?,
            history: HistoryLog::new(db.open_tree("history")?),
            active_docs: db.open_tree("active_docs")?,
            notifications: db.open_tree("notifications")?,
            overdue_marks: db.open_tree("overdue_marks")?,
            resolver,
            notifier,
            callback,
            db,
        })
    }

    pub fn definitions(&self) -> &WorkflowDefinitionStore {
        &self.definitions
    }

    pub(crate) fn instances_tree(&self) -> &sled::Tree {
        &self.instances
    }

    pub(crate) fn notifications_tree(&self) -> &sled::Tree {
        &self.notifications
    }

    pub(crate) fn overdue_marks_tree(&self) -> &sled::Tree {
        &self.overdue_marks
    }

    pub(crate) fn resolver(&self) -> &StepResolver {
        &self.resolver
    }

    pub(crate) fn dispatch(&self, requests: Vec<NotificationRequest>) {
        for request in requests {
            self.notifier.notify(request);
        }
    }

    fn is_admin_for(&self, user_id: UserId, company_id: Option<CompanyId>) -> bool {
        let directory = self.resolver.directory();
        directory.is_system_admin(user_id)
            || company_id.is_some_and(|company| directory.is_company_admin(company, user_id))
    }

    /// The approvers of the current step as of now.
    pub(crate) fn effective(&self, instance: &ApprovalInstance) -> EffectiveApprovers {
        match instance.current() {
            Some(step) if instance.status.is_active() => self.resolver.effective(
                &step.definition.approvers,
                &step.eligible,
                &step.delegators(),
                instance.company_id,
            ),
            _ => EffectiveApprovers {
                approvers: vec![],
                refreshed: false,
            },
        }
    }

    /// Carries a completed step forward: enters the next step and asks its
    /// approvers, or releases the document and tells the submitter once the
    /// instance is finished.
    fn follow_through(
        &self,
        instance: &mut ApprovalInstance,
        transition: Transition,
        active_docs: &TransactionalTree,
        marks: &TransactionalTree,
        outbox: &mut Outbox<'_>,
        now: TimeStamp,
    ) -> TxResult<()> {
        match transition {
            Transition::StepCompleted { next, .. } => {
                let approvers = instance
                    .steps
                    .get(next as usize)
                    .map(|s| self.resolver.resolve_step(&s.definition, instance.company_id))
                    .unwrap_or_default();
                instance.enter_step(next, approvers.clone(), now).or_abort()?;
                for approver in approvers {
                    outbox.push(instance, approver, NotificationEvent::ApprovalRequested)?;
                }
            }
            Transition::Finalized(result) => {
                active_docs.remove(utils::document_key(instance.document_type, instance.document_id))?;
                clear_overdue_marks(marks, instance)?;
                outbox.push(instance, instance.submitter_id, outcome_event(result))?;
            }
            Transition::Commented | Transition::Recorded | Transition::Delegated { .. } => {}
        }
        Ok(())
    }

    /// Completes the current `all` step of an instance when everyone still
    /// able to approve it already has. Approvers leaving the company can make
    /// that true without any new action.
    pub(crate) fn settle(&self, instance_id: u64) -> Result<Option<Transition>, ApprovalError> {
        let (settled, requests) = (
            &self.instances,
            &self.active_docs,
            &self.overdue_marks,
            &self.notifications,
        )
            .transaction(
                |(instances, active_docs, marks, notifications)| -> TxResult<(Option<(ApprovalInstance, StepOrder, Transition)>, Vec<NotificationRequest>)> {
                    let now = TimeStamp::now();
                    let mut instance = load_instance(instances, instance_id)?;
                    let step_order = instance.current_step;
                    let effective = self.effective(&instance);
                    let Some(transition) = instance.settle(&effective, now) else {
                        return Ok((None, vec![]));
                    };
                    let mut outbox = Outbox::new(notifications, now);
                    self.follow_through(&mut instance, transition, active_docs, marks, &mut outbox, now)?;
                    save_instance(instances, &instance)?;
                    Ok((Some((instance, step_order, transition)), outbox.into_requests()))
                },
            )?;

        let Some((instance, step_order, transition)) = settled else {
            return Ok(None);
        };
        info!(
            instance_id,
            step_order,
            status = instance.status.as_str(),
            "Step completed by its remaining approvers"
        );
        self.dispatch(requests);
        if let Transition::Finalized(result) = transition {
            self.callback
                .on_approval_resolved(instance.document_type, instance.document_id, result);
        }
        Ok(Some(transition))
    }

    // ---- submission ----

    /// Starts an approval cycle for a document under the caller's workspace.
    pub fn submit(
        &self,
        ctx: &WorkspaceContext,
        document_type: DocumentType,
        document_id: u64,
    ) -> Result<ApprovalInstance, ApprovalError> {
        self.try_submit(ctx, document_type, document_id)
            .inspect_err(|e| log_failure("submit", 0, ctx.user_id, e))
    }

    fn try_submit(
        &self,
        ctx: &WorkspaceContext,
        document_type: DocumentType,
        document_id: u64,
    ) -> Result<ApprovalInstance, ApprovalError> {
        ctx.validate()?;
        let company_id = ctx.scope_company();
        let definition = self.definitions.resolve_applicable(document_type, company_id)?;
        let first_step_approvers = definition
            .steps
            .first()
            .map(|step| self.resolver.resolve_step(step, company_id))
            .ok_or(ValidationError::NoSteps)?;
        let instance_id = self.db.generate_id()?;
        let history_id = self.db.generate_id()?;

        let (instance, requests) = (
            &self.instances,
            self.history.tree(),
            &self.active_docs,
            &self.notifications,
        )
            .transaction(
                |(instances, history, active_docs, notifications)| -> TxResult<(ApprovalInstance, Vec<NotificationRequest>)> {
                    let now = TimeStamp::now();
                    let doc_key = utils::document_key(document_type, document_id);
                    if let Some(existing) = active_docs.get(&doc_key)? {
                        return abort(ApprovalError::ActiveInstanceExists {
                            document_type,
                            document_id,
                            instance_id: utils::trailing_id(&existing).unwrap_or_default(),
                        });
                    }

                    let instance = ApprovalInstance::submit(NewInstance {
                        id: instance_id,
                        definition: &definition,
                        document_id,
                        company_id,
                        factory_id: ctx.scope_factory(),
                        submitter_id: ctx.user_id,
                        first_step_approvers: first_step_approvers.clone(),
                        now,
                    })
                    .or_abort()?;

                    active_docs.insert(doc_key, utils::id_key(instance_id))?;
                    ApprovalHistory {
                        id: history_id,
                        instance_id,
                        step_order: 0,
                        step_name: instance.current_step_name.clone(),
                        action: HistoryAction::Submit,
                        actor_id: ctx.user_id,
                        comment: None,
                        delegate_to: None,
                        acted_at: now,
                    }
                    .append(history)?;

                    let mut outbox = Outbox::new(notifications, now);
                    for approver in &first_step_approvers {
                        outbox.push(&instance, *approver, NotificationEvent::ApprovalRequested)?;
                    }
                    save_instance(instances, &instance)?;
                    Ok((instance, outbox.into_requests()))
                },
            )?;

        if instance.blocked {
            warn!(
                instance_id,
                step_order = 0,
                "First step resolved to no eligible approvers, instance is blocked"
            );
        }
        info!(
            instance_id,
            workflow_id = definition.id,
            workflow_version = definition.version,
            document_type = %document_type,
            document_id,
            submitter_id = ctx.user_id,
            company_id = ?company_id,
            "Document submitted for approval"
        );
        self.dispatch(requests);
        Ok(instance)
    }

    /// Entry point for the document service, which knows the tenant scope but
    /// not the caller's full workspace context.
    pub fn submit_for_approval(
        &self,
        document_type: DocumentType,
        document_id: u64,
        company_id: Option<CompanyId>,
        factory_id: Option<FactoryId>,
        submitter_id: UserId,
    ) -> Result<ApprovalInstance, ApprovalError> {
        let ctx = match company_id {
            Some(company) => WorkspaceContext::enterprise(submitter_id, company, factory_id),
            None => WorkspaceContext::personal(submitter_id),
        };
        self.submit(&ctx, document_type, document_id)
    }

    pub fn submit_batch(
        &self,
        ctx: &WorkspaceContext,
        document_type: DocumentType,
        document_ids: &[u64],
    ) -> BatchResults<ApprovalInstance> {
        document_ids
            .iter()
            .map(|id| (*id, self.submit(ctx, document_type, *id)))
            .collect()
    }

    // ---- actions ----

    /// Applies an approver's action to the current step of an instance.
    pub fn advance(
        &self,
        ctx: &WorkspaceContext,
        instance_id: u64,
        request: ActionRequest,
    ) -> Result<ActionOutcome, ApprovalError> {
        self.try_advance(ctx, instance_id, &request)
            .inspect_err(|e| log_failure(request.action.as_str(), instance_id, ctx.user_id, e))
    }

    fn try_advance(
        &self,
        ctx: &WorkspaceContext,
        instance_id: u64,
        request: &ActionRequest,
    ) -> Result<ActionOutcome, ApprovalError> {
        ctx.validate()?;
        let actor_id = ctx.user_id;
        // A step left waiting on approvers who are gone is completed before
        // the new action is judged.
        self.settle(instance_id)?;
        let history_id = self.db.generate_id()?;

        let (outcome, requests) = (
            &self.instances,
            self.history.tree(),
            &self.active_docs,
            &self.notifications,
            &self.overdue_marks,
        )
            .transaction(
                |(instances, history, active_docs, notifications, marks)| -> TxResult<(ActionOutcome, Vec<NotificationRequest>)> {
                    let now = TimeStamp::now();
                    let mut instance = load_instance(instances, instance_id)?;
                    if !instance.visible_to(ctx) {
                        return abort(ApprovalError::InstanceNotFound(instance_id));
                    }
                    instance
                        .precheck(actor_id, request.expected_step)
                        .or_abort()?;

                    let effective = self.effective(&instance);
                    instance
                        .authorize(actor_id, request.action, request.expected_step, &effective)
                        .or_abort()?;
                    if let Action::Delegate { to } = request.action {
                        if !self.resolver.is_active(instance.company_id, to) {
                            return abort(ValidationError::InvalidDelegate(format!(
                                "user {} is not an active employee",
                                to
                            )));
                        }
                    }

                    let step_order = instance.current_step;
                    let step_name = instance.current_step_name.clone();
                    let transition = instance
                        .apply(actor_id, request.action, &effective, now)
                        .or_abort()?;

                    let mut outbox = Outbox::new(notifications, now);
                    if let Transition::Delegated { to } = transition {
                        outbox.push(&instance, to, NotificationEvent::Delegated)?;
                    }
                    self.follow_through(&mut instance, transition, active_docs, marks, &mut outbox, now)?;

                    let entry = ApprovalHistory {
                        id: history_id,
                        instance_id,
                        step_order,
                        step_name,
                        action: history_action(request.action),
                        actor_id,
                        comment: request.comment.clone(),
                        delegate_to: match request.action {
                            Action::Delegate { to } => Some(to),
                            _ => None,
                        },
                        acted_at: now,
                    };
                    entry.append(history)?;
                    save_instance(instances, &instance)?;

                    Ok((
                        ActionOutcome {
                            instance,
                            entry,
                            transition,
                        },
                        outbox.into_requests(),
                    ))
                },
            )?;

        info!(
            instance_id,
            actor_id,
            action = request.action.as_str(),
            step_order = outcome.entry.step_order,
            status = outcome.instance.status.as_str(),
            "Approval action recorded"
        );
        if outcome.instance.blocked {
            warn!(
                instance_id,
                step_order = outcome.instance.current_step,
                "Step resolved to no eligible approvers, instance is blocked"
            );
        }
        self.dispatch(requests);
        if let Transition::Finalized(result) = outcome.transition {
            self.callback
                .on_approval_resolved(outcome.instance.document_type, outcome.instance.document_id, result);
        }
        Ok(outcome)
    }

    /// Applies the same action to several instances. Each one succeeds or
    /// fails on its own.
    pub fn advance_batch(
        &self,
        ctx: &WorkspaceContext,
        instance_ids: &[u64],
        action: Action,
        comment: Option<&str>,
    ) -> BatchResults<ActionOutcome> {
        instance_ids
            .iter()
            .map(|id| {
                let mut request = ActionRequest::new(action);
                request.comment = comment.map(str::to_string);
                (*id, self.advance(ctx, *id, request))
            })
            .collect()
    }

    /// Withdraws an active instance. Only its submitter or an admin may do so.
    pub fn cancel(
        &self,
        ctx: &WorkspaceContext,
        instance_id: u64,
        comment: Option<String>,
    ) -> Result<ApprovalInstance, ApprovalError> {
        self.try_cancel(ctx, instance_id, comment)
            .inspect_err(|e| log_failure("cancel", instance_id, ctx.user_id, e))
    }

    fn try_cancel(
        &self,
        ctx: &WorkspaceContext,
        instance_id: u64,
        comment: Option<String>,
    ) -> Result<ApprovalInstance, ApprovalError> {
        ctx.validate()?;
        let actor_id = ctx.user_id;
        let history_id = self.db.generate_id()?;

        let (instance, requests) = (
            &self.instances,
            self.history.tree(),
            &self.active_docs,
            &self.notifications,
            &self.overdue_marks,
        )
            .transaction(
                |(instances, history, active_docs, notifications, marks)| -> TxResult<(ApprovalInstance, Vec<NotificationRequest>)> {
                    let now = TimeStamp::now();
                    let mut instance = load_instance(instances, instance_id)?;
                    if !instance.visible_to(ctx) {
                        return abort(ApprovalError::InstanceNotFound(instance_id));
                    }
                    if actor_id != instance.submitter_id && !self.is_admin_for(actor_id, instance.company_id) {
                        return abort(ApprovalError::PermissionDenied(format!(
                            "only the submitter or an admin may cancel instance {}",
                            instance_id
                        )));
                    }
                    let waiting_on = self.effective(&instance).approvers;
                    let step_order = instance.current_step;
                    let step_name = instance.current_step_name.clone();
                    instance.cancel(now).or_abort()?;

                    active_docs.remove(utils::document_key(instance.document_type, instance.document_id))?;
                    clear_overdue_marks(marks, &instance)?;
                    ApprovalHistory {
                        id: history_id,
                        instance_id,
                        step_order,
                        step_name,
                        action: HistoryAction::Cancel,
                        actor_id,
                        comment: comment.clone(),
                        delegate_to: None,
                        acted_at: now,
                    }
                    .append(history)?;

                    let mut outbox = Outbox::new(notifications, now);
                    for approver in waiting_on {
                        outbox.push(&instance, approver, NotificationEvent::Cancelled)?;
                    }
                    save_instance(instances, &instance)?;
                    Ok((instance, outbox.into_requests()))
                },
            )?;

        info!(instance_id, actor_id, "Approval instance cancelled");
        self.dispatch(requests);
        self.callback.on_approval_resolved(
            instance.document_type,
            instance.document_id,
            ApprovalOutcome::Cancelled,
        );
        Ok(instance)
    }

    /// Replaces the approver rule of the current step of one instance. This is
    /// how an admin unblocks a step whose approvers have all gone.
    pub fn reassign_step(
        &self,
        ctx: &WorkspaceContext,
        instance_id: u64,
        rule: ApproverRule,
        comment: Option<String>,
    ) -> Result<ApprovalInstance, ApprovalError> {
        self.try_reassign(ctx, instance_id, rule, comment)
            .inspect_err(|e| log_failure("reassign", instance_id, ctx.user_id, e))
    }

    fn try_reassign(
        &self,
        ctx: &WorkspaceContext,
        instance_id: u64,
        rule: ApproverRule,
        comment: Option<String>,
    ) -> Result<ApprovalInstance, ApprovalError> {
        ctx.validate()?;
        let actor_id = ctx.user_id;
        let history_id = self.db.generate_id()?;

        let (instance, settled, requests) = (
            &self.instances,
            self.history.tree(),
            &self.active_docs,
            &self.notifications,
            &self.overdue_marks,
        )
            .transaction(
                |(instances, history, active_docs, notifications, marks)| -> TxResult<(ApprovalInstance, Option<Transition>, Vec<NotificationRequest>)> {
                    let now = TimeStamp::now();
                    let mut instance = load_instance(instances, instance_id)?;
                    if !instance.visible_to(ctx) {
                        return abort(ApprovalError::InstanceNotFound(instance_id));
                    }
                    if !self.is_admin_for(actor_id, instance.company_id) {
                        return abort(ApprovalError::PermissionDenied(format!(
                            "only an admin may reassign approvers of instance {}",
                            instance_id
                        )));
                    }
                    if rule.ids().is_empty() {
                        return abort(ValidationError::EmptyApproverSet(instance.current_step));
                    }
                    self.resolver.validate_rule(&rule, instance.company_id).or_abort()?;

                    let approvers = self.resolver.resolve(&rule, instance.company_id);
                    instance
                        .reassign_current(rule.clone(), approvers.clone())
                        .or_abort()?;
                    ApprovalHistory {
                        id: history_id,
                        instance_id,
                        step_order: instance.current_step,
                        step_name: instance.current_step_name.clone(),
                        action: HistoryAction::Reassign,
                        actor_id,
                        comment: comment.clone(),
                        delegate_to: None,
                        acted_at: now,
                    }
                    .append(history)?;

                    let mut outbox = Outbox::new(notifications, now);
                    // The new set may consist only of people who approved already.
                    let effective = self.effective(&instance);
                    let settled = instance.settle(&effective, now);
                    match settled {
                        Some(transition) => {
                            self.follow_through(&mut instance, transition, active_docs, marks, &mut outbox, now)?;
                        }
                        None => {
                            for approver in approvers {
                                outbox.push(&instance, approver, NotificationEvent::ApprovalRequested)?;
                            }
                        }
                    }
                    save_instance(instances, &instance)?;
                    Ok((instance, settled, outbox.into_requests()))
                },
            )?;

        info!(
            instance_id,
            actor_id,
            step_order = instance.current_step,
            blocked = instance.blocked,
            settled = settled.is_some(),
            "Step approvers reassigned"
        );
        self.dispatch(requests);
        if let Some(Transition::Finalized(result)) = settled {
            self.callback
                .on_approval_resolved(instance.document_type, instance.document_id, result);
        }
        Ok(instance)
    }

    // ---- queries ----

    pub fn get(&self, ctx: &WorkspaceContext, instance_id: u64) -> Result<ApprovalInstance, ApprovalError> {
        let instance: ApprovalInstance = match self.instances.get(utils::id_key(instance_id))? {
            Some(bytes) => utils::decode(&bytes)?,
            None => return Err(ApprovalError::InstanceNotFound(instance_id)),
        };
        if !instance.visible_to(ctx) {
            return Err(ApprovalError::InstanceNotFound(instance_id));
        }
        Ok(instance)
    }

    pub fn view(&self, ctx: &WorkspaceContext, instance_id: u64) -> Result<InstanceView, ApprovalError> {
        let instance = self.get(ctx, instance_id)?;
        Ok(self.to_view(instance))
    }

    fn to_view(&self, mut instance: ApprovalInstance) -> InstanceView {
        let effective = self.effective(&instance);
        let outstanding_approvers = instance.outstanding(&effective);
        if instance.status.is_active() {
            instance.blocked = effective.is_blocked();
        }
        InstanceView {
            instance,
            current_approvers: effective.approvers,
            outstanding_approvers,
        }
    }

    pub fn history(&self, ctx: &WorkspaceContext, instance_id: u64) -> Result<Vec<ApprovalHistory>, ApprovalError> {
        self.get(ctx, instance_id)?;
        self.history.list(instance_id)
    }

    pub(crate) fn scan_instances(&self) -> Result<Vec<ApprovalInstance>, ApprovalError> {
        self.instances
            .iter()
            .map(|entry| {
                let (_, bytes) = entry?;
                utils::decode(&bytes)
            })
            .collect()
    }

    /// Active instances in the caller's workspace waiting on the caller.
    pub fn pending_for(&self, ctx: &WorkspaceContext) -> Result<Vec<InstanceView>, ApprovalError> {
        ctx.validate()?;
        let user_id = ctx.user_id;
        Ok(self
            .scan_instances()?
            .into_iter()
            .filter(|i| i.status.is_active() && i.visible_to(ctx))
            .map(|i| self.to_view(i))
            .filter(|v| v.outstanding_approvers.contains(&user_id))
            .filter(|v| v.instance.current().is_some_and(|s| s.decided_by(user_id).is_none()))
            .collect())
    }

    pub fn statistics(&self, ctx: &WorkspaceContext) -> Result<Statistics, ApprovalError> {
        self.statistics_at(ctx, TimeStamp::now())
    }

    pub fn statistics_at(&self, ctx: &WorkspaceContext, now: TimeStamp) -> Result<Statistics, ApprovalError> {
        ctx.validate()?;
        let mut stats = Statistics::default();
        for status in InstanceStatus::ALL {
            stats.by_status.insert(status.as_str().to_string(), 0);
        }
        for document_type in DocumentType::ALL {
            stats.by_document_type.insert(document_type.as_str().to_string(), 0);
        }

        for instance in self.scan_instances()? {
            if !instance.visible_to(ctx) {
                continue;
            }
            stats.total += 1;
            *stats
                .by_status
                .entry(instance.status.as_str().to_string())
                .or_default() += 1;
            *stats
                .by_document_type
                .entry(instance.document_type.as_str().to_string())
                .or_default() += 1;
            if instance.status.is_active() {
                if self.effective(&instance).is_blocked() {
                    stats.blocked += 1;
                }
                if instance.is_overdue(now) {
                    stats.overdue += 1;
                }
            }
        }
        Ok(stats)
    }

    // ---- notifications ----

    pub fn list_notifications(
        &self,
        ctx: &WorkspaceContext,
        unread_only: bool,
    ) -> Result<Vec<ApprovalNotification>, ApprovalError> {
        let mut out = Vec::new();
        for entry in self.notifications.scan_prefix(utils::id_key(ctx.user_id)) {
            let (_, bytes) = entry?;
            let notification: ApprovalNotification = utils::decode(&bytes)?;
            if !unread_only || !notification.is_read {
                out.push(notification);
            }
        }
        Ok(out)
    }

    pub fn mark_read(&self, ctx: &WorkspaceContext, notification_id: u64) -> Result<ApprovalNotification, ApprovalError> {
        let key = utils::pair_key(ctx.user_id, notification_id);
        let mut notification: ApprovalNotification = match self.notifications.get(&key)? {
            Some(bytes) => utils::decode(&bytes)?,
            None => return Err(ApprovalError::NotificationNotFound(notification_id)),
        };
        if !notification.is_read {
            notification.is_read = true;
            self.notifications.insert(key, utils::encode(&notification)?)?;
        }
        Ok(notification)
    }

    // ---- workflow administration ----

    fn ensure_workflow_admin(&self, ctx: &WorkspaceContext, company_id: Option<CompanyId>) -> Result<(), ApprovalError> {
        ctx.validate()?;
        let directory = self.resolver.directory();
        let allowed = directory.is_system_admin(ctx.user_id)
            || company_id.is_some_and(|company| {
                ctx.scope_company() == Some(company) && directory.is_company_admin(company, ctx.user_id)
            });
        if allowed {
            Ok(())
        } else {
            Err(ApprovalError::PermissionDenied(format!(
                "user {} may not administer workflows of this scope",
                ctx.user_id
            )))
        }
    }

    pub fn create_workflow(
        &self,
        ctx: &WorkspaceContext,
        draft: NewWorkflowDefinition,
    ) -> Result<WorkflowDefinition, ApprovalError> {
        self.ensure_workflow_admin(ctx, draft.company_id)?;
        self.definitions.create(draft)
    }

    /// Definitions usable from the caller's workspace.
    pub fn list_workflows(&self, ctx: &WorkspaceContext) -> Result<Vec<WorkflowDefinition>, ApprovalError> {
        ctx.validate()?;
        self.definitions.list(ctx.scope_company())
    }

    pub fn get_workflow(&self, ctx: &WorkspaceContext, workflow_id: u64) -> Result<WorkflowDefinition, ApprovalError> {
        ctx.validate()?;
        let definition = self.definitions.get(workflow_id)?;
        if definition.company_id.is_some() && definition.company_id != ctx.scope_company() {
            return Err(ApprovalError::WorkflowNotFound(workflow_id));
        }
        Ok(definition)
    }

    pub fn update_workflow_steps(
        &self,
        ctx: &WorkspaceContext,
        workflow_id: u64,
        steps: Vec<StepDefinition>,
    ) -> Result<WorkflowDefinition, ApprovalError> {
        let current = self.get_workflow(ctx, workflow_id)?;
        self.ensure_workflow_admin(ctx, current.company_id)?;
        self.definitions.update_steps(workflow_id, steps)
    }

    pub fn deactivate_workflow(&self, ctx: &WorkspaceContext, workflow_id: u64) -> Result<WorkflowDefinition, ApprovalError> {
        let current = self.get_workflow(ctx, workflow_id)?;
        self.ensure_workflow_admin(ctx, current.company_id)?;
        self.definitions.deactivate(workflow_id)
    }
}
