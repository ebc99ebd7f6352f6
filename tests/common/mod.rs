#![allow(dead_code)]

use std::sync::Arc;
use tempfile::{TempDir, tempdir};
use wps_approval::collaborators::{InMemoryDirectory, RecordingCallback};
use wps_approval::context::WorkspaceContext;
use wps_approval::definition::{ApprovalMode, ApproverRule, NewWorkflowDefinition, StepDefinition, WorkflowDefinition};
use wps_approval::notify::RecordingNotifier;
use wps_approval::service::ApprovalService;
use wps_approval::types::{DocumentType, UserId};

pub const COMPANY: u64 = 1;
pub const SUBMITTER: UserId = 50;
pub const ADMIN: UserId = 90;
pub const OUTSIDER: UserId = 77;

pub struct Harness {
    // keeps the database directory alive for the test
    _dir: TempDir,
    pub directory: Arc<InMemoryDirectory>,
    pub notifier: Arc<RecordingNotifier>,
    pub callback: Arc<RecordingCallback>,
    pub service: Arc<ApprovalService>,
}

/// Fresh database with company 1 employing users 1-6 and 9, the submitter and
/// an admin. Sled locks its directory, so every test gets its own.
pub fn harness() -> anyhow::Result<Harness> {
    let dir = tempdir()?;
    let db = Arc::new(sled::open(dir.path().join("approval.db"))?);

    let directory = Arc::new(InMemoryDirectory::new());
    for user in [1, 2, 3, 4, 5, 6, 9, SUBMITTER] {
        directory.add_employee(COMPANY, user, &[]);
    }
    directory.set_admin(COMPANY, ADMIN, true);
    directory.add_system_admin(ADMIN);

    let notifier = Arc::new(RecordingNotifier::new());
    let callback = Arc::new(RecordingCallback::new());
    let service = Arc::new(ApprovalService::new(
        db,
        directory.clone(),
        notifier.clone(),
        callback.clone(),
    )?);

    Ok(Harness {
        _dir: dir,
        directory,
        notifier,
        callback,
        service,
    })
}

pub fn as_user(user_id: UserId) -> WorkspaceContext {
    WorkspaceContext::enterprise(user_id, COMPANY, None)
}

pub fn admin() -> WorkspaceContext {
    as_user(ADMIN)
}

pub fn users(ids: &[UserId]) -> ApproverRule {
    ApproverRule::Users(ids.to_vec())
}

/// `[any:{1,2}, all:{3,4}]` owned by company 1.
pub fn two_step_workflow(h: &Harness, document_type: DocumentType) -> anyhow::Result<WorkflowDefinition> {
    let draft = NewWorkflowDefinition::new("Two step review", "two-step", document_type)
        .for_company(COMPANY)
        .set_default(true)
        .step(StepDefinition::new("Technical check", users(&[1, 2])))
        .step(StepDefinition::new("Sign off", users(&[3, 4])).set_mode(ApprovalMode::All));
    Ok(h.service.create_workflow(&admin(), draft)?)
}
