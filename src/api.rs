//! HTTP surface over [`ApprovalService`].
//!
//! The caller's workspace comes from gateway-set headers (`X-User-Id`,
//! `X-Workspace-Type`, `X-Company-Id`, `X-Factory-Id`) and is resolved once by
//! the [`Workspace`] extractor. Engine calls touch sled and run on the
//! blocking pool.
use crate::context::{WorkspaceContext, WorkspaceType};
use crate::definition::{ApproverRule, NewWorkflowDefinition, StepDefinition};
use crate::error::{ApprovalError, ValidationError};
use crate::history::ApprovalHistory;
use crate::instance::{Action, ApprovalInstance};
use crate::service::{ActionRequest, ApprovalService, BatchResults};
use crate::types::{DocumentType, StepOrder, UserId};
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ApprovalService>,
}

pub fn router(service: Arc<ApprovalService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/approvals/submit", post(submit))
        .route("/approvals/batch", post(batch_action))
        .route("/approvals/pending", get(pending))
        .route("/approvals/statistics", get(statistics))
        .route("/approvals/:id", get(get_instance))
        .route("/approvals/:id/action", post(action))
        .route("/approvals/:id/history", get(history))
        .route("/approvals/:id/cancel", post(cancel))
        .route("/approvals/:id/reassign", post(reassign))
        .route("/notifications", get(notifications))
        .route("/notifications/:id/read", post(mark_read))
        .route("/workflows", post(create_workflow).get(list_workflows))
        .route("/workflows/:id", get(get_workflow))
        .route("/workflows/:id/steps", put(update_steps))
        .route("/workflows/:id/deactivate", post(deactivate_workflow))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { service })
}

// ---- errors ----

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            kind: "unauthorized",
            message: message.into(),
        }
    }

    fn bad_header(name: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "validation",
            message: format!("Header '{}' is malformed", name),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal",
            message: message.into(),
        }
    }

    fn body(&self) -> serde_json::Value {
        json!({ "kind": self.kind, "message": self.message })
    }
}

pub fn status_for(err: &ApprovalError) -> StatusCode {
    match err {
        ApprovalError::NoWorkflowConfigured { .. }
        | ApprovalError::InvalidApprover(_)
        | ApprovalError::BlockedStep { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ApprovalError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        ApprovalError::AlreadyProcessed { .. }
        | ApprovalError::InvalidTransition(_)
        | ApprovalError::ActiveInstanceExists { .. } => StatusCode::CONFLICT,
        ApprovalError::InstanceNotFound(_)
        | ApprovalError::WorkflowNotFound(_)
        | ApprovalError::NotificationNotFound(_) => StatusCode::NOT_FOUND,
        ApprovalError::Validation(_) => StatusCode::BAD_REQUEST,
        ApprovalError::Storage(_) | ApprovalError::Codec(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<ApprovalError> for ApiError {
    fn from(err: ApprovalError) -> Self {
        if err.is_internal() {
            error!(kind = err.kind(), error = %err, "Request failed on an internal error");
            return Self::internal("internal error");
        }
        Self {
            status: status_for(&err),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApprovalError::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.body() }))).into_response()
    }
}

// ---- workspace extraction ----

/// The caller's workspace context as set by the gateway.
#[derive(Debug, Clone)]
pub struct Workspace(pub WorkspaceContext);

fn header_u64(headers: &HeaderMap, name: &str) -> Result<Option<u64>, ApiError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .map(Some)
            .ok_or_else(|| ApiError::bad_header(name)),
    }
}

impl Workspace {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, ApiError> {
        let user_id = header_u64(headers, "x-user-id")?
            .ok_or_else(|| ApiError::unauthorized("Missing X-User-Id header"))?;
        let company_id = header_u64(headers, "x-company-id")?;
        let factory_id = header_u64(headers, "x-factory-id")?;
        let workspace_type = match headers.get("x-workspace-type").map(|v| v.to_str()) {
            None if company_id.is_some() => WorkspaceType::Enterprise,
            None => WorkspaceType::Personal,
            Some(Ok(raw)) if raw.eq_ignore_ascii_case("enterprise") => WorkspaceType::Enterprise,
            Some(Ok(raw)) if raw.eq_ignore_ascii_case("personal") => WorkspaceType::Personal,
            Some(_) => return Err(ApiError::bad_header("x-workspace-type")),
        };
        let ctx = WorkspaceContext {
            user_id,
            workspace_type,
            company_id,
            factory_id,
        };
        ctx.validate()?;
        Ok(Self(ctx))
    }
}

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Workspace {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Self::from_headers(&parts.headers)
    }
}

async fn run_blocking<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&ApprovalService) -> Result<T, ApprovalError> + Send + 'static,
    T: Send + 'static,
{
    let service = state.service.clone();
    tokio::task::spawn_blocking(move || f(&service))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .map_err(ApiError::from)
}

// ---- bodies ----

#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    pub document_type: String,
    pub document_ids: Vec<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ActionBody {
    pub action: String,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub delegate_to: Option<UserId>,
    #[serde(default)]
    pub expected_step: Option<StepOrder>,
}

#[derive(Debug, Deserialize)]
pub struct BatchActionBody {
    pub instance_ids: Vec<u64>,
    pub action: String,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub delegate_to: Option<UserId>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelBody {
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReassignBody {
    #[serde(flatten)]
    pub approvers: ApproverRule,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStepsBody {
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Default, Deserialize)]
pub struct NotificationsQuery {
    #[serde(default)]
    pub unread_only: bool,
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub instance: ApprovalInstance,
    pub history: ApprovalHistory,
}

fn parse_action(name: &str, delegate_to: Option<UserId>) -> Result<Action, ValidationError> {
    match name.trim().to_ascii_lowercase().as_str() {
        "approve" => Ok(Action::Approve),
        "reject" => Ok(Action::Reject),
        "comment" => Ok(Action::Comment),
        "delegate" => delegate_to
            .map(|to| Action::Delegate { to })
            .ok_or_else(|| ValidationError::InvalidDelegate("delegate_to is required".into())),
        other => Err(ValidationError::UnknownAction(other.to_string())),
    }
}

/// 200 when every item succeeded, 207 otherwise.
fn batch_response<T>(results: BatchResults<T>, render: impl Fn(T) -> serde_json::Value) -> Response {
    let mut any_failed = false;
    let items: Vec<serde_json::Value> = results
        .into_iter()
        .map(|(id, result)| match result {
            Ok(value) => json!({ "id": id, "ok": true, "result": render(value) }),
            Err(err) => {
                any_failed = true;
                let err = ApiError::from(err);
                json!({ "id": id, "ok": false, "error": err.body() })
            }
        })
        .collect();
    let status = if any_failed {
        StatusCode::MULTI_STATUS
    } else {
        StatusCode::OK
    };
    (status, Json(json!({ "results": items }))).into_response()
}

// ---- handlers ----

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn submit(
    State(state): State<AppState>,
    Workspace(ctx): Workspace,
    Json(body): Json<SubmitBody>,
) -> Result<Response, ApiError> {
    let document_type: DocumentType = body.document_type.parse()?;
    let results = run_blocking(&state, move |service| {
        Ok(service.submit_batch(&ctx, document_type, &body.document_ids))
    })
    .await?;
    Ok(batch_response(results, |instance| json!(instance)))
}

async fn action(
    State(state): State<AppState>,
    Workspace(ctx): Workspace,
    Path(id): Path<u64>,
    Json(body): Json<ActionBody>,
) -> Result<Json<ActionResponse>, ApiError> {
    let request = ActionRequest {
        action: parse_action(&body.action, body.delegate_to)?,
        comment: body.comment,
        expected_step: body.expected_step,
    };
    let outcome = run_blocking(&state, move |service| service.advance(&ctx, id, request)).await?;
    Ok(Json(ActionResponse {
        instance: outcome.instance,
        history: outcome.entry,
    }))
}

async fn batch_action(
    State(state): State<AppState>,
    Workspace(ctx): Workspace,
    Json(body): Json<BatchActionBody>,
) -> Result<Response, ApiError> {
    let action = parse_action(&body.action, body.delegate_to)?;
    let results = run_blocking(&state, move |service| {
        Ok(service.advance_batch(&ctx, &body.instance_ids, action, body.comment.as_deref()))
    })
    .await?;
    Ok(batch_response(results, |outcome| {
        json!({ "instance": outcome.instance, "history": outcome.entry })
    }))
}

async fn get_instance(
    State(state): State<AppState>,
    Workspace(ctx): Workspace,
    Path(id): Path<u64>,
) -> Result<Response, ApiError> {
    let view = run_blocking(&state, move |service| service.view(&ctx, id)).await?;
    Ok(Json(view).into_response())
}

async fn history(
    State(state): State<AppState>,
    Workspace(ctx): Workspace,
    Path(id): Path<u64>,
) -> Result<Json<Vec<ApprovalHistory>>, ApiError> {
    Ok(Json(run_blocking(&state, move |service| service.history(&ctx, id)).await?))
}

async fn cancel(
    State(state): State<AppState>,
    Workspace(ctx): Workspace,
    Path(id): Path<u64>,
    body: Option<Json<CancelBody>>,
) -> Result<Json<ApprovalInstance>, ApiError> {
    let comment = body.and_then(|Json(b)| b.comment);
    Ok(Json(
        run_blocking(&state, move |service| service.cancel(&ctx, id, comment)).await?,
    ))
}

async fn reassign(
    State(state): State<AppState>,
    Workspace(ctx): Workspace,
    Path(id): Path<u64>,
    Json(body): Json<ReassignBody>,
) -> Result<Json<ApprovalInstance>, ApiError> {
    Ok(Json(
        run_blocking(&state, move |service| {
            service.reassign_step(&ctx, id, body.approvers, body.comment)
        })
        .await?,
    ))
}

async fn pending(State(state): State<AppState>, Workspace(ctx): Workspace) -> Result<Response, ApiError> {
    let views = run_blocking(&state, move |service| service.pending_for(&ctx)).await?;
    Ok(Json(views).into_response())
}

async fn statistics(State(state): State<AppState>, Workspace(ctx): Workspace) -> Result<Response, ApiError> {
    let stats = run_blocking(&state, move |service| service.statistics(&ctx)).await?;
    Ok(Json(stats).into_response())
}

async fn notifications(
    State(state): State<AppState>,
    Workspace(ctx): Workspace,
    Query(query): Query<NotificationsQuery>,
) -> Result<Response, ApiError> {
    let list = run_blocking(&state, move |service| {
        service.list_notifications(&ctx, query.unread_only)
    })
    .await?;
    Ok(Json(list).into_response())
}

async fn mark_read(
    State(state): State<AppState>,
    Workspace(ctx): Workspace,
    Path(id): Path<u64>,
) -> Result<Response, ApiError> {
    let notification = run_blocking(&state, move |service| service.mark_read(&ctx, id)).await?;
    Ok(Json(notification).into_response())
}

async fn create_workflow(
    State(state): State<AppState>,
    Workspace(ctx): Workspace,
    Json(draft): Json<NewWorkflowDefinition>,
) -> Result<Response, ApiError> {
    let definition = run_blocking(&state, move |service| service.create_workflow(&ctx, draft)).await?;
    Ok((StatusCode::CREATED, Json(definition)).into_response())
}

async fn list_workflows(State(state): State<AppState>, Workspace(ctx): Workspace) -> Result<Response, ApiError> {
    let list = run_blocking(&state, move |service| service.list_workflows(&ctx)).await?;
    Ok(Json(list).into_response())
}

async fn get_workflow(
    State(state): State<AppState>,
    Workspace(ctx): Workspace,
    Path(id): Path<u64>,
) -> Result<Response, ApiError> {
    let definition = run_blocking(&state, move |service| service.get_workflow(&ctx, id)).await?;
    Ok(Json(definition).into_response())
}

async fn update_steps(
    State(state): State<AppState>,
    Workspace(ctx): Workspace,
    Path(id): Path<u64>,
    Json(body): Json<UpdateStepsBody>,
) -> Result<Response, ApiError> {
    let definition = run_blocking(&state, move |service| {
        service.update_workflow_steps(&ctx, id, body.steps)
    })
    .await?;
    Ok(Json(definition).into_response())
}

async fn deactivate_workflow(
    State(state): State<AppState>,
    Workspace(ctx): Workspace,
    Path(id): Path<u64>,
) -> Result<Response, ApiError> {
    let definition = run_blocking(&state, move |service| service.deactivate_workflow(&ctx, id)).await?;
    Ok(Json(definition).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{InMemoryDirectory, RecordingCallback};
    use crate::definition::ApprovalMode;
    use crate::notify::RecordingNotifier;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tempfile::{TempDir, tempdir};
    use tower::ServiceExt;

    const COMPANY: u64 = 1;
    const ADMIN: u64 = 90;

    fn setup() -> (TempDir, Router) {
        let dir = tempdir().unwrap();
        let db = Arc::new(sled::open(dir.path()).unwrap());
        let directory = Arc::new(InMemoryDirectory::new());
        for user in [1, 2, 3, 4, 50] {
            directory.add_employee(COMPANY, user, &[]);
        }
        directory.set_admin(COMPANY, ADMIN, true);
        directory.add_system_admin(ADMIN);

        let service = Arc::new(
            ApprovalService::new(
                db,
                directory,
                Arc::new(RecordingNotifier::new()),
                Arc::new(RecordingCallback::new()),
            )
            .unwrap(),
        );
        let draft = NewWorkflowDefinition::new("WPS review", "wps-std", DocumentType::Wps)
            .set_default(true)
            .step(StepDefinition::new("Check", ApproverRule::Users(vec![1, 2])))
            .step(StepDefinition::new("Sign", ApproverRule::Users(vec![3, 4])).set_mode(ApprovalMode::All));
        service
            .create_workflow(&WorkspaceContext::personal(ADMIN), draft)
            .unwrap();
        (dir, router(service))
    }

    fn request(method: &str, uri: &str, user: Option<u64>, body: Option<serde_json::Value>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .header("x-company-id", COMPANY.to_string());
        if let Some(user) = user {
            builder = builder.header("x-user-id", user.to_string());
        }
        let body = body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty);
        builder.body(body).unwrap()
    }

    async fn call(app: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn missing_user_is_unauthorized() {
        let (_dir, app) = setup();
        let (status, body) = call(&app, request("GET", "/approvals/pending", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["kind"], "unauthorized");
    }

    #[tokio::test]
    async fn submit_reports_per_document_results() {
        let (_dir, app) = setup();
        let body = json!({ "document_type": "wps", "document_ids": [10, 11] });
        let (status, json) = call(&app, request("POST", "/approvals/submit", Some(50), Some(body))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["results"][0]["ok"], true);
        assert_eq!(json["results"][1]["result"]["status"], "pending");

        // second submission of document 10 conflicts, document 12 is new
        let body = json!({ "document_type": "wps", "document_ids": [10, 12] });
        let (status, json) = call(&app, request("POST", "/approvals/submit", Some(50), Some(body))).await;
        assert_eq!(status, StatusCode::MULTI_STATUS);
        assert_eq!(json["results"][0]["error"]["kind"], "active_instance_exists");
        assert_eq!(json["results"][1]["ok"], true);
    }

    #[tokio::test]
    async fn action_flow_and_error_codes() {
        let (_dir, app) = setup();
        let body = json!({ "document_type": "WPS", "document_ids": [10] });
        let (_, json) = call(&app, request("POST", "/approvals/submit", Some(50), Some(body))).await;
        let id = json["results"][0]["result"]["id"].as_u64().unwrap();
        let uri = format!("/approvals/{}/action", id);

        let (status, json) = call(&app, request("POST", &uri, Some(3), Some(json!({ "action": "approve" })))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json["error"]["kind"], "permission_denied");

        let (status, json) = call(&app, request("POST", &uri, Some(1), Some(json!({ "action": "approve" })))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["instance"]["current_step"], 1);
        assert_eq!(json["history"]["action"], "approve");

        let (status, json) = call(&app, request("POST", &uri, Some(1), Some(json!({ "action": "approve" })))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["error"]["kind"], "already_processed");

        let (status, _) = call(&app, request("POST", &uri, Some(1), Some(json!({ "action": "shrug" })))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, json) = call(&app, request("GET", &format!("/approvals/{}/history", id), Some(50), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().map(Vec::len), Some(2));

        let (status, _) = call(&app, request("GET", "/approvals/999999", Some(50), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_document_type_is_a_bad_request() {
        let (_dir, app) = setup();
        let body = json!({ "document_type": "invoice", "document_ids": [1] });
        let (status, json) = call(&app, request("POST", "/approvals/submit", Some(50), Some(body))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["kind"], "validation");
    }

    #[tokio::test]
    async fn workflows_require_an_admin() {
        let (_dir, app) = setup();
        let draft = json!({
            "name": "PQR review",
            "code": "pqr-std",
            "document_type": "pqr",
            "company_id": COMPANY,
            "steps": [{ "step_order": 0, "step_name": "Check", "approver_type": "user", "approver_ids": [1], "approval_mode": "any" }]
        });
        let (status, _) = call(&app, request("POST", "/workflows", Some(1), Some(draft.clone()))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, json) = call(&app, request("POST", "/workflows", Some(ADMIN), Some(draft))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["version"], 1);

        let (status, json) = call(&app, request("GET", "/workflows", Some(1), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().map(Vec::len), Some(2));
    }
}
