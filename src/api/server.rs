//! API Server module
//!
//! HTTP surface over [`Core`] for a UI layer or host integration. Every conversation-scoped
//! route lives under `/api/conversations/:conversation`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::completion::TurnType;
use crate::generation::HostState;
use crate::library::ConflictPolicy;
use crate::models::{PlanError, PlanResponse, SettingsUpdate, TaskError, TaskId};
use crate::prompts::PromptKind;
use crate::Core;

/// Request to add a new task
#[derive(Serialize, Deserialize)]
pub struct AddTaskRequest {
    /// Defaults to the current objective
    pub parent: Option<TaskId>,
    pub description: String,
    pub index: Option<usize>,
}

#[derive(Serialize, Deserialize)]
pub struct DescriptionRequest {
    pub description: String,
}

#[derive(Serialize, Deserialize)]
pub struct DurationRequest {
    pub duration: u32,
}

/// New child order for a task
#[derive(Serialize, Deserialize)]
pub struct ReorderRequest {
    pub order: Vec<TaskId>,
}

/// A message was received by the host
#[derive(Serialize, Deserialize, Default)]
pub struct TurnRequest {
    #[serde(default)]
    pub turn_type: TurnType,
}

#[derive(Serialize, Deserialize)]
pub struct PromptRequest {
    pub text: String,
}

#[derive(Serialize, Deserialize)]
pub struct HostActivityRequest {
    pub generating: bool,
}

/// `?confirm=true` acknowledges a destructive operation
#[derive(Debug, Default, Deserialize)]
pub struct ConfirmQuery {
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ImportQuery {
    #[serde(default)]
    pub policy: ConflictPolicy,
}

/// `?names=a,b`; absent means everything
#[derive(Debug, Default, Deserialize)]
pub struct ExportQuery {
    pub names: Option<String>,
}

impl ExportQuery {
    fn names(&self) -> Vec<String> {
        self.names
            .as_deref()
            .map(|names| {
                names
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub address: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: ([127, 0, 0, 1], 3000).into(),
        }
    }
}

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub core: Core,
    pub host: Arc<HostState>,
}

/// API responses
#[derive(Serialize, Deserialize)]
pub struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

fn status_for(error: &PlanError) -> StatusCode {
    match error {
        PlanError::Task(TaskError::NotFound(_))
        | PlanError::Task(TaskError::ParentNotFound(_))
        | PlanError::Task(TaskError::MissingId)
        | PlanError::Missing(_)
        | PlanError::NoActiveTask => StatusCode::NOT_FOUND,
        PlanError::Task(_)
        | PlanError::InvalidName(_)
        | PlanError::Invalid(_)
        | PlanError::Import(_) => StatusCode::BAD_REQUEST,
        PlanError::ConfirmationRequired(_) => StatusCode::CONFLICT,
        PlanError::Generation(_) => StatusCode::BAD_GATEWAY,
        PlanError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response<T: Serialize>(error: PlanError) -> Response {
    let status = status_for(&error);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %error, "Request failed");
    }
    (status, Json(ApiResponse::<T>::error(error.to_string()))).into_response()
}

/// Helper function to map Core results to Axum responses
fn map_core_result_to_response<T: Serialize>(
    result: Result<PlanResponse<T>, PlanError>,
) -> Response {
    match result {
        Ok(plan_response) => {
            (StatusCode::OK, Json(ApiResponse::success(plan_response))).into_response()
        }
        Err(e) => error_response::<PlanResponse<T>>(e),
    }
}

/// Helper function to map Core results (without PlanResponse) to Axum responses
fn map_core_result_simple<T: Serialize>(result: Result<T, PlanError>) -> Response {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::success(data))).into_response(),
        Err(e) => error_response::<T>(e),
    }
}

/// Builds the application router
pub fn router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let conversation = Router::new()
        .route("/plan", get(get_plan))
        .route("/distilled", get(get_distilled_context))
        .route("/injection", get(get_injection))
        .route("/stats", get(get_stats))
        .route("/tasks", post(add_task))
        .route("/tasks/:id", delete(remove_task))
        .route("/tasks/:id/after", post(add_task_after))
        .route("/tasks/:id/complete", post(complete_task))
        .route("/tasks/:id/uncomplete", post(uncomplete_task))
        .route("/tasks/:id/description", put(set_description))
        .route("/tasks/:id/duration", put(set_duration))
        .route("/tasks/:id/reset", post(reset_elapsed))
        .route("/tasks/:id/branch", post(branch))
        .route("/tasks/:id/reorder", post(reorder_tasks))
        .route("/ascend", post(ascend))
        .route("/objective", put(set_objective))
        .route("/active/complete", post(complete_active))
        .route("/check", post(check_now))
        .route("/generate", post(generate))
        .route("/generate-more", post(generate_more))
        .route("/turn", post(message_received))
        .route("/swipe", post(swipe))
        .route("/switch", post(switch_conversation))
        .route("/settings", put(update_settings))
        .route("/prompts/:kind", put(set_prompt))
        .route("/clear", post(clear_tasks))
        .route("/purge/completed", post(purge_completed))
        .route("/purge/upcoming", post(purge_upcoming))
        .route("/export", get(export_tasks))
        .route("/import", post(import_tasks))
        .route("/templates/:name", post(save_template))
        .route("/templates/:name/load", post(load_template))
        .route("/prompt-sets/:name", post(new_prompt_set))
        .route("/prompt-sets/:name/select", post(select_prompt_set))
        .route(
            "/prompt-set",
            put(save_prompt_set).delete(delete_prompt_set),
        );

    Router::new()
        .nest("/api/conversations/:conversation", conversation)
        .route("/api/library/templates", get(list_templates))
        .route("/api/library/templates/:name", delete(delete_template))
        .route("/api/library/prompt-sets", get(list_prompt_sets))
        .route("/api/library/export/templates", get(export_templates))
        .route("/api/library/import/templates", post(import_templates))
        .route("/api/library/export/prompt-sets", get(export_prompt_sets))
        .route("/api/library/import/prompt-sets", post(import_prompt_sets))
        .route("/api/library/stats", get(global_stats))
        .route("/api/host/activity", put(set_host_activity))
        .route("/api/events/:conversation", get(events_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Starts the API server
pub async fn serve(
    core: Core,
    host: Arc<HostState>,
    config: ServerConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = router(AppState { core, host });

    tracing::info!("Starting server on {}", config.address);
    let listener = TcpListener::bind(config.address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

// --- Views --- //

async fn get_plan(
    State(state): State<AppState>,
    Path(conversation): Path<String>,
) -> impl IntoResponse {
    map_core_result_to_response(Ok(state.core.get_plan(&conversation)))
}

async fn get_distilled_context(
    State(state): State<AppState>,
    Path(conversation): Path<String>,
) -> impl IntoResponse {
    map_core_result_to_response(Ok(state.core.distilled_context(&conversation)))
}

async fn get_injection(
    State(state): State<AppState>,
    Path(conversation): Path<String>,
) -> impl IntoResponse {
    map_core_result_to_response(Ok(state.core.injection(&conversation)))
}

async fn get_stats(
    State(state): State<AppState>,
    Path(conversation): Path<String>,
) -> impl IntoResponse {
    map_core_result_to_response(Ok(state.core.statistics(&conversation)))
}

// --- Task editing --- //

async fn add_task(
    State(state): State<AppState>,
    Path(conversation): Path<String>,
    Json(payload): Json<AddTaskRequest>,
) -> impl IntoResponse {
    let response = state.core.add_task(
        &conversation,
        payload.parent,
        payload.description,
        payload.index,
    );
    map_core_result_to_response(response)
}

async fn add_task_after(
    State(state): State<AppState>,
    Path((conversation, id)): Path<(String, TaskId)>,
) -> impl IntoResponse {
    map_core_result_to_response(state.core.add_task_after(&conversation, id))
}

async fn remove_task(
    State(state): State<AppState>,
    Path((conversation, id)): Path<(String, TaskId)>,
    Query(query): Query<ConfirmQuery>,
) -> impl IntoResponse {
    map_core_result_to_response(state.core.remove_task(&conversation, id, query.confirm))
}

async fn complete_task(
    State(state): State<AppState>,
    Path((conversation, id)): Path<(String, TaskId)>,
) -> impl IntoResponse {
    map_core_result_to_response(state.core.set_completed(&conversation, id, true))
}

async fn uncomplete_task(
    State(state): State<AppState>,
    Path((conversation, id)): Path<(String, TaskId)>,
) -> impl IntoResponse {
    map_core_result_to_response(state.core.set_completed(&conversation, id, false))
}

async fn set_description(
    State(state): State<AppState>,
    Path((conversation, id)): Path<(String, TaskId)>,
    Json(payload): Json<DescriptionRequest>,
) -> impl IntoResponse {
    map_core_result_to_response(state.core.set_description(
        &conversation,
        id,
        payload.description,
    ))
}

async fn set_duration(
    State(state): State<AppState>,
    Path((conversation, id)): Path<(String, TaskId)>,
    Json(payload): Json<DurationRequest>,
) -> impl IntoResponse {
    map_core_result_to_response(state.core.set_duration(&conversation, id, payload.duration))
}

async fn reset_elapsed(
    State(state): State<AppState>,
    Path((conversation, id)): Path<(String, TaskId)>,
) -> impl IntoResponse {
    map_core_result_to_response(state.core.reset_elapsed(&conversation, id))
}

async fn branch(
    State(state): State<AppState>,
    Path((conversation, id)): Path<(String, TaskId)>,
) -> impl IntoResponse {
    map_core_result_to_response(state.core.branch(&conversation, id))
}

async fn reorder_tasks(
    State(state): State<AppState>,
    Path((conversation, id)): Path<(String, TaskId)>,
    Json(payload): Json<ReorderRequest>,
) -> impl IntoResponse {
    map_core_result_to_response(state.core.reorder_tasks(&conversation, id, payload.order))
}

async fn ascend(
    State(state): State<AppState>,
    Path(conversation): Path<String>,
) -> impl IntoResponse {
    map_core_result_to_response(state.core.ascend(&conversation))
}

async fn set_objective(
    State(state): State<AppState>,
    Path(conversation): Path<String>,
    Json(payload): Json<DescriptionRequest>,
) -> impl IntoResponse {
    map_core_result_to_response(
        state
            .core
            .set_objective_description(&conversation, payload.description),
    )
}

async fn complete_active(
    State(state): State<AppState>,
    Path(conversation): Path<String>,
) -> impl IntoResponse {
    map_core_result_to_response(state.core.complete_active(&conversation))
}

async fn clear_tasks(
    State(state): State<AppState>,
    Path(conversation): Path<String>,
    Query(query): Query<ConfirmQuery>,
) -> impl IntoResponse {
    map_core_result_to_response(state.core.clear_tasks(&conversation, query.confirm))
}

async fn purge_completed(
    State(state): State<AppState>,
    Path(conversation): Path<String>,
    Query(query): Query<ConfirmQuery>,
) -> impl IntoResponse {
    map_core_result_to_response(
        state
            .core
            .purge_recently_completed(&conversation, query.confirm),
    )
}

async fn purge_upcoming(
    State(state): State<AppState>,
    Path(conversation): Path<String>,
    Query(query): Query<ConfirmQuery>,
) -> impl IntoResponse {
    map_core_result_to_response(state.core.purge_upcoming(&conversation, query.confirm))
}

// --- Generation loop --- //

/// "Check task now": plain-text `true` or `false`
async fn check_now(
    State(state): State<AppState>,
    Path(conversation): Path<String>,
) -> Response {
    match state.core.check_now(&conversation).await {
        Ok(response) => {
            let completed = response.inner().completed();
            (StatusCode::OK, completed.to_string()).into_response()
        }
        Err(e) => error_response::<()>(e),
    }
}

async fn generate(
    State(state): State<AppState>,
    Path(conversation): Path<String>,
) -> impl IntoResponse {
    map_core_result_to_response(state.core.generate_tasks(&conversation, false).await)
}

async fn generate_more(
    State(state): State<AppState>,
    Path(conversation): Path<String>,
) -> impl IntoResponse {
    map_core_result_to_response(state.core.generate_tasks(&conversation, true).await)
}

async fn message_received(
    State(state): State<AppState>,
    Path(conversation): Path<String>,
    payload: Option<Json<TurnRequest>>,
) -> impl IntoResponse {
    let turn_type = payload.map(|Json(p)| p.turn_type).unwrap_or_default();
    map_core_result_to_response(state.core.message_received(&conversation, turn_type).await)
}

async fn swipe(
    State(state): State<AppState>,
    Path(conversation): Path<String>,
) -> impl IntoResponse {
    map_core_result_to_response(state.core.swipe(&conversation))
}

async fn switch_conversation(
    State(state): State<AppState>,
    Path(conversation): Path<String>,
) -> impl IntoResponse {
    map_core_result_to_response(state.core.switch_conversation(&conversation))
}

async fn update_settings(
    State(state): State<AppState>,
    Path(conversation): Path<String>,
    Json(payload): Json<SettingsUpdate>,
) -> impl IntoResponse {
    map_core_result_to_response(state.core.update_settings(&conversation, payload))
}

async fn set_prompt(
    State(state): State<AppState>,
    Path((conversation, kind)): Path<(String, PromptKind)>,
    Json(payload): Json<PromptRequest>,
) -> impl IntoResponse {
    map_core_result_to_response(state.core.set_prompt(&conversation, kind, payload.text))
}

// --- Export/import and library --- //

async fn export_tasks(
    State(state): State<AppState>,
    Path(conversation): Path<String>,
) -> impl IntoResponse {
    map_core_result_simple(state.core.export_tasks(&conversation))
}

async fn import_tasks(
    State(state): State<AppState>,
    Path(conversation): Path<String>,
    Query(query): Query<ConfirmQuery>,
    Json(document): Json<Value>,
) -> impl IntoResponse {
    map_core_result_to_response(
        state
            .core
            .import_tasks(&conversation, &document, query.confirm),
    )
}

async fn save_template(
    State(state): State<AppState>,
    Path((conversation, name)): Path<(String, String)>,
) -> impl IntoResponse {
    map_core_result_to_response(state.core.save_template(&conversation, &name))
}

async fn load_template(
    State(state): State<AppState>,
    Path((conversation, name)): Path<(String, String)>,
    Query(query): Query<ConfirmQuery>,
) -> impl IntoResponse {
    map_core_result_to_response(
        state
            .core
            .load_template(&conversation, &name, query.confirm),
    )
}

async fn new_prompt_set(
    State(state): State<AppState>,
    Path((conversation, name)): Path<(String, String)>,
) -> impl IntoResponse {
    map_core_result_to_response(state.core.new_prompt_set(&conversation, &name))
}

async fn select_prompt_set(
    State(state): State<AppState>,
    Path((conversation, name)): Path<(String, String)>,
) -> impl IntoResponse {
    map_core_result_to_response(state.core.select_prompt_set(&conversation, &name))
}

async fn save_prompt_set(
    State(state): State<AppState>,
    Path(conversation): Path<String>,
) -> impl IntoResponse {
    map_core_result_to_response(state.core.save_prompt_set(&conversation))
}

async fn delete_prompt_set(
    State(state): State<AppState>,
    Path(conversation): Path<String>,
    Query(query): Query<ConfirmQuery>,
) -> impl IntoResponse {
    map_core_result_to_response(state.core.delete_prompt_set(&conversation, query.confirm))
}

async fn list_templates(State(state): State<AppState>) -> impl IntoResponse {
    map_core_result_simple(Ok(state.core.template_names()))
}

async fn delete_template(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<ConfirmQuery>,
) -> impl IntoResponse {
    map_core_result_simple(
        state
            .core
            .delete_template(&name, query.confirm)
            .map(|()| name),
    )
}

async fn list_prompt_sets(State(state): State<AppState>) -> impl IntoResponse {
    map_core_result_simple(Ok(state.core.prompt_set_names()))
}

async fn export_templates(
    State(state): State<AppState>,
    Query(query): Query<ExportQuery>,
) -> impl IntoResponse {
    map_core_result_simple(Ok(state.core.export_templates(&query.names())))
}

async fn import_templates(
    State(state): State<AppState>,
    Query(query): Query<ImportQuery>,
    Json(document): Json<Value>,
) -> impl IntoResponse {
    map_core_result_simple(state.core.import_templates(&document, query.policy))
}

async fn export_prompt_sets(
    State(state): State<AppState>,
    Query(query): Query<ExportQuery>,
) -> impl IntoResponse {
    map_core_result_simple(Ok(state.core.export_prompt_sets(&query.names())))
}

async fn import_prompt_sets(
    State(state): State<AppState>,
    Query(query): Query<ImportQuery>,
    Json(document): Json<Value>,
) -> impl IntoResponse {
    map_core_result_simple(state.core.import_prompt_sets(&document, query.policy))
}

async fn global_stats(State(state): State<AppState>) -> impl IntoResponse {
    map_core_result_simple(Ok(state.core.global_statistics()))
}

async fn set_host_activity(
    State(state): State<AppState>,
    Json(payload): Json<HostActivityRequest>,
) -> impl IntoResponse {
    state.host.set_generating(payload.generating);
    map_core_result_simple(Ok(payload.generating))
}

// --- Update stream --- //

const UPDATE_EVENT: &str = "event: update\ndata: change\n\n";

async fn events_handler(
    State(state): State<AppState>,
    Path(conversation): Path<String>,
) -> impl IntoResponse {
    let receiver = state.core.subscribe();
    let stream = futures::stream::unfold(receiver, move |mut receiver| {
        let conversation = conversation.clone();
        async move {
            loop {
                match receiver.recv().await {
                    Ok(id) if id == conversation => break,
                    Ok(_) => continue,
                    // Some messages were missed; the client refetches anyway
                    Err(RecvError::Lagged(_)) => break,
                    Err(RecvError::Closed) => return None,
                }
            }
            Some((Ok::<_, Infallible>(UPDATE_EVENT.to_string()), receiver))
        }
    });

    // Set headers for event stream
    let headers = [
        (
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("text/event-stream"),
        ),
        (
            axum::http::header::CACHE_CONTROL,
            axum::http::HeaderValue::from_static("no-cache"),
        ),
    ];

    (headers, axum::body::Body::from_stream(stream))
}
