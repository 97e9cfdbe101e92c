use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use conductor_common::{GraphBlueprint, RunId, RunMode};
use serde::Deserialize;

use super::{sse, ws};
use crate::config::{ConductorToml, SettingsStore, StageSettings};
use crate::errors::{PlanError, RunError};
use crate::plan::Planner;
use crate::registry::{ControlSignal, RunRegistry, RunRequest, RuntimeSettings};
use crate::stages::StageCatalog;
use crate::workflow::WorkflowStore;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub registry: Arc<RunRegistry>,
    pub workflow: WorkflowStore,
    pub settings: SettingsStore,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wire the registry to the built-in stages described by `config`.
    pub fn from_config(config: &ConductorToml) -> Result<Self> {
        let settings = SettingsStore::new(&config.stages);
        let workflow = WorkflowStore::new();
        let catalog = StageCatalog::new(settings.clone(), &config.search)?;
        if !catalog.has_live_stage() {
            tracing::warn!("No stage has api_base and api_key configured; running in demo mode");
        }
        let planner = Planner::new(catalog, workflow.clone());
        let registry = RunRegistry::new(
            Arc::new(planner),
            RuntimeSettings::from(&config.runtime),
        );
        Ok(Self {
            registry: Arc::new(registry),
            workflow,
            settings,
        })
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct StartRunRequest {
    pub user_query: String,
    #[serde(default)]
    pub mode: RunMode,
}

#[derive(Deserialize)]
pub struct SelectionRequest {
    pub node: String,
    /// Signed so that negative indices reach the gate and fall back to 0.
    pub choice_index: i64,
}

#[derive(Deserialize)]
pub struct WorkflowUpdateRequest {
    pub steps: Vec<String>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            RunError::ResumeRejected { .. } => ApiError::Conflict(err.to_string()),
            RunError::Plan(_) => ApiError::BadRequest(err.to_string()),
        }
    }
}

impl From<PlanError> for ApiError {
    fn from(err: PlanError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

/// Parse a run id from the path. Anything unparseable cannot name a run.
pub(super) fn parse_run_id(raw: &str) -> Result<RunId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::NotFound(format!("Run {} not found", raw)))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/runs", get(list_runs).post(create_run))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/events", get(sse::run_events))
        .route("/api/runs/{id}/ws", get(ws::run_socket))
        .route("/api/runs/{id}/pause", post(pause_run))
        .route("/api/runs/{id}/resume", post(resume_run))
        .route("/api/runs/{id}/stop", post(stop_run))
        .route("/api/runs/{id}/selection", post(submit_selection))
        .route("/api/workflow", get(get_workflow).post(set_workflow))
        .route("/api/workflow/graph", get(get_graph).post(set_graph))
        .route(
            "/api/stages/settings",
            get(get_stage_settings).post(update_stage_settings),
        )
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_runs(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.registry.list())
}

async fn create_run(
    State(state): State<SharedState>,
    Json(req): Json<StartRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let query = req.user_query.trim();
    if query.is_empty() {
        return Err(ApiError::BadRequest("user_query cannot be empty".into()));
    }
    let run_id = state.registry.create(RunRequest {
        query: query.to_string(),
        mode: req.mode,
    });
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"run_id": run_id})),
    ))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = parse_run_id(&id)?;
    Ok(Json(state.registry.get(run_id)?))
}

async fn signal_run(
    state: &SharedState,
    id: &str,
    signal: ControlSignal,
) -> Result<Json<serde_json::Value>, ApiError> {
    let run_id = parse_run_id(id)?;
    let snapshot = state.registry.signal(run_id, signal)?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "status": snapshot.status,
        "paused": snapshot.paused,
        "stop_requested": snapshot.stop_requested,
    })))
}

async fn pause_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    signal_run(&state, &id, ControlSignal::Pause).await
}

async fn resume_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    signal_run(&state, &id, ControlSignal::Resume).await
}

async fn stop_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    signal_run(&state, &id, ControlSignal::Stop).await
}

async fn submit_selection(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<SelectionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = parse_run_id(&id)?;
    let node = req.node.trim();
    if node.is_empty() {
        return Err(ApiError::BadRequest("node cannot be empty".into()));
    }
    let record = state
        .registry
        .record_selection(run_id, node, req.choice_index)?;
    Ok(Json(serde_json::json!({"ok": true, "selection": record})))
}

async fn get_workflow(State(state): State<SharedState>) -> impl IntoResponse {
    let plan: Vec<&str> = state
        .workflow
        .plan_override()
        .unwrap_or_default()
        .iter()
        .map(|k| k.as_str())
        .collect();
    Json(serde_json::json!({"workflow_plan": plan}))
}

async fn set_workflow(
    State(state): State<SharedState>,
    Json(req): Json<WorkflowUpdateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let kinds = state.workflow.set_plan_override(&req.steps)?;
    let plan: Vec<&str> = kinds.iter().map(|k| k.as_str()).collect();
    tracing::info!(?plan, "Workflow override updated");
    Ok(Json(serde_json::json!({"workflow_plan": plan})))
}

async fn get_graph(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.workflow.graph())
}

async fn set_graph(
    State(state): State<SharedState>,
    Json(graph): Json<GraphBlueprint>,
) -> impl IntoResponse {
    Json(state.workflow.set_graph(graph))
}

async fn get_stage_settings(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.settings.masked())
}

async fn update_stage_settings(
    State(state): State<SharedState>,
    Json(updates): Json<BTreeMap<String, StageSettings>>,
) -> impl IntoResponse {
    Json(state.settings.update(updates))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::RunTiming;
    use crate::errors::StageFailure;
    use crate::plan::{Plan, StageDescriptor};
    use crate::stages::Stage;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use conductor_common::{EventBody, RunStatus, StageInput, StageRecord};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    struct Fails;

    #[async_trait]
    impl Stage for Fails {
        async fn invoke(&self, _input: &StageInput) -> Result<StageRecord, StageFailure> {
            Err(StageFailure::new("timeout"))
        }
    }

    struct Offers;

    #[async_trait]
    impl Stage for Offers {
        async fn invoke(&self, _input: &StageInput) -> Result<StageRecord, StageFailure> {
            Ok(StageRecord::candidates(vec!["first".into(), "second".into()]))
        }
    }

    fn test_state(plan: Plan) -> SharedState {
        let registry = RunRegistry::new(
            Arc::new(plan),
            RuntimeSettings {
                timing: RunTiming {
                    poll_interval: Duration::from_millis(10),
                    stage_timeout: None,
                },
                retain_finished: Duration::from_secs(60),
            },
        );
        Arc::new(AppState {
            registry: Arc::new(registry),
            workflow: WorkflowStore::new(),
            settings: SettingsStore::new(&BTreeMap::new()),
        })
    }

    fn test_app() -> (Router, SharedState) {
        let plan = Plan::new(vec![StageDescriptor::new("fails", Arc::new(Fails), false)]).unwrap();
        let state = test_state(plan);
        (api_router().with_state(state.clone()), state)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_empty(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = test_app();
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_create_run_returns_created() {
        let (app, state) = test_app();
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/runs",
                serde_json::json!({"user_query": "What is Rust?", "mode": "interactive"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let body: serde_json::Value = body_json(response.into_body()).await;
        let run_id = body["run_id"].as_str().unwrap().to_string();
        assert_eq!(state.registry.len(), 1);

        let response = app.oneshot(get(&format!("/api/runs/{}", run_id))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let snapshot: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(snapshot["mode"], "interactive");
        assert_eq!(snapshot["query"], "What is Rust?");
    }

    #[tokio::test]
    async fn test_create_run_rejects_blank_query() {
        let (app, _) = test_app();
        let response = app
            .oneshot(post_json("/api/runs", serde_json::json!({"user_query": "  "})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("user_query"));
    }

    #[tokio::test]
    async fn test_unknown_run_is_404_everywhere() {
        let (app, _) = test_app();
        let id = RunId::new();
        for uri in [
            format!("/api/runs/{}/pause", id),
            format!("/api/runs/{}/resume", id),
            format!("/api/runs/{}/stop", id),
        ] {
            let response = app.clone().oneshot(post_empty(&uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", uri);
        }
        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/api/runs/{}/selection", id),
                serde_json::json!({"node": "research", "choice_index": 0}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app.clone().oneshot(get("/api/runs/not-a-uuid")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(get(&format!("/api/runs/{}/events", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_resume_on_stage_error_is_conflict() {
        let (app, state) = test_app();
        let id = state.registry.create(RunRequest {
            query: "q".into(),
            mode: RunMode::Autonomous,
        });
        let mut rx = state.registry.handle(id).unwrap().watch();
        rx.wait_for(|s| s.status == RunStatus::PausedError).await.unwrap();

        let response = app
            .clone()
            .oneshot(post_empty(&format!("/api/runs/{}/resume", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .oneshot(post_empty(&format!("/api/runs/{}/stop", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["stop_requested"], true);

        rx.wait_for(|s| s.status == RunStatus::Done).await.unwrap();
    }

    #[tokio::test]
    async fn test_selection_accepts_negative_index() {
        let (app, state) = test_app();
        let id = state.registry.create(RunRequest {
            query: "q".into(),
            mode: RunMode::Interactive,
        });
        let response = app
            .oneshot(post_json(
                &format!("/api/runs/{}/selection", id),
                serde_json::json!({"node": "research", "choice_index": -1}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["selection"]["stage"], "research");
    }

    #[tokio::test]
    async fn test_negative_selection_resolves_to_first_option() {
        let plan = Plan::new(vec![StageDescriptor::new("pick", Arc::new(Offers), true)]).unwrap();
        let state = test_state(plan);
        let app = api_router().with_state(state.clone());
        let (id, mut events) = state.registry.create_subscribed(RunRequest {
            query: "q".into(),
            mode: RunMode::Interactive,
        });
        while let Some(event) = events.recv().await {
            if matches!(event.body, EventBody::AwaitingSelection { .. }) {
                break;
            }
        }

        let response = app
            .oneshot(post_json(
                &format!("/api/runs/{}/selection", id),
                serde_json::json!({"node": "pick", "choice_index": -1}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["selection"]["choice_index"], -1);

        let mut rest = Vec::new();
        while let Some(event) = events.recv().await {
            rest.push(event.body);
        }
        match &rest[0] {
            EventBody::Selection {
                choice_index,
                chosen,
                automatic,
                rationale,
                ..
            } => {
                assert_eq!(*choice_index, Some(0));
                assert_eq!(chosen, "first");
                assert!(!automatic);
                assert!(rationale.contains("[-1]"));
            }
            other => panic!("expected selection, got {:?}", other),
        }
        assert!(matches!(&rest[1], EventBody::Exit { node } if node == "pick"));
        assert!(matches!(
            &rest[2],
            EventBody::Done {
                stopped: false,
                ..
            }
        ));
        assert_eq!(state.registry.get(id).unwrap().status, RunStatus::Done);
    }

    #[tokio::test]
    async fn test_workflow_override_round_trip() {
        let (app, _) = test_app();
        let response = app.clone().oneshot(get("/api/workflow")).await.unwrap();
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["workflow_plan"], serde_json::json!([]));

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/workflow",
                serde_json::json!({"steps": ["ResearchAgent", "output"]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.clone().oneshot(get("/api/workflow")).await.unwrap();
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["workflow_plan"], serde_json::json!(["research", "output"]));

        for steps in [serde_json::json!([]), serde_json::json!(["summarize"])] {
            let response = app
                .clone()
                .oneshot(post_json("/api/workflow", serde_json::json!({"steps": steps})))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn test_graph_round_trip() {
        let (app, _) = test_app();
        let response = app.clone().oneshot(get("/api/workflow/graph")).await.unwrap();
        let graph: GraphBlueprint = body_json(response.into_body()).await;
        assert_eq!(graph.nodes.len(), 5);

        let custom = serde_json::json!({
            "nodes": [{"id": "research", "type": "tool", "x": 10.0, "y": 20.0}],
            "edges": []
        });
        let response = app
            .clone()
            .oneshot(post_json("/api/workflow/graph", custom))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(get("/api/workflow/graph")).await.unwrap();
        let graph: GraphBlueprint = body_json(response.into_body()).await;
        assert_eq!(graph.nodes.len(), 1);
        assert_eq!(graph.nodes[0].node_type.as_deref(), Some("tool"));
    }

    #[tokio::test]
    async fn test_stage_settings_are_masked() {
        let (app, state) = test_app();
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/stages/settings",
                serde_json::json!({
                    "research": {"api_base": "https://llm.example.com/v1", "api_key": "sk-live"},
                    "summarize": {"api_key": "ignored"}
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["research"]["api_key"], crate::config::MASK);
        assert!(body.get("summarize").is_none());

        let response = app.oneshot(get("/api/stages/settings")).await.unwrap();
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["research"]["api_key"], crate::config::MASK);
        assert!(body["intake"]["prompt"].as_str().is_some());
        assert_eq!(
            state.settings.get("research").unwrap().api_key.as_deref(),
            Some("sk-live")
        );
    }
}
