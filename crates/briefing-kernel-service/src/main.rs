use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use briefing_kernel_api::scheduler::start_scheduler;
use briefing_kernel_api::{
    AnnealingReport, Briefing, BriefingConfig, BriefingError, BriefingKernelApi,
    CreateHandoffRequest, DisabledSummarizer, HttpSummarizer, LogInteractionRequest,
    MigrateResult, RefreshResult, ResolveRequest, ResolveResult, Summarizer,
    API_CONTRACT_VERSION,
};
use briefing_kernel_core::{
    Contact, ContactId, ContactUpdate, ErrorId, ErrorPattern, ErrorSummary, Handoff, HandoffId,
    HandoffStatus, Interaction, NewContact, NewErrorRecord,
};
use briefing_kernel_store_sqlite::SchemaStatus;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const DEFAULT_WINDOW_HOURS: u32 = 24;

#[derive(Debug, Clone)]
struct ServiceState {
    api: BriefingKernelApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct ContextQuery {
    level: Option<u8>,
    refresh: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
struct WindowQuery {
    window_hours: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct HandoffStatusRequest {
    status: HandoffStatus,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct ReportedError {
    error_id: ErrorId,
}

#[derive(Debug, Parser)]
#[command(name = "briefing-kernel-service")]
#[command(about = "Local HTTP service for the contact briefing kernel")]
struct Args {
    #[arg(long, default_value = "./briefing_kernel.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Optional YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Knowledge document path; overrides the configuration file.
    #[arg(long)]
    knowledge: Option<PathBuf>,
    #[arg(long)]
    debug: bool,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<BriefingError> for ServiceError {
    fn from(err: BriefingError) -> Self {
        let status = match &err {
            BriefingError::NotFound { .. } => StatusCode::NOT_FOUND,
            BriefingError::Summarizer { .. } => StatusCode::BAD_GATEWAY,
            BriefingError::BudgetExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            BriefingError::Validation(_) => StatusCode::BAD_REQUEST,
            BriefingError::Aborted(_) | BriefingError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn parse_contact_id(raw: &str) -> Result<ContactId, ServiceError> {
    ContactId::parse(raw).map_err(|err| ServiceError::bad_request(err.to_string()))
}

fn parse_handoff_id(raw: &str) -> Result<HandoffId, ServiceError> {
    HandoffId::parse(raw).map_err(|err| ServiceError::bad_request(err.to_string()))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/contacts", post(contact_upsert))
        .route("/v1/contacts/:contact_id", get(contact_show).patch(contact_update))
        .route("/v1/contacts/:contact_id/interactions", post(interaction_log))
        .route("/v1/contacts/:contact_id/context", get(context_show))
        .route("/v1/contacts/:contact_id/context/refresh", post(context_refresh))
        .route("/v1/handoffs", post(handoff_create))
        .route("/v1/handoffs/:handoff_id/status", post(handoff_status))
        .route("/v1/errors", post(errors_report))
        .route("/v1/errors/summary", get(errors_summary))
        .route("/v1/errors/patterns", get(errors_patterns))
        .route("/v1/errors/resolve", post(errors_resolve))
        .route("/v1/anneal/run", post(anneal_run))
        .with_state(state)
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).compact().try_init();
}

fn build_summarizer(config: &BriefingConfig) -> Result<Arc<dyn Summarizer>> {
    match HttpSummarizer::from_env(config.summarizer.clone())? {
        Some(summarizer) => Ok(Arc::new(summarizer)),
        None => {
            tracing::warn!("no summarizer API key configured; regeneration requests will fail");
            Ok(Arc::new(DisabledSummarizer))
        }
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(%error, "failed to listen for shutdown signal");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let mut config = BriefingConfig::load(args.config.as_deref())?;
    if let Some(knowledge) = args.knowledge {
        config.knowledge.path = knowledge;
    }
    let summarizer = build_summarizer(&config)?;
    let api = BriefingKernelApi::new(args.db, config, summarizer);
    api.migrate(false)?;

    let scheduler = start_scheduler(&api);
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "briefing kernel service listening");
    axum::serve(listener, app(ServiceState { api }))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown().await;
    tracing::info!("briefing kernel service stopped");
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| ServiceError::bad_request(err.to_string()))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result =
        state.api.migrate(request.dry_run).map_err(|err| ServiceError::bad_request(err.to_string()))?;
    Ok(Json(envelope(result)))
}

async fn contact_upsert(
    State(state): State<ServiceState>,
    Json(request): Json<NewContact>,
) -> Result<Json<ServiceEnvelope<Contact>>, ServiceError> {
    let contact = state.api.upsert_contact(request).await?;
    Ok(Json(envelope(contact)))
}

async fn contact_show(
    State(state): State<ServiceState>,
    Path(contact_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Contact>>, ServiceError> {
    let contact = state.api.get_contact(parse_contact_id(&contact_id)?).await?;
    Ok(Json(envelope(contact)))
}

async fn contact_update(
    State(state): State<ServiceState>,
    Path(contact_id): Path<String>,
    Json(update): Json<ContactUpdate>,
) -> Result<Json<ServiceEnvelope<Contact>>, ServiceError> {
    let contact = state.api.update_contact(parse_contact_id(&contact_id)?, update).await?;
    Ok(Json(envelope(contact)))
}

async fn interaction_log(
    State(state): State<ServiceState>,
    Path(contact_id): Path<String>,
    Json(request): Json<LogInteractionRequest>,
) -> Result<Json<ServiceEnvelope<Interaction>>, ServiceError> {
    let interaction = state.api.log_interaction(parse_contact_id(&contact_id)?, request).await?;
    Ok(Json(envelope(interaction)))
}

async fn context_show(
    State(state): State<ServiceState>,
    Path(contact_id): Path<String>,
    Query(query): Query<ContextQuery>,
) -> Result<Json<ServiceEnvelope<Briefing>>, ServiceError> {
    let briefing = state
        .api
        .get_context(
            parse_contact_id(&contact_id)?,
            query.level.unwrap_or(1),
            query.refresh.unwrap_or(false),
        )
        .await?;
    Ok(Json(envelope(briefing)))
}

async fn context_refresh(
    State(state): State<ServiceState>,
    Path(contact_id): Path<String>,
) -> Result<Json<ServiceEnvelope<RefreshResult>>, ServiceError> {
    let result = state.api.refresh_context(parse_contact_id(&contact_id)?).await?;
    Ok(Json(envelope(result)))
}

async fn handoff_create(
    State(state): State<ServiceState>,
    Json(request): Json<CreateHandoffRequest>,
) -> Result<Json<ServiceEnvelope<Handoff>>, ServiceError> {
    let handoff = state.api.create_handoff(request).await?;
    Ok(Json(envelope(handoff)))
}

async fn handoff_status(
    State(state): State<ServiceState>,
    Path(handoff_id): Path<String>,
    Json(request): Json<HandoffStatusRequest>,
) -> Result<Json<ServiceEnvelope<Handoff>>, ServiceError> {
    let handoff =
        state.api.update_handoff_status(parse_handoff_id(&handoff_id)?, request.status).await?;
    Ok(Json(envelope(handoff)))
}

async fn errors_report(
    State(state): State<ServiceState>,
    Json(entry): Json<NewErrorRecord>,
) -> Result<Json<ServiceEnvelope<ReportedError>>, ServiceError> {
    let error_id = state.api.report_error(entry).await?;
    Ok(Json(envelope(ReportedError { error_id })))
}

async fn errors_summary(
    State(state): State<ServiceState>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<ServiceEnvelope<ErrorSummary>>, ServiceError> {
    let summary =
        state.api.error_summary(query.window_hours.unwrap_or(DEFAULT_WINDOW_HOURS)).await?;
    Ok(Json(envelope(summary)))
}

async fn errors_patterns(
    State(state): State<ServiceState>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<ServiceEnvelope<Vec<ErrorPattern>>>, ServiceError> {
    let patterns =
        state.api.error_patterns(query.window_hours.unwrap_or(DEFAULT_WINDOW_HOURS)).await?;
    Ok(Json(envelope(patterns)))
}

async fn errors_resolve(
    State(state): State<ServiceState>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<ServiceEnvelope<ResolveResult>>, ServiceError> {
    let result = state.api.resolve_errors(request).await?;
    Ok(Json(envelope(result)))
}

async fn anneal_run(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<AnnealingReport>>, ServiceError> {
    let report = state.api.run_annealing_cycle().await?;
    Ok(Json(envelope(report)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use briefing_kernel_api::summarizer::SummarizerError;
    use briefing_kernel_api::testing::{test_api, ScriptedSummarizer};
    use http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn router(summarizer: ScriptedSummarizer) -> Router {
        let (api, _summarizer) = test_api(summarizer);
        app(ServiceState { api })
    }

    async fn response_json(response: Response) -> Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().uri(uri).method(method);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        let status = response.status();
        (status, response_json(response).await)
    }

    async fn create_contact(router: &Router) -> String {
        let (status, value) = send(
            router,
            "POST",
            "/v1/contacts",
            Some(json!({"email": "ana@example.com", "name": "Ana Silva", "company": "Fabrikam"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        match value["data"]["contact_id"].as_str() {
            Some(id) => id.to_string(),
            None => panic!("contact_id missing from response: {value}"),
        }
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = router(ScriptedSummarizer::default());
        let (status, value) = send(&router, "GET", "/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            value.get("service_contract_version").and_then(Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(value["data"]["status"], "ok");
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let router = router(ScriptedSummarizer::default());
        let response = match router
            .oneshot(
                Request::builder()
                    .uri("/v1/openapi")
                    .method("GET")
                    .body(Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = String::from_utf8_lossy(&bytes);
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("/v1/contacts/{contact_id}/context"));
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn logged_interaction_then_recent_briefing_is_fresh() {
        let router = router(ScriptedSummarizer::default());
        let contact_id = create_contact(&router).await;

        let (status, value) = send(
            &router,
            "POST",
            &format!("/v1/contacts/{contact_id}/interactions"),
            Some(json!({
                "channel": "email",
                "direction": "inbound",
                "raw_content": "Could you send over the renewal quote by Friday?"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(value["data"]["summary"].is_string());

        let (status, value) =
            send(&router, "GET", &format!("/v1/contacts/{contact_id}/context?level=2"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["api_contract_version"], API_CONTRACT_VERSION);
        assert_eq!(value["data"]["is_stale"], false);
        assert!(value["data"]["generated_at"].is_string());
        let recent = value["data"]["recent_interactions"].as_array().map_or(0, Vec::len);
        assert!((1..=10).contains(&recent));
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn unknown_and_malformed_ids_map_to_404_and_400() {
        let router = router(ScriptedSummarizer::default());
        let missing = ContactId::new();
        let (status, value) =
            send(&router, "GET", &format!("/v1/contacts/{missing}/context?level=1"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(value["service_contract_version"], SERVICE_CONTRACT_VERSION);
        assert!(value["error"].as_str().is_some_and(|error| error.contains("not found")));

        let (status, _value) = send(&router, "GET", "/v1/contacts/not-a-ulid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn summarizer_failure_maps_to_bad_gateway_and_is_journaled() {
        let summarizer = ScriptedSummarizer::default();
        summarizer.push_error(SummarizerError::RateLimited);
        let router = router(summarizer);
        let contact_id = create_contact(&router).await;

        let (status, _value) =
            send(&router, "POST", &format!("/v1/contacts/{contact_id}/context/refresh"), None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);

        let (status, value) = send(&router, "GET", "/v1/errors/patterns?window_hours=1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            value["data"][0]["pattern_id"],
            "external_dependency:regeneration_pipeline:generate_context"
        );
    }

    // Test IDs: TSVC-006
    #[tokio::test]
    async fn reported_errors_resolve_once() {
        let router = router(ScriptedSummarizer::default());
        for _ in 0..3 {
            let (status, value) = send(
                &router,
                "POST",
                "/v1/errors",
                Some(json!({
                    "error_type": "integration_gap",
                    "service": "crm_sync",
                    "operation": "push_contact",
                    "message": "unknown field `tier`"
                })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert!(value["data"]["error_id"].is_string());
        }

        let resolve = json!({
            "pattern_id": "integration_gap:crm_sync:push_contact",
            "resolution": "mapped tier to segment"
        });
        let (_, first) = send(&router, "POST", "/v1/errors/resolve", Some(resolve.clone())).await;
        assert_eq!(first["data"]["count_resolved"], 3);
        let (_, second) = send(&router, "POST", "/v1/errors/resolve", Some(resolve)).await;
        assert_eq!(second["data"]["count_resolved"], 0);

        let (_, summary) = send(&router, "GET", "/v1/errors/summary", None).await;
        assert_eq!(summary["data"]["total"], 3);
        assert_eq!(summary["data"]["unresolved"], 0);
    }

    // Test IDs: TSVC-007
    #[tokio::test]
    async fn anneal_run_reports_every_phase() {
        let router = router(ScriptedSummarizer::default());
        let (status, value) = send(&router, "POST", "/v1/anneal/run", None).await;
        assert_eq!(status, StatusCode::OK);
        let phases = value["data"]["phases"].as_array().map_or(0, Vec::len);
        assert_eq!(phases, 4);
    }

    // Test IDs: TSVC-008
    #[tokio::test]
    async fn handoff_create_and_accept() {
        let router = router(ScriptedSummarizer::default());
        let contact_id = create_contact(&router).await;

        let (status, value) = send(
            &router,
            "POST",
            "/v1/handoffs",
            Some(json!({
                "contact_id": contact_id,
                "from_agent": "sdr",
                "to_agent": "account_exec",
                "reason": "pricing question",
                "urgency": "critical"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["data"]["status"], "pending");
        let handoff_id = value["data"]["handoff_id"].as_str().unwrap_or_default().to_string();

        let (status, value) = send(
            &router,
            "POST",
            &format!("/v1/handoffs/{handoff_id}/status"),
            Some(json!({"status": "accepted"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["data"]["status"], "accepted");
    }

    // Test IDs: TSVC-009
    #[tokio::test]
    async fn out_of_range_error_windows_map_to_400() {
        let router = router(ScriptedSummarizer::default());
        for uri in [
            "/v1/errors/summary?window_hours=0",
            "/v1/errors/summary?window_hours=4294967295",
            "/v1/errors/patterns?window_hours=0",
            "/v1/errors/patterns?window_hours=4294967295",
        ] {
            let (status, value) = send(&router, "GET", uri, None).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}: {value}");
            assert!(
                value["error"].as_str().is_some_and(|error| error.contains("window_hours")),
                "{uri}: {value}"
            );
        }

        let (status, _value) =
            send(&router, "GET", "/v1/errors/summary?window_hours=8760", None).await;
        assert_eq!(status, StatusCode::OK);
    }
}
