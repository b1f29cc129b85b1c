/**
 * API REST WARDEN - Serveur HTTP principal du kernel
 *
 * RÔLE :
 * Exposer le parc d'hôtes aux opérateurs et au panel : exécution de
 * commandes (bufferisée ou en flux SSE), santé et remédiation, installation
 * des agents, inventaire des services, télémétrie. Sert aussi les routes
 * destinées aux agents eux-mêmes (canal WebSocket, script d'installation).
 *
 * FONCTIONNEMENT :
 * - Serveur Axum avec middleware clé API (`x-api-key`)
 * - Routes : /health, /system, /hosts, /services, /metrics, /agent
 * - Erreurs d'exécution → code HTTP + corps JSON `{error, kind, ...}`
 * - Flux SSE : la fermeture de la connexion cliente annule le travail distant
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sauf /health et les routes /agent/…
 * - Les routes /agent/… s'authentifient par token agent
 * - Clé absente de la configuration : tout accès API refusé
 */

use crate::agents::ConnectionRegistry;
use crate::channel::serve_agent_socket;
use crate::config::KernelConfig;
use crate::dispatch::Dispatcher;
use crate::errors::{ExecError, StoreError};
use crate::health::{HealthMonitor, HostHealth, KernelHealth};
use crate::installer::render_install_script;
use crate::models::{is_valid_host_id, AgentStatus, ExecOutput, MetricSample};
use crate::services::{HostServices, ServiceDirectory};
use crate::store::{SeriesQuery, Store};
use crate::transport::{ChannelSink, StreamEvent};
use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub health: HealthMonitor,
    pub services: Arc<ServiceDirectory>,
    pub config: Arc<KernelConfig>,
    pub api_key: Option<String>,
}

/// Erreur HTTP : échec d'exécution ou requête refusée
#[derive(Debug)]
pub enum ApiError {
    Exec(ExecError),
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unauthorized,
}

impl From<ExecError> for ApiError {
    fn from(e: ExecError) -> Self {
        ApiError::Exec(e)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Exec(ExecError::Store(e))
    }
}

fn exec_status(e: &ExecError) -> StatusCode {
    match e {
        ExecError::UnknownHost(_) => StatusCode::NOT_FOUND,
        ExecError::Timeout { .. } | ExecError::Deadline { .. } => StatusCode::GATEWAY_TIMEOUT,
        ExecError::Transport { .. } | ExecError::Parse { .. } => StatusCode::BAD_GATEWAY,
        ExecError::RemediationExhausted { .. } => StatusCode::CONFLICT,
        ExecError::Cancelled { .. } | ExecError::Store(_) | ExecError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Exec(e) => {
                let mut body = json!({ "error": e.to_string(), "kind": e.kind() });
                if let Some(transport) = e.transport() {
                    body["transport"] = json!(transport);
                }
                if let Some((stdout, stderr)) = e.captured_output() {
                    body["stdout"] = json!(stdout);
                    body["stderr"] = json!(stderr);
                }
                (exec_status(&e), body)
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg, "kind": "bad_request" })),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg, "kind": "not_found" })),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, json!({ "error": msg, "kind": "conflict" })),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, json!({ "error": "unauthorized", "kind": "unauthorized" })),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let path = req.uri().path();

    // Santé et routes agents : hors clé API
    if path == "/health" || path.starts_with("/agent/") {
        return Ok(next.run(req).await);
    }

    let Some(expected) = app.api_key.as_deref().filter(|k| !k.is_empty()) else {
        warn!("SECURITY: WARDEN_API_KEY not set - API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);

    if !ok {
        warn!(path = %path, "rejected request with missing or wrong api key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/hosts", get(list_hosts).post(add_host))
        .route("/hosts/{host}", axum::routing::delete(remove_host))
        .route("/hosts/{host}/exec", post(exec))
        .route("/hosts/{host}/exec/stream", get(exec_stream))
        .route("/hosts/{host}/health", get(host_health))
        .route("/hosts/{host}/health/reset", post(reset_health))
        .route("/hosts/{host}/remediate", post(remediate))
        .route("/hosts/{host}/agent", post(install_agent).delete(uninstall_agent))
        .route("/hosts/{host}/agent/token", post(regenerate_token))
        .route("/hosts/{host}/metrics", get(host_metrics))
        .route("/services", get(list_services))
        .route("/metrics", post(ingest_metrics))
        .route("/agent/ws", get(agent_socket))
        .route("/agent/install.sh", get(install_script))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

async fn ensure_host(app: &AppState, host: &str) -> ApiResult<()> {
    if app.store.host_exists(host).await? {
        Ok(())
    } else {
        Err(ExecError::UnknownHost(host.to_string()).into())
    }
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    let hosts = app.store.list_hosts().await.map(|h| h.len()).unwrap_or(0);
    Json(app.health.kernel_health(hosts))
}

#[derive(Serialize)]
struct HostView {
    host: String,
    live: bool,
    agent_status: Option<AgentStatus>,
    agent_version: Option<String>,
    last_ping: Option<i64>,
}

// GET /hosts
async fn list_hosts(State(app): State<AppState>) -> ApiResult<Json<Vec<HostView>>> {
    let mut views = Vec::new();
    for host in app.store.list_hosts().await? {
        let record = app.registry.connection(&host).await?;
        views.push(HostView {
            live: app.registry.is_live(&host),
            agent_status: record.as_ref().map(|r| r.status),
            agent_version: record.as_ref().and_then(|r| r.version.clone()),
            last_ping: record.as_ref().and_then(|r| r.last_ping),
            host,
        });
    }
    Ok(Json(views))
}

#[derive(Deserialize)]
struct NewHost {
    host: String,
}

// POST /hosts
async fn add_host(State(app): State<AppState>, Json(body): Json<NewHost>) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let host = body.host.trim();
    if !is_valid_host_id(host) {
        return Err(ApiError::BadRequest(format!("invalid host identifier: {:?}", body.host)));
    }
    if !app.store.add_host(host).await? {
        return Err(ApiError::Conflict(format!("host {host} already registered")));
    }
    info!(host = %host, "host registered");
    Ok((StatusCode::CREATED, Json(json!({ "host": host }))))
}

// DELETE /hosts/{host}
async fn remove_host(State(app): State<AppState>, Path(host): Path<String>) -> ApiResult<StatusCode> {
    if !app.store.remove_host(&host).await? {
        return Err(ApiError::NotFound(format!("host {host} not registered")));
    }
    app.registry.forget(&host);
    app.health.reset(&host);
    app.services.forget(&host);
    info!(host = %host, "host removed");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ExecBody {
    command: String,
    timeout_ms: Option<u64>,
}

// POST /hosts/{host}/exec
async fn exec(
    State(app): State<AppState>,
    Path(host): Path<String>,
    Json(body): Json<ExecBody>,
) -> ApiResult<Json<ExecOutput>> {
    if body.command.trim().is_empty() {
        return Err(ApiError::BadRequest("empty command".into()));
    }
    let timeout = body.timeout_ms.map(Duration::from_millis);
    Ok(Json(app.dispatcher.execute(&host, &body.command, timeout).await?))
}

#[derive(Deserialize)]
struct StreamParams {
    command: String,
}

fn sse_event(event: &StreamEvent) -> Option<Event> {
    let name = match event {
        StreamEvent::Chunk { .. } => "chunk",
        StreamEvent::Done { .. } => "done",
        StreamEvent::Error { .. } => "error",
    };
    Event::default().event(name).json_data(event).ok()
}

// GET /hosts/{host}/exec/stream?command=...
async fn exec_stream(
    State(app): State<AppState>,
    Path(host): Path<String>,
    Query(params): Query<StreamParams>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    ensure_host(&app, &host).await?;

    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    let dispatcher = app.dispatcher.clone();
    tokio::spawn(async move {
        let mut sink = ChannelSink::new(tx);
        let _ = dispatcher.stream_execute(&host, &params.command, &mut sink, cancel).await;
    });

    // le guard vit avec le flux : client parti → annulation
    let events = stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let event = rx.recv().await?;
        let sse = sse_event(&event)?;
        Some((Ok::<_, Infallible>(sse), (rx, guard)))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

// GET /hosts/{host}/health
async fn host_health(State(app): State<AppState>, Path(host): Path<String>) -> ApiResult<Json<HostHealth>> {
    ensure_host(&app, &host).await?;
    Ok(Json(app.health.check_health(&host)))
}

// POST /hosts/{host}/health/reset
async fn reset_health(State(app): State<AppState>, Path(host): Path<String>) -> ApiResult<Json<serde_json::Value>> {
    ensure_host(&app, &host).await?;
    let reset = app.health.reset(&host);
    Ok(Json(json!({ "host": host, "reset": reset })))
}

// POST /hosts/{host}/remediate
async fn remediate(State(app): State<AppState>, Path(host): Path<String>) -> ApiResult<Json<HostHealth>> {
    ensure_host(&app, &host).await?;
    Ok(Json(app.health.remediate_now(&host)?))
}

#[derive(Deserialize, Default)]
struct InstallBody {
    panel_address: Option<String>,
}

// POST /hosts/{host}/agent
async fn install_agent(State(app): State<AppState>, Path(host): Path<String>, body: Bytes) -> ApiResult<impl IntoResponse> {
    let body: InstallBody = if body.is_empty() {
        InstallBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(format!("invalid body: {e}")))?
    };
    let outcome = app.registry.install_on(&host, body.panel_address.as_deref()).await?;
    let status = if outcome.success { StatusCode::OK } else { StatusCode::BAD_GATEWAY };
    Ok((status, Json(outcome)))
}

// DELETE /hosts/{host}/agent
async fn uninstall_agent(State(app): State<AppState>, Path(host): Path<String>) -> ApiResult<impl IntoResponse> {
    ensure_host(&app, &host).await?;
    let outcome = app.registry.uninstall_from(&host).await?;
    if outcome.success {
        app.health.reset(&host);
    }
    let status = if outcome.success { StatusCode::OK } else { StatusCode::BAD_GATEWAY };
    Ok((status, Json(outcome)))
}

// POST /hosts/{host}/agent/token
async fn regenerate_token(State(app): State<AppState>, Path(host): Path<String>) -> ApiResult<Json<serde_json::Value>> {
    let token = app.registry.regenerate_token(&host).await?;
    Ok(Json(json!({ "host": host, "token": token })))
}

// GET /services
async fn list_services(State(app): State<AppState>) -> ApiResult<Json<Vec<HostServices>>> {
    Ok(Json(app.services.list_all().await?))
}

// POST /metrics
async fn ingest_metrics(State(app): State<AppState>, Json(samples): Json<Vec<MetricSample>>) -> ApiResult<Json<serde_json::Value>> {
    let inserted = app.store.insert_samples(samples).await?;
    Ok(Json(json!({ "inserted": inserted })))
}

#[derive(Deserialize)]
struct MetricsParams {
    application: String,
    service: String,
    from: Option<i64>,
    to: Option<i64>,
}

// GET /hosts/{host}/metrics
async fn host_metrics(
    State(app): State<AppState>,
    Path(host): Path<String>,
    Query(params): Query<MetricsParams>,
) -> ApiResult<Json<Vec<MetricSample>>> {
    ensure_host(&app, &host).await?;
    let query = SeriesQuery::new(&host, &params.application, &params.service);
    let rows = app
        .store
        .samples_in_range(query, params.from.unwrap_or(0), params.to.unwrap_or(i64::MAX))
        .await?;
    Ok(Json(rows))
}

#[derive(Deserialize)]
struct TokenParams {
    token: String,
}

// GET /agent/ws?token=...
async fn agent_socket(
    State(app): State<AppState>,
    Query(params): Query<TokenParams>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let Some(host) = app.registry.authenticate(&params.token).await? else {
        warn!("agent connection with unknown token rejected");
        return Err(ApiError::Unauthorized);
    };
    let registry = app.registry.clone();
    let hello_timeout = Duration::from_secs(app.config.exec.hello_timeout_secs);
    Ok(ws.on_upgrade(move |socket| serve_agent_socket(socket, registry, host, hello_timeout)))
}

// GET /agent/install.sh?token=...
async fn install_script(State(app): State<AppState>, Query(params): Query<TokenParams>) -> ApiResult<Response> {
    let Some(host) = app.registry.authenticate(&params.token).await? else {
        return Err(ApiError::NotFound("unknown agent token".into()));
    };
    let script = render_install_script(&host, &params.token, &app.config.agent_channel_url(), &app.config.agent_binary_url)
        .map_err(|e| ExecError::Internal(format!("install config: {e}")))?;
    Ok(([(header::CONTENT_TYPE, "text/x-shellscript")], script).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CachePolicy, ResultCache};
    use crate::health::HealthPolicy;
    use crate::test_support::{registry_with, FakeRemediator, FakeTransport};
    use crate::transport::AgentTransport;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const KEY: &str = "test-key";

    async fn app(shell: FakeTransport) -> (Router, AppState) {
        app_with(Arc::new(shell)).await
    }

    async fn app_with(shell: Arc<FakeTransport>) -> (Router, AppState) {
        let (registry, store) = registry_with(shell.clone(), &["h1"]).await;
        let agent = Arc::new(AgentTransport::new(registry.clone()));
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), registry.clone(), agent, shell.clone(), Duration::from_secs(30)));
        let cache = ResultCache::new(CachePolicy {
            fresh_ttl: Duration::from_secs(30),
            stale_ttl: Duration::from_secs(3600),
            deadline: Duration::from_secs(4),
        });
        let services = Arc::new(ServiceDirectory::new(store.clone(), dispatcher.clone(), cache, "list-units"));
        let health = HealthMonitor::new(
            registry.clone(),
            Arc::new(FakeRemediator::failing()),
            HealthPolicy { offline_threshold: Duration::from_secs(30), retry_delay: Duration::from_secs(30), max_attempts: 3 },
        );
        let state = AppState {
            store,
            registry,
            dispatcher,
            health,
            services,
            config: Arc::new(KernelConfig::default()),
            api_key: Some(KEY.into()),
        };
        (build_router(state.clone()), state)
    }

    fn request(method: &str, uri: &str, body: Option<serde_json::Value>) -> HttpRequest<Body> {
        let builder = HttpRequest::builder().method(method).uri(uri).header("x-api-key", KEY);
        match body {
            Some(b) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_api_key_required_except_health() {
        let (router, _) = app(FakeTransport::ssh()).await;
        let resp = router
            .clone()
            .oneshot(HttpRequest::builder().uri("/hosts").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = router
            .oneshot(HttpRequest::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_exec_over_shell() {
        let (router, _) = app(FakeTransport::ssh().printing("up 3 days")).await;
        let resp = router.oneshot(request("POST", "/hosts/h1/exec", Some(json!({ "command": "uptime" })))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["stdout"], "up 3 days");
        assert_eq!(body["transport"], "ssh");
    }

    #[tokio::test]
    async fn test_exec_errors_map_to_status() {
        let (router, _) = app(FakeTransport::ssh().exiting(2, "no such unit")).await;
        let resp = router
            .clone()
            .oneshot(request("POST", "/hosts/ghost/exec", Some(json!({ "command": "uptime" }))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(resp).await["kind"], "unknown_host");

        let resp = router.oneshot(request("POST", "/hosts/h1/exec", Some(json!({ "command": "x" })))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body = json_body(resp).await;
        assert_eq!(body["kind"], "transport_failure");
        assert_eq!(body["stderr"], "no such unit");
    }

    #[tokio::test]
    async fn test_host_lifecycle() {
        let (router, _) = app(FakeTransport::ssh()).await;
        let resp = router.clone().oneshot(request("POST", "/hosts", Some(json!({ "host": "h2" })))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let resp = router.clone().oneshot(request("POST", "/hosts", Some(json!({ "host": "h2" })))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = router.clone().oneshot(request("GET", "/hosts", None)).await.unwrap();
        let body = json_body(resp).await;
        assert_eq!(body.as_array().map(Vec::len), Some(2));
        assert_eq!(body[0]["live"], false);

        let resp = router.clone().oneshot(request("DELETE", "/hosts/h2", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let resp = router.oneshot(request("DELETE", "/hosts/h2", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_add_host_rejects_shell_metacharacters() {
        let (router, state) = app(FakeTransport::ssh()).await;
        for host in ["h$(touch /tmp/x)", "h\"; reboot", "-oProxyCommand=sh", "h`id`"] {
            let resp = router.clone().oneshot(request("POST", "/hosts", Some(json!({ "host": host })))).await.unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{host}");
        }
        assert_eq!(state.store.list_hosts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_install_then_script_served_by_token() {
        let (router, state) = app(FakeTransport::ssh()).await;
        let resp = router.clone().oneshot(request("POST", "/hosts/h1/agent", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["success"], true);

        let token = state.registry.upsert_token("h1", None).await.unwrap();
        let resp = router
            .clone()
            .oneshot(HttpRequest::builder().uri(format!("/agent/install.sh?token={token}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&bytes).contains("host = \"h1\""));

        let resp = router
            .oneshot(HttpRequest::builder().uri("/agent/install.sh?token=nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_and_manual_remediation() {
        let (router, _) = app(FakeTransport::ssh()).await;
        let resp = router.clone().oneshot(request("GET", "/hosts/h1/health", None)).await.unwrap();
        let body = json_body(resp).await;
        assert_eq!(body["connected"], false);
        assert_eq!(body["attempts"], 0);
        assert_eq!(body["max_attempts"], 3);

        let resp = router.clone().oneshot(request("POST", "/hosts/h1/remediate", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["attempts"], 1);

        let resp = router.oneshot(request("GET", "/hosts/ghost/health", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_ingest_and_range() {
        let (router, _) = app(FakeTransport::ssh()).await;
        let samples = json!([
            { "host": "h1", "application": "rust", "service": "s1", "timestamp": 100, "cpu_usage": 12.5,
              "memory_usage": null, "player_count": 4, "response_time": null, "status": 1 },
            { "host": "h1", "application": "rust", "service": "s1", "timestamp": 200, "cpu_usage": 20.0,
              "memory_usage": null, "player_count": 5, "response_time": null, "status": 1 }
        ]);
        let resp = router.clone().oneshot(request("POST", "/metrics", Some(samples))).await.unwrap();
        assert_eq!(json_body(resp).await["inserted"], 2);

        let resp = router
            .oneshot(request("GET", "/hosts/h1/metrics?application=rust&service=s1&from=150", None))
            .await
            .unwrap();
        let body = json_body(resp).await;
        assert_eq!(body.as_array().map(Vec::len), Some(1));
        assert_eq!(body[0]["player_count"], 5);
    }

    #[tokio::test]
    async fn test_stream_emits_sse_events() {
        let (router, _) = app(FakeTransport::ssh().printing("hello\n")).await;
        let resp = router.oneshot(request("GET", "/hosts/h1/exec/stream?command=echo%20hello", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("event: chunk"));
        assert!(text.contains("event: done"));
        assert!(text.contains("\"exit_code\":0"));
    }

    #[tokio::test]
    async fn test_dropping_stream_body_cancels_command() {
        let shell = Arc::new(FakeTransport::ssh().holding_stream());
        let (router, _) = app_with(shell.clone()).await;

        let resp = router.oneshot(request("GET", "/hosts/h1/exec/stream?command=tail%20-f%20log", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let mut body = resp.into_body();
        let frame = body.frame().await.unwrap().unwrap();
        let first = String::from_utf8_lossy(frame.data_ref().unwrap()).to_string();
        assert!(first.contains("first line"));
        assert!(!shell.saw_cancel());

        drop(body);
        for _ in 0..50 {
            if shell.saw_cancel() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(shell.saw_cancel());
    }
}
