//! `HeraldServer`: Axum HTTP + WebSocket gateway in front of the hub.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use herald_core::{PrincipalId, ProjectId, RegistrationError, Scope, ScopeBinding};
use herald_settings::ServerSettings;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::health::{self, HealthResponse};
use crate::hub::{Hub, HubStats};
use crate::metrics::WS_REGISTRATION_REJECTS_TOTAL;
use crate::websocket::connection::ClientConnection;
use crate::websocket::session::run_ws_session;

/// Header carrying the authenticated principal.
pub const PRINCIPAL_HEADER: &str = "x-principal-id";

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The hub.
    pub hub: Arc<Hub>,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// Max inbound WebSocket message size.
    pub max_message_size: usize,
    /// When the server started.
    pub start_time: Instant,
}

/// The Herald server.
pub struct HeraldServer {
    hub: Arc<Hub>,
    settings: ServerSettings,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl HeraldServer {
    /// Create a new server around a hub.
    pub fn new(hub: Arc<Hub>, settings: ServerSettings) -> Self {
        Self {
            hub,
            settings,
            metrics: None,
            start_time: Instant::now(),
        }
    }

    /// Serve `/metrics` from this handle.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            hub: self.hub.clone(),
            metrics: self.metrics.clone(),
            max_message_size: self.settings.max_message_size,
            start_time: self.start_time,
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/stats", get(stats_handler))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Bind and serve until the hub shuts down. Returns the bound address and
    /// the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener =
            TcpListener::bind((self.settings.host.as_str(), self.settings.port)).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "herald listening");

        let app = self.router();
        let stop = self.hub.shutdown_token();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(stop.cancelled_owned())
                .await;
            if let Err(e) = served {
                warn!(error = %e, "http server exited with error");
            }
        });
        Ok((addr, handle))
    }

    /// The hub.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Listener settings.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }
}

/// Query parameters of `GET /ws`.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Fallback principal for trusted internal callers.
    pub principal_id: Option<String>,
    /// `user` (default), `project` or `dashboard`.
    pub scope: Option<String>,
    /// Required for project scope.
    pub project_id: Option<String>,
}

/// Stable code for a registration error.
fn error_code(err: &RegistrationError) -> &'static str {
    match err {
        RegistrationError::MissingPrincipal => "missing_principal",
        RegistrationError::MissingProject => "missing_project",
        RegistrationError::UnexpectedProject(_) => "unexpected_project",
        RegistrationError::InvalidScope(_) => "invalid_scope",
        RegistrationError::AlreadyRegistered(_) => "already_registered",
        RegistrationError::TooManyConnections { .. } => "too_many_connections",
        RegistrationError::ShuttingDown => "shutting_down",
    }
}

fn reject(err: &RegistrationError) -> Response {
    let code = error_code(err);
    counter!(WS_REGISTRATION_REJECTS_TOTAL, "reason" => code).increment(1);
    let status = match err {
        RegistrationError::TooManyConnections { .. } => StatusCode::TOO_MANY_REQUESTS,
        RegistrationError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_REQUEST,
    };
    info!(reason = code, error = %err, "websocket registration rejected");
    (status, Json(json!({ "error": code, "message": err.to_string() }))).into_response()
}

/// Resolve principal and scope binding from headers and query.
fn resolve(
    headers: &HeaderMap,
    params: ConnectParams,
) -> Result<(PrincipalId, Scope, Option<ProjectId>), RegistrationError> {
    let principal = headers
        .get(PRINCIPAL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or(params.principal_id)
        .map(PrincipalId::from_string)
        .filter(|p| !p.is_blank())
        .ok_or(RegistrationError::MissingPrincipal)?;
    let scope = match params.scope.as_deref() {
        Some(s) if !s.trim().is_empty() => s.parse()?,
        _ => Scope::User,
    };
    let project = params
        .project_id
        .filter(|p| !p.trim().is_empty())
        .map(ProjectId::from_string);
    let _ = ScopeBinding::from_parts(scope, project.clone())?;
    Ok((principal, scope, project))
}

/// GET /ws
///
/// Registration happens before the upgrade so a bad request gets a plain
/// HTTP error instead of an accepted-then-closed socket.
async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ConnectParams>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if state.hub.is_shutting_down() {
        return reject(&RegistrationError::ShuttingDown);
    }
    let (principal, scope, project) = match resolve(&headers, params) {
        Ok(parts) => parts,
        Err(e) => return reject(&e),
    };
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let (tx, rx) = mpsc::channel(state.hub.config().outbound_buffer_size);
    let connection = Arc::new(ClientConnection::new(tx));
    let registry = state.hub.registry().clone();
    let id = match registry.register(connection.clone(), scope, principal, project) {
        Ok(id) => id,
        Err(e) => return reject(&e),
    };

    let failed_registry = registry.clone();
    upgrade
        .max_message_size(state.max_message_size)
        .on_failed_upgrade(move |e| {
            warn!(conn_id = %id, error = %e, "websocket upgrade failed");
            let _ = failed_registry.unregister(&id);
        })
        .on_upgrade(move |socket| run_ws_session(socket, connection, rx, registry))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.hub.registry().len(),
        state.hub.is_shutting_down(),
    ))
}

/// GET /stats
async fn stats_handler(State(state): State<AppState>) -> Json<HubStats> {
    Json(state.hub.stats())
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            crate::metrics::render(handle),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::LocalBridge;
    use crate::config::HubConfig;
    use axum::body::Body;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    fn make_server() -> HeraldServer {
        let hub = Arc::new(Hub::new(HubConfig::default(), Arc::new(LocalBridge)));
        HeraldServer::new(
            hub,
            ServerSettings {
                port: 0,
                ..ServerSettings::default()
            },
        )
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 10_000)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap_or_default())
    }

    // ─── Resolve ───

    #[test]
    fn header_wins_over_query() {
        let mut headers = HeaderMap::new();
        let _ = headers.insert(PRINCIPAL_HEADER, "7".parse().unwrap());
        let params = ConnectParams {
            principal_id: Some("9".into()),
            ..ConnectParams::default()
        };
        let (principal, scope, project) = resolve(&headers, params).unwrap();
        assert_eq!(principal.as_str(), "7");
        assert_eq!(scope, Scope::User);
        assert!(project.is_none());
    }

    #[test]
    fn query_principal_is_fallback() {
        let params = ConnectParams {
            principal_id: Some("9".into()),
            scope: Some("project".into()),
            project_id: Some("p1".into()),
        };
        let (principal, scope, project) = resolve(&HeaderMap::new(), params).unwrap();
        assert_eq!(principal.as_str(), "9");
        assert_eq!(scope, Scope::Project);
        assert_eq!(project.unwrap().as_str(), "p1");
    }

    #[test]
    fn resolve_errors() {
        assert_eq!(
            resolve(&HeaderMap::new(), ConnectParams::default()).unwrap_err(),
            RegistrationError::MissingPrincipal
        );
        let params = |scope: &str, project: Option<&str>| ConnectParams {
            principal_id: Some("3".into()),
            scope: Some(scope.into()),
            project_id: project.map(Into::into),
        };
        assert_eq!(
            resolve(&HeaderMap::new(), params("project", None)).unwrap_err(),
            RegistrationError::MissingProject
        );
        assert_eq!(
            resolve(&HeaderMap::new(), params("dashboard", Some("p"))).unwrap_err(),
            RegistrationError::UnexpectedProject(Scope::Dashboard)
        );
        assert_eq!(
            resolve(&HeaderMap::new(), params("team", None)).unwrap_err(),
            RegistrationError::InvalidScope("team".into())
        );
    }

    #[test]
    fn too_many_connections_is_429() {
        let err = RegistrationError::TooManyConnections {
            principal_id: "3".into(),
            limit: 1,
        };
        assert_eq!(reject(&err).status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            reject(&RegistrationError::MissingProject).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn shutting_down_is_503() {
        let err = RegistrationError::ShuttingDown;
        assert_eq!(error_code(&err), "shutting_down");
        assert_eq!(reject(&err).status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    // ─── Routes ───

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let (status, body) = get_json(make_server().router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert!(body["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn health_reports_draining_after_shutdown() {
        let server = make_server();
        server.hub().shutdown().await;
        let (_, body) = get_json(server.router(), "/health").await;
        assert_eq!(body["status"], "draining");
    }

    #[tokio::test]
    async fn stats_endpoint_reports_counts() {
        let (status, body) = get_json(make_server().router(), "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["connections"]["total"], 0);
        assert_eq!(body["queue_capacity"], 1000);
        assert_eq!(body["bridge"], "local");
    }

    #[tokio::test]
    async fn ws_missing_project_is_400() {
        let (status, body) = get_json(
            make_server().router(),
            "/ws?principal_id=3&scope=project",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "missing_project");
    }

    #[tokio::test]
    async fn ws_missing_principal_is_400() {
        let (status, body) = get_json(make_server().router(), "/ws?scope=dashboard").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "missing_principal");
    }

    #[tokio::test]
    async fn ws_without_upgrade_headers_is_rejected() {
        let server = make_server();
        let req = Request::builder()
            .uri("/ws?principal_id=3")
            .body(Body::empty())
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
        assert!(server.hub().registry().is_empty());
    }

    #[tokio::test]
    async fn ws_refused_while_shutting_down() {
        let server = make_server();
        server.hub().shutdown().await;
        let (status, body) = get_json(server.router(), "/ws?principal_id=3").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "shutting_down");
    }

    #[tokio::test]
    async fn metrics_absent_without_recorder() {
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = make_server().router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_served_with_handle() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let app = make_server().with_metrics(handle).router();
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(
            resp.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/plain")
        );
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let req = Request::builder().uri("/nonexistent").body(Body::empty()).unwrap();
        let resp = make_server().router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listen_binds_ephemeral_port() {
        let server = make_server();
        let (addr, handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        server.hub().shutdown().await;
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
