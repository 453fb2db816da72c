//! Router assembly and startup.

use crate::auth::ResolvedAuth;
use crate::routes;
use crate::state::AppState;
use crate::ws::{handle_connection, WsProgressSink, WsQuery, WsRegistry};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use capstan_core::CoreConfig;
use capstan_driver::{DriverDeps, ProgressNotifier, WorkflowDriver};
use capstan_governance::{default_constitution, GovernanceRing, GuardrailConfig};
use capstan_kernel::StateKernel;
use capstan_runner::{default_registry, LlmClient, ScriptedLlmClient};
use capstan_store::{
    FsBlobStore, MemoryExecutionStore, MemoryGcQueue, MemoryIdempotencyStore, MemoryManifestStore,
    MemoryTokenStore,
};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

pub struct GatewaySettings {
    pub port: u16,
    pub bind: String,
    pub config: CoreConfig,
    pub data_dir: PathBuf,
    /// Overridable for tests and for wiring a real provider.
    pub llm: Option<Arc<dyn LlmClient>>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            port: 18990,
            bind: "0.0.0.0".to_string(),
            config: CoreConfig::default(),
            data_dir: PathBuf::from("./capstan-data"),
            llm: None,
        }
    }
}

pub fn build_state(settings: &GatewaySettings, auth: ResolvedAuth) -> Arc<AppState> {
    let blobs = Arc::new(FsBlobStore::new(settings.data_dir.join("blobs")));
    let manifests = Arc::new(MemoryManifestStore::new());
    let gc = Arc::new(MemoryGcQueue::default());
    let executions = Arc::new(MemoryExecutionStore::new());
    let idempotency = Arc::new(MemoryIdempotencyStore::new());
    let tokens = Arc::new(MemoryTokenStore::new());

    let kernel = Arc::new(StateKernel::new(
        blobs,
        manifests,
        gc,
        settings.config.clone(),
    ));
    let governance = Arc::new(GovernanceRing::new(
        GuardrailConfig::default(),
        default_constitution(),
    ));
    let llm = settings
        .llm
        .clone()
        .unwrap_or_else(|| Arc::new(ScriptedLlmClient::default()));

    let ws = Arc::new(WsRegistry::new());
    let notifier = Arc::new(ProgressNotifier::new(
        Box::new(WsProgressSink(ws.clone())),
        std::time::Duration::from_secs(2),
    ));

    let driver = Arc::new(WorkflowDriver::new(DriverDeps {
        kernel,
        executions: executions.clone(),
        idempotency,
        tokens: tokens.clone(),
        governance,
        registry: Arc::new(default_registry(llm)),
        notifier: Some(notifier),
        config: settings.config.clone(),
    }));

    Arc::new(AppState {
        auth,
        driver,
        executions,
        tokens,
        workflows: DashMap::new(),
        ws,
    })
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/workflows", post(routes::save_workflow))
        .route("/executions", post(routes::submit))
        .route("/executions", get(routes::list_executions))
        .route("/executions/:arn", get(routes::get_status))
        .route("/executions/:arn", delete(routes::delete_execution))
        .route("/executions/:arn/history", get(routes::get_history))
        .route("/executions/:arn/stop", post(routes::stop_execution))
        .route("/callbacks/hitp", post(routes::hitp_callback))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .with_state(state)
}

pub async fn start_gateway(settings: GatewaySettings) -> anyhow::Result<()> {
    let auth = ResolvedAuth::from_env()?;
    let state = build_state(&settings, auth);
    let app = build_router(state);

    let bind_addr: SocketAddr = format!("{}:{}", settings.bind, settings.port).parse()?;
    info!("Capstan gateway v{} starting", env!("CARGO_PKG_VERSION"));
    info!("  Listening on: {}", bind_addr);
    info!("  WebSocket:    ws://{}/ws", bind_addr);
    info!("  State bucket: {}", settings.config.state_bucket);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "ws_connections": state.ws.connection_count(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let registry = state.ws.clone();
    let auth = state.auth.clone();
    ws.on_upgrade(move |socket| handle_connection(socket, registry, auth, query))
}
