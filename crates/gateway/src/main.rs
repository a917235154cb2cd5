//! CondoPortal API Gateway
//!
//! The main entry point for all external API requests.
//! Handles:
//! - Firebase ID-token authentication
//! - Document uploads, ingestion and record management
//! - Knowledge base search and workflow questions
//! - Rate limiting and observability (logging, metrics)

mod handlers;
mod middleware;

use anyhow::{bail, Context};
use axum::{
    extract::{DefaultBodyLimit, FromRef},
    http::HeaderValue,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use condoportal_common::{
    auth::{FirebaseTokenVerifier, TokenVerifier},
    config::{AppConfig, ObservabilityConfig, StorageBackend},
    dify::{KnowledgeBase, KnowledgeBaseClient, Workflow, WorkflowClient},
    firebase::{FileStorage, FirestoreClient, IdentityClient, StorageClient},
    metrics::{self, LATENCY_BUCKETS, METRICS_PREFIX, PIPELINE_BUCKETS},
    store::{DocumentStore, FirestoreDocumentStore, KnowledgeBaseDocumentStore},
    upstream::http_client,
    VERSION,
};
use condoportal_ingestion::{GeminiOcr, IngestionPipeline, PipelineSettings};
use handlers::{ask, auth, documents, health, search};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use middleware::{rate_limit::rate_limit_middleware, RateLimit};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Room for multipart boundaries and text fields on top of the file itself
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub store: Arc<dyn DocumentStore>,
    pub knowledge_base: Arc<dyn KnowledgeBase>,
    pub workflow: Arc<dyn Workflow>,
    pub files: Arc<dyn FileStorage>,
    pub identity: Arc<IdentityClient>,
    pub pipeline: Arc<IngestionPipeline>,
    pub metrics: Option<PrometheusHandle>,
}

impl FromRef<AppState> for Arc<dyn TokenVerifier> {
    fn from_ref(state: &AppState) -> Self {
        state.verifier.clone()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("Failed to load configuration")?;
    init_tracing(&config.observability);

    info!(
        service = %config.observability.service_name,
        "Starting CondoPortal API Gateway v{}",
        VERSION
    );

    // Refuse to start with missing settings, reporting all of them
    if let Err(problems) = config.validate() {
        for problem in &problems {
            error!(problem = %problem, "Invalid configuration");
        }
        bail!("{} configuration problem(s), see log", problems.len());
    }

    let metrics_handle = if config.observability.metrics_enabled {
        Some(install_metrics_recorder()?)
    } else {
        None
    };
    metrics::register_metrics();

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server.host or server.port")?;

    let state = build_state(Arc::new(config), metrics_handle)?;
    info!(backend = state.store.backend(), "Document store ready");

    let app = create_router(state);

    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    if config.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn install_metrics_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(format!("{}_request_duration_seconds", METRICS_PREFIX)),
            LATENCY_BUCKETS,
        )?
        .set_buckets_for_metric(
            Matcher::Full(format!("{}_search_duration_seconds", METRICS_PREFIX)),
            LATENCY_BUCKETS,
        )?
        .set_buckets_for_metric(
            Matcher::Full(format!("{}_ingestion_duration_seconds", METRICS_PREFIX)),
            PIPELINE_BUCKETS,
        )?
        .set_buckets_for_metric(
            Matcher::Full(format!("{}_question_duration_seconds", METRICS_PREFIX)),
            PIPELINE_BUCKETS,
        )?
        .install_recorder()?;
    Ok(handle)
}

/// Wire the managed-service clients into handler state
fn build_state(config: Arc<AppConfig>, metrics: Option<PrometheusHandle>) -> anyhow::Result<AppState> {
    let retry_budget = Duration::from_secs(config.dify.retry_budget_secs);
    let upstream_http = http_client(Duration::from_secs(config.dify.timeout_secs))?;
    let gemini_http = http_client(Duration::from_secs(config.gemini.timeout_secs))?;

    let verifier: Arc<dyn TokenVerifier> = Arc::new(FirebaseTokenVerifier::new(
        upstream_http.clone(),
        config.firebase.jwks_url.clone(),
        config.firebase.project_id.clone(),
        Duration::from_secs(config.firebase.jwks_ttl_secs),
    ));

    let knowledge_base: Arc<dyn KnowledgeBase> =
        Arc::new(KnowledgeBaseClient::new(upstream_http.clone(), &config.dify));
    let workflow: Arc<dyn Workflow> = Arc::new(WorkflowClient::new(upstream_http.clone(), &config.dify));

    let files: Arc<dyn FileStorage> = Arc::new(StorageClient::new(
        upstream_http.clone(),
        config.firebase.storage_base_url.as_deref(),
        config.firebase.storage_bucket.clone(),
        retry_budget,
    ));

    let store: Arc<dyn DocumentStore> = match config.storage.backend {
        StorageBackend::Firestore => Arc::new(FirestoreDocumentStore::new(
            FirestoreClient::new(upstream_http.clone(), config.firestore_documents_url(), retry_budget),
            config.firebase.collection.clone(),
        )),
        StorageBackend::KnowledgeBase => Arc::new(KnowledgeBaseDocumentStore::new(knowledge_base.clone())),
    };

    let identity = Arc::new(IdentityClient::new(
        upstream_http,
        config.firebase.api_key.clone(),
        config.firebase.identity_base_url.as_deref(),
        config.firebase.secure_token_base_url.as_deref(),
    ));

    let pipeline = Arc::new(IngestionPipeline::new(
        PipelineSettings::from_config(&config),
        Arc::new(GeminiOcr::new(gemini_http, &config.gemini, retry_budget)),
        knowledge_base.clone(),
    )?);

    Ok(AppState {
        config,
        verifier,
        store,
        knowledge_base,
        workflow,
        files,
        identity,
        pipeline,
        metrics,
    })
}

fn cors_layer(origin: &str) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    match origin.trim() {
        "" | "*" => cors.allow_origin(Any),
        origin => match HeaderValue::from_str(origin) {
            Ok(value) => cors.allow_origin(value),
            Err(_) => {
                warn!(origin = %origin, "Invalid CORS origin, cross-origin requests disabled");
                cors
            }
        },
    }
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    let config = state.config.clone();

    // API routes
    let api_routes = Router::new()
        // Health endpoints (no auth)
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/metrics", get(health::metrics))

        // Session endpoints
        .route("/auth/login", post(auth::login))
        .route("/auth/refresh", post(auth::refresh))
        .route("/me", get(auth::me))

        // Document endpoints
        .route(
            "/documents",
            post(documents::upload_document).get(documents::list_documents),
        )
        .route(
            "/documents/{id}",
            get(documents::get_document)
                .patch(documents::update_document)
                .delete(documents::delete_document),
        )

        // Knowledge base endpoints
        .route("/search", post(search::search))
        .route("/ask", post(ask::ask))
        .route_layer(from_fn(middleware::metrics::track_requests));

    let mut router = Router::new().nest("/v1", api_routes);
    if let Some(rate_limit) = RateLimit::from_config(&config.rate_limit) {
        router = router.layer(from_fn_with_state(rate_limit, rate_limit_middleware));
    }

    // Compose the app
    router
        .layer(DefaultBodyLimit::max(config.ingestion.max_upload_bytes + MULTIPART_OVERHEAD))
        .layer(TimeoutLayer::new(config.request_timeout()))
        .layer(ConcurrencyLimitLayer::new(config.server.max_concurrent_requests.max(1)))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config.server.cors_origin))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
