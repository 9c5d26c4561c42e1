use crate::routes;
use axum::{Extension, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tributary_core::collector::ApiClientPool;
use tributary_core::storage::{MetaStore, PipelineGuard, RecordStore, SqliteStore, TableLocks};
use tributary_core::{
    BlueprintScheduler, BlueprintService, EngineConfig, PipelineOrchestrator, PipelineQueue, PluginRegistry,
    SourceService, TaskRunner,
};

const REQUEST_ID: &str = "x-request-id";

/// Everything a handler can reach. Built once at startup.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<EngineConfig>,
    pub registry: Arc<PluginRegistry>,
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub queue: Arc<PipelineQueue>,
    pub blueprints: Arc<BlueprintService>,
    pub sources: Arc<SourceService>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire the engine over one store. The API client pool and table locks
    /// are shared by the runner and the source service.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(
        meta: Arc<dyn MetaStore>,
        records: Arc<dyn RecordStore>,
        registry: Arc<PluginRegistry>,
        config: Arc<EngineConfig>,
    ) -> Self {
        let clients = Arc::new(ApiClientPool::new());
        let locks = Arc::new(TableLocks::new());
        let runner = Arc::new(TaskRunner::new(
            registry.clone(),
            meta.clone(),
            records,
            clients.clone(),
            config.clone(),
        ));
        let orchestrator = Arc::new(PipelineOrchestrator::new(meta.clone(), runner, locks.clone(), config.clone()));
        let guard = PipelineGuard::new(meta.clone(), locks, config.lock_timeout);
        Self {
            queue: Arc::new(PipelineQueue::new(orchestrator.clone())),
            blueprints: Arc::new(BlueprintService::new(orchestrator.clone())),
            sources: Arc::new(SourceService::new(meta, registry.clone(), guard, clients)),
            orchestrator,
            registry,
            config,
            started_at: Instant::now(),
        }
    }

    /// Open the SQLite store named by the config.
    #[tracing::instrument(level = "info", skip_all, fields(db_path = %config.db_path.display()))]
    pub async fn open(config: EngineConfig, registry: Arc<PluginRegistry>) -> anyhow::Result<Self> {
        let store = Arc::new(SqliteStore::new(&config.db_path).await?);
        Ok(Self::new(store.clone(), store, registry, Arc::new(config)))
    }
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router(state: AppState) -> Router {
    let header = axum::http::HeaderName::from_static(REQUEST_ID);
    Router::new()
        .merge(routes::router())
        .layer(Extension(Arc::new(state)))
        .layer(PropagateRequestIdLayer::new(header.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(header, MakeRequestUuid))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Start the queue and scheduler loops; they stop when `shutdown` fires.
#[tracing::instrument(level = "info", skip_all)]
pub async fn spawn_background(state: &AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let recovered = state.queue.recover().await?;
    if recovered > 0 {
        tracing::warn!(recovered, "interrupted pipelines re-queued");
    }

    let queue = state.queue.clone();
    let token = shutdown.clone();
    tokio::spawn(async move { queue.run_loop(token).await });

    let scheduler = BlueprintScheduler::new(state.blueprints.clone(), state.config.blueprint_poll_interval)?;
    tokio::spawn(async move { scheduler.run_loop(shutdown).await });
    Ok(())
}

#[tracing::instrument(level = "info", skip_all, fields(%addr))]
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    spawn_background(&state, shutdown.clone()).await?;

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening");
    let token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for ctrl-c");
            }
            token.cancel();
        })
        .await?;
    shutdown.cancel();
    Ok(())
}
