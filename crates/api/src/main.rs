use std::sync::Arc;

use anyhow::Context;

use coursegen_ai::{HttpGenerationClient, HttpGenerationConfig};
use coursegen_api::app::{self, AppServices};
use coursegen_infra::jobs::{JobService, PostgresJobStore};
use coursegen_infra::{
    AppConfig, BreakerRegistry, DegradationGuard, FsArtifactStore, GuardedJobStore, SystemClock, Worker,
    WorkerPool,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine; the environment may already be populated.
    let _ = dotenvy::dotenv();

    let config = AppConfig::from_env().context("invalid configuration")?;
    coursegen_observability::init(config.log_format);
    tracing::info!(
        workers = config.worker.worker_count,
        http_addr = %config.http_addr,
        generation = %config.generation.base_url,
        "starting coursegen"
    );

    let store = PostgresJobStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to job store")?;
    store.migrate().await.context("running migrations")?;

    let guard = DegradationGuard::new();
    let guarded = GuardedJobStore::new(Arc::new(store), guard);
    let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));

    let client = HttpGenerationClient::new(
        HttpGenerationConfig::new(&config.generation.base_url, &config.generation.api_key)
            .with_request_timeout(config.generation.call_timeout),
    )
    .context("building generation client")?;

    let worker = Worker::new(
        guarded.clone(),
        Arc::new(client),
        breakers.clone(),
        Arc::new(FsArtifactStore::new(&config.artifact_dir)),
        config.retry.clone(),
        Arc::new(SystemClock),
        config.worker.clone(),
    );
    let pool = WorkerPool::spawn(worker);

    let services = Arc::new(AppServices::new(JobService::arc(guarded), breakers));
    let router = app::build_app(services);

    let listener = tokio::net::TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("binding {}", config.http_addr))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    let shutdown = pool.shutdown_token();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("shutdown requested"),
                _ = shutdown.cancelled() => {}
            }
        })
        .await
        .context("http server")?;

    pool.shutdown().await;
    Ok(())
}
