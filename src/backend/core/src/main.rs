//! Pulse Server - Main entry point

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use pulse_core::api::{self, AppState};
use pulse_core::config::Config;
use pulse_core::dispatch::{BrokerExecutor, ExecutorResolver, HttpExecutor, SinkExecutor};
use pulse_core::events::EventBus;
use pulse_core::health::HealthService;
use pulse_core::jobs::JobService;
use pulse_core::leader::LeaderCoordinator;
use pulse_core::observability;
use pulse_core::repository::{
    InMemoryRepository, JobRepository, LeaseRepository, PostgresRepository,
};
use pulse_core::scheduler::SchedulerLoop;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: Could not load config: {}. Using defaults.", e);
        Config::default()
    });

    // Initialize observability
    observability::init(
        &config.observability.log_level,
        config.observability.json_logging,
    )?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Pulse Server"
    );

    // Select the repository backend
    let (job_repo, lease_repo): (Arc<dyn JobRepository>, Arc<dyn LeaseRepository>) =
        match &config.database.url {
            Some(url) => {
                let repo = PostgresRepository::new(
                    url,
                    config.database.max_connections,
                    config.database.min_connections,
                )
                .await?;
                repo.migrate().await?;
                tracing::info!("Connected to database, migrations applied");
                let repo = Arc::new(repo);
                (repo.clone(), repo)
            }
            None => {
                tracing::warn!("No database configured; using in-memory repository (dev mode)");
                let repo = Arc::new(InMemoryRepository::new());
                (repo.clone(), repo)
            }
        };

    // Recipient executors
    let http_client = reqwest::Client::new();
    let http = Arc::new(HttpExecutor::new(http_client.clone()));
    let broker = Arc::new(BrokerExecutor::connect(&config.broker.url)?);
    let sink = Arc::new(SinkExecutor::new(
        http_client,
        config.dispatch.sink_url.clone(),
    ));
    let resolver = Arc::new(ExecutorResolver::standard(
        http,
        broker,
        sink.clone(),
        config.dispatch.default_execution_timeout,
    ));

    // Event bus and job service
    let events = Arc::new(EventBus::default());
    let service = Arc::new(JobService::new(job_repo.clone(), events.clone()));

    // Leader election
    let (coordinator, mastership) = LeaderCoordinator::new(lease_repo, config.leader.clone());
    tracing::info!(instance = %coordinator.instance_name(), "Replica identity assigned");

    // Scheduler loop
    let scheduler = Arc::new(SchedulerLoop::new(
        job_repo.clone(),
        resolver,
        events.clone(),
        config.scheduler.clone(),
        mastership.clone(),
    ));

    // Inbound request channel
    let (_request_sender, ingestor) =
        pulse_core::ingest::RequestIngestor::channel(service.clone(), 256);

    let shutdown = CancellationToken::new();
    let coordinator_task = tokio::spawn(coordinator.clone().run(shutdown.clone()));
    let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));
    let ingestor_task = tokio::spawn(ingestor.run(shutdown.clone()));

    // HTTP surface
    let sink_required = config.dispatch.sink_url.is_some() || std::env::var("K_SINK").is_ok();
    let health = HealthService::new(job_repo, mastership, sink, sink_required);
    let app = api::build_router(AppState { service, health });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Graceful shutdown: stop the loops; the coordinator resigns mastership
    // proactively so another replica can take over without waiting for the
    // lease to go stale.
    shutdown.cancel();
    let _ = coordinator_task.await;
    let _ = scheduler_task.await;
    let _ = ingestor_task.await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
