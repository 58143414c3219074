use atrium::application::actors::DepartmentActor;
use atrium::application::handlers::portfolio_handler::PortfolioHandler;
use atrium::application::handlers::status_handler::{self, AppState};
use atrium::application::services::collaborator_pool::CollaboratorPool;
use atrium::application::services::orchestrator::DepartmentOrchestrator;
use atrium::config::DeskConfig;
use atrium::domain::repositories::message_bus::MessageBus;
use atrium::domain::repositories::position_store::PositionStore;
use atrium::domain::services::position_ledger::PositionLedger;
use atrium::infrastructure::valuation::StaticValuation;
use atrium::persistence::message_repository::SqliteMessageBus;
use atrium::persistence::position_repository::SqlitePositionStore;
use atrium::persistence::reconciliation_audit::{
    ReconciliationRepository, SqliteReconciliationRepository,
};
use atrium::persistence::{init_database_with, DatabaseConfig};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Loaded before logging so RUST_LOG can come from .env
    let dotenv = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "atrium=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Atrium Portfolio desk starting...");
    match dotenv {
        Ok(path) => info!("Loaded environment from {}", path.display()),
        Err(e) if e.not_found() => {}
        Err(e) => warn!("Failed to load .env file: {}", e),
    }

    let config = DeskConfig::from_env();
    info!(
        "Configuration loaded: target deployment {:.0}%, max {} positions, cycle every {}s",
        config.target_deployment_ratio * 100.0,
        config.max_positions,
        config.cycle_interval_seconds
    );

    let db_config = DatabaseConfig::from_env();
    let pool = init_database_with(&db_config).await?;

    let bus: Arc<dyn MessageBus> = Arc::new(SqliteMessageBus::new(pool.clone()));
    let store: Arc<dyn PositionStore> = Arc::new(SqlitePositionStore::new(pool.clone()));
    let audit: Arc<dyn ReconciliationRepository> =
        Arc::new(SqliteReconciliationRepository::new(pool.clone()));

    // No live market data feed is wired in; prices come from fills
    warn!(
        "Using static valuation source with portfolio value {:.2}",
        config.portfolio_value
    );
    let valuation = Arc::new(StaticValuation::new(config.portfolio_value));

    let ledger = Arc::new(PositionLedger::new(store, config.reconciliation_config()));
    let handler = PortfolioHandler::new(
        ledger.clone(),
        valuation,
        CollaboratorPool::new(config.collaborator_pool_config()),
        config.portfolio_handler_config(),
    )
    .with_audit(audit.clone());

    let orchestrator = DepartmentOrchestrator::new(Arc::new(handler), bus, config.retry_policy());
    let portfolio = DepartmentActor::spawn(orchestrator, config.cycle_interval());

    let app = status_handler::router(AppState {
        portfolio: portfolio.clone(),
        ledger,
        audit: Some(audit),
    });

    let addr = config.status_addr;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = axum::serve(listener, app);

    let shutdown_signal = async move {
        let ctrl_c = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C signal"),
                Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                    info!("Received SIGTERM signal");
                }
                Err(e) => error!("Failed to install SIGTERM handler: {}", e),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    };

    info!("Desk started successfully. Press Ctrl+C to stop.");
    server.with_graceful_shutdown(shutdown_signal).await?;

    info!("Desk shutting down gracefully...");

    // Returns once the actor has exited and its last cycle has flushed
    portfolio.shutdown().await;
    pool.close().await;

    info!("Shutdown complete");
    Ok(())
}
