//! API server entry point.

use std::sync::Arc;

use api::{AppState, Config};
use coordination::{
    InMemoryWaitingList, LockCoordinator, RedisLockBackend, RedisWaitingList, WaitingList,
};
use ledger::{InMemoryLedger, LedgerStore, PostgresLedger};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const MAX_DB_CONNECTIONS: u32 = 20;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn open_ledger(config: &Config) -> Arc<dyn LedgerStore> {
    match &config.database_url {
        Some(url) => {
            let ledger = PostgresLedger::connect(url, MAX_DB_CONNECTIONS)
                .await
                .expect("failed to connect to PostgreSQL");
            ledger
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using PostgreSQL ledger");
            Arc::new(ledger)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory ledger");
            Arc::new(InMemoryLedger::new())
        }
    }
}

async fn open_coordination(config: &Config) -> (LockCoordinator, Arc<dyn WaitingList>) {
    match &config.redis_url {
        Some(url) => {
            let backend = RedisLockBackend::new(url)
                .await
                .expect("failed to connect to Redis");
            let list = RedisWaitingList::new(url)
                .await
                .expect("failed to connect to Redis")
                .with_ttl(config.waiting_list_ttl);
            tracing::info!("using Redis locks and waiting lists");
            (
                LockCoordinator::new(Arc::new(backend)).with_options(config.lock_options()),
                Arc::new(list),
            )
        }
        None => {
            tracing::warn!("REDIS_URL not set, using process-local locks and waiting lists");
            (
                LockCoordinator::in_memory().with_options(config.lock_options()),
                Arc::new(InMemoryWaitingList::new(config.waiting_list_ttl)),
            )
        }
    }
}

#[tokio::main]
async fn main() {
    // 1. Load configuration and initialize tracing
    let config = Config::from_env().expect("invalid configuration");
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let prometheus_builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let metrics_handle = prometheus_builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Open the ledger and the coordination backends
    let ledger = open_ledger(&config).await;
    let (locks, waiting_list) = open_coordination(&config).await;

    // 4. Build state and start background workers
    let addr = config.addr();
    let state = Arc::new(AppState::new(ledger, locks, waiting_list, config));
    let cancel = CancellationToken::new();
    let workers = state.spawn_background(&cancel);
    tracing::info!(
        strategy = %state.config.coupon_strategy,
        reservation = %state.config.stock_reservation,
        workers = workers.len(),
        "background workers started"
    );

    // 5. Build the application and start server
    let app = api::create_app(state, metrics_handle);
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // 6. Stop background workers
    cancel.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::warn!(error = %e, "background worker ended abnormally");
        }
    }

    tracing::info!("server shut down gracefully");
}
