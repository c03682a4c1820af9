use crate::config::{BankConfig, StorageBackend};
use crate::handlers;
use crate::services::{Database, InMemoryStore, LedgerStore, TransferEngine};
use axum::{
    middleware::from_fn,
    routing::{get, post},
    Router,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::request_id_middleware;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn LedgerStore>,
    pub engine: TransferEngine,
    pub environment: String,
}

impl AppState {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        transfer_timeout: Duration,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            engine: TransferEngine::new(store.clone(), transfer_timeout),
            store,
            environment: environment.into(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/healthcheck", get(handlers::healthcheck))
        .route(
            "/accounts",
            get(handlers::accounts::list_accounts).post(handlers::accounts::create_account),
        )
        .route(
            "/accounts/:id",
            get(handlers::accounts::get_account)
                .put(handlers::accounts::update_account)
                .patch(handlers::accounts::update_balance)
                .delete(handlers::accounts::delete_account),
        )
        .route("/accounts/:id/entries", get(handlers::accounts::list_entries))
        .route(
            "/accounts/:id/transfers",
            get(handlers::accounts::list_transfers),
        )
        .route("/transfers", post(handlers::transfers::create_transfer));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(request_id_middleware))
        .with_state(state)
}

pub struct Application {
    port: u16,
    server: Box<dyn std::future::Future<Output = std::io::Result<()>> + Send + Unpin>,
}

impl Application {
    pub async fn build(config: BankConfig) -> Result<Self, AppError> {
        let store: Arc<dyn LedgerStore> = match config.storage {
            StorageBackend::Postgres => {
                let db = Database::new(
                    config.database.url.expose_secret(),
                    config.database.max_connections,
                    config.database.min_connections,
                    config.database.lock_timeout(),
                )
                .await
                .map_err(|e| {
                    tracing::error!("Failed to connect to PostgreSQL: {}", e);
                    e
                })?;
                db.run_migrations().await.map_err(|e| {
                    tracing::error!("Failed to run database migrations: {}", e);
                    e
                })?;
                Arc::new(db)
            }
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory storage; data will not survive a restart");
                Arc::new(InMemoryStore::new())
            }
        };

        let state = AppState::new(
            store,
            config.transfer_timeout(),
            config.common.environment.clone(),
        );
        let app = build_router(state);

        let addr = config.common.listen_addr()?;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind TCP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(
            port = port,
            storage = ?config.storage,
            environment = %config.common.environment,
            "Listening"
        );

        let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

        Ok(Self {
            port,
            server: Box::new(server.into_future()),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.server.await
    }
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
