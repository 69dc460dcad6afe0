//! EcoVault Backend Server
//!
//! Main entrypoint for the EcoVault backend: REST API for submission intake
//! and moderation, the asynchronous verification worker pool, the wallet
//! ledger, and payout gateway reconciliation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{header, HeaderValue, Method},
    routing::get,
    Router,
};
use sqlx::postgres::PgPoolOptions;
use tokio::time::sleep;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use ecovault_server::app_state::AppState;
use ecovault_server::cashout_service::CashoutService;
use ecovault_server::config::AppConfig;
use ecovault_server::gateway::GatewayRouter;
use ecovault_server::geo::GeoService;
use ecovault_server::handlers::{health_check, root};
use ecovault_server::media::{FfmpegProcessor, MediaProcessor};
use ecovault_server::routes;
use ecovault_server::storage::{HttpStorage, InMemoryStorage, Storage};
use ecovault_server::submission_service::SubmissionService;
use ecovault_server::verification_worker::{self, JobQueue, VerificationWorker};
use ecovault_server::wallet_service::WalletService;

const SCANNER_SUPERVISOR_MAX_BACKOFF_SECONDS: u64 = 30;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Arc::new(AppConfig::from_env());

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .expect("database connection failed");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("database migrations failed");

    // Collaborators
    let storage: Arc<dyn Storage> = match &config.storage_base_url {
        Some(base_url) => Arc::new(HttpStorage::new(base_url.clone(), config.storage_token.clone())),
        None => {
            warn!("STORAGE_BASE_URL not set, falling back to in-memory storage");
            Arc::new(InMemoryStorage::new())
        }
    };
    let media: Arc<dyn MediaProcessor> = Arc::new(FfmpegProcessor::new());
    let gateways = Arc::new(GatewayRouter::from_config(&config));

    // Services
    let geo_service = Arc::new(GeoService::new(pool.clone()));
    let wallet_service = Arc::new(WalletService::new(pool.clone()));
    let (queue, job_rx) = JobQueue::new(config.queue_capacity);
    let submission_service = Arc::new(SubmissionService::new(
        pool.clone(),
        geo_service.clone(),
        storage.clone(),
        wallet_service.clone(),
        queue.clone(),
        config.clone(),
    ));
    let cashout_service = Arc::new(CashoutService::new(
        pool.clone(),
        wallet_service.clone(),
        gateways,
        config.clone(),
    ));

    // Verification worker pool
    let worker = Arc::new(VerificationWorker::new(
        pool.clone(),
        storage,
        media,
        wallet_service.clone(),
        queue.clone(),
        config.clone(),
    ));
    tokio::spawn(verification_worker::run(worker, job_rx));

    // Start and supervise the requeue scanner that recovers lost jobs.
    {
        let pool = pool.clone();
        let queue = queue.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let mut restart_count: u32 = 0;
            loop {
                let handle = tokio::spawn(verification_worker::requeue_scanner(
                    pool.clone(),
                    queue.clone(),
                    Duration::from_secs(config.requeue_scan_secs),
                    Duration::from_secs(config.requeue_stale_secs),
                ));

                match handle.await {
                    Ok(()) => {
                        info!("requeue scanner exited cleanly; stopping supervisor");
                        break;
                    }
                    Err(join_error) => {
                        if join_error.is_panic() {
                            error!("requeue scanner panicked; restarting");
                        } else {
                            error!(error = %join_error, "requeue scanner task failed; restarting");
                        }
                    }
                }

                restart_count = restart_count.saturating_add(1);
                let backoff_seconds = (2u64.saturating_pow(restart_count.min(5)))
                    .min(SCANNER_SUPERVISOR_MAX_BACKOFF_SECONDS);
                warn!(restart_count, backoff_seconds, "requeue scanner restart backoff");
                sleep(Duration::from_secs(backoff_seconds)).await;
            }
        });
    }

    let app_state = AppState::new(
        submission_service,
        cashout_service,
        wallet_service,
        geo_service,
        config.webhook_secret.clone(),
    );

    // Create the app router
    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .merge(routes::submission_routes())
        .merge(routes::moderation_routes())
        .merge(routes::wallet_routes())
        .merge(routes::cashout_routes())
        .merge(routes::webhook_routes())
        .merge(routes::collection_point_routes())
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer())
        .with_state(app_state);

    // Get port from environment or default to 3001
    let port = std::env::var("PORT")
        .unwrap_or_else(|_| "3001".to_string())
        .parse()
        .expect("PORT must be a number");

    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    tracing::info!("Server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

fn build_cors_layer() -> CorsLayer {
    let allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:3000".to_string())
        .split(',')
        .filter_map(|origin| origin.trim().parse::<HeaderValue>().ok())
        .collect::<Vec<_>>();

    CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
        .allow_credentials(false)
}
