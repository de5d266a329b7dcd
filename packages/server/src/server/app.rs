// Router and shared request state

use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{header::CONTENT_TYPE, Method},
    middleware,
    routing::{get, post},
    Extension, Router,
};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::kernel::jobs::Dispatcher;
use crate::kernel::{ServerKernel, StreamHub};
use crate::server::middleware::extract_client_ip;
use crate::server::routes::{
    health_handler, report_status_ws, request_job_handler, scan_status_ws,
};
use crate::status::StatusReader;

const API_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state handed to every handler through an `Extension`.
#[derive(Clone)]
pub struct AppState {
    pub kernel: Arc<ServerKernel>,
    pub dispatcher: Dispatcher,
    /// Local subscribers for the status topics
    pub stream_hub: StreamHub,
    pub status_reader: StatusReader,
    pub db_pool: PgPool,
}

impl AppState {
    pub fn new(kernel: Arc<ServerKernel>, stream_hub: StreamHub, db_pool: PgPool) -> Self {
        Self {
            dispatcher: Dispatcher::new(kernel.clone()),
            status_reader: StatusReader::new(kernel.clone()),
            kernel,
            stream_hub,
            db_pool,
        }
    }
}

pub fn build_app(state: AppState) -> Router {
    // CORS configuration - allow any origin
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE]);

    let api = Router::new()
        .route("/api/jobs", post(request_job_handler))
        .layer(TimeoutLayer::new(API_TIMEOUT));

    Router::new()
        .merge(api)
        .route("/ws/status", get(report_status_ws))
        .route("/ws/scan-status", get(scan_status_ws))
        .route("/health", get(health_handler))
        // Middleware layers (applied in reverse order - last added runs first)
        .layer(middleware::from_fn(extract_client_ip))
        .layer(Extension(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
