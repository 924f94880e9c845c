//! Worker process HTTP server
//!
//! ```text
//! POST /api/map     MapTaskRequest    -> MapTaskResponse
//! POST /api/reduce  ReduceTaskRequest -> ReduceTaskResponse
//! GET  /health      liveness probe
//! GET  /metrics     Prometheus text exposition
//! ```
//!
//! Task execution is blocking file I/O and runs on the blocking pool, so
//! probes keep answering while a long task is in flight.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rand::Rng;
use serde::Serialize;
use tower_http::trace::TraceLayer;

use super::executor;
use super::{MapTaskRequest, MapTaskResponse, ReduceTaskRequest, ReduceTaskResponse};
use crate::metrics;
use crate::tasks::TaskFactory;

// ============================================================================
// Configuration
// ============================================================================

/// Worker server settings
#[derive(Debug, Clone)]
pub struct WorkerServerConfig {
    /// Listen address
    pub bind_address: SocketAddr,

    /// Probability in `[0, 1]` that a map task is artificially delayed
    pub slow_probability: f64,

    /// How long an injected slow map task sleeps before running
    pub slow_delay: Duration,

    /// Enable request logging
    pub enable_request_logging: bool,
}

impl WorkerServerConfig {
    pub fn new(bind_address: SocketAddr) -> Self {
        Self {
            bind_address,
            slow_probability: 0.0,
            slow_delay: Duration::from_secs(10),
            enable_request_logging: true,
        }
    }

    pub fn with_slow_worker(mut self, probability: f64, delay: Duration) -> Self {
        self.slow_probability = probability;
        self.slow_delay = delay;
        self
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if !(0.0..=1.0).contains(&self.slow_probability) {
            return Err(ServerError::ConfigError(format!(
                "slow_probability must be within [0, 1], got {}",
                self.slow_probability
            )));
        }
        Ok(())
    }
}

// ============================================================================
// App State
// ============================================================================

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub factory: Arc<TaskFactory>,
    pub config: WorkerServerConfig,
    pub start_time: Instant,
}

impl AppState {
    async fn maybe_slow_down(&self, task_id: usize) {
        if self.config.slow_probability <= 0.0 {
            return;
        }
        let roll: f64 = rand::thread_rng().gen();
        if roll < self.config.slow_probability {
            tracing::warn!(
                task_id,
                delay_ms = self.config.slow_delay.as_millis() as u64,
                "Injecting slow map task"
            );
            tokio::time::sleep(self.config.slow_delay).await;
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
    tasks: Vec<String>,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.start_time.elapsed().as_secs(),
        tasks: state.factory.names().into_iter().map(String::from).collect(),
    })
}

async fn map_task(
    State(state): State<AppState>,
    Json(request): Json<MapTaskRequest>,
) -> Json<MapTaskResponse> {
    state.maybe_slow_down(request.task_id).await;

    let task_id = request.task_id;
    let factory = state.factory.clone();
    let result = tokio::task::spawn_blocking(move || executor::execute_map(&factory, &request)).await;

    let response = match result {
        Ok(Ok(files)) => MapTaskResponse::ok(files),
        Ok(Err(e)) => {
            tracing::error!(task_id, error = %e, "Map task failed");
            MapTaskResponse::failed(e.to_string())
        }
        Err(e) => {
            tracing::error!(task_id, error = %e, "Map task aborted");
            MapTaskResponse::failed(format!("map task aborted: {e}"))
        }
    };
    metrics::record_worker_task("map", response.success);
    Json(response)
}

async fn reduce_task(
    State(state): State<AppState>,
    Json(request): Json<ReduceTaskRequest>,
) -> Json<ReduceTaskResponse> {
    let task_id = request.task_id;
    let factory = state.factory.clone();
    let result =
        tokio::task::spawn_blocking(move || executor::execute_reduce(&factory, &request)).await;

    let response = match result {
        Ok(Ok(_)) => ReduceTaskResponse::ok(),
        Ok(Err(e)) => {
            tracing::error!(task_id, error = %e, "Reduce task failed");
            ReduceTaskResponse::failed(e.to_string())
        }
        Err(e) => {
            tracing::error!(task_id, error = %e, "Reduce task aborted");
            ReduceTaskResponse::failed(format!("reduce task aborted: {e}"))
        }
    };
    metrics::record_worker_task("reduce", response.success);
    Json(response)
}

async fn metrics_text() -> impl IntoResponse {
    match metrics::encode_metrics() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Build the worker router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/api/map", post(map_task))
        .route("/api/reduce", post(reduce_task))
        .with_state(state)
}

// ============================================================================
// Worker Server
// ============================================================================

/// A worker process serving map/reduce calls
pub struct WorkerServer {
    config: WorkerServerConfig,
    state: AppState,
}

impl WorkerServer {
    pub fn new(config: WorkerServerConfig, factory: TaskFactory) -> Result<Self, ServerError> {
        config.validate()?;

        let state = AppState {
            factory: Arc::new(factory),
            config: config.clone(),
            start_time: Instant::now(),
        };
        Ok(Self { config, state })
    }

    pub fn build_router(&self) -> Router {
        let router = create_router(self.state.clone());
        if self.config.enable_request_logging {
            router.layer(TraceLayer::new_for_http())
        } else {
            router
        }
    }

    /// Bind the configured address and serve until `shutdown_signal` resolves
    pub async fn start_with_shutdown(
        &self,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let listener = tokio::net::TcpListener::bind(self.config.bind_address)
            .await
            .map_err(|e| ServerError::BindError(e.to_string()))?;
        self.serve(listener, shutdown_signal).await
    }

    /// Serve on an already-bound listener
    pub async fn serve(
        &self,
        listener: tokio::net::TcpListener,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let addr = listener
            .local_addr()
            .map_err(|e| ServerError::BindError(e.to_string()))?;
        tracing::info!(
            address = %addr,
            tasks = ?self.state.factory.names(),
            slow_probability = self.config.slow_probability,
            "Worker listening"
        );

        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ServerError::ServeError(e.to_string()))?;

        tracing::info!(address = %addr, "Worker shutdown complete");
        Ok(())
    }
}

// ============================================================================
// Server Errors
// ============================================================================

/// Server errors
#[derive(Debug, Clone)]
pub enum ServerError {
    /// Configuration error
    ConfigError(String),

    /// Failed to bind to address
    BindError(String),

    /// Server error
    ServeError(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigError(msg) => write!(f, "Configuration error: {msg}"),
            Self::BindError(msg) => write!(f, "Failed to bind: {msg}"),
            Self::ServeError(msg) => write!(f, "Server error: {msg}"),
        }
    }
}

impl std::error::Error for ServerError {}

// ============================================================================
// Tests
// ============================================================================
