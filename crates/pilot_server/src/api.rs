//! API server

use crate::handler;
use axum::routing::{get, post};
use axum::Router;
use pilot_calibrate::CalibrationService;
use pilot_core::PilotResult;
use pilot_runtime::{PilotRuntime, Settings};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    pub bind: String,
    /// Allow cross-origin requests from any origin
    #[serde(default)]
    pub permissive_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            permissive_cors: false,
        }
    }
}

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    /// Wired services
    pub runtime: Arc<PilotRuntime>,
    /// Calibration scans over the runtime's store
    pub calibration: Arc<CalibrationService>,
    /// Process start
    pub started: Instant,
}

impl AppState {
    /// State over an existing runtime
    #[must_use]
    pub fn new(runtime: Arc<PilotRuntime>) -> Self {
        let calibration = Arc::new(CalibrationService::new(Arc::clone(runtime.store())));
        Self {
            runtime,
            calibration,
            started: Instant::now(),
        }
    }
}

/// HTTP front end over a [`PilotRuntime`]
pub struct ApiServer {
    config: ServerConfig,
    state: AppState,
}

impl ApiServer {
    /// Build the runtime from settings
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be opened
    pub fn new(settings: Settings) -> PilotResult<Self> {
        let config = ServerConfig {
            bind: settings.bind.clone(),
            ..ServerConfig::default()
        };
        let runtime = Arc::new(PilotRuntime::from_settings(settings)?);
        Ok(Self::with_runtime(config, runtime))
    }

    /// Serve an existing runtime
    #[must_use]
    pub fn with_runtime(config: ServerConfig, runtime: Arc<PilotRuntime>) -> Self {
        Self {
            config,
            state: AppState::new(runtime),
        }
    }

    /// Replace the server configuration
    #[must_use]
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// The route table
    #[must_use]
    pub fn router(&self) -> Router {
        let router = routes().with_state(self.state.clone()).layer(TraceLayer::new_for_http());
        if self.config.permissive_cors {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Start the interval triggers, then bind and serve until the process
    /// exits
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound
    pub async fn serve(self) -> std::io::Result<()> {
        if let Err(err) = self.state.runtime.trigger().load_jobs().await {
            warn!(error = %err, "workflow triggers not loaded");
        }
        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(addr = %listener.local_addr()?, "pilot server listening");
        axum::serve(listener, self.router()).await
    }
}

fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(handler::health))
        .route("/compile", post(handler::compile))
        .route("/workflows", get(handler::list_workflows).post(handler::create_workflow))
        .route("/workflows/{id}/executions", get(handler::list_executions))
        .route("/workflows/{id}/run", post(handler::run_workflow))
        .route("/executions/{id}/resume", post(handler::resume))
        .route("/executions/{id}/pause", post(handler::pause))
        .route("/executions/{id}/status", get(handler::status))
        .route("/calibration/hardcodes", post(handler::detect_hardcodes))
}
