//! Control surface server

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    http::{HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use super::error::ApiError;
use super::routes::{
    events_stream, get_status, list_events, list_monitored_files, query_tag, security_middleware,
    start_monitoring, stop_monitoring, tag_path, tag_tree, untag_path,
};
use crate::config::ApiConfig;
use crate::service::{DlpServices, MonitoringController};
use crate::tag::TaggingService;

/// Server configuration
#[derive(Clone, Debug)]
pub struct ApiServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// CORS origins; empty allows any
    pub allowed_origins: Vec<String>,
    pub session_token: Option<String>,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self::from(&ApiConfig::default())
    }
}

impl From<&ApiConfig> for ApiServerConfig {
    fn from(config: &ApiConfig) -> Self {
        Self {
            bind_address: config.bind_address.clone(),
            port: config.port,
            allowed_origins: config.allowed_origins.clone(),
            session_token: config.require_token.clone().filter(|t| !t.is_empty()),
        }
    }
}

/// Shared state for the handlers
#[derive(Clone)]
pub struct ApiState {
    pub controller: Arc<MonitoringController>,
    pub tagging: Arc<TaggingService>,
    session_token: Option<Arc<str>>,
}

impl ApiState {
    pub fn new(
        controller: Arc<MonitoringController>,
        tagging: Arc<TaggingService>,
        session_token: Option<String>,
    ) -> Self {
        Self {
            controller,
            tagging,
            session_token: session_token.map(Arc::from),
        }
    }

    pub fn requires_token(&self) -> bool {
        self.session_token.is_some()
    }

    /// Validate a session token
    pub fn validate_token(&self, token: &str) -> bool {
        match &self.session_token {
            None => true,
            // Constant-time comparison
            Some(expected) => {
                expected.len() == token.len()
                    && expected
                        .as_bytes()
                        .iter()
                        .zip(token.as_bytes())
                        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                        == 0
            }
        }
    }
}

pub struct ApiServer {
    state: ApiState,
    config: ApiServerConfig,
}

impl ApiServer {
    pub fn new(state: ApiState, config: ApiServerConfig) -> Self {
        Self { state, config }
    }

    pub fn from_services(services: &DlpServices, config: ApiServerConfig) -> Self {
        let state = ApiState::new(
            services.controller.clone(),
            services.tagging.clone(),
            config.session_token.clone(),
        );
        Self::new(state, config)
    }

    pub fn state(&self) -> &ApiState {
        &self.state
    }

    /// Build the router with all routes and middleware
    pub fn build_router(&self) -> Router {
        let state = self.state.clone();

        let cors = CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers(Any);
        let cors = if self.config.allowed_origins.is_empty() {
            cors.allow_origin(Any)
        } else {
            cors.allow_origin(
                self.config
                    .allowed_origins
                    .iter()
                    .filter_map(|o| o.parse::<HeaderValue>().ok())
                    .collect::<Vec<_>>(),
            )
        };

        Router::new()
            .route("/api/monitoring/status", get(get_status))
            .route("/api/monitoring/start", post(start_monitoring))
            .route("/api/monitoring/stop", post(stop_monitoring))
            .route("/api/monitored_files", get(list_monitored_files))
            .route("/api/events", get(list_events))
            .route("/api/events/stream", get(events_stream))
            .route("/api/tags", post(tag_path).delete(untag_path).get(query_tag))
            .route("/api/tags/tree", post(tag_tree))
            .route("/health", get(|| async { "OK" }))
            .layer(middleware::from_fn_with_state(state.clone(), security_middleware))
            .layer(cors)
            .with_state(state)
    }

    /// Serve until `shutdown` resolves
    pub async fn serve<F>(self, shutdown: F) -> Result<(), ApiError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| ApiError::BindFailed {
                reason: format!("invalid bind address: {}", e),
            })?;
        let router = self.build_router();

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ApiError::BindFailed { reason: e.to_string() })?;

        tracing::info!(
            address = %addr,
            token_required = self.state.requires_token(),
            "Control surface listening"
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ApiError::Internal { reason: e.to_string() })?;

        Ok(())
    }
}
