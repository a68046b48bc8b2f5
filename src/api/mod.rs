pub mod auth;
pub mod error;
mod gateway;
mod handlers;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use parking_lot::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use std::sync::Arc;

use crate::health::HealthSample;
use crate::orchestrator::Orchestrator;
use crate::shutdown::ShutdownCoordinator;

use handlers::*;

/// Header carrying the caller's user identity, recorded on created sessions.
pub const USER_HEADER: &str = "x-termgate-user";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub shutdown: ShutdownCoordinator,
    /// Most recent health-monitor sample, if one has been taken.
    pub health: Arc<RwLock<Option<HealthSample>>>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, shutdown: ShutdownCoordinator) -> Self {
        Self {
            orchestrator,
            shutdown,
            health: Arc::new(RwLock::new(None)),
        }
    }
}

/// Configuration for the HTTP/WS router.
///
/// Use `RouterConfig::default()` in tests for a minimal no-auth setup.
#[derive(Default)]
pub struct RouterConfig {
    pub token: Option<String>,
    pub cors_origins: Vec<String>,
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let protected = Router::new()
        .route("/stats", get(stats))
        .route("/shells", get(shells))
        .route(
            "/projects/{project}/sessions",
            get(session_list).post(session_create),
        )
        .route("/projects/{project}/suspend", post(project_suspend))
        .route("/projects/{project}/resume", post(project_resume))
        .route("/sessions/{id}", get(session_get).delete(session_close))
        .route("/sessions/{id}/focus", post(session_focus))
        .route("/sessions/{id}/blur", post(session_blur))
        .route("/sessions/{id}/input", post(session_input))
        .route("/sessions/{id}/resize", post(session_resize))
        .route("/ws", get(gateway::ws_handler))
        .with_state(state);

    let protected = match config.token {
        Some(token) => protected.layer(axum::middleware::from_fn(move |req, next| {
            let t = token.clone();
            async move { auth::require_auth(t, req, next).await }
        })),
        None => protected,
    };

    let router = Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ));

    // Conditionally apply CORS if origins are configured.
    if config.cors_origins.is_empty() {
        router
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([
                    header::AUTHORIZATION,
                    header::CONTENT_TYPE,
                    HeaderName::from_static(USER_HEADER),
                ]),
        )
    }
}
