use axum::{
    Router,
    http::Method,
    middleware as axum_middleware,
    routing::get,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::notifications::service::Dispatcher;
use crate::server::config::{ServerConfig, TELEGRAM_WEBHOOK_PATH};
use crate::services::connect_service::ConnectService;
use crate::services::installation_service::InstallationService;
use crate::services::session_service::SessionService;
use crate::services::settings_service::SettingsService;
use crate::web::{middleware::auth, routes::*};

pub use error::AppError;

pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub sessions: Arc<SessionService>,
    pub connect: Arc<ConnectService>,
    pub installations: Arc<InstallationService>,
    pub settings: Arc<SettingsService>,
    pub dispatcher: Arc<Dispatcher>,
}

async fn health_check_handler() -> &'static str {
    "OK"
}

pub fn create_router(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(vec![Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_check_handler))
        .nest("/api/hook", hook_routes::create_hook_router())
        .nest(TELEGRAM_WEBHOOK_PATH, telegram_routes::create_telegram_router())
        .nest(
            "/api/settings",
            settings_routes::create_settings_router()
                .route_layer(axum_middleware::from_fn_with_state(app_state.clone(), auth::auth)),
        )
        .nest(
            "/api/connect",
            connect_routes::create_connect_router()
                .route_layer(axum_middleware::from_fn_with_state(app_state.clone(), auth::auth)),
        )
        .nest(
            "/api/installations",
            installation_routes::create_installation_router()
                .route_layer(axum_middleware::from_fn_with_state(app_state.clone(), auth::auth)),
        )
        .with_state(app_state)
        .layer(cors)
}
