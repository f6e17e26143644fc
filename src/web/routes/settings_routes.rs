use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::notifications::models::Setting;
use crate::web::models::{AuthenticatedUser, DeliveryResponse, TestNotificationRequest};
use crate::web::{AppError, AppState};

pub fn create_settings_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/test", post(send_test_notification))
        .route(
            "/{account}",
            get(get_settings).put(update_settings).delete(delete_settings),
        )
}

async fn get_settings(
    State(app_state): State<Arc<AppState>>,
    Extension(authenticated_user): Extension<AuthenticatedUser>,
    Path(account): Path<String>,
) -> Result<Json<Setting>, AppError> {
    app_state
        .settings
        .get(&account, &authenticated_user.login)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("no settings for {account}")))
}

async fn update_settings(
    State(app_state): State<Arc<AppState>>,
    Extension(authenticated_user): Extension<AuthenticatedUser>,
    Path(account): Path<String>,
    Json(setting): Json<Setting>,
) -> Result<Json<Value>, AppError> {
    app_state
        .settings
        .save(&account, &authenticated_user.login, &setting)
        .await?;
    Ok(Json(json!({})))
}

async fn delete_settings(
    State(app_state): State<Arc<AppState>>,
    Extension(authenticated_user): Extension<AuthenticatedUser>,
    Path(account): Path<String>,
) -> Result<Json<Value>, AppError> {
    app_state
        .settings
        .delete(&account, &authenticated_user.login)
        .await?;
    Ok(Json(json!({})))
}

async fn send_test_notification(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<TestNotificationRequest>,
) -> Result<Json<DeliveryResponse>, AppError> {
    let report = app_state.settings.send_test(&payload.notify_settings).await?;
    Ok(Json(DeliveryResponse {
        delivered: report.delivered,
    }))
}
