use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::services::connect_service::{ConnectStatus, IssuedToken, PLATFORM_FIELD, Platform};
use crate::web::models::AuthenticatedUser;
use crate::web::{AppError, AppState};

pub fn create_connect_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/{platform}", post(issue_connect_token))
        .route("/{platform}/{token}", get(get_connect_result))
}

async fn issue_connect_token(
    State(app_state): State<Arc<AppState>>,
    Extension(authenticated_user): Extension<AuthenticatedUser>,
    Path(platform): Path<String>,
) -> Result<Json<IssuedToken>, AppError> {
    let platform: Platform = platform.parse()?;
    let issued = app_state
        .connect
        .issue(&authenticated_user.login, platform)
        .await?;
    Ok(Json(issued))
}

/// The bot's binding once redeemed; until then only the platform tag.
async fn get_connect_result(
    State(app_state): State<Arc<AppState>>,
    Path((platform, token)): Path<(String, String)>,
) -> Result<Json<Map<String, Value>>, AppError> {
    let platform: Platform = platform.parse()?;
    match app_state.connect.peek(&token).await? {
        ConnectStatus::Ready(payload) => Ok(Json(payload)),
        ConnectStatus::Pending { platform: stored } => {
            let mut pending = Map::new();
            pending.insert(
                PLATFORM_FIELD.to_string(),
                Value::from(stored.unwrap_or_else(|| platform.to_string())),
            );
            Ok(Json(pending))
        }
    }
}
