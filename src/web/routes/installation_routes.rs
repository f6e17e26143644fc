use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    routing::get,
};
use std::sync::Arc;

use crate::services::github_service::Repository;
use crate::web::models::{AuthenticatedUser, InstallationView, PageQuery};
use crate::web::{AppError, AppState};

pub fn create_installation_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_installations))
        .route("/{installation_id}/repos", get(list_installed_repos))
}

async fn list_installations(
    State(app_state): State<Arc<AppState>>,
    Extension(authenticated_user): Extension<AuthenticatedUser>,
) -> Result<Json<Vec<InstallationView>>, AppError> {
    let installations = app_state
        .installations
        .installations(&authenticated_user.login)
        .await?;
    Ok(Json(installations.into_iter().map(InstallationView::from).collect()))
}

async fn list_installed_repos(
    State(app_state): State<Arc<AppState>>,
    Path(installation_id): Path<i64>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Vec<Repository>>, AppError> {
    let page = query.page.unwrap_or(1).max(1);
    let repos = app_state.installations.repos(installation_id, page).await?;
    Ok(Json(repos))
}
