use axum::{
    body::Body as AxumBody,
    extract::State,
    http::{Request, header},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::CookieJar;
use std::sync::Arc;
use tracing::warn;

use crate::services::session_service::SESSION_COOKIE;
use crate::web::models::AuthenticatedUser;
use crate::web::{AppState, error::AppError};

pub async fn auth(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    mut req: Request<AxumBody>,
    next: Next,
) -> Result<Response, AppError> {
    // Authorization header first, then the session cookie
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(|s| s.to_string())
        .or_else(|| jar.get(SESSION_COOKIE).map(|c| c.value().to_string()))
        .ok_or_else(|| AppError::Unauthorized("no session".to_string()))?;

    let login = state.sessions.verify(&token).map_err(|e| {
        warn!(error = %e, "Session rejected by auth middleware.");
        AppError::from(e)
    })?;

    req.extensions_mut().insert(AuthenticatedUser { login });
    Ok(next.run(req).await)
}
