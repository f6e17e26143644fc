use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::post,
};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::notifications::compose::{StarEvent, compose};
use crate::web::{AppError, AppState};

pub const EVENT_HEADER: &str = "x-github-event";

pub fn create_hook_router() -> Router<Arc<AppState>> {
    Router::new().route("/", post(on_event))
}

/// Relays a star event to every member of the repository owner's account whose
/// settings admit the repository. Each member's dispatch runs concurrently.
async fn on_event(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<&'static str, AppError> {
    let event_type = headers
        .get(EVENT_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if event_type != "star" {
        debug!(event_type, "Ignoring non-star webhook.");
        return Ok("Not a star event");
    }

    let event: StarEvent = serde_json::from_slice(&body)?;
    let Some((title, message)) = compose(&event) else {
        return Ok("Ignored action");
    };

    let repo = &event.repository.full_name;
    let account = &event.repository.owner.login;
    let members = app_state.settings.all(account).await?;
    let targets: Vec<_> = members
        .iter()
        .filter(|(_, setting)| setting.is_allow_repo(repo))
        .collect();
    if targets.is_empty() {
        debug!(account, repo, "No settings admit this repository.");
        return Ok("Settings not found");
    }

    let dispatcher = &app_state.dispatcher;
    let (title, message) = (&title, &message);
    let deliveries = targets.into_iter().map(|(login, setting)| async move {
        let result = dispatcher
            .dispatch(title, message, &setting.notify_settings)
            .await;
        (login, result)
    });

    let mut failures = Vec::new();
    for (login, result) in join_all(deliveries).await {
        match result {
            Ok(report) => info!(account, repo, login, delivered = report.delivered.len(), "Star relayed."),
            Err(e) => {
                warn!(account, repo, login, error = %e, "Star relay failed.");
                failures.push(format!("{login}: {e}"));
            }
        }
    }
    if !failures.is_empty() {
        return Err(AppError::Upstream(failures.join("; ")));
    }
    Ok("Sent")
}
