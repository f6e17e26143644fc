use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use crate::cache::StoreError;
use crate::credentials::CredentialError;
use crate::notifications::service::DispatchError;
use crate::services::connect_service::ConnectError;
use crate::services::installation_service::InstallationError;
use crate::services::session_service::SessionError;
use crate::services::settings_service::SettingsError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Not Found: {0}")]
    NotFound(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Too many requests: {0}")]
    TooManyRequests(String),
    #[error("Upstream error: {0}")]
    Upstream(String),
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("Internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::TooManyRequests(msg) => (StatusCode::TOO_MANY_REQUESTS, msg),
            AppError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
            AppError::ServiceUnavailable(msg) => {
                error!(error = %msg, "Store unavailable while serving a request.");
                (StatusCode::SERVICE_UNAVAILABLE, msg)
            }
            AppError::InternalServerError(msg) => {
                error!(error = %msg, "Internal server error.");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(serde_json::json!({ "error": error_message }))).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::ServiceUnavailable(err.to_string())
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Creation(msg) => AppError::InternalServerError(msg),
            SessionError::Invalid(msg) => AppError::Unauthorized(msg),
        }
    }
}

impl From<CredentialError> for AppError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::CacheMiss(_) | CredentialError::NotRenewable(_) => {
                AppError::Unauthorized(format!("{err}; sign in with GitHub again"))
            }
            CredentialError::RefreshFailed { .. } | CredentialError::MintFailed { .. } => {
                AppError::Upstream(err.to_string())
            }
            CredentialError::StoreUnavailable(e) => e.into(),
        }
    }
}

impl From<InstallationError> for AppError {
    fn from(err: InstallationError) -> Self {
        match err {
            InstallationError::NotAssociated { .. } => AppError::Forbidden(err.to_string()),
            InstallationError::Credential(e) => e.into(),
            InstallationError::GitHub(e) => AppError::Upstream(e.to_string()),
            InstallationError::Store(e) => e.into(),
        }
    }
}

impl From<ConnectError> for AppError {
    fn from(err: ConnectError) -> Self {
        match err {
            ConnectError::RateLimited { .. } => AppError::TooManyRequests(err.to_string()),
            ConnectError::NotFound => AppError::NotFound(err.to_string()),
            ConnectError::AlreadyRedeemed => AppError::Conflict(err.to_string()),
            ConnectError::InvalidPayload(_) | ConnectError::UnknownPlatform(_) => {
                AppError::InvalidInput(err.to_string())
            }
            ConnectError::Store(e) => e.into(),
        }
    }
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Config(_) => AppError::InvalidInput(err.to_string()),
            DispatchError::Send { .. } | DispatchError::DeadlineExceeded { .. } => {
                AppError::Upstream(err.to_string())
            }
        }
    }
}

impl From<SettingsError> for AppError {
    fn from(err: SettingsError) -> Self {
        match err {
            SettingsError::TooMany(_) | SettingsError::Invalid(_) => AppError::InvalidInput(err.to_string()),
            SettingsError::Installation(e) => e.into(),
            SettingsError::Store(e) => e.into(),
            SettingsError::Dispatch(e) => e.into(),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidInput(format!("JSON deserialization error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::connect_service::Platform;

    #[test]
    fn connect_errors_map_to_statuses() {
        let cases = [
            (ConnectError::RateLimited { platform: Platform::Telegram }, StatusCode::TOO_MANY_REQUESTS),
            (ConnectError::NotFound, StatusCode::NOT_FOUND),
            (ConnectError::AlreadyRedeemed, StatusCode::CONFLICT),
            (ConnectError::UnknownPlatform("irc".into()), StatusCode::BAD_REQUEST),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).into_response().status(), status);
        }
    }

    #[test]
    fn missing_delegated_credential_asks_to_sign_in() {
        let response = AppError::from(CredentialError::CacheMiss("alice".into())).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn unassociated_account_is_forbidden() {
        let err = InstallationError::NotAssociated { account: "acme".into() };
        let response = AppError::from(SettingsError::from(err)).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
