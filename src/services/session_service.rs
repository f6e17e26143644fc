use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SESSION_COOKIE: &str = "session";
pub const SESSION_LIFETIME_HOURS: i64 = 24;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("JWT creation failed: {0}")]
    Creation(String),
    #[error("invalid session: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// GitHub login.
    pub sub: String,
    pub exp: usize,
}

/// HS256 session tokens naming the signed-in GitHub login.
pub struct SessionService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl SessionService {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 5;
        Self {
            encoding: EncodingKey::from_secret(secret.as_ref()),
            decoding: DecodingKey::from_secret(secret.as_ref()),
            validation,
        }
    }

    /// Signs a session for `login`. Called by whatever completes the OAuth
    /// sign-in, after it has stored the login's delegated token.
    pub fn issue(&self, login: &str) -> Result<String, SessionError> {
        let expiration = (Utc::now() + Duration::hours(SESSION_LIFETIME_HOURS)).timestamp() as usize;
        let claims = Claims {
            sub: login.to_owned(),
            exp: expiration,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| SessionError::Creation(e.to_string()))
    }

    /// Returns the login the token was issued for.
    pub fn verify(&self, token: &str) -> Result<String, SessionError> {
        let token_data = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| SessionError::Invalid(e.to_string()))?;
        Ok(token_data.claims.sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_sessions_verify_to_their_login() {
        let sessions = SessionService::new("s3cret");
        let token = sessions.issue("alice").unwrap();
        assert_eq!(sessions.verify(&token).unwrap(), "alice");
    }

    #[test]
    fn other_secrets_are_rejected() {
        let token = SessionService::new("one").issue("alice").unwrap();
        assert!(matches!(
            SessionService::new("two").verify(&token),
            Err(SessionError::Invalid(_))
        ));
    }

    #[test]
    fn expired_sessions_are_rejected() {
        let claims = Claims {
            sub: "alice".into(),
            exp: (Utc::now() - Duration::minutes(5)).timestamp() as usize,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"s3cret"),
        )
        .unwrap();
        assert!(SessionService::new("s3cret").verify(&token).is_err());
    }
}
