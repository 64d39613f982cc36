// ABOUTME: Bearer token verification against the auth provider's JWT signing secret
// ABOUTME: Yields the {user_id, email} identity every handler authorizes against
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Chifa.ai

//! # Authentication
//!
//! Inbound requests carry `Authorization: Bearer <token>`. The token is an
//! HS256 JWT issued by the auth provider; this module verifies it and
//! extracts the caller identity. Token issuance (signup, login, refresh)
//! lives with the auth provider, not here - `generate_token` exists for
//! service tooling and tests.

use crate::constants::{limits::SESSION_EXPIRY_HOURS, service_names::JWT_AUDIENCE};
use crate::errors::{AppError, AppResult};
use axum::http::HeaderMap;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// JWT claims carried by an auth-provider token
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User ID
    pub sub: String,
    /// User email
    pub email: String,
    /// Issued at timestamp
    pub iat: i64,
    /// Expiration timestamp
    pub exp: i64,
    /// Audience
    pub aud: String,
}

/// Authenticated caller identity
#[derive(Debug, Clone)]
pub struct AuthResult {
    /// Verified user ID
    pub user_id: String,
    /// Verified email
    pub email: String,
}

/// Verifies bearer tokens against the shared signing secret
#[derive(Clone)]
pub struct AuthManager {
    secret: Vec<u8>,
    expiry_hours: i64,
}

impl AuthManager {
    /// Create a manager with the auth provider's signing secret
    #[must_use]
    pub fn new(secret: Vec<u8>, expiry_hours: i64) -> Self {
        Self {
            secret,
            expiry_hours,
        }
    }

    /// Create a manager with the default session expiry
    #[must_use]
    pub fn with_default_expiry(secret: Vec<u8>) -> Self {
        // Safe: expiry hours are small positive configuration values
        #[allow(clippy::cast_possible_wrap)]
        Self::new(secret, SESSION_EXPIRY_HOURS as i64)
    }

    /// Issue a token for a user (service tooling and tests)
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn generate_token(&self, user_id: &str, email: &str) -> AppResult<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_owned(),
            email: email.to_owned(),
            iat: now.timestamp(),
            exp: (now + Duration::hours(self.expiry_hours)).timestamp(),
            aud: JWT_AUDIENCE.to_owned(),
        };

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&self.secret),
        )
        .map_err(|e| AppError::internal(format!("Failed to sign token: {e}")))
    }

    /// Verify a bearer token and extract the caller identity
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` for expired, malformed, or badly signed
    /// tokens.
    pub fn validate_token(&self, token: &str) -> AppResult<AuthResult> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[JWT_AUDIENCE]);

        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(&self.secret),
            &validation,
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                AppError::unauthorized("Token expired")
            }
            jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                AppError::unauthorized("Invalid token signature")
            }
            _ => AppError::unauthorized(format!("Invalid token: {e}")),
        })?;

        Ok(AuthResult {
            user_id: data.claims.sub,
            email: data.claims.email,
        })
    }

    /// Authenticate a request from its headers
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` when the header is missing, not a bearer
    /// scheme, or carries an invalid token.
    pub fn authenticate_request(&self, headers: &HeaderMap) -> AppResult<AuthResult> {
        let token = extract_bearer(headers)
            .ok_or_else(|| AppError::unauthorized("Missing authorization header"))?;
        self.validate_token(token)
    }
}

/// Pull the bearer token out of the Authorization header
#[must_use]
pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn manager() -> AuthManager {
        AuthManager::with_default_expiry(b"test-secret".to_vec())
    }

    #[test]
    fn test_token_round_trip() {
        let manager = manager();
        let token = manager.generate_token("user-1", "ph@example.fr").unwrap();
        let auth = manager.validate_token(&token).unwrap();
        assert_eq!(auth.user_id, "user-1");
        assert_eq!(auth.email, "ph@example.fr");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = manager().generate_token("user-1", "ph@example.fr").unwrap();
        let other = AuthManager::with_default_expiry(b"other-secret".to_vec());
        assert!(other.validate_token(&token).is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let expired = AuthManager::new(b"test-secret".to_vec(), -1);
        let token = expired.generate_token("user-1", "ph@example.fr").unwrap();
        let err = manager().validate_token(&token).unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::Unauthorized);
    }

    #[test]
    fn test_extract_bearer() {
        let mut headers = HeaderMap::new();
        assert!(extract_bearer(&headers).is_none());

        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc123"),
        );
        assert_eq!(extract_bearer(&headers), Some("abc123"));

        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Basic abc123"),
        );
        assert!(extract_bearer(&headers).is_none());
    }

    #[test]
    fn test_garbage_token_rejected() {
        let err = manager().validate_token("not.a.jwt").unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::Unauthorized);
    }
}
