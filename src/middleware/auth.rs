//! Authentication gate for the REST and WebSocket surfaces.
//!
//! Authentication is an external collaborator: when a plugin is registered
//! every request must present a token it accepts; with no plugin the gate
//! is open. Handlers opt in through the `RequireAuth` extractor, which runs
//! before any handler logic.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Identity attached to an authorized request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub principal: String,
}

/// Auth collaborator failures.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no credentials supplied")]
    MissingCredentials,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("auth internal error: {0}")]
    Internal(String),
}

/// External authentication collaborator.
#[async_trait]
pub trait AuthPlugin: Send + Sync {
    async fn authorize(&self, token: &str) -> Result<AuthContext, AuthError>;
}

/// Process-wide auth gate. Allow-all until a plugin is registered.
#[derive(Default)]
pub struct AuthGate {
    plugin: Option<Arc<dyn AuthPlugin>>,
}

impl AuthGate {
    /// An open gate: every request is admitted as anonymous.
    pub fn open() -> Self {
        Self { plugin: None }
    }

    pub fn with_plugin(plugin: Arc<dyn AuthPlugin>) -> Self {
        Self {
            plugin: Some(plugin),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.plugin.is_some()
    }

    /// Authorize a token (or its absence) against the plugin.
    pub async fn authorize(&self, token: Option<&str>) -> Result<AuthContext, AuthError> {
        match &self.plugin {
            None => Ok(AuthContext {
                principal: "anonymous".to_string(),
            }),
            Some(plugin) => {
                let token = token.ok_or(AuthError::MissingCredentials)?;
                plugin.authorize(token).await
            }
        }
    }
}

/// JSON error body for auth failures
#[derive(Debug, Serialize)]
struct AuthErrorResponse {
    error: String,
    code: &'static str,
}

/// Auth rejection type
pub struct AuthRejection {
    status: StatusCode,
    body: AuthErrorResponse,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<AuthError> for AuthRejection {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingCredentials | AuthError::InvalidCredentials => AuthRejection {
                status: StatusCode::UNAUTHORIZED,
                body: AuthErrorResponse {
                    error: err.to_string(),
                    code: "UNAUTHORIZED",
                },
            },
            AuthError::Internal(msg) => AuthRejection {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: AuthErrorResponse {
                    error: msg,
                    code: "INTERNAL_ERROR",
                },
            },
        }
    }
}

/// Axum extractor invoking the auth collaborator before the handler runs.
///
/// Token sources, in order:
/// 1. `Authorization: Bearer <token>` header
/// 2. `X-API-Key: <key>` header
/// 3. `?token=<token>` query parameter (for WebSocket upgrades)
pub struct RequireAuth(pub AuthContext);

#[async_trait]
impl<S> FromRequestParts<S> for RequireAuth
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        let gate = parts
            .extensions
            .get::<Arc<AuthGate>>()
            .ok_or_else(|| AuthError::Internal("AuthGate not configured".to_string()))?;

        let token = extract_token(parts);
        let ctx = gate.authorize(token.as_deref()).await?;
        Ok(RequireAuth(ctx))
    }
}

fn extract_token(parts: &Parts) -> Option<String> {
    if let Some(value) = parts
        .headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }

    if let Some(value) = parts.headers.get("x-api-key").and_then(|h| h.to_str().ok()) {
        return Some(value.trim().to_string());
    }

    if let Some(query) = parts.uri.query() {
        for param in query.split('&') {
            if let Some(token) = param.strip_prefix("token=") {
                return Some(token.to_string());
            }
        }
    }

    None
}
