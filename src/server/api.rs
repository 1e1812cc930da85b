use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequestParts, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::authorization::{AccessRequest, Authorizer};
use crate::security::audit_log::AuditLogger;
use crate::security::cache_strategy::{AuthError, CacheStrategy};
use crate::store::PolicyCache;

pub type SharedState = Arc<AppState>;

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<PolicyCache>,
    pub authorizer: Authorizer,
    pub strategy: CacheStrategy,
    pub audit: AuditLogger,
}

impl AppState {
    pub fn new(cache: Arc<PolicyCache>, authorizer: Authorizer, strategy: CacheStrategy) -> Self {
        Self {
            cache,
            authorizer,
            strategy,
            audit: AuditLogger::new(),
        }
    }
}

/// Username of the caller, proven by a bearer token signed with one of the
/// cached secrets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated(pub String);

impl FromRequestParts<SharedState> for Authenticated {
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, state: &SharedState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        state
            .strategy
            .authenticate_header(header)
            .map(Authenticated)
            .map_err(AuthRejection)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub struct AuthRejection(pub AuthError);

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            code: self.0.code().to_string(),
            message: self.0.to_string(),
        };
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthzResponse {
    pub allowed: bool,
    pub denied: bool,
    pub reason: String,
}

async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    let snapshot = state.cache.snapshot();
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "generation": snapshot.generation(),
        "loaded_at": snapshot.loaded_at(),
        "policies": snapshot.policies().len(),
        "secrets": snapshot.secret_count(),
    }))
}

async fn authorize(
    State(state): State<SharedState>,
    Authenticated(username): Authenticated,
    body: Result<Json<AccessRequest>, JsonRejection>,
) -> Response {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            let body = ErrorResponse {
                code: "BadRequest".to_string(),
                message: rejection.body_text(),
            };
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        }
    };

    // the caller's identity always overrides whatever the body claims
    let request = request.with_identity(&username);
    let decision = state.authorizer.evaluate(&request);
    if !decision.allowed {
        state
            .audit
            .access_denied(&username, &request.resource, &request.action, &decision.reason);
    }
    debug!(username = %username, allowed = decision.allowed, "authorization answered");

    Json(AuthzResponse {
        allowed: decision.allowed,
        denied: !decision.allowed,
        reason: decision.reason,
    })
    .into_response()
}

pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v1/authz", post(authorize))
        .with_state(state)
}
