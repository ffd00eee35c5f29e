//! REST API
//!
//! JSON endpoints over the pool scheduler, with CORS and a session filter.
//! Authorization failures map to 401 and downstream failures to 400; the
//! pool never commits state on a request that fails.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Query, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::auth::{AuthProvider, SessionRegistry, User};
use crate::pool::{EnvPool, InfoParams, PoolError, UpParams};

/// Header carrying the session id / access token.
pub const ACCESS_TOKEN_HEADER: &str = "x-access-token";

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<EnvPool>,
    pub auth: Arc<dyn AuthProvider>,
    pub sessions: Arc<SessionRegistry>,
}

pub fn router(state: AppState, allow_origin: &str) -> Router {
    let protected = Router::new()
        .route("/claim", post(claim))
        .route("/ping", post(ping))
        .route("/info", post(info))
        .route("/up", post(up))
        .route("/whitelist", get(whitelist))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_session,
        ));
    Router::new()
        .route("/health", get(health))
        .route("/me", get(me))
        .route("/auth/callback", get(auth_callback))
        .merge(protected)
        .layer(cors_layer(allow_origin))
        // outermost, so it rewrites the CORS layer's preflight response
        .layer(middleware::from_fn(preflight_no_content))
        .with_state(state)
}

fn cors_layer(allow_origin: &str) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    match allow_origin.parse::<HeaderValue>() {
        Ok(origin) if !allow_origin.is_empty() && allow_origin != "*" => {
            layer.allow_origin(origin)
        }
        _ => layer.allow_origin(Any),
    }
}

/// `OPTIONS` answers with 204 instead of the CORS layer's default 200.
async fn preflight_no_content(request: Request, next: Next) -> Response {
    let preflight = request.method() == Method::OPTIONS;
    let mut response = next.run(request).await;
    if preflight && response.status() == StatusCode::OK {
        *response.status_mut() = StatusCode::NO_CONTENT;
    }
    response
}

/// Session filter for the protected routes.
///
/// Unknown tokens are validated against the auth provider once and then
/// remembered; the resolved user is handed to the handlers through request
/// extensions.
async fn require_session(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(ACCESS_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    if token.is_empty() {
        return error_response(StatusCode::UNAUTHORIZED, "Not authenticated");
    }
    let user = match state.sessions.get(&token).await {
        Some(user) => user,
        None => match state.auth.login_user(&token).await {
            Ok(user) => {
                state.sessions.insert(user.clone()).await;
                user
            }
            Err(e) => {
                warn!(error = %e, "session rejected");
                return error_response(StatusCode::UNAUTHORIZED, "Not authenticated");
            }
        },
    };
    request.extensions_mut().insert(user);
    next.run(request).await
}

// Handlers

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn me(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let token = headers
        .get(ACCESS_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if token.is_empty() {
        return error_response(StatusCode::UNAUTHORIZED, "Not authenticated");
    }
    if !state.sessions.contains(token).await {
        match state.auth.login_user(token).await {
            Ok(user) => state.sessions.insert(user).await,
            Err(_) => return error_response(StatusCode::UNAUTHORIZED, "Not authenticated"),
        }
    }
    Json(json!({ "sessionId": token })).into_response()
}

#[derive(Deserialize)]
struct AuthCallbackQuery {
    #[serde(default)]
    code: String,
    #[serde(default)]
    state: Option<String>,
}

/// OAuth code exchange. The redirect target comes from `state`, with
/// `$accessToken` interpolated.
async fn auth_callback(
    State(state): State<AppState>,
    Query(query): Query<AuthCallbackQuery>,
) -> Response {
    if query.code.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "code missing");
    }
    let user = match state.auth.exchange_code(&query.code).await {
        Ok(user) => user,
        Err(e) => {
            warn!(error = %e, "auth callback failed");
            return error_response(StatusCode::BAD_REQUEST, "error getting access token");
        }
    };
    let token = user.access_token.clone();
    state.sessions.insert(user).await;
    let location = match query.state.as_deref().filter(|s| !s.is_empty()) {
        Some(target) => target.replace("$accessToken", &token),
        None => "/".to_string(),
    };
    redirect(&location)
}

async fn claim(State(state): State<AppState>, Json(_body): Json<serde_json::Value>) -> Response {
    Json(state.pool.claim().await).into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PingRequest {
    #[serde(default)]
    claim_token: String,
    #[serde(default)]
    get_env_details: bool,
}

async fn ping(State(state): State<AppState>, Json(request): Json<PingRequest>) -> Response {
    match state
        .pool
        .ping(&request.claim_token, request.get_env_details)
        .await
    {
        Ok(response) => Json(response).into_response(),
        Err(e) => pool_error_response(e),
    }
}

async fn info(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(request): Json<InfoParams>,
) -> Response {
    if let Some(denied) = check_repo_access(&state, &user, &request.repo).await {
        return denied;
    }
    match state.pool.info(request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => pool_error_response(e),
    }
}

async fn up(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(request): Json<UpParams>,
) -> Response {
    if let Some(denied) = check_repo_access(&state, &user, &request.repo).await {
        return denied;
    }
    match state.pool.up(request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => pool_error_response(e),
    }
}

async fn whitelist(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "repos": state.pool.whitelist() }))
}

/// 401 when the provider denies the repo, 400 when the lookup itself fails.
async fn check_repo_access(state: &AppState, user: &User, repo: &str) -> Option<Response> {
    match state.auth.user_can_view_repo(user, repo).await {
        Ok(true) => None,
        Ok(false) => Some(error_response(StatusCode::UNAUTHORIZED, "Invalid repo")),
        Err(e) => {
            warn!(error = %e, "repo permission check failed");
            Some(error_response(
                StatusCode::BAD_REQUEST,
                "error checking repo permissions",
            ))
        }
    }
}

fn pool_error_response(error: PoolError) -> Response {
    match error {
        PoolError::Unauthorized(message) => error_response(StatusCode::UNAUTHORIZED, message),
        PoolError::Downstream(e) => {
            warn!(error = %e, "request failed downstream");
            error_response(StatusCode::BAD_REQUEST, &format!("{e:#}"))
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn redirect(location: &str) -> Response {
    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(header::LOCATION, location)
        .body(Body::empty())
        .unwrap_or_else(|_| error_response(StatusCode::BAD_REQUEST, "invalid redirect target"))
}
