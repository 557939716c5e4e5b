//!
//! tripgate HTTP server
//! --------------------
//! This module defines the Axum-based HTTP surface for the gate: the login
//! and logout endpoints that issue and revoke the credential cookie, the
//! session-probe endpoint the client guard calls, the redirect target stub
//! pages, and the protected areas the edge gate fronts.
//!
//! Responsibilities:
//! - Session issuance with a cookie + CSRF token model.
//! - Login/logout endpoints backed by the `identity` user directory.
//! - `GET /auth/me` session probe returning the caller's roles.
//! - The edge gate mounted as a layer over every route.

use std::{collections::HashMap, net::SocketAddr};

use anyhow::Context;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{middleware, Extension, Json, Router};
use getrandom::getrandom;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::config::{GateConfig, ServerConfig};
use crate::error::{AppError, AppResult};
use crate::gate::{self, bearer_cookie, GateState, RequestContext};
use crate::identity::{self, SessionManager};

/// Shared server state injected into all handlers.
///
/// Holds the user-directory root, the gate's policy/config pair, the
/// session manager, and the per-session CSRF tokens (keyed by the session
/// token the cookie carries).
#[derive(Clone)]
pub struct AppState {
    pub data_root: String,
    pub gate: GateState,
    pub sm: std::sync::Arc<SessionManager>,
    /// Session token -> CSRF token mapping
    pub csrf_tokens: std::sync::Arc<RwLock<HashMap<String, String>>>,
}

impl AppState {
    pub fn new(data_root: impl Into<String>, policy: crate::policy::RoutePolicy, cfg: GateConfig) -> Self {
        Self {
            data_root: data_root.into(),
            gate: GateState::new(policy, cfg),
            sm: std::sync::Arc::new(SessionManager::default()),
            csrf_tokens: std::sync::Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

fn log_startup(cfg: &ServerConfig) {
    let cwd = std::env::current_dir().ok();
    let data_path = std::path::Path::new(&cfg.data_root);
    info!(
        target: "startup",
        "tripgate starting. cwd={:?}, data_root='{}' (exists={}), policy_file={:?}, admin_bypass={}",
        cwd, cfg.data_root, data_path.exists(), cfg.policy_file, cfg.admin_bypass
    );
}

/// Mount every route and layer the edge gate over the lot, so the policy
/// table is the single place deciding which areas need which roles.
pub fn build_router(state: AppState) -> Router {
    let gate_state = state.gate.clone();
    Router::new()
        .route("/", get(|| async { "tripgate ok" }))
        .route("/login", get(login_page).post(login))
        .route("/logout", post(logout))
        .route("/csrf", get(get_csrf))
        .route("/auth/me", get(whoami))
        .route("/403", get(forbidden_page))
        .route("/admin", get(admin_overview))
        .route("/staff/dashboard", get(staff_dashboard))
        .route("/account", get(account_profile))
        .route("/bookings", get(bookings))
        .layer(middleware::from_fn_with_state(gate_state, gate::authorize))
        .with_state(state)
}

/// Start the tripgate HTTP server: ensure the user directory exists (with
/// its default admin), resolve the policy table, and serve.
pub async fn run_with_config(cfg: ServerConfig) -> anyhow::Result<()> {
    log_startup(&cfg);

    std::fs::create_dir_all(&cfg.data_root)
        .with_context(|| format!("Failed to create or access data root: {}", cfg.data_root))?;
    identity::ensure_default_admin(&cfg.data_root)
        .with_context(|| format!("While ensuring default admin under data_root: {}", cfg.data_root))?;

    let policy = cfg.load_policy()?;
    info!("route policy: {} rule(s), admin_bypass={}", policy.rules.len(), policy.admin_bypass);

    let state = AppState::new(cfg.data_root.clone(), policy, GateConfig::default());
    let app = build_router(state);

    let addr: SocketAddr = format!("0.0.0.0:{}", cfg.http_port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Convenience entry point using env-var configuration.
pub async fn run() -> anyhow::Result<()> {
    run_with_config(ServerConfig::from_env()).await
}

#[derive(Debug, Deserialize)]
struct LoginPayload {
    username: String,
    password: String,
}

fn gen_hex(bytes: usize) -> String {
    use std::fmt::Write as _;
    let mut buf = vec![0u8; bytes];
    let _ = getrandom(&mut buf);
    let mut out = String::with_capacity(bytes * 2);
    for b in &buf {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

fn set_session_cookie(cfg: &GateConfig, token: &str) -> HeaderValue {
    // HttpOnly cookie scoped to path / with SameSite=Strict
    HeaderValue::from_str(&format!(
        "{}={}; HttpOnly; Secure; SameSite=Strict; Path=/",
        cfg.session_cookie, token
    ))
    .unwrap()
}

fn clear_session_cookie(cfg: &GateConfig) -> HeaderValue {
    HeaderValue::from_str(&format!(
        "{}=deleted; Expires=Thu, 01 Jan 1970 00:00:00 GMT; HttpOnly; Secure; SameSite=Strict; Path=/",
        cfg.session_cookie
    ))
    .unwrap()
}

async fn validate_csrf(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(tok) = bearer_cookie(headers, &state.gate.cfg) else { return false; };
    let Some(provided) = headers.get("x-csrf-token").and_then(|v| v.to_str().ok()).map(|s| s.to_string()) else { return false; };
    let cmap = state.csrf_tokens.read().await;
    match cmap.get(&tok) {
        Some(expected) => expected == &provided,
        None => false,
    }
}

async fn login(State(state): State<AppState>, Json(payload): Json<LoginPayload>) -> impl IntoResponse {
    match identity::authenticate(&state.data_root, &payload.username, &payload.password) {
        Ok(Some(principal)) => {
            let session = state.sm.issue(principal);
            let csrf = gen_hex(32);
            {
                let mut cmap = state.csrf_tokens.write().await;
                cmap.insert(session.token.clone(), csrf);
            }
            let mut headers = HeaderMap::new();
            headers.insert("Set-Cookie", set_session_cookie(&state.gate.cfg, &session.token));
            (StatusCode::OK, headers, Json(json!({"status":"ok"})))
        }
        Ok(None) => (StatusCode::UNAUTHORIZED, HeaderMap::new(), Json(json!({"status":"unauthorized"}))),
        Err(e) => {
            error!("login error: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new(), Json(json!({"status":"error","error": e.to_string()})))
        }
    }
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> AppResult<impl IntoResponse> {
    // Require CSRF token
    if !validate_csrf(&state, &headers).await {
        return Err(AppError::csrf("invalid_csrf", "missing or stale csrf token"));
    }
    if let Some(tok) = bearer_cookie(&headers, &state.gate.cfg) {
        state.sm.logout(&tok);
        let mut cmap = state.csrf_tokens.write().await;
        cmap.remove(&tok);
    }
    let mut h = HeaderMap::new();
    h.insert("Set-Cookie", clear_session_cookie(&state.gate.cfg));
    Ok((StatusCode::OK, h, Json(json!({"status":"ok"}))))
}

async fn get_csrf(State(state): State<AppState>, headers: HeaderMap) -> AppResult<impl IntoResponse> {
    // Must be logged in to fetch a CSRF token
    let Some(tok) = bearer_cookie(&headers, &state.gate.cfg) else {
        return Err(AppError::auth("unauthorized", "login required"));
    };
    if state.sm.validate(&tok).is_none() {
        return Err(AppError::auth("unauthorized", "login required"));
    }
    let cmap = state.csrf_tokens.read().await;
    match cmap.get(&tok) {
        Some(csrf) => Ok(Json(json!({"status":"ok","csrf": csrf}))),
        None => Err(AppError::internal("csrf_missing", "csrf not available")),
    }
}

/// Session probe: the client guard's "who am I". Any non-2xx means
/// unauthenticated to the caller, so this only distinguishes 200 and 401.
async fn whoami(State(state): State<AppState>, headers: HeaderMap) -> AppResult<impl IntoResponse> {
    let principal = bearer_cookie(&headers, &state.gate.cfg).and_then(|tok| state.sm.validate(&tok));
    match principal {
        Some(p) => Ok(Json(json!({
            "status": "ok",
            "data": { "user": { "id": p.user_id, "roles": p.roles } }
        }))),
        None => Err(AppError::auth("unauthorized", "no active session")),
    }
}

async fn login_page() -> impl IntoResponse {
    // Redirect target; the `redirect` query parameter is consumed by the
    // client after authentication.
    "tripgate login"
}

async fn forbidden_page() -> impl IntoResponse {
    (StatusCode::FORBIDDEN, "forbidden")
}

async fn admin_overview(Extension(ctx): Extension<RequestContext>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "area": "admin",
        "request_id": ctx.request_id,
        "subject": ctx.subject,
        "roles": ctx.roles,
    }))
}

async fn staff_dashboard(Extension(ctx): Extension<RequestContext>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "area": "staff",
        "subject": ctx.subject,
        "open_tours": 4,
        "pending_transfers": 2,
    }))
}

async fn account_profile(Extension(ctx): Extension<RequestContext>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "area": "account",
        "subject": ctx.subject,
        "roles": ctx.roles,
    }))
}

async fn bookings(Extension(ctx): Extension<RequestContext>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "area": "bookings",
        "subject": ctx.subject,
        "items": [],
    }))
}
