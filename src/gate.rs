//! Edge gate: the synchronous authorization checkpoint every inbound
//! request passes before reaching a handler.
//!
//! The decision is computed fresh per request from the route policy table
//! and the credential cookie alone — no I/O, no shared mutable state — so
//! evaluation is safe to run concurrently across requests. Which redirect a
//! failure takes depends on token presence, not validity: no token on a
//! restricted path goes to login (with a `redirect` return parameter), a
//! present-but-useless token goes to the forbidden page.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use tracing::debug;
use uuid::Uuid;

use crate::config::GateConfig;
use crate::policy::{parse_roles, Role, RoutePolicy};
use crate::token;

/// Terminal outcome of one gate evaluation. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow { subject: Option<String>, roles: Vec<Role> },
    RedirectLogin { to: String },
    RedirectForbidden { to: String },
}

/// Attached to admitted requests so handlers can see what the gate saw.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub subject: Option<String>,
    pub roles: Vec<Role>,
}

/// Shared state for the middleware layer.
#[derive(Clone)]
pub struct GateState {
    pub policy: Arc<RoutePolicy>,
    pub cfg: Arc<GateConfig>,
}

impl GateState {
    pub fn new(policy: RoutePolicy, cfg: GateConfig) -> Self {
        Self { policy: Arc::new(policy), cfg: Arc::new(cfg) }
    }
}

pub fn parse_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookie = headers.get("cookie").or_else(|| headers.get("Cookie"))?;
    let s = cookie.to_str().ok()?;
    for part in s.split(';') {
        let p = part.trim();
        if let Some(eq) = p.find('=') {
            let (k, v) = p.split_at(eq);
            if k == name { return Some(v[1..].to_string()); }
        }
    }
    None
}

/// The credential cookie, primary name first, then the legacy name.
pub fn bearer_cookie(headers: &HeaderMap, cfg: &GateConfig) -> Option<String> {
    parse_cookie(headers, &cfg.session_cookie).or_else(|| parse_cookie(headers, &cfg.legacy_cookie))
}

/// Pure decision function. `path` excludes the query string; `query` is the
/// raw query when one was present, preserved into the login return target.
pub fn evaluate(
    policy: &RoutePolicy,
    cfg: &GateConfig,
    path: &str,
    query: Option<&str>,
    tok: Option<&str>,
) -> Decision {
    let Some(required) = policy.required_for(path) else {
        return Decision::Allow { subject: None, roles: Vec::new() };
    };
    if required.is_empty() {
        return Decision::Allow { subject: None, roles: Vec::new() };
    }

    let Some(tok) = tok else {
        let original = match query {
            Some(q) if !q.is_empty() => format!("{}?{}", path, q),
            _ => path.to_string(),
        };
        let to = format!("{}?redirect={}", cfg.login_path, urlencoding::encode(&original));
        return Decision::RedirectLogin { to };
    };

    // A malformed token decodes to no claims at all: the holder is treated
    // as role-less, which lands on the forbidden branch below.
    let payload = token::decode_unverified(tok).unwrap_or_default();
    let roles = parse_roles(&payload.role_claims());
    if policy.admits(&roles, required) {
        Decision::Allow { subject: payload.sub, roles }
    } else {
        Decision::RedirectForbidden { to: cfg.forbidden_path.clone() }
    }
}

/// Axum middleware applying [`evaluate`] to every request. Admitted
/// requests proceed with a [`RequestContext`] extension; the rest get a 307
/// to the login or forbidden page.
pub async fn authorize(State(gate): State<GateState>, mut req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(|q| q.to_string());
    let tok = bearer_cookie(req.headers(), &gate.cfg);

    match evaluate(&gate.policy, &gate.cfg, &path, query.as_deref(), tok.as_deref()) {
        Decision::Allow { subject, roles } => {
            let ctx = RequestContext { request_id: Uuid::new_v4(), subject, roles };
            req.extensions_mut().insert(ctx);
            next.run(req).await
        }
        Decision::RedirectLogin { to } => {
            debug!(target: "gate", %path, "no credential, redirecting to login");
            Redirect::temporary(&to).into_response()
        }
        Decision::RedirectForbidden { to } => {
            debug!(target: "gate", %path, "credential lacks required role");
            Redirect::temporary(&to).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyRule;
    use axum::http::HeaderValue;

    fn policy() -> RoutePolicy {
        RoutePolicy::new(vec![
            PolicyRule::new("/admin", vec![Role::Admin]),
            PolicyRule::new("/staff", vec![Role::Admin, Role::Staff]),
        ])
    }

    fn cfg() -> GateConfig {
        GateConfig::default()
    }

    fn staff_token() -> String {
        token::encode_claims("pat", &[Role::Staff], None)
    }

    #[test]
    fn open_path_allows_without_token() {
        let d = evaluate(&policy(), &cfg(), "/tours/venice", None, None);
        assert!(matches!(d, Decision::Allow { .. }));
    }

    #[test]
    fn open_path_allows_with_garbage_token() {
        let d = evaluate(&policy(), &cfg(), "/", None, Some("!!!"));
        assert!(matches!(d, Decision::Allow { .. }));
    }

    #[test]
    fn missing_token_redirects_to_login_with_return_path() {
        let d = evaluate(&policy(), &cfg(), "/staff/rota", Some("week=34"), None);
        assert_eq!(d, Decision::RedirectLogin { to: "/login?redirect=%2Fstaff%2Frota%3Fweek%3D34".into() });
    }

    #[test]
    fn malformed_token_redirects_to_forbidden_not_login() {
        let d = evaluate(&policy(), &cfg(), "/staff/rota", None, Some("not-a-token"));
        assert_eq!(d, Decision::RedirectForbidden { to: "/403".into() });
    }

    #[test]
    fn matching_role_is_admitted() {
        let tok = staff_token();
        let d = evaluate(&policy(), &cfg(), "/staff/rota", None, Some(&tok));
        match d {
            Decision::Allow { subject, roles } => {
                assert_eq!(subject.as_deref(), Some("pat"));
                assert_eq!(roles, vec![Role::Staff]);
            }
            other => panic!("expected Allow, got {:?}", other),
        }
    }

    #[test]
    fn wrong_role_is_forbidden() {
        let tok = token::encode_claims("guest", &[Role::Customer], None);
        let d = evaluate(&policy(), &cfg(), "/staff/rota", None, Some(&tok));
        assert_eq!(d, Decision::RedirectForbidden { to: "/403".into() });
    }

    #[test]
    fn cookie_priority_prefers_primary_name() {
        let c = cfg();
        let mut headers = HeaderMap::new();
        headers.insert(
            "cookie",
            HeaderValue::from_str(&format!("{}=legacy-tok; {}=primary-tok", c.legacy_cookie, c.session_cookie)).unwrap(),
        );
        assert_eq!(bearer_cookie(&headers, &c).as_deref(), Some("primary-tok"));

        let mut only_legacy = HeaderMap::new();
        only_legacy.insert("cookie", HeaderValue::from_str(&format!("{}=legacy-tok", c.legacy_cookie)).unwrap());
        assert_eq!(bearer_cookie(&only_legacy, &c).as_deref(), Some("legacy-tok"));
    }

    #[test]
    fn parse_cookie_ignores_partial_name_matches() {
        let mut headers = HeaderMap::new();
        headers.insert("cookie", HeaderValue::from_static("xtripgate_token=no; tripgate_token=yes"));
        assert_eq!(parse_cookie(&headers, "tripgate_token").as_deref(), Some("yes"));
    }
}
