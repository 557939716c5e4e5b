//! Runtime configuration: gate settings shared by both checkpoints and the
//! env-driven server settings, with defaults matching a local install.

use anyhow::{Context, Result};

use crate::policy::RoutePolicy;

/// Settings the edge gate and the client guard share: where to send the
/// unauthenticated and the unauthorized, and which cookies may carry the
/// credential (primary first, then the legacy name older clients still set).
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub login_path: String,
    pub forbidden_path: String,
    pub session_cookie: String,
    pub legacy_cookie: String,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            login_path: "/login".into(),
            forbidden_path: "/403".into(),
            session_cookie: "tripgate_token".into(),
            legacy_cookie: "access_token".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http_port: u16,
    pub data_root: String,
    /// Optional JSON policy table; the built-in table applies when unset.
    pub policy_file: Option<String>,
    pub admin_bypass: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { http_port: 7878, data_root: "data".into(), policy_file: None, admin_bypass: true }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let http_port = std::env::var("TRIPGATE_HTTP_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(7878);
        let data_root = std::env::var("TRIPGATE_DATA_ROOT").unwrap_or_else(|_| "data".to_string());
        let policy_file = std::env::var("TRIPGATE_POLICY_FILE").ok();
        let admin_bypass = std::env::var("TRIPGATE_ADMIN_BYPASS")
            .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "false" | "0" | "off"))
            .unwrap_or(true);
        Self { http_port, data_root, policy_file, admin_bypass }
    }

    /// Resolve the route policy table: the configured file when present,
    /// otherwise the built-in table. A bypass opt-out in the environment
    /// wins over whatever the file says.
    pub fn load_policy(&self) -> Result<RoutePolicy> {
        let mut policy = match &self.policy_file {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("reading policy table from {}", p))?;
                RoutePolicy::from_json(&raw).with_context(|| format!("parsing policy table {}", p))?
            }
            None => RoutePolicy::default(),
        };
        if !self.admin_bypass {
            policy.admin_bypass = false;
        }
        Ok(policy)
    }
}
