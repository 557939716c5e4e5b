//! Client guard: the asynchronous counterpart of the edge gate, wrapped
//! around a rendered subtree. On mount it probes the who-am-I endpoint and
//! settles into exactly one terminal state; until then callers render a
//! neutral "checking" placeholder off the published state.
//!
//! Every failure is absorbed here: a failed probe falls through once to the
//! locally cached role list, and a corrupt cache counts as no roles. The
//! user only ever sees the protected content or a redirect.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::GateConfig;
use crate::identity::IdentityProvider;
use crate::policy::{parse_roles, Role, RoutePolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Checking,
    Authorized,
    Unauthorized,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("session probe transport failed: {0}")]
    Transport(String),
    #[error("session probe returned HTTP {0}")]
    Status(u16),
}

/// Credentialed "who am I" call against the session endpoint. 2xx resolves
/// `Ok` with the raw body; anything else is an error the guard degrades on.
#[async_trait]
pub trait SessionProbe: Send + Sync {
    async fn whoami(&self) -> Result<serde_json::Value, ProbeError>;
}

/// Where the guard sends the browser. `replace` swaps the current history
/// entry; the guard never pushes.
pub trait Navigator: Send + Sync {
    fn replace(&self, to: &str);
}

/// What one mounted guard protects and where its redirects go.
#[derive(Clone)]
pub struct GuardSpec {
    pub policy: Arc<RoutePolicy>,
    pub required: Vec<Role>,
    /// Location encoded into the login `redirect` parameter.
    pub current_location: String,
    pub login_path: String,
    pub forbidden_path: String,
}

impl GuardSpec {
    /// Derive the requirement from the shared policy table, so a guard
    /// mounted on a path enforces exactly what the edge gate enforces.
    pub fn for_path(policy: Arc<RoutePolicy>, cfg: &GateConfig, path: impl Into<String>) -> Self {
        let path = path.into();
        let required = policy.required_for(&path).map(|r| r.to_vec()).unwrap_or_default();
        Self {
            policy,
            required,
            current_location: path,
            login_path: cfg.login_path.clone(),
            forbidden_path: cfg.forbidden_path.clone(),
        }
    }
}

/// Live handle to a mounted guard. Dropping it (or calling [`unmount`])
/// before the probe settles suppresses the terminal transition and any
/// navigation — a result may not act on an unmounted tree.
///
/// [`unmount`]: GuardHandle::unmount
pub struct GuardHandle {
    state: watch::Receiver<GuardState>,
    cancel: Option<oneshot::Sender<()>>,
    _task: JoinHandle<()>,
}

impl GuardHandle {
    /// Current state; `Checking` synchronously from the moment of mount.
    pub fn state(&self) -> GuardState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<GuardState> {
        self.state.clone()
    }

    /// Wait for the terminal state. Resolves immediately once settled.
    pub async fn settled(&mut self) -> GuardState {
        loop {
            let cur = *self.state.borrow();
            if cur != GuardState::Checking {
                return cur;
            }
            if self.state.changed().await.is_err() {
                return *self.state.borrow();
            }
        }
    }

    pub fn unmount(mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }
}

/// Mount a guard: publish `Checking`, probe, settle once. Guards are
/// independent; mounting several in the same tree means several probes.
pub fn mount(
    spec: GuardSpec,
    probe: Arc<dyn SessionProbe>,
    fallback: Arc<dyn IdentityProvider>,
    nav: Arc<dyn Navigator>,
) -> GuardHandle {
    let (state_tx, state_rx) = watch::channel(GuardState::Checking);
    let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        let outcome = tokio::select! {
            biased;
            _ = &mut cancel_rx => return,
            res = probe.whoami() => res,
        };
        // The handle may have gone away between the probe settling and now;
        // a stale result must not flip state or navigate.
        if !matches!(cancel_rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
            debug!(target: "guard", "unmounted before probe settled, discarding result");
            return;
        }

        let (next, destination) = resolve(&spec, outcome, fallback.as_ref());
        state_tx.send_replace(next);
        if let Some(to) = destination {
            nav.replace(&to);
        }
    });

    GuardHandle { state: state_rx, cancel: Some(cancel_tx), _task: task }
}

/// Map the probe outcome onto the terminal state and an optional redirect.
fn resolve(
    spec: &GuardSpec,
    outcome: Result<serde_json::Value, ProbeError>,
    fallback: &dyn IdentityProvider,
) -> (GuardState, Option<String>) {
    match outcome {
        Ok(body) => {
            let roles = parse_roles(&roles_from_probe(&body));
            if spec.policy.admits(&roles, &spec.required) {
                (GuardState::Authorized, None)
            } else {
                debug!(target: "guard", location = %spec.current_location, "session roles insufficient");
                (GuardState::Unauthorized, Some(spec.forbidden_path.clone()))
            }
        }
        Err(err) => {
            warn!(target: "guard", location = %spec.current_location, "session probe failed: {err}, trying cached roles");
            let cached = fallback.current_roles().unwrap_or_else(|e| {
                warn!(target: "guard", "cached roles unreadable: {e:#}");
                Vec::new()
            });
            if spec.policy.admits(&cached, &spec.required) {
                (GuardState::Authorized, None)
            } else {
                let to = format!(
                    "{}?redirect={}",
                    spec.login_path,
                    urlencoding::encode(&spec.current_location)
                );
                (GuardState::Unauthorized, Some(to))
            }
        }
    }
}

/// Pull the role strings out of the probe body, tolerating both response
/// shapes the backend has used: `data.user.roles` and `user.roles`.
fn roles_from_probe(body: &serde_json::Value) -> Vec<String> {
    let node = body
        .get("data")
        .and_then(|d| d.get("user"))
        .and_then(|u| u.get("roles"))
        .or_else(|| body.get("user").and_then(|u| u.get("roles")));
    node.and_then(|n| n.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).map(String::from).collect())
        .unwrap_or_default()
}

/// Probe implementation against the live session endpoint. The client's
/// cookie jar carries the credential; no timeout is layered on here beyond
/// whatever the supplied client enforces.
pub struct HttpProbe {
    client: reqwest::Client,
    whoami_url: reqwest::Url,
}

impl HttpProbe {
    pub fn new(base: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().cookie_store(true).build()?;
        Self::with_client(client, base)
    }

    /// Share a client (and its cookie jar) with the rest of the frontend.
    pub fn with_client(client: reqwest::Client, base: &str) -> anyhow::Result<Self> {
        let whoami_url = reqwest::Url::parse(base)?.join("/auth/me")?;
        Ok(Self { client, whoami_url })
    }
}

#[async_trait]
impl SessionProbe for HttpProbe {
    async fn whoami(&self) -> Result<serde_json::Value, ProbeError> {
        let resp = self
            .client
            .get(self.whoami_url.clone())
            .send()
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ProbeError::Status(status.as_u16()));
        }
        resp.json::<serde_json::Value>()
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))
    }
}
