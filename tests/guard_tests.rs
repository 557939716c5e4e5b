//! Client guard state-machine tests: checking-then-settle, the fallback
//! path when the probe fails, and unmount cancellation. The probe,
//! navigator, and role cache are all substituted so every branch is
//! reachable without a network.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;

use tripgate::config::GateConfig;
use tripgate::guard::{self, GuardSpec, GuardState, Navigator, ProbeError, SessionProbe};
use tripgate::identity::{CachedRoles, IdentityProvider, StaticRoles};
use tripgate::policy::{PolicyRule, Role, RoutePolicy};

fn booking_policy() -> Arc<RoutePolicy> {
    Arc::new(RoutePolicy::new(vec![
        PolicyRule::new("/admin", vec![Role::Admin]),
        PolicyRule::new("/staff", vec![Role::Admin, Role::Staff]),
        PolicyRule::new("/account", vec![Role::Customer, Role::Staff, Role::Admin]),
    ]))
}

fn spec_for(path: &str) -> GuardSpec {
    GuardSpec::for_path(booking_policy(), &GateConfig::default(), path)
}

/// Probe answering with a canned outcome.
struct StubProbe {
    outcome: Mutex<Option<Result<serde_json::Value, ProbeError>>>,
}

impl StubProbe {
    fn ok(body: serde_json::Value) -> Arc<Self> {
        Arc::new(Self { outcome: Mutex::new(Some(Ok(body))) })
    }

    fn status(code: u16) -> Arc<Self> {
        Arc::new(Self { outcome: Mutex::new(Some(Err(ProbeError::Status(code)))) })
    }

    fn transport() -> Arc<Self> {
        Arc::new(Self { outcome: Mutex::new(Some(Err(ProbeError::Transport("connection refused".into()))) ) })
    }
}

#[async_trait]
impl SessionProbe for StubProbe {
    async fn whoami(&self) -> Result<serde_json::Value, ProbeError> {
        self.outcome.lock().take().expect("probe called more than once")
    }
}

/// Probe that never settles until told to, for cancellation tests.
struct GatedProbe {
    release: Mutex<Option<watch::Receiver<bool>>>,
}

impl GatedProbe {
    fn new() -> (Arc<Self>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (Arc::new(Self { release: Mutex::new(Some(rx)) }), tx)
    }
}

#[async_trait]
impl SessionProbe for GatedProbe {
    async fn whoami(&self) -> Result<serde_json::Value, ProbeError> {
        let mut rx = self.release.lock().take().expect("probe called more than once");
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        Ok(json!({"user": {"roles": ["admin"]}}))
    }
}

#[derive(Default)]
struct RecordingNav {
    calls: Mutex<Vec<String>>,
}

impl Navigator for RecordingNav {
    fn replace(&self, to: &str) {
        self.calls.lock().push(to.to_string());
    }
}

/// Role cache whose stored value cannot be parsed.
struct BrokenCache {
    changes: watch::Sender<Vec<Role>>,
}

impl BrokenCache {
    fn new() -> Arc<Self> {
        let (changes, _) = watch::channel(Vec::new());
        Arc::new(Self { changes })
    }
}

impl IdentityProvider for BrokenCache {
    fn current_roles(&self) -> anyhow::Result<Vec<Role>> {
        anyhow::bail!("stored role list is corrupt")
    }

    fn subscribe(&self) -> watch::Receiver<Vec<Role>> {
        self.changes.subscribe()
    }
}

fn empty_cache() -> Arc<StaticRoles> {
    Arc::new(StaticRoles::new(Vec::new()))
}

#[tokio::test]
async fn guard_is_checking_on_mount_then_settles_once() {
    let probe = StubProbe::ok(json!({"data": {"user": {"roles": ["staff"]}}}));
    let nav = Arc::new(RecordingNav::default());
    let mut handle = guard::mount(spec_for("/staff/dashboard"), probe, empty_cache(), nav.clone());

    // Synchronously Checking before the probe has a chance to run
    assert_eq!(handle.state(), GuardState::Checking);

    assert_eq!(handle.settled().await, GuardState::Authorized);
    assert_eq!(handle.state(), GuardState::Authorized);
    assert!(nav.calls.lock().is_empty(), "authorized guard must not navigate");
}

#[tokio::test]
async fn insufficient_session_roles_navigate_to_forbidden() {
    // Probe succeeds but the user holds no roles at all
    let probe = StubProbe::ok(json!({"user": {"roles": []}}));
    let nav = Arc::new(RecordingNav::default());
    let mut handle = guard::mount(spec_for("/account"), probe, empty_cache(), nav.clone());

    assert_eq!(handle.settled().await, GuardState::Unauthorized);
    assert_eq!(*nav.calls.lock(), vec!["/403".to_string()]);
}

#[tokio::test]
async fn probe_401_falls_back_to_cached_admin_roles() {
    // Cached role list on disk, read through the real provider
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("roles.json");
    std::fs::write(&cache_path, r#"["admin"]"#).unwrap();
    let cache = Arc::new(CachedRoles::new(cache_path));

    let nav = Arc::new(RecordingNav::default());
    let mut handle = guard::mount(spec_for("/staff/dashboard"), StubProbe::status(401), cache, nav.clone());

    assert_eq!(handle.settled().await, GuardState::Authorized);
    assert!(nav.calls.lock().is_empty(), "fallback admission must not navigate");
}

#[tokio::test]
async fn failed_probe_and_failed_fallback_redirect_to_login() {
    let cache = Arc::new(StaticRoles::new(vec![Role::Customer]));
    let nav = Arc::new(RecordingNav::default());
    let mut handle = guard::mount(spec_for("/staff/dashboard"), StubProbe::transport(), cache, nav.clone());

    assert_eq!(handle.settled().await, GuardState::Unauthorized);
    assert_eq!(*nav.calls.lock(), vec!["/login?redirect=%2Fstaff%2Fdashboard".to_string()]);
}

#[tokio::test]
async fn corrupt_cache_counts_as_no_roles() {
    let nav = Arc::new(RecordingNav::default());
    let mut handle = guard::mount(spec_for("/account"), StubProbe::status(503), BrokenCache::new(), nav.clone());

    assert_eq!(handle.settled().await, GuardState::Unauthorized);
    assert_eq!(*nav.calls.lock(), vec!["/login?redirect=%2Faccount".to_string()]);
}

#[tokio::test]
async fn guard_on_unrestricted_path_authorizes_even_when_probe_fails() {
    // No rule matches, so the requirement is empty and admission is open
    let nav = Arc::new(RecordingNav::default());
    let mut handle = guard::mount(spec_for("/tours/rome"), StubProbe::status(401), empty_cache(), nav.clone());

    assert_eq!(handle.settled().await, GuardState::Authorized);
    assert!(nav.calls.lock().is_empty());
}

#[tokio::test]
async fn unmount_before_probe_settles_suppresses_result() {
    let (probe, release) = GatedProbe::new();
    let nav = Arc::new(RecordingNav::default());
    let handle = guard::mount(spec_for("/admin"), probe, empty_cache(), nav.clone());

    let state_rx = handle.watch();
    assert_eq!(*state_rx.borrow(), GuardState::Checking);

    handle.unmount();
    // Let the probe finish after the unmount; nothing may happen
    let _ = release.send(true);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    assert_eq!(*state_rx.borrow(), GuardState::Checking, "no terminal transition after unmount");
    assert!(nav.calls.lock().is_empty(), "no navigation after unmount");
}

#[tokio::test]
async fn dropping_the_handle_cancels_like_unmount() {
    let (probe, release) = GatedProbe::new();
    let nav = Arc::new(RecordingNav::default());
    let handle = guard::mount(spec_for("/admin"), probe, empty_cache(), nav.clone());
    let state_rx = handle.watch();

    drop(handle);
    let _ = release.send(true);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    assert_eq!(*state_rx.borrow(), GuardState::Checking);
    assert!(nav.calls.lock().is_empty());
}

#[tokio::test]
async fn independent_guards_settle_independently() {
    let nav = Arc::new(RecordingNav::default());
    let staff_probe = StubProbe::ok(json!({"data": {"user": {"roles": ["staff"]}}}));
    let admin_probe = StubProbe::ok(json!({"data": {"user": {"roles": ["staff"]}}}));

    let mut staff = guard::mount(spec_for("/staff/dashboard"), staff_probe, empty_cache(), nav.clone());
    let mut admin = guard::mount(spec_for("/admin"), admin_probe, empty_cache(), nav.clone());

    assert_eq!(staff.settled().await, GuardState::Authorized);
    assert_eq!(admin.settled().await, GuardState::Unauthorized);
    assert_eq!(*nav.calls.lock(), vec!["/403".to_string()]);
}
