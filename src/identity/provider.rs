use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::sync::watch;

use crate::policy::{parse_roles, Role};

/// Single abstraction over "where do this client's roles live right now".
/// The client guard's fallback path reads through this instead of poking at
/// cookies or cache files itself; other frontends can subscribe to changes.
pub trait IdentityProvider: Send + Sync {
    fn current_roles(&self) -> Result<Vec<Role>>;
    fn subscribe(&self) -> watch::Receiver<Vec<Role>>;
}

/// Read-only view of the role list a prior login cached on this client.
/// The file is written elsewhere (at login); this subsystem only reads it.
/// An absent file means "no cached roles"; an unreadable or corrupt file is
/// an error the caller treats as empty.
pub struct CachedRoles {
    path: PathBuf,
    changes: watch::Sender<Vec<Role>>,
}

impl CachedRoles {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (changes, _) = watch::channel(Vec::new());
        Self { path: path.into(), changes }
    }

    fn read_file(path: &Path) -> Result<Vec<Role>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading cached roles from {}", path.display()))?;
        let value: serde_json::Value = serde_json::from_str(&raw)
            .with_context(|| format!("cached roles at {} are not valid JSON", path.display()))?;
        // Either a bare array of role strings or an object with a "roles" key
        let arr = value
            .as_array()
            .or_else(|| value.get("roles").and_then(|v| v.as_array()))
            .context("cached roles JSON holds neither an array nor a roles key")?;
        let claims: Vec<String> = arr.iter().filter_map(|v| v.as_str()).map(String::from).collect();
        Ok(parse_roles(&claims))
    }
}

impl IdentityProvider for CachedRoles {
    fn current_roles(&self) -> Result<Vec<Role>> {
        let roles = Self::read_file(&self.path)?;
        self.changes.send_replace(roles.clone());
        Ok(roles)
    }

    fn subscribe(&self) -> watch::Receiver<Vec<Role>> {
        self.changes.subscribe()
    }
}

/// Fixed role set, for embedding and tests.
pub struct StaticRoles {
    changes: watch::Sender<Vec<Role>>,
}

impl StaticRoles {
    pub fn new(roles: Vec<Role>) -> Self {
        let (changes, _) = watch::channel(roles);
        Self { changes }
    }

    pub fn set(&self, roles: Vec<Role>) {
        self.changes.send_replace(roles);
    }
}

impl IdentityProvider for StaticRoles {
    fn current_roles(&self) -> Result<Vec<Role>> {
        Ok(self.changes.borrow().clone())
    }

    fn subscribe(&self) -> watch::Receiver<Vec<Role>> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_cache_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CachedRoles::new(dir.path().join("roles.json"));
        assert_eq!(cache.current_roles().unwrap(), Vec::<Role>::new());
    }

    #[test]
    fn cache_accepts_bare_array_and_object_forms() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("roles.json");

        std::fs::write(&p, r#"["Staff","admin","ghost"]"#).unwrap();
        let cache = CachedRoles::new(&p);
        assert_eq!(cache.current_roles().unwrap(), vec![Role::Staff, Role::Admin]);

        std::fs::write(&p, r#"{"roles":["customer"]}"#).unwrap();
        assert_eq!(cache.current_roles().unwrap(), vec![Role::Customer]);
    }

    #[test]
    fn corrupt_cache_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("roles.json");
        std::fs::write(&p, "not json {{{{").unwrap();
        assert!(CachedRoles::new(&p).current_roles().is_err());

        std::fs::write(&p, r#"{"user":"nobody"}"#).unwrap();
        assert!(CachedRoles::new(&p).current_roles().is_err());
    }

    #[test]
    fn static_roles_notify_subscribers() {
        let provider = StaticRoles::new(vec![Role::Customer]);
        let rx = provider.subscribe();
        provider.set(vec![Role::Customer, Role::Staff]);
        assert_eq!(*rx.borrow(), vec![Role::Customer, Role::Staff]);
    }
}
