use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use password_hash::{PasswordHash, SaltString};
use serde::{Deserialize, Serialize};

use crate::policy::Role;

use super::principal::Principal;

/// File-backed user directory: a JSON document of user records with Argon2
/// PHC password hashes. Scoped to the data root so tests can point it at a
/// temp directory.

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserRecord {
    user_id: String,
    #[serde(default)]
    display_name: Option<String>,
    password_hash: String,
    #[serde(default)]
    roles: Vec<Role>,
    created_at: i64,
    updated_at: i64,
}

fn users_path(data_root: &str) -> PathBuf {
    Path::new(data_root).join("users.json")
}

fn read_users(path: &Path) -> Result<Vec<UserRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)?;
    let users: Vec<UserRecord> = serde_json::from_str(&raw)?;
    Ok(users)
}

fn write_users(path: &Path, users: &[UserRecord]) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).ok();
    }
    let raw = serde_json::to_string_pretty(users)?;
    std::fs::write(path, raw)?;
    Ok(())
}

pub fn hash_password(password: &str) -> Result<String> {
    let mut salt_bytes = [0u8; 16];
    getrandom::getrandom(&mut salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
    let salt = SaltString::encode_b64(&salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
    let argon2 = Argon2::default();
    let phc = argon2.hash_password(password.as_bytes(), &salt).map_err(|e| anyhow!(e.to_string()))?.to_string();
    Ok(phc)
}

pub fn verify_password(hash: &str, password: &str) -> bool {
    if let Ok(parsed) = PasswordHash::new(hash) {
        let argon2 = Argon2::default();
        argon2.verify_password(password.as_bytes(), &parsed).is_ok()
    } else { false }
}

/// Seed the directory with a default admin on first run so a fresh install
/// is reachable. No-op when the file already exists.
pub fn ensure_default_admin(data_root: &str) -> Result<()> {
    let p = users_path(data_root);
    if p.exists() { return Ok(()); }
    let now = chrono::Utc::now().timestamp_millis();
    let admin = UserRecord {
        user_id: "admin".into(),
        display_name: Some("Platform Admin".into()),
        password_hash: hash_password("tripgate")?,
        roles: vec![Role::Admin],
        created_at: now,
        updated_at: now,
    };
    write_users(&p, &[admin])
}

/// Create or replace a user. Replacement keeps the original creation time.
pub fn add_user(data_root: &str, user_id: &str, display_name: Option<&str>, password: &str, roles: Vec<Role>) -> Result<()> {
    let p = users_path(data_root);
    let mut users = read_users(&p)?;
    let now = chrono::Utc::now().timestamp_millis();
    let created_at = users
        .iter()
        .find(|u| u.user_id.eq_ignore_ascii_case(user_id))
        .map(|u| u.created_at)
        .unwrap_or(now);
    users.retain(|u| !u.user_id.eq_ignore_ascii_case(user_id));
    users.push(UserRecord {
        user_id: user_id.to_string(),
        display_name: display_name.map(String::from),
        password_hash: hash_password(password)?,
        roles,
        created_at,
        updated_at: now,
    });
    write_users(&p, &users)
}

/// Verify credentials; `Ok(Some)` carries the principal the session will be
/// issued for, `Ok(None)` means bad username or password.
pub fn authenticate(data_root: &str, user_id: &str, password: &str) -> Result<Option<Principal>> {
    let users = read_users(&users_path(data_root))?;
    let Some(user) = users.iter().find(|u| u.user_id.eq_ignore_ascii_case(user_id)) else {
        return Ok(None);
    };
    if !verify_password(&user.password_hash, password) {
        return Ok(None);
    }
    Ok(Some(Principal {
        user_id: user.user_id.clone(),
        display_name: user.display_name.clone(),
        roles: user.roles.clone(),
    }))
}
