//! Route policy and role matching, shared by the edge gate and the client
//! guard. The table is ordered: the first rule whose prefix covers the
//! request path decides the required roles, and a path no rule covers is
//! open access.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Capability level gating access to a protected area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Staff,
    Admin,
}

impl Role {
    /// Case-insensitive parse. Unknown role names yield `None`, so a claim
    /// this crate does not know about can never satisfy a requirement.
    pub fn parse(s: &str) -> Option<Role> {
        match s.trim().to_ascii_lowercase().as_str() {
            "customer" => Some(Role::Customer),
            "staff" => Some(Role::Staff),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Staff => "staff",
            Role::Admin => "admin",
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map raw claim strings to known roles, dropping anything unrecognized.
pub fn parse_roles<S: AsRef<str>>(claims: &[S]) -> Vec<Role> {
    let mut out: Vec<Role> = Vec::with_capacity(claims.len());
    for c in claims {
        if let Some(r) = Role::parse(c.as_ref()) {
            if !out.contains(&r) {
                out.push(r);
            }
        }
    }
    out
}

/// One entry of the route policy table: a path prefix and the roles allowed
/// under it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub prefix: String,
    pub roles: Vec<Role>,
}

impl PolicyRule {
    pub fn new(prefix: impl Into<String>, roles: Vec<Role>) -> Self {
        Self { prefix: prefix.into(), roles }
    }
}

/// Ordered route policy table. Adding a new protected area means appending a
/// rule here; nothing else hardcodes role checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePolicy {
    pub rules: Vec<PolicyRule>,
    /// A principal holding `admin` satisfies any requirement. Explicit
    /// policy, honored identically by the edge gate and the client guard.
    #[serde(default = "default_admin_bypass")]
    pub admin_bypass: bool,
}

fn default_admin_bypass() -> bool {
    true
}

impl Default for RoutePolicy {
    /// Built-in table for the booking platform's protected areas.
    fn default() -> Self {
        Self {
            rules: vec![
                PolicyRule::new("/admin", vec![Role::Admin]),
                PolicyRule::new("/staff", vec![Role::Admin, Role::Staff]),
                PolicyRule::new("/account", vec![Role::Customer, Role::Staff, Role::Admin]),
                PolicyRule::new("/bookings", vec![Role::Customer, Role::Staff, Role::Admin]),
            ],
            admin_bypass: true,
        }
    }
}

impl RoutePolicy {
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self { rules, admin_bypass: true }
    }

    /// Load an ordered table from its JSON form (an array of rules keeps
    /// declaration order, which a JSON object would not guarantee).
    pub fn from_json(s: &str) -> anyhow::Result<RoutePolicy> {
        let policy: RoutePolicy = serde_json::from_str(s)?;
        Ok(policy)
    }

    /// Roles bound to the first rule covering `path`, or `None` when the
    /// path is unrestricted. `path` must not carry a query string.
    pub fn required_for(&self, path: &str) -> Option<&[Role]> {
        self.rules
            .iter()
            .find(|r| path_covered_by(path, &r.prefix))
            .map(|r| r.roles.as_slice())
    }

    /// Admission predicate shared by both components. Empty requirement
    /// admits everyone; `admin_bypass` admits any principal holding
    /// `admin`; otherwise the sets must intersect.
    pub fn admits(&self, user_roles: &[Role], required: &[Role]) -> bool {
        if required.is_empty() {
            return true;
        }
        if self.admin_bypass && user_roles.contains(&Role::Admin) {
            return true;
        }
        user_roles.iter().any(|r| required.contains(r))
    }
}

/// Segment-aware prefix test: `/admin` covers `/admin` and `/admin/users`
/// but not `/admin-tools`. A bare `/` or empty prefix covers everything.
fn path_covered_by(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
