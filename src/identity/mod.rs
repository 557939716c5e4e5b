//! Central identity and session management for the booking platform's gate.
//! Keep the public surface thin and split implementation across sub-modules.

mod directory;
mod principal;
mod provider;
mod session;

pub use directory::{add_user, authenticate, ensure_default_admin, hash_password, verify_password};
pub use principal::Principal;
pub use provider::{CachedRoles, IdentityProvider, StaticRoles};
pub use session::{Session, SessionManager, SessionToken};
