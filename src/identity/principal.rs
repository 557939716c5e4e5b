use serde::{Deserialize, Serialize};

use crate::policy::Role;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub roles: Vec<Role>,
}

impl Principal {
    pub fn new(user_id: impl Into<String>, roles: Vec<Role>) -> Self {
        Self { user_id: user_id.into(), display_name: None, roles }
    }
}
