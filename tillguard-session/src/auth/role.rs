//! Roles and user identity
//!
//! Roles form a closed set; anything the remote API sends is mapped onto it
//! at the boundary or rejected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Staff role driving every permission decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Full access, never looked up in the permission table
    Administrator,
    /// Back-office manager
    Manager,
    /// Floor staff taking orders
    Server,
    /// Till operator
    Cashier,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Administrator, Role::Manager, Role::Server, Role::Cashier];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Administrator => "administrator",
            Role::Manager => "manager",
            Role::Server => "server",
            Role::Cashier => "cashier",
        }
    }

    pub fn is_admin(&self) -> bool {
        *self == Role::Administrator
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "administrator" | "admin" => Ok(Role::Administrator),
            "manager" => Ok(Role::Manager),
            "server" | "waiter" => Ok(Role::Server),
            "cashier" => Ok(Role::Cashier),
            _ => Err(format!("Unknown role: {}", s)),
        }
    }
}

/// Authenticated staff member as persisted in the session record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Remote identifier, kept opaque
    pub id: String,
    /// Lower-cased login name
    pub username: String,
    pub display_name: String,
    pub email: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub is_active: bool,
    pub is_staff: bool,
    pub is_superuser: bool,
    pub date_joined: Option<DateTime<Utc>>,
}

impl User {
    /// "First Last" when a name is known, otherwise the username
    pub fn derive_display_name(first_name: &str, last_name: &str, username: &str) -> String {
        let full = format!("{} {}", first_name.trim(), last_name.trim());
        let full = full.trim();
        if full.is_empty() {
            username.to_string()
        } else {
            full.to_string()
        }
    }

    /// Short string for logs, never includes credentials
    pub fn display_string(&self) -> String {
        format!("{} ({})", self.display_name, self.role)
    }
}
