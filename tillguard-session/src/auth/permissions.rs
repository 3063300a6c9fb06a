//! Permission System
//!
//! Closed permission vocabulary plus the two static tables the resolver reads:
//! role -> granted codes, and menu -> required codes.

use super::Role;
use crate::{SessionError, SessionResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::warn;

/// A single permission code
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Permission {
    DashboardView,
    SalesView,
    SalesCreate,
    SalesRefund,
    StockView,
    StockEdit,
    OrdersView,
    OrdersCreate,
    OrdersEdit,
    SuppliersView,
    SuppliersEdit,
    ReportsView,
    ReportsExport,
    UsersView,
    UsersEdit,
    SettingsView,
    SettingsEdit,
}

impl Permission {
    pub const ALL: [Permission; 17] = [
        Permission::DashboardView,
        Permission::SalesView,
        Permission::SalesCreate,
        Permission::SalesRefund,
        Permission::StockView,
        Permission::StockEdit,
        Permission::OrdersView,
        Permission::OrdersCreate,
        Permission::OrdersEdit,
        Permission::SuppliersView,
        Permission::SuppliersEdit,
        Permission::ReportsView,
        Permission::ReportsExport,
        Permission::UsersView,
        Permission::UsersEdit,
        Permission::SettingsView,
        Permission::SettingsEdit,
    ];

    /// Wire code, e.g. `sales.view`
    pub fn code(&self) -> &'static str {
        match self {
            Permission::DashboardView => "dashboard.view",
            Permission::SalesView => "sales.view",
            Permission::SalesCreate => "sales.create",
            Permission::SalesRefund => "sales.refund",
            Permission::StockView => "stock.view",
            Permission::StockEdit => "stock.edit",
            Permission::OrdersView => "orders.view",
            Permission::OrdersCreate => "orders.create",
            Permission::OrdersEdit => "orders.edit",
            Permission::SuppliersView => "suppliers.view",
            Permission::SuppliersEdit => "suppliers.edit",
            Permission::ReportsView => "reports.view",
            Permission::ReportsExport => "reports.export",
            Permission::UsersView => "users.view",
            Permission::UsersEdit => "users.edit",
            Permission::SettingsView => "settings.view",
            Permission::SettingsEdit => "settings.edit",
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl std::str::FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_lowercase();
        Permission::ALL
            .into_iter()
            .find(|p| p.code() == code)
            .ok_or_else(|| format!("Unknown permission: {}", s))
    }
}

impl TryFrom<String> for Permission {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Permission> for String {
    fn from(permission: Permission) -> Self {
        permission.code().to_string()
    }
}

/// Typed set of permission codes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<Permission>);

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every code in the vocabulary
    pub fn all() -> Self {
        Permission::ALL.into_iter().collect()
    }

    pub fn contains(&self, permission: &Permission) -> bool {
        self.0.contains(permission)
    }

    pub fn insert(&mut self, permission: Permission) -> bool {
        self.0.insert(permission)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Permission> {
        self.0.iter()
    }

    /// Parse a list of wire codes, rejecting anything outside the vocabulary
    pub fn parse_codes<S: AsRef<str>>(codes: &[S]) -> SessionResult<Self> {
        codes
            .iter()
            .map(|code| {
                code.as_ref()
                    .parse::<Permission>()
                    .map_err(SessionError::config)
            })
            .collect()
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = Permission>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a PermissionSet {
    type Item = &'a Permission;
    type IntoIter = std::collections::btree_set::Iter<'a, Permission>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Role -> granted permissions
#[derive(Debug, Clone)]
pub struct PermissionTable {
    roles: HashMap<Role, PermissionSet>,
}

impl Default for PermissionTable {
    fn default() -> Self {
        use Permission::*;

        let manager: PermissionSet = Permission::ALL
            .into_iter()
            .filter(|p| !matches!(p, UsersEdit | SettingsEdit))
            .collect();

        let server = [DashboardView, OrdersView, OrdersCreate, OrdersEdit, SalesView]
            .into_iter()
            .collect();

        let cashier = [DashboardView, SalesView, SalesCreate, OrdersView]
            .into_iter()
            .collect();

        Self {
            roles: HashMap::from([
                (Role::Manager, manager),
                (Role::Server, server),
                (Role::Cashier, cashier),
            ]),
        }
    }
}

impl PermissionTable {
    /// Table with no grants at all
    pub fn empty() -> Self {
        Self {
            roles: HashMap::new(),
        }
    }

    /// Replace the grants of one role
    pub fn with_role(mut self, role: Role, permissions: PermissionSet) -> Self {
        self.roles.insert(role, permissions);
        self
    }

    /// Default table with configured roles replaced wholesale
    pub fn with_overrides(overrides: &BTreeMap<String, Vec<String>>) -> SessionResult<Self> {
        let mut table = Self::default();

        for (role_name, codes) in overrides {
            let role: Role = role_name.parse().map_err(SessionError::config)?;
            let permissions = PermissionSet::parse_codes(codes)?;

            if role.is_admin() {
                warn!(
                    role = %role,
                    "Ignoring permission override for administrator, it always has every permission"
                );
                continue;
            }

            table.roles.insert(role, permissions);
        }

        Ok(table)
    }

    /// Grants stored for a role; administrator has no entry
    pub fn grants(&self, role: Role) -> Option<&PermissionSet> {
        self.roles.get(&role)
    }
}

/// Menu / feature identifier -> permissions it requires (any of)
#[derive(Debug, Clone)]
pub struct MenuTable {
    menus: HashMap<String, Vec<Permission>>,
}

impl Default for MenuTable {
    fn default() -> Self {
        use Permission::*;

        let menus = [
            ("dashboard", vec![]),
            ("sales", vec![SalesView]),
            ("stock", vec![StockView]),
            ("orders", vec![OrdersView]),
            ("suppliers", vec![SuppliersView]),
            ("reports", vec![ReportsView]),
            ("users", vec![UsersView]),
            ("settings", vec![SettingsView]),
        ]
        .into_iter()
        .map(|(id, required)| (id.to_string(), required))
        .collect();

        Self { menus }
    }
}

impl MenuTable {
    pub fn empty() -> Self {
        Self {
            menus: HashMap::new(),
        }
    }

    /// Register or replace a menu
    pub fn with_menu(mut self, menu_id: &str, required: Vec<Permission>) -> Self {
        self.menus.insert(menu_id.to_string(), required);
        self
    }

    /// Default table with configured menus added or replaced
    pub fn with_overrides(overrides: &BTreeMap<String, Vec<String>>) -> SessionResult<Self> {
        let mut table = Self::default();

        for (menu_id, codes) in overrides {
            let required = codes
                .iter()
                .map(|code| code.parse::<Permission>().map_err(SessionError::config))
                .collect::<SessionResult<Vec<_>>>()?;
            table.menus.insert(menu_id.clone(), required);
        }

        Ok(table)
    }

    /// Required codes, `None` for an unknown menu
    pub fn required(&self, menu_id: &str) -> Option<&[Permission]> {
        self.menus.get(menu_id).map(Vec::as_slice)
    }

    pub fn menu_ids(&self) -> impl Iterator<Item = &str> {
        self.menus.keys().map(String::as_str)
    }
}
