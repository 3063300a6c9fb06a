//! Permission resolver
//!
//! Pure lookups over the permission and menu tables. Nothing here touches
//! session state; expiry handling lives in the session manager.

use super::{MenuTable, Permission, PermissionSet, PermissionTable, Role};
use crate::SessionResult;
use tillguard_core::PermissionOverrides;

#[derive(Debug, Clone, Default)]
pub struct PermissionResolver {
    table: PermissionTable,
    menus: MenuTable,
}

impl PermissionResolver {
    pub fn new(table: PermissionTable, menus: MenuTable) -> Self {
        Self { table, menus }
    }

    /// Build from configuration overrides, validating every code
    pub fn from_overrides(overrides: &PermissionOverrides) -> SessionResult<Self> {
        Ok(Self {
            table: PermissionTable::with_overrides(&overrides.roles)?,
            menus: MenuTable::with_overrides(&overrides.menus)?,
        })
    }

    /// Administrator always passes; other roles need the code in their grants
    pub fn has_permission(&self, role: Role, permission: Permission) -> bool {
        if role.is_admin() {
            return true;
        }

        self.table
            .grants(role)
            .is_some_and(|grants| grants.contains(&permission))
    }

    pub fn has_any_permission(&self, role: Role, permissions: &[Permission]) -> bool {
        permissions.iter().any(|p| self.has_permission(role, *p))
    }

    pub fn has_all_permissions(&self, role: Role, permissions: &[Permission]) -> bool {
        permissions.iter().all(|p| self.has_permission(role, *p))
    }

    /// Unknown menus fail closed, for every role
    pub fn can_access_menu(&self, role: Role, menu_id: &str) -> bool {
        match self.menus.required(menu_id) {
            None => false,
            Some([]) => true,
            Some(required) => self.has_any_permission(role, required),
        }
    }

    /// Permission set attached to a session at login
    pub fn permissions_for(&self, role: Role) -> PermissionSet {
        if role.is_admin() {
            return PermissionSet::all();
        }

        self.table.grants(role).cloned().unwrap_or_default()
    }

    /// Menu identifiers the role may open, sorted
    pub fn accessible_menus(&self, role: Role) -> Vec<String> {
        let mut menus: Vec<String> = self
            .menus
            .menu_ids()
            .filter(|id| self.can_access_menu(role, id))
            .map(str::to_string)
            .collect();
        menus.sort();
        menus
    }
}
