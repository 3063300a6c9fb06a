//! Authentication and Authorization Module
//!
//! Role-based access control for the dashboard:
//! - Roles: closed set of staff roles
//! - Permissions: closed vocabulary of dotted codes and the role/menu tables
//! - Resolver: pure "may role R do P / open menu M" lookups

pub mod permissions;
pub mod resolver;
pub mod role;

pub use permissions::{MenuTable, Permission, PermissionSet, PermissionTable};
pub use resolver::PermissionResolver;
pub use role::{Role, User};
