//! Session lifecycle
//!
//! The [`SessionManager`] state machine and its collaborators: credential
//! storage, activity tracking and the periodic validator.

pub mod activity;
pub mod manager;
pub mod storage;
pub mod types;
mod validator;

pub use activity::{ActivitySignal, ActivityTracker, Throttle};
pub use manager::{SessionManager, SessionManagerBuilder};
pub use storage::{CredentialStore, FileBackend, MemoryBackend, StorageBackend};
pub use types::{LogoutReason, SessionEvent, SessionRecord, SessionStatus, TokenPair};
