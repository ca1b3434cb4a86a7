//! Persistence layer: the SQLite repository, conversation-history
//! reconstruction, and role/department permission resolution.

pub mod entities;
pub mod history;
pub mod permissions;
pub mod repository;

pub use history::HistoryStore;
pub use permissions::{PermissionKind, PermissionResolver};
pub use repository::Repository;
