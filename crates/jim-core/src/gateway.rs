//! Persistence gateway consumed by the router.
//!
//! The storage engine itself lives behind this trait. Every method is
//! request-scoped: a failure degrades one request, never the server.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The account has never logged in.
    #[error("Unknown user: {0}")]
    UnknownUser(String),

    /// Snapshot file could not be read or written.
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot contents could not be (de)serialized.
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),

    /// Backend refused the operation.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// A known user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Row identifier.
    pub id: u64,
    /// Unique account name.
    pub username: String,
    /// Last login, unix seconds.
    pub last_login: u64,
}

/// A currently logged-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSession {
    /// Account name.
    pub username: String,
    /// Remote address.
    pub address: IpAddr,
    /// Remote port.
    pub port: u16,
    /// Login time, unix seconds.
    pub since: u64,
}

/// One login event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRecord {
    /// Account name.
    pub username: String,
    /// Login time, unix seconds.
    pub date: u64,
    /// Remote address.
    pub address: IpAddr,
    /// Remote port.
    pub port: u16,
}

/// Per-user message totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCounters {
    /// Messages sent by the user.
    pub sent: u64,
    /// Messages addressed to the user.
    pub received: u64,
}

/// Persistence operations used by the server.
pub trait Gateway: Send + Sync {
    /// Record a login: upsert the user, mark the session active, append
    /// login history and make sure a counters row exists.
    fn login(&self, account: &str, address: IpAddr, port: u16) -> Result<(), StorageError>;

    /// Clear the active-session marker. The user row persists.
    fn logout(&self, account: &str) -> Result<(), StorageError>;

    /// Add a contact edge. Ignored if `contact` is unknown, is `user`
    /// itself, or the edge already exists.
    fn add_contact(&self, user: &str, contact: &str) -> Result<(), StorageError>;

    /// Remove a contact edge. Removing a missing edge is a no-op.
    fn remove_contact(&self, user: &str, contact: &str) -> Result<(), StorageError>;

    /// All known users, sorted by name.
    fn list_users(&self) -> Result<Vec<UserRecord>, StorageError>;

    /// Contacts of `user`, sorted by name.
    fn list_contacts(&self, user: &str) -> Result<Vec<String>, StorageError>;

    /// Count one message from `sender` to `recipient`.
    fn record_message(&self, sender: &str, recipient: &str) -> Result<(), StorageError>;

    /// Users currently logged in, sorted by name.
    fn active_sessions(&self) -> Result<Vec<ActiveSession>, StorageError>;

    /// Login history, oldest first, optionally for one account.
    fn login_history(&self, account: Option<&str>) -> Result<Vec<LoginRecord>, StorageError>;

    /// Message totals per user, sorted by name.
    fn message_counters(&self) -> Result<Vec<(String, MessageCounters)>, StorageError>;
}
