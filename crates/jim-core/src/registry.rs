//! Session registry for JIM.
//!
//! The registry binds account names to live connections. A name is bound
//! at most once and a connection holds at most one name.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::debug;

/// Atomic counter backing [`ConnectionId::next`].
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Allocate a process-unique connection ID.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The account name is bound to another connection.
    #[error("Account name already in use: {0}")]
    NameTaken(String),

    /// The connection already holds a session.
    #[error("Connection {connection} is already bound to {name}")]
    AlreadyBound {
        /// Connection that tried to bind twice.
        connection: ConnectionId,
        /// Name it already holds.
        name: String,
    },
}

/// Live mapping of account name to connection.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    by_name: HashMap<String, ConnectionId>,
    by_connection: HashMap<ConnectionId, String>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `connection`.
    ///
    /// # Errors
    ///
    /// Fails if the name is already bound or the connection already holds a
    /// name. The existing binding is left untouched either way.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        connection: ConnectionId,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.by_name.contains_key(&name) {
            return Err(RegistryError::NameTaken(name));
        }
        if let Some(bound) = self.by_connection.get(&connection) {
            return Err(RegistryError::AlreadyBound {
                connection,
                name: bound.clone(),
            });
        }

        debug!(account = %name, connection = %connection, "Session registered");
        self.by_name.insert(name.clone(), connection);
        self.by_connection.insert(connection, name);
        Ok(())
    }

    /// Look up the connection bound to `name`.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<ConnectionId> {
        self.by_name.get(name).copied()
    }

    /// Look up the name bound to `connection`.
    #[must_use]
    pub fn name_of(&self, connection: ConnectionId) -> Option<&str> {
        self.by_connection.get(&connection).map(String::as_str)
    }

    /// Check whether `name` is bound to exactly `connection`.
    #[must_use]
    pub fn is_bound_to(&self, name: &str, connection: ConnectionId) -> bool {
        self.lookup(name) == Some(connection)
    }

    /// Remove the session for `name`.
    ///
    /// Returns the connection it was bound to, if any.
    pub fn remove(&mut self, name: &str) -> Option<ConnectionId> {
        let connection = self.by_name.remove(name)?;
        self.by_connection.remove(&connection);
        debug!(account = %name, connection = %connection, "Session removed");
        Some(connection)
    }

    /// Remove whatever session `connection` holds.
    ///
    /// Returns the account name that was bound, if any.
    pub fn remove_connection(&mut self, connection: ConnectionId) -> Option<String> {
        let name = self.by_connection.remove(&connection)?;
        self.by_name.remove(&name);
        debug!(account = %name, connection = %connection, "Session removed");
        Some(name)
    }

    /// All active sessions, sorted by account name.
    #[must_use]
    pub fn active(&self) -> Vec<(String, ConnectionId)> {
        let mut sessions: Vec<_> = self
            .by_name
            .iter()
            .map(|(name, conn)| (name.clone(), *conn))
            .collect();
        sessions.sort();
        sessions
    }

    /// Number of active sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Check if no session is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_lookup_remove() {
        let mut registry = SessionRegistry::new();
        let conn = ConnectionId(1);

        registry.register("alice", conn).unwrap();
        assert_eq!(registry.lookup("alice"), Some(conn));
        assert_eq!(registry.name_of(conn), Some("alice"));
        assert!(registry.is_bound_to("alice", conn));
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.remove("alice"), Some(conn));
        assert_eq!(registry.lookup("alice"), None);
        assert_eq!(registry.name_of(conn), None);
        assert!(registry.is_empty());

        // Removing twice is harmless
        assert_eq!(registry.remove("alice"), None);
    }

    #[test]
    fn test_duplicate_name_keeps_existing_session() {
        let mut registry = SessionRegistry::new();
        registry.register("alice", ConnectionId(1)).unwrap();

        assert_eq!(
            registry.register("alice", ConnectionId(2)),
            Err(RegistryError::NameTaken("alice".into()))
        );
        assert_eq!(registry.lookup("alice"), Some(ConnectionId(1)));
        assert_eq!(registry.name_of(ConnectionId(2)), None);
    }

    #[test]
    fn test_connection_binds_once() {
        let mut registry = SessionRegistry::new();
        registry.register("alice", ConnectionId(1)).unwrap();

        assert!(matches!(
            registry.register("bob", ConnectionId(1)),
            Err(RegistryError::AlreadyBound { .. })
        ));
        assert_eq!(registry.lookup("bob"), None);
    }

    #[test]
    fn test_remove_connection() {
        let mut registry = SessionRegistry::new();
        registry.register("alice", ConnectionId(1)).unwrap();
        registry.register("bob", ConnectionId(2)).unwrap();

        assert_eq!(registry.remove_connection(ConnectionId(1)), Some("alice".into()));
        assert_eq!(registry.remove_connection(ConnectionId(9)), None);
        assert_eq!(registry.active(), vec![("bob".to_string(), ConnectionId(2))]);
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let first = ConnectionId::next();
        let second = ConnectionId::next();
        assert_ne!(first, second);
        assert!(first.to_string().starts_with("conn-"));
    }
}
