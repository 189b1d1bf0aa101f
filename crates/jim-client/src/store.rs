//! Local cache shared by the composer and the listener.

use jim_protocol::Timestamp;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Cache handle shared across tasks.
pub type SharedStore = Arc<Mutex<LocalStore>>;

/// Which way a message travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// One message in the local history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub direction: Direction,
    /// The other party.
    pub peer: String,
    pub text: String,
    /// Timestamp the sender put on the message.
    pub time: Timestamp,
}

impl fmt::Display for HistoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            Direction::Incoming => write!(f, "[{}] from {}: {}", self.time, self.peer, self.text),
            Direction::Outgoing => write!(f, "[{}] to {}: {}", self.time, self.peer, self.text),
        }
    }
}

/// Known users, contacts and message history of one session.
#[derive(Debug, Default)]
pub struct LocalStore {
    known_users: BTreeSet<String>,
    contacts: BTreeSet<String>,
    history: Vec<HistoryEntry>,
}

impl LocalStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store behind a shared handle.
    #[must_use]
    pub fn shared() -> SharedStore {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Replace the known users.
    pub fn set_known_users(&mut self, users: impl IntoIterator<Item = String>) {
        self.known_users = users.into_iter().collect();
    }

    #[must_use]
    pub fn is_known(&self, name: &str) -> bool {
        self.known_users.contains(name)
    }

    /// Known users, sorted.
    #[must_use]
    pub fn known_users(&self) -> Vec<String> {
        self.known_users.iter().cloned().collect()
    }

    /// Replace the contacts.
    pub fn set_contacts(&mut self, contacts: impl IntoIterator<Item = String>) {
        self.contacts = contacts.into_iter().collect();
    }

    /// Add a contact. Returns `false` if it was already present.
    pub fn add_contact(&mut self, name: impl Into<String>) -> bool {
        self.contacts.insert(name.into())
    }

    /// Remove a contact. Returns `false` if it was absent.
    pub fn remove_contact(&mut self, name: &str) -> bool {
        self.contacts.remove(name)
    }

    #[must_use]
    pub fn has_contact(&self, name: &str) -> bool {
        self.contacts.contains(name)
    }

    /// Contacts, sorted.
    #[must_use]
    pub fn contacts(&self) -> Vec<String> {
        self.contacts.iter().cloned().collect()
    }

    /// Append a message to the history.
    pub fn record(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
    }

    /// History in arrival order, optionally one direction only.
    #[must_use]
    pub fn history(&self, direction: Option<Direction>) -> Vec<&HistoryEntry> {
        self.history
            .iter()
            .filter(|e| direction.map_or(true, |d| e.direction == d))
            .collect()
    }
}
