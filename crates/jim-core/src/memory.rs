//! In-memory gateway with optional JSON snapshots.
//!
//! Tables are concurrent maps so the event loop and the admin console can
//! use the same gateway. Snapshots carry users, contacts, login history and
//! counters; active sessions are never restored.

use crate::gateway::{
    ActiveSession, Gateway, LoginRecord, MessageCounters, StorageError, UserRecord,
};
use dashmap::{DashMap, DashSet};
use jim_protocol::unix_time;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Serializable image of a [`MemoryGateway`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Known users.
    pub users: Vec<UserRecord>,
    /// Directed (user, contact) edges.
    pub contacts: Vec<(String, String)>,
    /// Login history, oldest first.
    pub login_history: Vec<LoginRecord>,
    /// Per-user message totals.
    pub counters: Vec<(String, MessageCounters)>,
}

/// Gateway keeping every table in memory.
#[derive(Debug)]
pub struct MemoryGateway {
    users: DashMap<String, UserRecord>,
    next_id: AtomicU64,
    active: DashMap<String, ActiveSession>,
    contacts: DashMap<String, DashSet<String>>,
    history: DashMap<String, Vec<LoginRecord>>,
    counters: DashMap<String, MessageCounters>,
}

impl MemoryGateway {
    /// Create an empty gateway.
    #[must_use]
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            next_id: AtomicU64::new(1),
            active: DashMap::new(),
            contacts: DashMap::new(),
            history: DashMap::new(),
            counters: DashMap::new(),
        }
    }

    /// Rebuild a gateway from a snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let gateway = Self::new();
        let max_id = snapshot.users.iter().map(|u| u.id).max().unwrap_or(0);
        gateway.next_id.store(max_id + 1, Ordering::Relaxed);

        for user in snapshot.users {
            gateway.users.insert(user.username.clone(), user);
        }
        for (user, contact) in snapshot.contacts {
            gateway.contacts.entry(user).or_default().insert(contact);
        }
        for record in snapshot.login_history {
            gateway
                .history
                .entry(record.username.clone())
                .or_default()
                .push(record);
        }
        for (user, counters) in snapshot.counters {
            gateway.counters.insert(user, counters);
        }
        gateway
    }

    /// Capture the persistent tables.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let mut users: Vec<UserRecord> = self.users.iter().map(|u| u.value().clone()).collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));

        let mut contacts: Vec<(String, String)> = self
            .contacts
            .iter()
            .flat_map(|entry| {
                let user = entry.key().clone();
                entry
                    .value()
                    .iter()
                    .map(|c| (user.clone(), c.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        contacts.sort();

        let mut counters: Vec<(String, MessageCounters)> = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        counters.sort_by(|a, b| a.0.cmp(&b.0));

        Snapshot {
            users,
            contacts,
            login_history: self.all_history(),
            counters,
        }
    }

    /// Load a gateway from a snapshot file.
    ///
    /// A missing file yields an empty gateway.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "No snapshot found, starting empty");
            return Ok(Self::new());
        }

        let contents = std::fs::read(path)?;
        let snapshot: Snapshot = serde_json::from_slice(&contents)?;
        info!(
            path = %path.display(),
            users = snapshot.users.len(),
            "Snapshot loaded"
        );
        Ok(Self::from_snapshot(snapshot))
    }

    /// Write a snapshot file, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), StorageError> {
        let path = path.as_ref();
        let contents = serde_json::to_vec_pretty(&self.snapshot())?;

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, path)?;

        info!(path = %path.display(), "Snapshot saved");
        Ok(())
    }

    fn require_user(&self, account: &str) -> Result<(), StorageError> {
        if self.users.contains_key(account) {
            Ok(())
        } else {
            Err(StorageError::UnknownUser(account.to_string()))
        }
    }

    fn all_history(&self) -> Vec<LoginRecord> {
        let mut history: Vec<LoginRecord> = self
            .history
            .iter()
            .flat_map(|e| e.value().clone())
            .collect();
        // Stable sort keeps each user's own entries in append order.
        history.sort_by(|a, b| {
            a.date
                .cmp(&b.date)
                .then_with(|| a.username.cmp(&b.username))
        });
        history
    }
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl Gateway for MemoryGateway {
    fn login(&self, account: &str, address: IpAddr, port: u16) -> Result<(), StorageError> {
        let now = unix_time();

        self.users
            .entry(account.to_string())
            .and_modify(|user| user.last_login = now)
            .or_insert_with(|| UserRecord {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                username: account.to_string(),
                last_login: now,
            });

        self.active.insert(
            account.to_string(),
            ActiveSession {
                username: account.to_string(),
                address,
                port,
                since: now,
            },
        );

        self.history
            .entry(account.to_string())
            .or_default()
            .push(LoginRecord {
                username: account.to_string(),
                date: now,
                address,
                port,
            });

        self.counters.entry(account.to_string()).or_default();

        debug!(account = %account, address = %address, port = port, "User logged in");
        Ok(())
    }

    fn logout(&self, account: &str) -> Result<(), StorageError> {
        self.require_user(account)?;
        self.active.remove(account);
        debug!(account = %account, "User logged out");
        Ok(())
    }

    fn add_contact(&self, user: &str, contact: &str) -> Result<(), StorageError> {
        self.require_user(user)?;

        if user == contact || !self.users.contains_key(contact) {
            debug!(user = %user, contact = %contact, "Ignoring contact");
            return Ok(());
        }

        if self
            .contacts
            .entry(user.to_string())
            .or_default()
            .insert(contact.to_string())
        {
            debug!(user = %user, contact = %contact, "Contact added");
        }
        Ok(())
    }

    fn remove_contact(&self, user: &str, contact: &str) -> Result<(), StorageError> {
        self.require_user(user)?;

        if let Some(contacts) = self.contacts.get(user) {
            if contacts.remove(contact).is_some() {
                debug!(user = %user, contact = %contact, "Contact removed");
            }
        }
        Ok(())
    }

    fn list_users(&self) -> Result<Vec<UserRecord>, StorageError> {
        let mut users: Vec<UserRecord> = self.users.iter().map(|u| u.value().clone()).collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }

    fn list_contacts(&self, user: &str) -> Result<Vec<String>, StorageError> {
        self.require_user(user)?;

        let mut contacts: Vec<String> = self
            .contacts
            .get(user)
            .map(|set| set.iter().map(|c| c.clone()).collect())
            .unwrap_or_default();
        contacts.sort();
        Ok(contacts)
    }

    fn record_message(&self, sender: &str, recipient: &str) -> Result<(), StorageError> {
        self.require_user(sender)?;
        self.require_user(recipient)?;

        self.counters.entry(sender.to_string()).or_default().sent += 1;
        self.counters.entry(recipient.to_string()).or_default().received += 1;
        Ok(())
    }

    fn active_sessions(&self) -> Result<Vec<ActiveSession>, StorageError> {
        let mut sessions: Vec<ActiveSession> =
            self.active.iter().map(|s| s.value().clone()).collect();
        sessions.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(sessions)
    }

    fn login_history(&self, account: Option<&str>) -> Result<Vec<LoginRecord>, StorageError> {
        match account {
            Some(account) => {
                self.require_user(account)?;
                Ok(self
                    .history
                    .get(account)
                    .map(|h| h.value().clone())
                    .unwrap_or_default())
            }
            None => Ok(self.all_history()),
        }
    }

    fn message_counters(&self) -> Result<Vec<(String, MessageCounters)>, StorageError> {
        let mut counters: Vec<(String, MessageCounters)> = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        counters.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(counters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn gateway_with(users: &[&str]) -> MemoryGateway {
        let gateway = MemoryGateway::new();
        for (i, user) in users.iter().enumerate() {
            gateway.login(user, LOCALHOST, 5000 + i as u16).unwrap();
        }
        gateway
    }

    #[test]
    fn test_login_upserts_user() {
        let gateway = gateway_with(&["alice"]);
        gateway.login("alice", LOCALHOST, 6000).unwrap();

        let users = gateway.list_users().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].username, "alice");
        assert_eq!(gateway.login_history(Some("alice")).unwrap().len(), 2);
        assert_eq!(gateway.active_sessions().unwrap()[0].port, 6000);
        assert_eq!(
            gateway.message_counters().unwrap(),
            vec![("alice".to_string(), MessageCounters::default())]
        );
    }

    #[test]
    fn test_logout_keeps_user() {
        let gateway = gateway_with(&["alice"]);
        gateway.logout("alice").unwrap();

        assert!(gateway.active_sessions().unwrap().is_empty());
        assert_eq!(gateway.list_users().unwrap().len(), 1);
        assert!(matches!(
            gateway.logout("nobody"),
            Err(StorageError::UnknownUser(_))
        ));
    }

    #[test]
    fn test_add_contact_is_idempotent() {
        let gateway = gateway_with(&["alice", "bob"]);

        gateway.add_contact("alice", "bob").unwrap();
        gateway.add_contact("alice", "bob").unwrap();

        assert_eq!(gateway.list_contacts("alice").unwrap(), vec!["bob"]);
        assert_eq!(gateway.snapshot().contacts.len(), 1);
        // Edges are directed
        assert!(gateway.list_contacts("bob").unwrap().is_empty());
    }

    #[test]
    fn test_add_contact_ignores_unknown_and_self() {
        let gateway = gateway_with(&["alice"]);

        gateway.add_contact("alice", "ghost").unwrap();
        gateway.add_contact("alice", "alice").unwrap();

        assert!(gateway.list_contacts("alice").unwrap().is_empty());
    }

    #[test]
    fn test_remove_missing_contact_is_noop() {
        let gateway = gateway_with(&["alice", "bob"]);

        gateway.remove_contact("alice", "bob").unwrap();
        gateway.add_contact("alice", "bob").unwrap();
        gateway.remove_contact("alice", "bob").unwrap();
        gateway.remove_contact("alice", "bob").unwrap();

        assert!(gateway.list_contacts("alice").unwrap().is_empty());
    }

    #[test]
    fn test_record_message_counts() {
        let gateway = gateway_with(&["alice", "bob"]);

        gateway.record_message("alice", "bob").unwrap();
        gateway.record_message("alice", "bob").unwrap();
        gateway.record_message("bob", "bob").unwrap();

        let counters: std::collections::HashMap<_, _> =
            gateway.message_counters().unwrap().into_iter().collect();
        assert_eq!(counters["alice"], MessageCounters { sent: 2, received: 0 });
        assert_eq!(counters["bob"], MessageCounters { sent: 1, received: 3 });

        assert!(matches!(
            gateway.record_message("alice", "ghost"),
            Err(StorageError::UnknownUser(_))
        ));
    }

    #[test]
    fn test_snapshot_restore_drops_active_sessions() {
        let gateway = gateway_with(&["alice", "bob"]);
        gateway.add_contact("alice", "bob").unwrap();
        gateway.record_message("alice", "bob").unwrap();

        let restored = MemoryGateway::from_snapshot(gateway.snapshot());

        assert_eq!(restored.snapshot(), gateway.snapshot());
        assert!(restored.active_sessions().unwrap().is_empty());

        // New users continue the id sequence
        restored.login("carol", LOCALHOST, 7000).unwrap();
        let ids: Vec<u64> = restored.list_users().unwrap().iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_save_and_load_file() {
        let path = std::env::temp_dir().join(format!(
            "jim-snapshot-{}-{}.json",
            std::process::id(),
            unix_time()
        ));

        let gateway = gateway_with(&["alice", "bob"]);
        gateway.add_contact("bob", "alice").unwrap();
        gateway.save_to(&path).unwrap();

        let loaded = MemoryGateway::load_from(&path).unwrap();
        assert_eq!(loaded.list_contacts("bob").unwrap(), vec!["alice"]);
        std::fs::remove_file(&path).unwrap();

        let empty = MemoryGateway::load_from(&path).unwrap();
        assert!(empty.list_users().unwrap().is_empty());
    }
}
