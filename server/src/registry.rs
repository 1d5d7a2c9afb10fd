//! User registry
//!
//! Maps live usernames to their connection handles, one entry per
//! authenticated session. The check-and-insert in [`Registry::register`] is
//! a single critical section, so exactly one of any set of concurrent
//! registrations for the same name can win. The lock is never held across
//! an await point; broadcast callers take a snapshot and send after
//! releasing it.

use std::collections::HashMap;
use std::sync::Mutex;

use confab_protocol::Envelope;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::SessionError;

/// Maximum accepted username length after trimming.
const MAX_USERNAME_LEN: usize = 20;

/// Routing handle for one authenticated session: the connection id plus
/// the bounded outbound queue drained by that session's writer task.
#[derive(Clone)]
pub struct SessionHandle {
    /// Connection id, unique per live connection
    pub id: Uuid,
    /// Registered username
    pub username: String,
    /// Outbound envelope queue; the writer encrypts under this session's key
    pub tx: mpsc::Sender<Envelope>,
}

#[derive(Default)]
struct Inner {
    by_name: HashMap<String, SessionHandle>,
    by_id: HashMap<Uuid, String>,
    // Insertion order, for deterministic user-list display.
    order: Vec<String>,
}

/// The set of live authenticated sessions.
///
/// One instance per server run, shared by reference; never a global.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Registry::default()
    }

    /// Atomically validate the username and claim it for `handle`.
    pub fn register(&self, handle: SessionHandle) -> Result<(), SessionError> {
        validate_username(&handle.username)?;

        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if inner.by_name.contains_key(&handle.username) {
            return Err(SessionError::DuplicateUsername(handle.username));
        }
        inner.by_id.insert(handle.id, handle.username.clone());
        inner.order.push(handle.username.clone());
        inner.by_name.insert(handle.username.clone(), handle);
        Ok(())
    }

    /// Remove the session with this connection id, returning its username.
    ///
    /// Called synchronously on disconnect, before any departure broadcast,
    /// so no router path can resolve a stale entry.
    pub fn unregister(&self, id: Uuid) -> Option<String> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let username = inner.by_id.remove(&id)?;
        inner.by_name.remove(&username);
        inner.order.retain(|name| name != &username);
        Some(username)
    }

    /// Usernames in registration order.
    pub fn users(&self) -> Vec<String> {
        self.inner.lock().expect("registry lock poisoned").order.clone()
    }

    /// Look up the handle for a username.
    pub fn resolve(&self, username: &str) -> Option<SessionHandle> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .by_name
            .get(username)
            .cloned()
    }

    /// Snapshot of every session except `exclude`, for broadcast fan-out.
    pub fn peers(&self, exclude: Uuid) -> Vec<SessionHandle> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner
            .order
            .iter()
            .filter_map(|name| inner.by_name.get(name))
            .filter(|handle| handle.id != exclude)
            .cloned()
            .collect()
    }

    /// Snapshot of every live session.
    pub fn all(&self) -> Vec<SessionHandle> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner
            .order
            .iter()
            .filter_map(|name| inner.by_name.get(name))
            .cloned()
            .collect()
    }

    /// Number of authenticated sessions.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").order.len()
    }

    /// Whether no sessions are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Username rules: non-empty after trimming, at most 20 characters,
/// alphanumeric plus space, underscore and hyphen.
fn validate_username(username: &str) -> Result<(), SessionError> {
    if username.trim().is_empty() {
        return Err(SessionError::InvalidUsername("empty"));
    }
    if username != username.trim() {
        return Err(SessionError::InvalidUsername("leading or trailing whitespace"));
    }
    if username.chars().count() > MAX_USERNAME_LEN {
        return Err(SessionError::InvalidUsername("longer than 20 characters"));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '_' || c == '-')
    {
        return Err(SessionError::InvalidUsername("contains forbidden characters"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(name: &str) -> SessionHandle {
        let (tx, _rx) = mpsc::channel(8);
        SessionHandle {
            id: Uuid::new_v4(),
            username: name.to_string(),
            tx,
        }
    }

    #[test]
    fn register_and_resolve() {
        let registry = Registry::new();
        let alice = handle("alice");
        let alice_id = alice.id;
        registry.register(alice).unwrap();

        assert_eq!(registry.resolve("alice").unwrap().id, alice_id);
        assert!(registry.resolve("bob").is_none());
    }

    #[test]
    fn duplicate_name_is_rejected_and_original_survives() {
        let registry = Registry::new();
        let first = handle("alice");
        let first_id = first.id;
        registry.register(first).unwrap();

        let err = registry.register(handle("alice")).unwrap_err();
        assert!(matches!(err, SessionError::DuplicateUsername(_)));
        assert_eq!(registry.resolve("alice").unwrap().id, first_id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn username_validation() {
        let registry = Registry::new();
        assert!(matches!(
            registry.register(handle("")).unwrap_err(),
            SessionError::InvalidUsername("empty")
        ));
        assert!(matches!(
            registry.register(handle("   ")).unwrap_err(),
            SessionError::InvalidUsername("empty")
        ));
        assert!(registry.register(handle("a".repeat(21).as_str())).is_err());
        assert!(registry.register(handle("evil\nname")).is_err());
        assert!(registry.register(handle("ok_name-1 x")).is_ok());
    }

    #[test]
    fn user_list_preserves_insertion_order() {
        let registry = Registry::new();
        for name in ["charlie", "alice", "bob"] {
            registry.register(handle(name)).unwrap();
        }
        assert_eq!(registry.users(), vec!["charlie", "alice", "bob"]);

        let alice_id = registry.resolve("alice").unwrap().id;
        registry.unregister(alice_id);
        assert_eq!(registry.users(), vec!["charlie", "bob"]);
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = Registry::new();
        let h = handle("alice");
        let id = h.id;
        registry.register(h).unwrap();

        assert_eq!(registry.unregister(id).as_deref(), Some("alice"));
        assert!(registry.unregister(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn peers_excludes_the_caller() {
        let registry = Registry::new();
        let alice = handle("alice");
        let alice_id = alice.id;
        registry.register(alice).unwrap();
        registry.register(handle("bob")).unwrap();
        registry.register(handle("charlie")).unwrap();

        let peers = registry.peers(alice_id);
        let names: Vec<_> = peers.iter().map(|h| h.username.as_str()).collect();
        assert_eq!(names, vec!["bob", "charlie"]);
    }

    #[test]
    fn concurrent_registration_has_exactly_one_winner() {
        use std::sync::Arc;

        let registry = Arc::new(Registry::new());
        let mut joins = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            joins.push(std::thread::spawn(move || {
                registry.register(handle("alice")).is_ok()
            }));
        }

        let wins = joins
            .into_iter()
            .map(|j| j.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(registry.len(), 1);
    }
}
