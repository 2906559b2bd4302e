//! Cookie-identified sessions, persisted behind a pluggable store.
//!
//! The store holds plain key/value maps keyed by session id. Handlers get a
//! [`Session`] handle with write-through semantics; a request that arrives
//! without a usable session id gets an ephemeral session with the empty id,
//! which reads and writes like any other but is never persisted.

use lattice_core::SessionSnapshot;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// Backend storage for session data.
pub trait SessionStore: Send + Sync {
    fn load(&self, id: &str) -> BTreeMap<String, Value>;
    fn store(&self, id: &str, values: BTreeMap<String, Value>);
    fn remove(&self, id: &str);
}

/// In-process store. Sessions live as long as the node.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, BTreeMap<String, Value>>>,
}

impl SessionStore for MemoryStore {
    fn load(&self, id: &str) -> BTreeMap<String, Value> {
        self.sessions
            .lock()
            .expect("session store lock")
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    fn store(&self, id: &str, values: BTreeMap<String, Value>) {
        self.sessions
            .lock()
            .expect("session store lock")
            .insert(id.to_string(), values);
    }

    fn remove(&self, id: &str) {
        self.sessions.lock().expect("session store lock").remove(id);
    }
}

/// Store that persists nothing. Every session behaves as ephemeral.
pub struct NullStore;

impl SessionStore for NullStore {
    fn load(&self, _id: &str) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }
    fn store(&self, _id: &str, _values: BTreeMap<String, Value>) {}
    fn remove(&self, _id: &str) {}
}

/// Hands out session handles bound to the configured store.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Session for a known id, hydrated from the store.
    pub fn session(&self, id: &str) -> Session {
        if id.is_empty() {
            return Session::ephemeral();
        }
        Session {
            id: id.to_string(),
            values: Arc::new(Mutex::new(self.store.load(id))),
            store: Some(self.store.clone()),
        }
    }

    /// Session rebuilt from a wire snapshot. Remote-origin requests carry
    /// their session by value; writes stay local to the forwarded call.
    pub fn from_snapshot(&self, snapshot: SessionSnapshot) -> Session {
        Session {
            id: snapshot.id,
            values: Arc::new(Mutex::new(snapshot.values)),
            store: None,
        }
    }
}

/// A handler's view of one session. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Session {
    id: String,
    values: Arc<Mutex<BTreeMap<String, Value>>>,
    store: Option<Arc<dyn SessionStore>>,
}

impl Session {
    /// The empty-id ephemeral session: usable, never persisted.
    pub fn ephemeral() -> Self {
        Session {
            id: String::new(),
            values: Arc::new(Mutex::new(BTreeMap::new())),
            store: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().expect("session lock").get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        let mut values = self.values.lock().expect("session lock");
        values.insert(key.into(), value.into());
        if let Some(store) = &self.store {
            store.store(&self.id, values.clone());
        }
    }

    pub fn delete(&self, key: &str) {
        let mut values = self.values.lock().expect("session lock");
        values.remove(key);
        if let Some(store) = &self.store {
            store.store(&self.id, values.clone());
        }
    }

    /// Plain serializable snapshot, as carried across node boundaries.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            values: self.values.lock().expect("session lock").clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn write_through_and_rehydrate() {
        let manager = SessionManager::new(Arc::new(MemoryStore::default()));
        let first = manager.session("abc");
        first.set("user", json!("ada"));

        let second = manager.session("abc");
        assert_eq!(second.get("user"), Some(json!("ada")));
        second.delete("user");
        assert_eq!(manager.session("abc").get("user"), None);
    }

    #[test]
    fn empty_id_is_ephemeral() {
        let manager = SessionManager::new(Arc::new(MemoryStore::default()));
        let session = manager.session("");
        session.set("k", json!(1));
        assert_eq!(session.get("k"), Some(json!(1)));
        // A fresh empty-id session shares nothing with the previous one.
        assert_eq!(manager.session("").get("k"), None);
    }

    #[test]
    fn snapshot_round_trip() {
        let manager = SessionManager::new(Arc::new(MemoryStore::default()));
        let session = manager.session("s1");
        session.set("n", json!(7));
        let rebuilt = manager.from_snapshot(session.snapshot());
        assert_eq!(rebuilt.id(), "s1");
        assert_eq!(rebuilt.get("n"), Some(json!(7)));
    }

    #[test]
    fn null_store_forgets() {
        let manager = SessionManager::new(Arc::new(NullStore));
        manager.session("x").set("k", json!(true));
        assert_eq!(manager.session("x").get("k"), None);
    }
}
