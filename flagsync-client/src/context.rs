//! Per-engine synchronization context
//!
//! Owns the tracked identity keys (with their channel hashes) and the storage
//! that holds every scope's change number. One context per engine instance;
//! nothing here is global.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::hash::channel_key_hash;
use crate::storage::Storage;

#[derive(Debug, Default)]
struct IdentityKeys {
    /// Insertion order, used for auth requests
    ordered: Vec<String>,
    by_hash: HashMap<String, Vec<String>>,
}

#[derive(Debug)]
pub struct SyncContext {
    keys: RwLock<IdentityKeys>,
    storage: Arc<dyn Storage>,
}

impl SyncContext {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            keys: RwLock::new(IdentityKeys::default()),
            storage,
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Track a new identity key. Returns false when it was already tracked.
    ///
    /// The set only grows.
    pub fn add_identity_key(&self, key: &str) -> bool {
        let mut keys = self.keys.write();
        if keys.ordered.iter().any(|k| k == key) {
            return false;
        }
        keys.ordered.push(key.to_string());
        keys.by_hash
            .entry(channel_key_hash(key))
            .or_default()
            .push(key.to_string());
        true
    }

    pub fn identity_keys(&self) -> Vec<String> {
        self.keys.read().ordered.clone()
    }

    pub fn has_identity_keys(&self) -> bool {
        !self.keys.read().ordered.is_empty()
    }

    /// Tracked keys whose channel hash is `hash`
    pub fn keys_for_hash(&self, hash: &str) -> Vec<String> {
        self.keys
            .read()
            .by_hash
            .get(hash)
            .cloned()
            .unwrap_or_default()
    }
}
