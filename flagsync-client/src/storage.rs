//! Local dataset storage
//!
//! The runtime only talks to storage through [`Storage`]. Every write is a
//! compare-and-apply against the scope's change number, so a stale write that
//! loses a race with a newer one is dropped under the lock instead of
//! overwriting it.

use std::collections::{BTreeSet, HashMap, HashSet};

use parking_lot::RwLock;
use shared::FlagDefinition;

/// Change number of a scope that was never synchronized
pub const UNSYNCED: i64 = -1;

pub trait Storage: Send + Sync + std::fmt::Debug {
    // === flags ===
    fn flags_change_number(&self) -> i64;

    /// Upsert `updated`, drop `removed`, advance the flags change number.
    /// Returns false (and changes nothing) unless `change_number` is newer.
    fn apply_flag_changes(
        &self,
        updated: Vec<FlagDefinition>,
        removed: Vec<String>,
        change_number: i64,
    ) -> bool;

    /// Kill a flag in place ahead of its refetch. No-op for unknown flags or
    /// when the flag is already at or past `change_number`.
    fn kill_flag(&self, name: &str, default_treatment: &str, change_number: i64) -> bool;

    fn get_flag(&self, name: &str) -> Option<FlagDefinition>;

    fn flag_names(&self) -> Vec<String>;

    /// Segments referenced by any stored flag
    fn referenced_segments(&self) -> BTreeSet<String>;

    // === segments ===
    fn segment_change_number(&self, name: &str) -> i64;

    fn apply_segment_changes(
        &self,
        name: &str,
        added: Vec<String>,
        removed: Vec<String>,
        change_number: i64,
    ) -> bool;

    fn segment_contains(&self, name: &str, key: &str) -> bool;

    // === per-key memberships ===
    fn membership_change_number(&self, key: &str) -> i64;

    fn memberships(&self, key: &str) -> Option<BTreeSet<String>>;

    /// Replace the key's membership. `change_number` is optional because the
    /// membership endpoint does not always report one; without it the write
    /// is applied when the set differs or the key was never loaded.
    fn replace_memberships(
        &self,
        key: &str,
        segments: BTreeSet<String>,
        change_number: Option<i64>,
    ) -> bool;

    /// Add or remove a single segment for a key (key-list deltas)
    fn update_membership(
        &self,
        key: &str,
        segment: &str,
        member: bool,
        change_number: i64,
    ) -> bool;
}

#[derive(Debug, Default)]
struct FlagTable {
    change_number: Option<i64>,
    flags: HashMap<String, FlagDefinition>,
}

#[derive(Debug, Default)]
struct SegmentEntry {
    change_number: i64,
    keys: HashSet<String>,
}

#[derive(Debug)]
struct MembershipEntry {
    change_number: i64,
    segments: BTreeSet<String>,
}

/// In-memory [`Storage`] backed by `parking_lot` locks
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    flags: RwLock<FlagTable>,
    segments: RwLock<HashMap<String, SegmentEntry>>,
    memberships: RwLock<HashMap<String, MembershipEntry>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for InMemoryStorage {
    fn flags_change_number(&self) -> i64 {
        self.flags.read().change_number.unwrap_or(UNSYNCED)
    }

    fn apply_flag_changes(
        &self,
        updated: Vec<FlagDefinition>,
        removed: Vec<String>,
        change_number: i64,
    ) -> bool {
        let mut table = self.flags.write();
        if change_number <= table.change_number.unwrap_or(UNSYNCED) {
            return false;
        }
        for name in removed {
            table.flags.remove(&name);
        }
        for flag in updated {
            table.flags.insert(flag.name.clone(), flag);
        }
        table.change_number = Some(change_number);
        true
    }

    fn kill_flag(&self, name: &str, default_treatment: &str, change_number: i64) -> bool {
        let mut table = self.flags.write();
        match table.flags.get_mut(name) {
            Some(flag) if flag.change_number < change_number => {
                flag.kill(default_treatment, change_number);
                true
            }
            _ => false,
        }
    }

    fn get_flag(&self, name: &str) -> Option<FlagDefinition> {
        self.flags.read().flags.get(name).cloned()
    }

    fn flag_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.flags.read().flags.keys().cloned().collect();
        names.sort();
        names
    }

    fn referenced_segments(&self) -> BTreeSet<String> {
        self.flags
            .read()
            .flags
            .values()
            .flat_map(|flag| flag.segment_names())
            .collect()
    }

    fn segment_change_number(&self, name: &str) -> i64 {
        self.segments
            .read()
            .get(name)
            .map(|s| s.change_number)
            .unwrap_or(UNSYNCED)
    }

    fn apply_segment_changes(
        &self,
        name: &str,
        added: Vec<String>,
        removed: Vec<String>,
        change_number: i64,
    ) -> bool {
        let mut segments = self.segments.write();
        let entry = segments
            .entry(name.to_string())
            .or_insert_with(|| SegmentEntry {
                change_number: UNSYNCED,
                keys: HashSet::new(),
            });
        if change_number <= entry.change_number {
            return false;
        }
        for key in removed {
            entry.keys.remove(&key);
        }
        entry.keys.extend(added);
        entry.change_number = change_number;
        true
    }

    fn segment_contains(&self, name: &str, key: &str) -> bool {
        self.segments
            .read()
            .get(name)
            .is_some_and(|s| s.keys.contains(key))
    }

    fn membership_change_number(&self, key: &str) -> i64 {
        self.memberships
            .read()
            .get(key)
            .map(|m| m.change_number)
            .unwrap_or(UNSYNCED)
    }

    fn memberships(&self, key: &str) -> Option<BTreeSet<String>> {
        self.memberships.read().get(key).map(|m| m.segments.clone())
    }

    fn replace_memberships(
        &self,
        key: &str,
        segments: BTreeSet<String>,
        change_number: Option<i64>,
    ) -> bool {
        let mut memberships = self.memberships.write();
        match memberships.get_mut(key) {
            None => {
                memberships.insert(
                    key.to_string(),
                    MembershipEntry {
                        change_number: change_number.unwrap_or(UNSYNCED),
                        segments,
                    },
                );
                true
            }
            Some(entry) => match change_number {
                Some(cn) if cn <= entry.change_number => false,
                Some(cn) => {
                    entry.change_number = cn;
                    entry.segments = segments;
                    true
                }
                None if entry.segments == segments => false,
                None => {
                    entry.segments = segments;
                    true
                }
            },
        }
    }

    fn update_membership(
        &self,
        key: &str,
        segment: &str,
        member: bool,
        change_number: i64,
    ) -> bool {
        let mut memberships = self.memberships.write();
        let entry = memberships
            .entry(key.to_string())
            .or_insert_with(|| MembershipEntry {
                change_number: UNSYNCED,
                segments: BTreeSet::new(),
            });
        if change_number <= entry.change_number {
            return false;
        }
        entry.change_number = change_number;
        if member {
            entry.segments.insert(segment.to_string());
        } else {
            entry.segments.remove(segment);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_changes_are_monotonic() {
        let storage = InMemoryStorage::new();
        assert_eq!(storage.flags_change_number(), UNSYNCED);

        assert!(storage.apply_flag_changes(vec![FlagDefinition::new("a", 10)], vec![], 10));
        assert_eq!(storage.flags_change_number(), 10);

        // same and older change numbers are dropped
        assert!(!storage.apply_flag_changes(vec![FlagDefinition::new("b", 10)], vec![], 10));
        assert!(!storage.apply_flag_changes(vec![], vec!["a".into()], 5));
        assert_eq!(storage.flag_names(), vec!["a"]);

        assert!(storage.apply_flag_changes(vec![], vec!["a".into()], 11));
        assert!(storage.flag_names().is_empty());
    }

    #[test]
    fn test_kill_flag_only_moves_forward() {
        let storage = InMemoryStorage::new();
        storage.apply_flag_changes(vec![FlagDefinition::new("a", 10)], vec![], 10);

        assert!(!storage.kill_flag("a", "off", 9));
        assert!(!storage.kill_flag("missing", "off", 20));
        assert!(storage.kill_flag("a", "off", 20));

        let flag = storage.get_flag("a").unwrap();
        assert!(flag.killed);
        assert_eq!(flag.default_treatment, "off");
        // kill does not advance the global flags change number
        assert_eq!(storage.flags_change_number(), 10);
    }

    #[test]
    fn test_segment_changes() {
        let storage = InMemoryStorage::new();
        assert!(storage.apply_segment_changes("beta", vec!["alice".into()], vec![], 1));
        assert!(storage.segment_contains("beta", "alice"));
        assert!(!storage.apply_segment_changes("beta", vec![], vec!["alice".into()], 1));
        assert!(storage.apply_segment_changes("beta", vec![], vec!["alice".into()], 2));
        assert!(!storage.segment_contains("beta", "alice"));
        assert_eq!(storage.segment_change_number("beta"), 2);
    }

    #[test]
    fn test_membership_replace_without_change_number() {
        let storage = InMemoryStorage::new();
        let set: BTreeSet<String> = ["beta".to_string()].into();

        // first load always applies, even when empty
        assert!(storage.replace_memberships("alice", BTreeSet::new(), None));
        assert!(storage.replace_memberships("alice", set.clone(), None));
        assert!(!storage.replace_memberships("alice", set.clone(), None));
        assert_eq!(storage.memberships("alice"), Some(set));
    }

    #[test]
    fn test_membership_delta_is_monotonic() {
        let storage = InMemoryStorage::new();
        storage.replace_memberships("alice", BTreeSet::new(), Some(5));

        assert!(!storage.update_membership("alice", "beta", true, 5));
        assert!(storage.update_membership("alice", "beta", true, 6));
        assert!(storage.memberships("alice").unwrap().contains("beta"));

        assert!(!storage.replace_memberships("alice", BTreeSet::new(), Some(6)));
        assert!(storage.replace_memberships("alice", BTreeSet::new(), Some(7)));
        assert!(storage.memberships("alice").unwrap().is_empty());
    }
}
