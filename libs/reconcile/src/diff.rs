//! Desired-versus-active diffing.

use std::collections::{BTreeMap, BTreeSet};

/// Actions needed to converge an active keyed set onto a desired one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedDiff<K> {
    /// Keys desired but not active.
    pub to_start: Vec<K>,

    /// Keys active but no longer desired.
    pub to_stop: Vec<K>,

    /// Keys active and desired, but with different parameters.
    pub to_restart: Vec<K>,
}

impl<K> KeyedDiff<K> {
    /// Returns true if no action is needed.
    pub fn is_empty(&self) -> bool {
        self.to_start.is_empty() && self.to_stop.is_empty() && self.to_restart.is_empty()
    }
}

impl<K> Default for KeyedDiff<K> {
    fn default() -> Self {
        Self {
            to_start: Vec::new(),
            to_stop: Vec::new(),
            to_restart: Vec::new(),
        }
    }
}

/// Diff two keyed maps by value equality.
///
/// Entries whose value is unchanged are left alone, no matter how often the
/// diff runs.
pub fn diff_keyed<K, V>(desired: &BTreeMap<K, V>, active: &BTreeMap<K, V>) -> KeyedDiff<K>
where
    K: Ord + Clone,
    V: PartialEq,
{
    let mut diff = KeyedDiff::default();

    for (key, want) in desired {
        match active.get(key) {
            None => diff.to_start.push(key.clone()),
            Some(have) if have != want => diff.to_restart.push(key.clone()),
            Some(_) => {}
        }
    }

    diff.to_stop = active
        .keys()
        .filter(|key| !desired.contains_key(*key))
        .cloned()
        .collect();

    diff
}

/// Setup/teardown actions for a plain set of keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetDiff<K> {
    /// Keys desired but not active.
    pub to_setup: Vec<K>,

    /// Keys active but no longer desired.
    pub to_teardown: Vec<K>,
}

impl<K> SetDiff<K> {
    /// Returns true if no action is needed.
    pub fn is_empty(&self) -> bool {
        self.to_setup.is_empty() && self.to_teardown.is_empty()
    }
}

/// Diff two key sets.
pub fn diff_sets<K: Ord + Clone>(desired: &BTreeSet<K>, active: &BTreeSet<K>) -> SetDiff<K> {
    SetDiff {
        to_setup: desired.difference(active).cloned().collect(),
        to_teardown: active.difference(desired).cloned().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_keyed() {
        let desired = BTreeMap::from([("a", 1), ("b", 2), ("c", 3)]);
        let active = BTreeMap::from([("b", 2), ("c", 4), ("d", 5)]);

        let diff = diff_keyed(&desired, &active);
        assert_eq!(diff.to_start, vec!["a"]);
        assert_eq!(diff.to_restart, vec!["c"]);
        assert_eq!(diff.to_stop, vec!["d"]);
    }

    #[test]
    fn test_diff_keyed_idempotent() {
        let desired = BTreeMap::from([("a", vec![8080]), ("b", vec![9000, 9001])]);

        let first = diff_keyed(&desired, &BTreeMap::new());
        assert_eq!(first.to_start.len(), 2);

        // Once applied, the active set equals the desired set.
        let second = diff_keyed(&desired, &desired.clone());
        assert!(second.is_empty());
    }

    #[test]
    fn test_diff_sets() {
        let desired = BTreeSet::from(["default", "staging"]);
        let active = BTreeSet::from(["default", "old"]);

        let diff = diff_sets(&desired, &active);
        assert_eq!(diff.to_setup, vec!["staging"]);
        assert_eq!(diff.to_teardown, vec!["old"]);

        assert!(diff_sets(&desired, &desired).is_empty());
    }
}
