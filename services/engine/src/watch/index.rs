//! Ancestor-to-descendant index used to replay late attributions.

use std::collections::{BTreeSet, HashMap, HashSet};

use tend_id::ObjectUid;

/// Maps each ancestor UID to the UIDs of objects observed beneath it.
///
/// Grows as objects are triaged and shrinks only when a namespace is torn
/// down.
#[derive(Debug, Default)]
pub struct DescendantIndex {
    by_ancestor: HashMap<ObjectUid, BTreeSet<ObjectUid>>,
}

impl DescendantIndex {
    pub fn record<'a>(
        &mut self,
        ancestors: impl IntoIterator<Item = &'a ObjectUid>,
        descendant: &ObjectUid,
    ) {
        for ancestor in ancestors {
            self.by_ancestor
                .entry(ancestor.clone())
                .or_default()
                .insert(descendant.clone());
        }
    }

    pub fn descendants_of(&self, ancestor: &ObjectUid) -> impl Iterator<Item = &ObjectUid> {
        self.by_ancestor.get(ancestor).into_iter().flatten()
    }

    /// Remove descendants everywhere, dropping ancestors left empty.
    pub fn forget(&mut self, descendants: &HashSet<ObjectUid>) {
        self.by_ancestor.retain(|_, set| {
            set.retain(|uid| !descendants.contains(uid));
            !set.is_empty()
        });
    }

    pub fn len(&self) -> usize {
        self.by_ancestor.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ancestor.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(s: &str) -> ObjectUid {
        ObjectUid::new(s)
    }

    #[test]
    fn test_record_and_forget() {
        let mut index = DescendantIndex::default();
        index.record([&uid("rs"), &uid("deploy")], &uid("pod-a"));
        index.record([&uid("rs")], &uid("pod-b"));

        let under_rs: Vec<&str> = index.descendants_of(&uid("rs")).map(|u| u.as_str()).collect();
        assert_eq!(under_rs, vec!["pod-a", "pod-b"]);
        assert_eq!(index.len(), 2);

        index.forget(&HashSet::from([uid("pod-a")]));
        assert_eq!(index.descendants_of(&uid("deploy")).count(), 0);
        assert_eq!(index.len(), 1);
    }
}
