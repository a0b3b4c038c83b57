//! Snapshot comparison for push planning, `keysync diff`, and document
//! merges.

use keysync_core::KeyValueSnapshot;

/// Old and new value of a modified key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueChange {
    pub old: String,
    pub new: String,
}

/// Outcome of comparing two snapshots.
///
/// `added`, `removed` and `modified` are pairwise disjoint; together with the
/// unchanged keys they cover every key of both inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffResult {
    /// Keys only in `new`, in `new` order.
    pub added: KeyValueSnapshot,
    /// Keys only in `old`, in `old` order.
    pub removed: KeyValueSnapshot,
    /// Keys in both with different values, in `new` order.
    pub modified: Vec<(String, ValueChange)>,
    pub unchanged: usize,
}

/// Compare `old` against `new`.
pub fn diff(old: &KeyValueSnapshot, new: &KeyValueSnapshot) -> DiffResult {
    let mut result = DiffResult::default();

    for (key, value) in new.iter() {
        match old.get(key) {
            None => {
                result.added.insert(key, value);
            }
            Some(previous) if previous == value => result.unchanged += 1,
            Some(previous) => result.modified.push((
                key.to_string(),
                ValueChange {
                    old: previous.to_string(),
                    new: value.to_string(),
                },
            )),
        }
    }

    for (key, value) in old.iter() {
        if !new.contains_key(key) {
            result.removed.insert(key, value);
        }
    }

    result
}

impl DiffResult {
    /// True when the inputs held identical key/value sets.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    /// `"N added, N removed, N modified"`.
    pub fn summary(&self) -> String {
        format!(
            "{} added, {} removed, {} modified",
            self.added.len(),
            self.removed.len(),
            self.modified.len()
        )
    }

    /// Added and modified keys, i.e. everything a push of `new` would write.
    pub fn changed_keys(&self) -> impl Iterator<Item = &str> {
        self.added
            .keys()
            .chain(self.modified.iter().map(|(key, _)| key.as_str()))
    }

    /// Bring `target` (a copy of `old`) up to `new` for added and modified
    /// keys. Removed keys are kept: a merge never drops remote-only entries.
    pub fn apply_to(&self, target: &mut KeyValueSnapshot) {
        target.merge(&self.added);
        for (key, change) in &self.modified {
            target.insert(key.as_str(), change.new.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn snapshot(pairs: &[(&str, &str)]) -> KeyValueSnapshot {
        pairs.iter().copied().collect()
    }

    #[test]
    fn classifies_added_removed_modified_and_unchanged() {
        let old = snapshot(&[("A", "1"), ("B", "2")]);
        let new = snapshot(&[("B", "3"), ("C", "4")]);

        let d = diff(&old, &new);
        assert_eq!(d.added, snapshot(&[("C", "4")]));
        assert_eq!(d.removed, snapshot(&[("A", "1")]));
        assert_eq!(
            d.modified,
            vec![(
                "B".to_string(),
                ValueChange {
                    old: "2".into(),
                    new: "3".into()
                }
            )]
        );
        assert_eq!(d.unchanged, 0);
        assert_eq!(d.summary(), "1 added, 1 removed, 1 modified");
    }

    #[test]
    fn identical_snapshots_are_empty() {
        let s = snapshot(&[("A", "1"), ("B", "2")]);
        let d = diff(&s, &s);
        assert!(d.is_empty());
        assert_eq!(d.unchanged, 2);
    }

    #[test]
    fn categories_are_disjoint_and_cover_both_inputs() {
        let old = snapshot(&[("A", "1"), ("B", "2"), ("C", "3"), ("D", "4")]);
        let new = snapshot(&[("D", "4"), ("C", "x"), ("E", "5"), ("F", "6")]);
        let d = diff(&old, &new);

        let added: HashSet<&str> = d.added.keys().collect();
        let removed: HashSet<&str> = d.removed.keys().collect();
        let modified: HashSet<&str> = d.modified.iter().map(|(k, _)| k.as_str()).collect();

        assert!(added.is_disjoint(&removed));
        assert!(added.is_disjoint(&modified));
        assert!(removed.is_disjoint(&modified));

        let union: HashSet<&str> = old.keys().chain(new.keys()).collect();
        assert_eq!(
            added.len() + removed.len() + modified.len() + d.unchanged,
            union.len()
        );
    }

    #[test]
    fn ordering_follows_new_then_old() {
        let old = snapshot(&[("Z", "1"), ("Y", "2")]);
        let new = snapshot(&[("C", "x"), ("B", "y"), ("A", "z")]);
        let d = diff(&old, &new);
        assert_eq!(d.added.keys().collect::<Vec<_>>(), ["C", "B", "A"]);
        assert_eq!(d.removed.keys().collect::<Vec<_>>(), ["Z", "Y"]);
    }

    #[test]
    fn apply_to_keeps_remote_only_keys() {
        let remote = snapshot(&[("KEEP", "r"), ("SHARED", "old")]);
        let local = snapshot(&[("SHARED", "new"), ("FRESH", "f")]);
        let d = diff(&remote, &local);

        let mut merged = remote.clone();
        d.apply_to(&mut merged);
        assert_eq!(
            merged,
            snapshot(&[("KEEP", "r"), ("SHARED", "new"), ("FRESH", "f")])
        );
        assert_eq!(d.changed_keys().collect::<Vec<_>>(), ["FRESH", "SHARED"]);
    }
}
