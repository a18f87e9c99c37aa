// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Structural diffs between snapshots.
//!
//! A [`Diff`] maps every [`Path`] whose leaf differs between two snapshots to a [`DiffEntry`]
//! describing how it differs. Paths whose leaves are equal (by [`Leaf`]'s equality) are absent.
//!
//! ```rust
//! # use reflux::{Diff, DiffEntry, Leaf, Snapshot};
//! # use serde_json::json;
//! let old = Snapshot::from_json(&json!({"name": "Ada", "age": 36}));
//! let new = Snapshot::from_json(&json!({"name": "Ada", "age": 37, "admin": true}));
//!
//! let diff = Diff::between(&old, &new);
//! assert_eq!(diff.len(), 2);
//! assert_eq!(diff.get("age"), Some(&DiffEntry::Changed { old: Leaf::U64(36), new: Leaf::U64(37) }));
//! assert_eq!(diff.get("admin"), Some(&DiffEntry::Added(Leaf::Bool(true))));
//! assert_eq!(diff.apply(&old), new);
//! ```
use crate::{Leaf, Path, Snapshot, snapshot};
use serde::{Deserialize, Serialize, ser::SerializeMap};
use std::{
    cmp::Ordering,
    collections::{BTreeMap, btree_map},
    fmt,
};

/// How a single path changed.
#[derive(Clone, PartialEq, Eq)]
pub enum DiffEntry {
    /// The path is only present in the new snapshot.
    Added(Leaf),
    /// The path is present in both snapshots with different leaves.
    Changed { old: Leaf, new: Leaf },
    /// The path is only present in the old snapshot.
    Removed(Leaf),
}

impl DiffEntry {
    /// The leaf before the change, if the path existed.
    pub fn old(&self) -> Option<&Leaf> {
        match self {
            DiffEntry::Added(_) => None,
            DiffEntry::Changed { old, .. } | DiffEntry::Removed(old) => Some(old),
        }
    }

    /// The leaf after the change, if the path still exists.
    pub fn new(&self) -> Option<&Leaf> {
        match self {
            DiffEntry::Added(new) | DiffEntry::Changed { new, .. } => Some(new),
            DiffEntry::Removed(_) => None,
        }
    }

    pub fn is_added(&self) -> bool {
        matches!(self, DiffEntry::Added(_))
    }

    pub fn is_changed(&self) -> bool {
        matches!(self, DiffEntry::Changed { .. })
    }

    pub fn is_removed(&self) -> bool {
        matches!(self, DiffEntry::Removed(_))
    }

    /// The entry describing the opposite change.
    pub fn invert(&self) -> Self {
        match self {
            DiffEntry::Added(new) => DiffEntry::Removed(new.clone()),
            DiffEntry::Changed { old, new } => DiffEntry::Changed {
                old: new.clone(),
                new: old.clone(),
            },
            DiffEntry::Removed(old) => DiffEntry::Added(old.clone()),
        }
    }
}

impl fmt::Debug for DiffEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffEntry::Added(new) => write!(f, "+{new:?}"),
            DiffEntry::Changed { old, new } => write!(f, "{old:?} -> {new:?}"),
            DiffEntry::Removed(old) => write!(f, "-{old:?}"),
        }
    }
}

impl Serialize for DiffEntry {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        match self {
            DiffEntry::Added(new) => map.serialize_entry("added", new)?,
            DiffEntry::Changed { old, new } => map.serialize_entry("changed", &(old, new))?,
            DiffEntry::Removed(old) => map.serialize_entry("removed", old)?,
        }
        map.end()
    }
}

/// The set of changed paths between two snapshots, ordered by path.
#[derive(Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Diff {
    entries: BTreeMap<Path, DiffEntry>,
}

impl Diff {
    /// Computes the diff from `old` to `new`.
    ///
    /// Both snapshots are walked once, in path order.
    pub fn between(old: &Snapshot, new: &Snapshot) -> Self {
        let mut entries = BTreeMap::new();
        let mut old_iter = old.iter().peekable();
        let mut new_iter = new.iter().peekable();

        loop {
            let order = match (old_iter.peek(), new_iter.peek()) {
                (None, None) => break,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some((old_path, _)), Some((new_path, _))) => old_path.cmp(new_path),
            };
            match order {
                Ordering::Less => {
                    let Some((path, leaf)) = old_iter.next() else {
                        break;
                    };
                    entries.insert(path.clone(), DiffEntry::Removed(leaf.clone()));
                }
                Ordering::Greater => {
                    let Some((path, leaf)) = new_iter.next() else {
                        break;
                    };
                    entries.insert(path.clone(), DiffEntry::Added(leaf.clone()));
                }
                Ordering::Equal => {
                    let (Some((path, old_leaf)), Some((_, new_leaf))) =
                        (old_iter.next(), new_iter.next())
                    else {
                        break;
                    };
                    if old_leaf != new_leaf {
                        entries.insert(
                            path.clone(),
                            DiffEntry::Changed {
                                old: old_leaf.clone(),
                                new: new_leaf.clone(),
                            },
                        );
                    }
                }
            }
        }

        Self { entries }
    }

    /// Applies this diff to `base`, returning the resulting snapshot.
    ///
    /// Applying `Diff::between(a, b)` to `a` yields `b`.
    pub fn apply(&self, base: &Snapshot) -> Snapshot {
        let mut snapshot = base.clone();
        self.apply_to(&mut snapshot);
        snapshot
    }

    /// Applies this diff to `snapshot` in place.
    ///
    /// Only the new side of each entry is consulted; the old side is not checked against
    /// `snapshot`.
    pub fn apply_to(&self, snapshot: &mut Snapshot) {
        for (path, entry) in &self.entries {
            match entry.new() {
                Some(leaf) => {
                    snapshot.insert(path.clone(), leaf.clone());
                }
                None => {
                    snapshot.remove(path);
                }
            }
        }
    }

    /// Returns the diff that undoes this one.
    pub fn invert(&self) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .map(|(path, entry)| (path.clone(), entry.invert()))
                .collect(),
        }
    }

    /// Looks up the entry for a `/`-separated path.
    pub fn get(&self, path: &str) -> Option<&DiffEntry> {
        snapshot::lookup(&self.entries, path)
    }

    pub fn get_path(&self, path: &Path) -> Option<&DiffEntry> {
        self.entries.get(path)
    }

    /// Returns true if `path` or anything below it changed.
    pub fn touches(&self, path: &Path) -> bool {
        self.entries
            .range(path.clone()..)
            .next()
            .is_some_and(|(changed, _)| changed.starts_with(path))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, &DiffEntry)> {
        self.entries.iter()
    }

    pub fn added(&self) -> impl Iterator<Item = (&Path, &Leaf)> {
        self.entries.iter().filter_map(|(path, entry)| match entry {
            DiffEntry::Added(leaf) => Some((path, leaf)),
            _ => None,
        })
    }

    pub fn removed(&self) -> impl Iterator<Item = (&Path, &Leaf)> {
        self.entries.iter().filter_map(|(path, entry)| match entry {
            DiffEntry::Removed(leaf) => Some((path, leaf)),
            _ => None,
        })
    }

    pub fn changed(&self) -> impl Iterator<Item = (&Path, &Leaf, &Leaf)> {
        self.entries.iter().filter_map(|(path, entry)| match entry {
            DiffEntry::Changed { old, new } => Some((path, old, new)),
            _ => None,
        })
    }
}

impl<'a> IntoIterator for &'a Diff {
    type Item = (&'a Path, &'a DiffEntry);
    type IntoIter = btree_map::Iter<'a, Path, DiffEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl FromIterator<(Path, DiffEntry)> for Diff {
    fn from_iter<T: IntoIterator<Item = (Path, DiffEntry)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl fmt::Debug for Diff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}

impl fmt::Display for Diff {
    /// One line per changed path: `+ path = new`, `~ path = old -> new` or `- path`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (path, entry)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            match entry {
                DiffEntry::Added(new) => write!(f, "+ {path} = {new}")?,
                DiffEntry::Changed { old, new } => write!(f, "~ {path} = {old} -> {new}")?,
                DiffEntry::Removed(_) => write!(f, "- {path}")?,
            }
        }
        Ok(())
    }
}

/// When a store computes the diff of a mutation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffingMode {
    /// No snapshots are taken and no diffs are computed. Every mutation counts as a change.
    None,
    /// The diff is computed while the mutation lock is held and delivered with the change.
    #[default]
    Sync,
    /// The diff is computed while the mutation lock is held, but diff observers are notified
    /// from the dispatcher's diff queue.
    Async,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(value: serde_json::Value) -> Snapshot {
        Snapshot::from_json(&value)
    }

    #[test]
    fn identical_snapshots_have_empty_diff() {
        let a = snapshot(json!({"a": 1, "b": [true, null]}));
        assert!(Diff::between(&a, &a.clone()).is_empty());
    }

    #[test]
    fn classifies_entries() {
        let old = snapshot(json!({"kept": 1, "changed": "x", "removed": false}));
        let new = snapshot(json!({"kept": 1, "changed": "y", "added": 2.5}));
        let diff = Diff::between(&old, &new);

        assert_eq!(diff.len(), 3);
        assert_eq!(diff.added().count(), 1);
        assert_eq!(diff.removed().count(), 1);
        assert_eq!(diff.changed().count(), 1);
        assert!(diff.get("kept").is_none());
        assert_eq!(diff.get("removed"), Some(&DiffEntry::Removed(Leaf::Bool(false))));
    }

    #[test]
    fn type_changes_are_changes() {
        let old = snapshot(json!({"v": 1}));
        let new = snapshot(json!({"v": "1"}));
        let diff = Diff::between(&old, &new);
        assert!(diff.get("v").is_some_and(DiffEntry::is_changed));
    }

    #[test]
    fn growing_an_empty_collection() {
        let old = snapshot(json!({"tags": []}));
        let new = snapshot(json!({"tags": ["a"]}));
        let diff = Diff::between(&old, &new);
        assert_eq!(diff.get("tags"), Some(&DiffEntry::Removed(Leaf::EmptyArray)));
        assert_eq!(diff.get("tags/0"), Some(&DiffEntry::Added(Leaf::from("a"))));
        assert_eq!(diff.apply(&old), new);
    }

    #[test]
    fn touches_checks_prefixes() {
        let old = snapshot(json!({"user": {"name": "Ada"}, "count": 1}));
        let new = snapshot(json!({"user": {"name": "Grace"}, "count": 1}));
        let diff = Diff::between(&old, &new);
        assert!(diff.touches(&Path::parse("user")));
        assert!(diff.touches(&Path::root()));
        assert!(!diff.touches(&Path::parse("count")));
    }

    #[test]
    fn display() {
        let old = snapshot(json!({"user": {"name": "Ada", "tags": ["a"]}, "count": 1}));
        let new = snapshot(json!({"user": {"name": "Grace", "tags": ["a", "b"]}, "flag": true}));
        let diff = Diff::between(&old, &new);

        insta::assert_snapshot!(diff, @r#"
        - count
        + flag = true
        ~ user/name = "Ada" -> "Grace"
        + user/tags/1 = "b"
        "#);
    }

    #[test]
    fn serializes_as_path_keyed_map() {
        let old = snapshot(json!({"a": 1, "b": 2}));
        let new = snapshot(json!({"a": 3, "c": 4}));
        let diff = Diff::between(&old, &new);

        assert_eq!(
            serde_json::to_value(&diff).unwrap(),
            json!({
                "a": {"changed": [1, 3]},
                "b": {"removed": 2},
                "c": {"added": 4},
            })
        );
    }

    #[test]
    fn indices_and_numeric_keys_serialize_apart() {
        let old = snapshot(json!({"a": ["x"]}));
        let new = snapshot(json!({"a": {"0": "y"}}));
        let diff = Diff::between(&old, &new);

        assert_eq!(diff.len(), 2);
        assert_eq!(diff.get("a/0"), Some(&DiffEntry::Removed(Leaf::from("x"))));
        assert_eq!(diff.get("a/~20"), Some(&DiffEntry::Added(Leaf::from("y"))));
        assert_eq!(
            serde_json::to_value(&diff).unwrap(),
            json!({
                "a/0": {"removed": "x"},
                "a/~20": {"added": "y"},
            })
        );
        assert_eq!(diff.apply(&old), new);
    }

    #[test]
    fn diffing_mode_from_config() {
        let mode: DiffingMode = serde_json::from_str("\"async\"").unwrap();
        assert_eq!(mode, DiffingMode::Async);
        assert_eq!(DiffingMode::default(), DiffingMode::Sync);
    }

    #[quickcheck]
    fn apply_reconstructs_new(old: Snapshot, new: Snapshot) -> bool {
        Diff::between(&old, &new).apply(&old) == new
    }

    #[quickcheck]
    fn invert_reconstructs_old(old: Snapshot, new: Snapshot) -> bool {
        let diff = Diff::between(&old, &new);
        diff.invert().apply(&new) == old && diff.invert() == Diff::between(&new, &old)
    }

    #[quickcheck]
    fn diff_only_lists_unequal_paths(old: Snapshot, new: Snapshot) -> bool {
        Diff::between(&old, &new)
            .iter()
            .all(|(path, _)| old.get_path(path) != new.get_path(path))
    }
}
