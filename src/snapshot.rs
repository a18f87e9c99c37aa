// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Flattened snapshots of models.
//!
//! A [`Snapshot`] is a read-only, flat view of a model at one instant: every leaf of the
//! serialized model is stored under its [`Path`]. Maps contribute their keys as path segments,
//! arrays contribute their indices.
//!
//! ```rust
//! # use reflux::Snapshot;
//! # use serde_json::json;
//! let snapshot = Snapshot::from_json(&json!({
//!     "user": { "address": { "street": "Main St" } },
//!     "tokens": ["a", "b"],
//! }));
//!
//! assert_eq!(snapshot.len(), 3);
//! assert_eq!(snapshot.get("user/address/street").unwrap(), "Main St");
//! assert_eq!(snapshot.get("tokens/1").unwrap(), "b");
//! ```
//!
//! Snapshots are produced with `serde`. Serialization failures never propagate out of
//! [`Snapshot::encode`] and [`Snapshot::decode`]: they fall back to an empty snapshot and a
//! default model respectively, and are logged. Use [`Snapshot::try_encode`] and
//! [`Snapshot::try_decode`] to observe the error instead.
use crate::{Leaf, error::Error, error::Result};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use smallvec::SmallVec;
use std::{collections::BTreeMap, fmt, str::FromStr};
use tracing::warn;

/// One step in a [`Path`].
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Segment {
    /// An object field.
    Key(String),
    /// An array element.
    Index(usize),
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Key(key) => key.fmt(f),
            Segment::Index(index) => write!(f, "[{index}]"),
        }
    }
}

impl From<&str> for Segment {
    fn from(value: &str) -> Self {
        Segment::Key(value.to_string())
    }
}

impl From<usize> for Segment {
    fn from(value: usize) -> Self {
        Segment::Index(value)
    }
}

/// The location of a leaf inside a model.
///
/// Paths render as `/`-joined segments (`user/address/street`, `tokens/0`). Keys containing `~`
/// or `/` are escaped as `~0` and `~1`, the same way JSON pointers do it. Keys made only of
/// digits are prefixed with `~2` so they never render like an index (`users/~242`). The root
/// path (used by models that serialize to a scalar) renders as the empty string.
///
/// When parsing a path from a string, all-digit segments are read as array indices and
/// segments starting with `~2` as keys.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Path(SmallVec<[Segment; 6]>);

impl Path {
    /// The path of the whole model.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parses a `/`-separated path.
    pub fn parse(path: &str) -> Self {
        Self::parse_with(path, true)
    }

    /// Parses a path reading every unescaped segment as a key, so `users/42` names the field
    /// `"42"` of `users`.
    pub fn parse_keys(path: &str) -> Self {
        Self::parse_with(path, false)
    }

    fn parse_with(path: &str, indices: bool) -> Self {
        if path.is_empty() {
            return Self::root();
        }
        Self(
            path.split('/')
                .map(|raw| {
                    if let Some(digits) = raw.strip_prefix("~2") {
                        return Segment::Key(unescape(digits));
                    }
                    if indices && is_numeric(raw) {
                        if let Ok(index) = raw.parse() {
                            return Segment::Index(index);
                        }
                    }
                    Segment::Key(unescape(raw))
                })
                .collect(),
        )
    }

    /// True if any segment is an array index.
    fn has_index(&self) -> bool {
        self.0.iter().any(|segment| matches!(segment, Segment::Index(_)))
    }

    /// Returns this path extended by one segment.
    pub fn child(&self, segment: impl Into<Segment>) -> Self {
        let mut path = self.clone();
        path.push(segment.into());
        path
    }

    pub fn push(&mut self, segment: Segment) {
        self.0.push(segment);
    }

    pub fn pop(&mut self) -> Option<Segment> {
        self.0.pop()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true if `self` equals `prefix` or lies below it.
    pub fn starts_with(&self, prefix: &Path) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl FromIterator<Segment> for Path {
    fn from_iter<T: IntoIterator<Item = Segment>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<&str> for Path {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl FromStr for Path {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            match segment {
                Segment::Key(key) if is_numeric(key) => write!(f, "~2{key}")?,
                Segment::Key(key) => f.write_str(&key.replace('~', "~0").replace('/', "~1"))?,
                Segment::Index(index) => write!(f, "{index}")?,
            }
        }
        Ok(())
    }
}

fn is_numeric(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

fn unescape(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

/// Looks `path` up reading digits as indices first, then as keys.
pub(crate) fn lookup<'m, V>(entries: &'m BTreeMap<Path, V>, path: &str) -> Option<&'m V> {
    let parsed = Path::parse(path);
    entries.get(&parsed).or_else(|| {
        parsed
            .has_index()
            .then(|| entries.get(&Path::parse_keys(path)))
            .flatten()
    })
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{self}")
    }
}

impl Serialize for Path {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A flat `path -> leaf` view of a model.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Snapshot {
    entries: BTreeMap<Path, Leaf>,
}

impl Snapshot {
    /// Creates an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Flattens a model.
    ///
    /// If the model cannot be serialized, the failure is logged and an empty snapshot returned.
    pub fn encode<M: Serialize + ?Sized>(model: &M) -> Self {
        Self::try_encode(model).unwrap_or_else(|error| {
            warn!(%error, "falling back to an empty snapshot");
            Self::default()
        })
    }

    /// Flattens a model, returning serialization errors.
    pub fn try_encode<M: Serialize + ?Sized>(model: &M) -> Result<Self> {
        let value = serde_json::to_value(model).map_err(Error::Encode)?;
        Ok(Self::from_json(&value))
    }

    /// Flattens a JSON value.
    pub fn from_json(value: &Value) -> Self {
        let mut entries = BTreeMap::new();
        flatten_into(value, &mut Path::root(), &mut entries);
        Self { entries }
    }

    /// Rebuilds the nested JSON value this snapshot was flattened from.
    ///
    /// Missing array elements are filled with `null`. If a path is recorded both as a leaf
    /// and as the prefix of other paths, the nested entries win.
    pub fn to_json(&self) -> Value {
        let mut root = Value::Null;
        for (path, leaf) in &self.entries {
            let mut slot = &mut root;
            for segment in path.segments() {
                slot = descend(slot, segment);
            }
            // Don't clobber a container already populated by a deeper path.
            if !(is_populated_container(slot) && leaf_is_empty_container(leaf)) {
                *slot = leaf.to_json();
            }
        }
        root
    }

    /// Rebuilds a model.
    ///
    /// If the snapshot does not describe a valid `M`, the failure is logged and `M::default()`
    /// returned.
    pub fn decode<M: DeserializeOwned + Default>(&self) -> M {
        self.try_decode().unwrap_or_else(|error| {
            warn!(%error, "falling back to a default model");
            M::default()
        })
    }

    /// Rebuilds a model, returning deserialization errors.
    pub fn try_decode<M: DeserializeOwned>(&self) -> Result<M> {
        serde_json::from_value(self.to_json()).map_err(Error::Decode)
    }

    /// Looks up the leaf at a `/`-separated path.
    ///
    /// A plain digit segment matches an array index or, failing that, a numeric object key.
    pub fn get(&self, path: &str) -> Option<&Leaf> {
        lookup(&self.entries, path)
    }

    pub fn get_path(&self, path: &Path) -> Option<&Leaf> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    pub fn insert(&mut self, path: Path, leaf: Leaf) -> Option<Leaf> {
        self.entries.insert(path, leaf)
    }

    pub fn remove(&mut self, path: &Path) -> Option<Leaf> {
        self.entries.remove(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over all entries, ordered by path.
    pub fn iter(&self) -> impl Iterator<Item = (&Path, &Leaf)> {
        self.entries.iter()
    }

    /// Iterates over all entries at or below `prefix`.
    pub fn scan<'a>(&'a self, prefix: &'a Path) -> impl Iterator<Item = (&'a Path, &'a Leaf)> {
        self.entries
            .range(prefix.clone()..)
            .take_while(move |(path, _)| path.starts_with(prefix))
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.keys()
    }
}

impl FromIterator<(Path, Leaf)> for Snapshot {
    fn from_iter<T: IntoIterator<Item = (Path, Leaf)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = (&'a Path, &'a Leaf);
    type IntoIter = std::collections::btree_map::Iter<'a, Path, Leaf>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

fn flatten_into(value: &Value, path: &mut Path, out: &mut BTreeMap<Path, Leaf>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, value) in map {
                path.push(Segment::Key(key.clone()));
                flatten_into(value, path, out);
                path.pop();
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (index, value) in items.iter().enumerate() {
                path.push(Segment::Index(index));
                flatten_into(value, path, out);
                path.pop();
            }
        }
        leaf => {
            if let Some(leaf) = Leaf::from_json(leaf) {
                out.insert(path.clone(), leaf);
            }
        }
    }
}

/// Returns the child slot for `segment`, turning `slot` into the right container first.
fn descend<'v>(slot: &'v mut Value, segment: &Segment) -> &'v mut Value {
    match segment {
        Segment::Key(key) => {
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            let Value::Object(map) = slot else {
                unreachable!("slot was just made an object")
            };
            map.entry(key.clone()).or_insert(Value::Null)
        }
        Segment::Index(index) => {
            if !slot.is_array() {
                *slot = Value::Array(Vec::new());
            }
            let Value::Array(items) = slot else {
                unreachable!("slot was just made an array")
            };
            if items.len() <= *index {
                items.resize(index + 1, Value::Null);
            }
            &mut items[*index]
        }
    }
}

fn is_populated_container(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        _ => false,
    }
}

fn leaf_is_empty_container(leaf: &Leaf) -> bool {
    matches!(leaf, Leaf::EmptyObject | Leaf::EmptyArray)
}

#[cfg(any(test, feature = "arbitrary"))]
impl quickcheck::Arbitrary for Path {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        // A tiny alphabet makes paths collide often, which is where diffs get interesting.
        let depth = 1 + usize::arbitrary(g) % 3;
        (0..depth)
            .map(|_| {
                if bool::arbitrary(g) {
                    Segment::Key(g.choose(&["a", "b", "c"]).copied().unwrap_or("a").to_string())
                } else {
                    Segment::Index(usize::arbitrary(g) % 3)
                }
            })
            .collect()
    }
}

#[cfg(any(test, feature = "arbitrary"))]
impl quickcheck::Arbitrary for Snapshot {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        Vec::<(Path, Leaf)>::arbitrary(g).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Address {
        street: String,
    }

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        name: String,
        address: Address,
        tokens: Vec<String>,
        tags: Vec<String>,
    }

    fn ada() -> User {
        User {
            name: "Ada".into(),
            address: Address {
                street: "Main St".into(),
            },
            tokens: vec!["t0".into(), "t1".into()],
            tags: vec![],
        }
    }

    #[test]
    fn flattens_nested_models() {
        let snapshot = Snapshot::encode(&ada());
        let paths: Vec<String> = snapshot.paths().map(ToString::to_string).collect();
        assert_eq!(
            paths,
            ["address/street", "name", "tags", "tokens/0", "tokens/1"]
        );
        assert_eq!(snapshot.get("tags"), Some(&Leaf::EmptyArray));
    }

    #[test]
    fn decode_restores_the_model() {
        let snapshot = Snapshot::encode(&ada());
        assert_eq!(snapshot.decode::<User>(), ada());
    }

    #[test]
    fn scalar_models_live_at_the_root() {
        let snapshot = Snapshot::encode(&42u32);
        assert_eq!(snapshot.get_path(&Path::root()), Some(&Leaf::U64(42)));
        assert_eq!(snapshot.decode::<u32>(), 42);
    }

    #[test]
    fn decode_falls_back_to_default() {
        let snapshot = Snapshot::from_json(&json!({"name": 7}));
        assert!(snapshot.try_decode::<User>().is_err());
        assert_eq!(snapshot.decode::<User>(), User::default());
    }

    #[test]
    fn encode_falls_back_to_empty() {
        struct Unserializable;
        impl Serialize for Unserializable {
            fn serialize<S: serde::Serializer>(&self, _: S) -> std::result::Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("nope"))
            }
        }

        assert!(Snapshot::try_encode(&Unserializable).is_err());
        assert!(Snapshot::encode(&Unserializable).is_empty());
    }

    #[test]
    fn keys_with_separators_are_escaped() {
        let snapshot = Snapshot::from_json(&json!({"a/b": {"c~d": 1}}));
        let path = snapshot.paths().next().unwrap().clone();
        assert_eq!(path.to_string(), "a~1b/c~0d");
        assert_eq!(Path::parse("a~1b/c~0d"), path);
        assert_eq!(snapshot.to_json(), json!({"a/b": {"c~d": 1}}));
    }

    #[test]
    fn to_json_fills_array_holes() {
        let snapshot: Snapshot = [(Path::parse("items/2"), Leaf::from("c"))]
            .into_iter()
            .collect();
        assert_eq!(snapshot.to_json(), json!({"items": [null, null, "c"]}));
    }

    #[test]
    fn scan_returns_entries_below_prefix() {
        let snapshot = Snapshot::encode(&ada());
        let prefix = Path::parse("tokens");
        let found: Vec<String> = snapshot
            .scan(&prefix)
            .map(|(path, _)| path.to_string())
            .collect();
        assert_eq!(found, ["tokens/0", "tokens/1"]);
    }

    #[test]
    fn serializes_as_flat_map() {
        let snapshot = Snapshot::from_json(&json!({"user": {"name": "Ada"}, "tokens": [1]}));
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json, json!({"tokens/0": 1, "user/name": "Ada"}));
    }

    #[test]
    fn numeric_keys_are_not_indices() {
        let snapshot = Snapshot::from_json(&json!({"users": {"42": "ada"}, "ids": ["x"]}));
        assert_eq!(snapshot.get("users/42"), Some(&Leaf::from("ada")));
        assert_eq!(snapshot.get("users/~242"), Some(&Leaf::from("ada")));
        assert_eq!(snapshot.get("ids/0"), Some(&Leaf::from("x")));
        assert_eq!(snapshot.get("ids/~20"), None);

        let key = Path::root().child("users").child("42");
        assert_eq!(key.to_string(), "users/~242");
        assert_eq!(Path::parse("users/~242"), key);
        assert_ne!(key, Path::parse("users/42"));
        assert_eq!(Path::parse_keys("users/42"), key);
        assert_eq!(snapshot.to_json(), json!({"users": {"42": "ada"}, "ids": ["x"]}));
    }

    #[test]
    fn escaped_tildes_do_not_read_as_numeric_keys() {
        let path = Path::root().child("~242");
        assert_eq!(path.to_string(), "~0242");
        assert_eq!(Path::parse("~0242"), path);
    }

    #[quickcheck]
    fn json_roundtrip(snapshot: Snapshot) -> bool {
        // Only well-formed snapshots (as produced by flattening) roundtrip exactly.
        let flattened = Snapshot::from_json(&snapshot.to_json());
        Snapshot::from_json(&flattened.to_json()) == flattened
    }
}
