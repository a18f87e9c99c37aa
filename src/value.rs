// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Leaf values of a [`Snapshot`](crate::Snapshot).
//!
//! A [`Leaf`] is what remains at the end of a path once a model has been flattened: a JSON
//! scalar, or an *empty* container. Non-empty containers never appear as leaves; their
//! contents are flattened into further paths instead.
//!
//! # Equality
//!
//! Diffing needs a precise notion of "did this value change", so [`Leaf`] equality is total
//! and structural:
//!
//! - values of different variants are never equal (`U64(1) != I64(1) != Double(1.0)`),
//! - doubles are compared with [`f64::total_cmp`], so `NaN == NaN` and `0.0 != -0.0`,
//! - everything else compares by value.
use serde::{Deserialize, Deserializer, Serialize, Serializer, ser::SerializeMap, ser::SerializeSeq};
use serde_json::{Number, Value};
use std::{cmp::Ordering, fmt};

/// A single flattened value.
#[derive(Clone)]
pub enum Leaf {
    Null,
    Bool(bool),
    U64(u64),
    I64(i64),
    Double(f64),
    String(String),
    /// An object without any fields.
    EmptyObject,
    /// An array without any elements.
    EmptyArray,
}

impl Leaf {
    /// Leaves of different variants order by declaration: `null` first, empty arrays last.
    const fn rank(&self) -> u8 {
        match self {
            Leaf::Null => 0,
            Leaf::Bool(_) => 1,
            Leaf::U64(_) => 2,
            Leaf::I64(_) => 3,
            Leaf::Double(_) => 4,
            Leaf::String(_) => 5,
            Leaf::EmptyObject => 6,
            Leaf::EmptyArray => 7,
        }
    }

    /// Converts a JSON value into a leaf.
    ///
    /// Returns `None` for non-empty objects and arrays, which are not leaves.
    pub fn from_json(value: &Value) -> Option<Self> {
        Some(match value {
            Value::Null => Leaf::Null,
            Value::Bool(b) => Leaf::Bool(*b),
            Value::Number(n) => Self::from_number(n),
            Value::String(s) => Leaf::String(s.clone()),
            Value::Object(map) if map.is_empty() => Leaf::EmptyObject,
            Value::Array(items) if items.is_empty() => Leaf::EmptyArray,
            Value::Object(_) | Value::Array(_) => return None,
        })
    }

    fn from_number(n: &Number) -> Self {
        if let Some(u) = n.as_u64() {
            Leaf::U64(u)
        } else if let Some(i) = n.as_i64() {
            Leaf::I64(i)
        } else {
            // serde_json only produces numbers that are representable as one of the three.
            Leaf::Double(n.as_f64().unwrap_or(f64::NAN))
        }
    }

    /// Converts the leaf back into JSON.
    ///
    /// Non-finite doubles have no JSON representation and become `null`.
    pub fn to_json(&self) -> Value {
        match self {
            Leaf::Null => Value::Null,
            Leaf::Bool(b) => Value::Bool(*b),
            Leaf::U64(u) => Value::from(*u),
            Leaf::I64(i) => Value::from(*i),
            Leaf::Double(d) => Number::from_f64(*d).map_or(Value::Null, Value::Number),
            Leaf::String(s) => Value::String(s.clone()),
            Leaf::EmptyObject => Value::Object(Default::default()),
            Leaf::EmptyArray => Value::Array(Vec::new()),
        }
    }

    /// Returns a short name describing the kind of value.
    pub fn type_name(&self) -> &'static str {
        match self {
            Leaf::Null => "null",
            Leaf::Bool(_) => "bool",
            Leaf::U64(_) => "u64",
            Leaf::I64(_) => "i64",
            Leaf::Double(_) => "double",
            Leaf::String(_) => "string",
            Leaf::EmptyObject => "object",
            Leaf::EmptyArray => "array",
        }
    }
}

/// `From` conversions for the Rust types a leaf can hold, grouped by the variant they land in.
macro_rules! leaf_from {
    ($($variant:ident <- $($source:ty),+;)*) => {
        $($(
            impl From<$source> for Leaf {
                fn from(value: $source) -> Self {
                    Leaf::$variant(value.into())
                }
            }
        )+)*
    };
}

leaf_from! {
    Bool <- bool;
    U64 <- u8, u16, u32, u64;
    I64 <- i8, i16, i32, i64;
    Double <- f32, f64;
    String <- String, &str;
}

impl fmt::Debug for Leaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(inner) => inner.fmt(f),
            // `{:?}` keeps the fraction, so `1.0d` never reads like an integer leaf.
            Self::Double(inner) => write!(f, "{inner:?}d"),
            Self::U64(inner) => write!(f, "{inner}u"),
            Self::I64(inner) => write!(f, "{inner}"),
            Self::String(inner) => inner.fmt(f),
            Self::EmptyObject => f.write_str("{}"),
            Self::EmptyArray => f.write_str("[]"),
        }
    }
}

/// Renders the leaf as JSON text.
impl fmt::Display for Leaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Keep the sign and fraction of non-finite or integral doubles visible.
            Self::Double(inner) if !inner.is_finite() => write!(f, "{inner}"),
            other => other.to_json().fmt(f),
        }
    }
}

impl PartialEq for Leaf {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other).is_eq()
    }
}
impl Eq for Leaf {}

impl PartialOrd for Leaf {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Leaf {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Leaf::Bool(a), Leaf::Bool(b)) => a.cmp(b),
            (Leaf::U64(a), Leaf::U64(b)) => a.cmp(b),
            (Leaf::I64(a), Leaf::I64(b)) => a.cmp(b),
            (Leaf::Double(a), Leaf::Double(b)) => a.total_cmp(b),
            (Leaf::String(a), Leaf::String(b)) => a.cmp(b),
            // Payload-free variants are equal to themselves; everything else orders by rank.
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialEq<str> for Leaf {
    fn eq(&self, other: &str) -> bool {
        matches!(self, Self::String(s) if s == other)
    }
}
impl PartialEq<&str> for Leaf {
    fn eq(&self, other: &&str) -> bool {
        matches!(self, Self::String(s) if s == other)
    }
}
impl PartialEq<bool> for Leaf {
    fn eq(&self, other: &bool) -> bool {
        matches!(self, Self::Bool(b) if b == other)
    }
}
impl PartialEq<f64> for Leaf {
    fn eq(&self, other: &f64) -> bool {
        matches!(self, Self::Double(f) if f == other)
    }
}
impl PartialEq<u64> for Leaf {
    fn eq(&self, other: &u64) -> bool {
        match self {
            Self::U64(u) => u == other,
            Self::I64(i) => u64::try_from(*i).is_ok_and(|u| &u == other),
            _ => false,
        }
    }
}
impl PartialEq<i64> for Leaf {
    fn eq(&self, other: &i64) -> bool {
        match self {
            Self::U64(u) => i64::try_from(*u).is_ok_and(|i| &i == other),
            Self::I64(i) => i == other,
            _ => false,
        }
    }
}
// Unsuffixed integer literals infer as `i32`, so `leaf == 3` lands here.
impl PartialEq<i32> for Leaf {
    fn eq(&self, other: &i32) -> bool {
        match self {
            Self::U64(u) => i32::try_from(*u).is_ok_and(|i| &i == other),
            Self::I64(i) => i32::try_from(*i).is_ok_and(|i| &i == other),
            _ => false,
        }
    }
}

impl Serialize for Leaf {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Leaf::Null => serializer.serialize_unit(),
            Leaf::Bool(b) => serializer.serialize_bool(*b),
            Leaf::U64(u) => serializer.serialize_u64(*u),
            Leaf::I64(i) => serializer.serialize_i64(*i),
            Leaf::Double(d) => serializer.serialize_f64(*d),
            Leaf::String(s) => serializer.serialize_str(s),
            Leaf::EmptyObject => serializer.serialize_map(Some(0))?.end(),
            Leaf::EmptyArray => serializer.serialize_seq(Some(0))?.end(),
        }
    }
}

impl<'de> Deserialize<'de> for Leaf {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Leaf::from_json(&value)
            .ok_or_else(|| serde::de::Error::custom("expected a scalar or an empty container"))
    }
}

#[cfg(any(test, feature = "arbitrary"))]
impl quickcheck::Arbitrary for Leaf {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        match u8::arbitrary(g) % 8 {
            0 => Leaf::Null,
            1 => Leaf::Bool(bool::arbitrary(g)),
            2 => Leaf::U64(u64::arbitrary(g)),
            3 => Leaf::I64(i64::arbitrary(g)),
            4 => Leaf::Double(f64::arbitrary(g)),
            5 => Leaf::String(String::arbitrary(g)),
            6 => Leaf::EmptyObject,
            _ => Leaf::EmptyArray,
        }
    }
}
