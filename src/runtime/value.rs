//! Context-independent plain values.
//!
//! [`PlainValue`] is the detached form a value takes after being deep
//! copied out of its context: plain data only, safe to move between
//! threads, able to represent the full numeric range including NaN and
//! ±Infinity. References never appear inside a plain value; a reference
//! result is marshaled separately.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::runtime::config::CopyLimits;
use crate::runtime::error::{Error, Result};

/// Detached copy of a context value.
#[derive(Clone, Debug, PartialEq)]
pub enum PlainValue {
    Undefined,
    Null,
    Bool(bool),
    /// Integral number within i64 range.
    Int(i64),
    /// Any other number, including NaN and ±Infinity.
    Float(f64),
    String(String),
    /// Preserves element order.
    Array(Vec<PlainValue>),
    /// Preserves insertion order.
    Object(IndexMap<String, PlainValue>),
}

impl PlainValue {
    /// Represent a number the way a copy does: integral finite values
    /// collapse to `Int`, everything else stays `Float`.
    pub fn number(value: f64) -> Self {
        if value.is_finite() && value.fract() == 0.0 {
            let as_int = value as i64;
            if as_int as f64 == value {
                return PlainValue::Int(as_int);
            }
        }
        PlainValue::Float(value)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PlainValue::Int(i) => Some(*i as f64),
            PlainValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PlainValue::String(s) => Some(s),
            _ => None,
        }
    }
}

// `Undefined` and `Null` both serialize as unit; the distinction exists
// only between contexts, not on the wire.
impl Serialize for PlainValue {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            PlainValue::Undefined | PlainValue::Null => serializer.serialize_none(),
            PlainValue::Bool(b) => serializer.serialize_bool(*b),
            PlainValue::Int(i) => serializer.serialize_i64(*i),
            PlainValue::Float(f) => serializer.serialize_f64(*f),
            PlainValue::String(s) => serializer.serialize_str(s),
            PlainValue::Array(items) => items.serialize(serializer),
            PlainValue::Object(map) => map.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for PlainValue {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct PlainValueVisitor;

        impl<'de> Visitor<'de> for PlainValueVisitor {
            type Value = PlainValue;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a plain value (null, bool, number, string, array, or object)")
            }

            fn visit_bool<E>(self, value: bool) -> std::result::Result<Self::Value, E> {
                Ok(PlainValue::Bool(value))
            }

            fn visit_i64<E>(self, value: i64) -> std::result::Result<Self::Value, E> {
                Ok(PlainValue::Int(value))
            }

            fn visit_u64<E>(self, value: u64) -> std::result::Result<Self::Value, E> {
                if value <= i64::MAX as u64 {
                    Ok(PlainValue::Int(value as i64))
                } else {
                    Ok(PlainValue::Float(value as f64))
                }
            }

            fn visit_f64<E>(self, value: f64) -> std::result::Result<Self::Value, E> {
                Ok(PlainValue::Float(value))
            }

            fn visit_str<E>(self, value: &str) -> std::result::Result<Self::Value, E> {
                Ok(PlainValue::String(value.to_owned()))
            }

            fn visit_string<E>(self, value: String) -> std::result::Result<Self::Value, E> {
                Ok(PlainValue::String(value))
            }

            fn visit_none<E>(self) -> std::result::Result<Self::Value, E> {
                Ok(PlainValue::Null)
            }

            fn visit_unit<E>(self) -> std::result::Result<Self::Value, E> {
                Ok(PlainValue::Null)
            }

            fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut items = Vec::new();
                while let Some(element) = seq.next_element()? {
                    items.push(element);
                }
                Ok(PlainValue::Array(items))
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: de::MapAccess<'de>,
            {
                let mut object = IndexMap::new();
                while let Some((key, value)) = map.next_entry()? {
                    object.insert(key, value);
                }
                Ok(PlainValue::Object(object))
            }
        }

        deserializer.deserialize_any(PlainValueVisitor)
    }
}

/// Countdown budget enforced while copying a value out of its context.
/// Exceeding either bound fails the copy as a whole.
pub struct LimitTracker {
    depth_left: usize,
    bytes_left: usize,
}

impl LimitTracker {
    pub fn new(limits: CopyLimits) -> Self {
        Self {
            depth_left: limits.max_depth,
            bytes_left: limits.max_bytes,
        }
    }

    /// Enter one nesting level.
    pub fn descend(&mut self) -> Result<()> {
        match self.depth_left.checked_sub(1) {
            Some(left) => {
                self.depth_left = left;
                Ok(())
            }
            None => Err(Error::InvalidOperation(
                "copy exceeded the depth limit".to_string(),
            )),
        }
    }

    /// Leave one nesting level.
    pub fn ascend(&mut self) {
        self.depth_left += 1;
    }

    /// Account for `bytes` of copied data.
    pub fn charge(&mut self, bytes: usize) -> Result<()> {
        match self.bytes_left.checked_sub(bytes) {
            Some(left) => {
                self.bytes_left = left;
                Ok(())
            }
            None => Err(Error::InvalidOperation(
                "copy exceeded the size limit".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integral_numbers_collapse_to_int() {
        assert_eq!(PlainValue::number(42.0), PlainValue::Int(42));
        assert_eq!(PlainValue::number(2.5), PlainValue::Float(2.5));
        assert!(matches!(
            PlainValue::number(f64::NAN),
            PlainValue::Float(f) if f.is_nan()
        ));
        assert!(matches!(
            PlainValue::number(f64::INFINITY),
            PlainValue::Float(f) if f.is_infinite()
        ));
    }

    #[test]
    fn serde_round_trips_plain_data() {
        let mut map = IndexMap::new();
        map.insert("items".to_string(), PlainValue::Array(vec![
            PlainValue::Int(1),
            PlainValue::String("two".to_string()),
            PlainValue::Null,
        ]));
        map.insert("flag".to_string(), PlainValue::Bool(true));
        let value = PlainValue::Object(map);

        let json = serde_json::to_string(&value).unwrap();
        let back: PlainValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn undefined_flattens_to_null_on_the_wire() {
        let json = serde_json::to_string(&PlainValue::Undefined).unwrap();
        assert_eq!(json, "null");
        let back: PlainValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, PlainValue::Null);
    }

    #[test]
    fn tracker_enforces_depth() {
        let mut tracker = LimitTracker::new(CopyLimits {
            max_depth: 2,
            max_bytes: 1000,
        });
        assert!(tracker.descend().is_ok());
        assert!(tracker.descend().is_ok());
        assert!(tracker.descend().is_err());
        tracker.ascend();
        tracker.ascend();
        assert!(tracker.descend().is_ok());
    }

    #[test]
    fn tracker_enforces_size() {
        let mut tracker = LimitTracker::new(CopyLimits {
            max_depth: 10,
            max_bytes: 100,
        });
        assert!(tracker.charge(60).is_ok());
        assert!(tracker.charge(40).is_ok());
        assert!(tracker.charge(1).is_err());
    }
}
