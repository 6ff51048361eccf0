//! Core identifier and timing types.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Identifier of a body (human or robot).
pub type BodyId = String;

/// Identifier of a keypoint within a body.
pub type KeypointId = String;

/// Index of a segment within a body.
pub type SegmentIndex = u16;

/// Monotonically non-decreasing nanosecond tick.
pub type TimestampType = u64;

/// Discrete robot operating mode.
///
/// A mode is a set of `variable = value` assignments; the empty set is the
/// *empty mode* (robot idle, between commanded motions). Values arriving as
/// JSON numbers or booleans are normalised to their string representation so
/// modes can key ordered containers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Mode {
    values: BTreeMap<String, String>,
}

impl Mode {
    /// The empty mode.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a mode from `(variable, value)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// True for the empty mode.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over the `(variable, value)` assignments.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.values.iter()
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "{{}}");
        }
        write!(f, "{{")?;
        for (i, (k, v)) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        write!(f, "}}")
    }
}

impl Serialize for Mode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (k, v) in &self.values {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Mode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ModeVisitor;

        impl<'de> Visitor<'de> for ModeVisitor {
            type Value = Mode;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of mode variables to values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Mode, A::Error> {
                let mut values = BTreeMap::new();
                while let Some((key, value)) =
                    access.next_entry::<String, serde_json::Value>()?
                {
                    let rendered = match value {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    values.insert(key, rendered);
                }
                Ok(Mode { values })
            }
        }

        deserializer.deserialize_map(ModeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_mode() {
        let mode = Mode::empty();
        assert!(mode.is_empty());
        assert_eq!(mode.to_string(), "{}");
    }

    #[test]
    fn test_mode_normalises_json_values() {
        let mode: Mode = serde_json::from_str(r#"{"phase": 2, "arm": "lowered"}"#).unwrap();
        assert_eq!(
            mode,
            Mode::from_pairs([("phase", "2"), ("arm", "lowered")])
        );
    }

    #[test]
    fn test_mode_round_trip() {
        let mode = Mode::from_pairs([("step", "pick")]);
        let json = serde_json::to_string(&mode).unwrap();
        let back: Mode = serde_json::from_str(&json).unwrap();
        assert_eq!(mode, back);
    }

    #[test]
    fn test_mode_ordering_is_stable() {
        let a = Mode::from_pairs([("a", "1"), ("b", "2")]);
        let b = Mode::from_pairs([("b", "2"), ("a", "1")]);
        assert_eq!(a, b);
    }
}
