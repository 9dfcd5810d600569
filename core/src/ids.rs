//! Tab and window identifiers.
//!
//! Identifiers arrive from the host and from persisted state either as
//! numbers or as numeric strings. Both forms deserialize into the same
//! integer newtype, so nothing past this boundary ever compares a string
//! id against a numeric one.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TabId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct WindowId(pub i64);

impl WindowId {
    /// Host sentinel reported when focus leaves every browser window.
    pub const NONE: WindowId = WindowId(-1);

    pub fn is_none_sentinel(self) -> bool {
        self == Self::NONE
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Int(i64),
    Float(f64),
    Text(String),
}

impl RawId {
    fn canonical(self) -> Option<i64> {
        match self {
            RawId::Int(n) => Some(n),
            RawId::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(f as i64),
            RawId::Float(_) => None,
            RawId::Text(s) => s.trim().parse::<i64>().ok(),
        }
    }
}

fn deserialize_canonical<'de, D>(deserializer: D, what: &'static str) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = RawId::deserialize(deserializer)?;
    raw.canonical()
        .ok_or_else(|| serde::de::Error::custom(format!("invalid {what} identifier")))
}

impl<'de> Deserialize<'de> for TabId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_canonical(deserializer, "tab").map(TabId)
    }
}

impl<'de> Deserialize<'de> for WindowId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_canonical(deserializer, "window").map(WindowId)
    }
}

/// Read an optional tab id out of a loosely-typed persisted value.
///
/// `null`, a missing value and anything that is not a whole number (or a
/// string holding one) all read as absent.
pub fn tab_id_from_value(value: Option<&serde_json::Value>) -> Option<TabId> {
    match value {
        None | Some(serde_json::Value::Null) => None,
        Some(v) => serde_json::from_value::<TabId>(v.clone()).ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn numeric_and_string_ids_canonicalize_to_the_same_value() {
        let from_number: TabId = serde_json::from_value(json!(42)).unwrap();
        let from_string: TabId = serde_json::from_value(json!("42")).unwrap();
        let from_float: TabId = serde_json::from_value(json!(42.0)).unwrap();
        assert_eq!(from_number, TabId(42));
        assert_eq!(from_string, TabId(42));
        assert_eq!(from_float, TabId(42));
    }

    #[test]
    fn garbage_ids_are_rejected() {
        assert!(serde_json::from_value::<TabId>(json!("tab-7")).is_err());
        assert!(serde_json::from_value::<WindowId>(json!(1.5)).is_err());
    }

    #[test]
    fn tab_id_from_value_treats_null_as_absent() {
        assert_eq!(tab_id_from_value(None), None);
        assert_eq!(tab_id_from_value(Some(&json!(null))), None);
        assert_eq!(tab_id_from_value(Some(&json!("17"))), Some(TabId(17)));
        assert_eq!(tab_id_from_value(Some(&json!({"id": 3}))), None);
    }

    #[test]
    fn none_sentinel_matches_host_value() {
        let w: WindowId = serde_json::from_value(json!(-1)).unwrap();
        assert!(w.is_none_sentinel());
        assert!(!WindowId(3).is_none_sentinel());
    }
}
