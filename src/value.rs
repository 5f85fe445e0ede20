use std::collections::BTreeMap;

use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};

use crate::ast::PathSeg;

/// A runtime value in the template.
///
/// The value domain is a closed tagged union; host data is converted at the
/// boundary (via the `From` impls or [`Value::from_serialize`]) rather than
/// accessed through reflection.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Truthiness for control flow: `null`, `false`, `0`, `""`, and empty
    /// sequences are falsy; everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0.0,
            Self::String(s) => !s.is_empty(),
            Self::List(l) => !l.is_empty(),
            Self::Map(m) => !m.is_empty(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    /// The string form used for output and string-taking filters.
    ///
    /// Numbers with no fractional part print without a decimal point, so
    /// `10 * 5` renders as `50` rather than `50.0`.
    pub fn to_display(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(b) => if *b { "true" } else { "false" }.to_owned(),
            Self::Number(n) => format_number(*n),
            Self::String(s) => s.clone(),
            Self::List(items) => {
                let parts: Vec<_> = items.iter().map(Self::to_display).collect();
                parts.join(", ")
            }
            Self::Map(_) => serde_json::to_string(self).unwrap_or_default(),
        }
    }

    /// Lenient numeric coercion: null is 0, booleans are 0/1, strings parse
    /// or fall back to 0. Sequences have no numeric form and coerce to 0.
    pub fn as_number(&self) -> f64 {
        match self {
            Self::Null => 0.0,
            Self::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Number(n) => *n,
            Self::String(s) => s.trim().parse().unwrap_or(0.0),
            Self::List(_) | Self::Map(_) => 0.0,
        }
    }

    /// Structural emptiness: null, the empty string, and empty sequences.
    /// Unlike truthiness, `0` and `false` are not empty.
    pub fn is_empty_value(&self) -> bool {
        match self {
            Self::Null => true,
            Self::String(s) => s.is_empty(),
            Self::List(l) => l.is_empty(),
            Self::Map(m) => m.is_empty(),
            Self::Bool(_) | Self::Number(_) => false,
        }
    }

    /// Walk a path of map keys / list indices. Missing keys, out-of-range
    /// indices, and lookups on scalars all resolve to null.
    pub fn get_path(&self, segments: &[PathSeg]) -> Value {
        let mut current = self;
        for seg in segments {
            current = match (current, seg) {
                (Self::Map(map), PathSeg::Key(key)) => match map.get(key) {
                    Some(v) => v,
                    None => return Self::Null,
                },
                (Self::List(list), PathSeg::Index(i)) => {
                    let idx = usize::try_from(*i).ok();
                    match idx.and_then(|i| list.get(i)) {
                        Some(v) => v,
                        None => return Self::Null,
                    }
                }
                // Numeric keys address lists too: `items.0` and `items[0]`
                // resolve the same way.
                (Self::List(list), PathSeg::Key(key)) => {
                    match key.parse::<usize>().ok().and_then(|i| list.get(i)) {
                        Some(v) => v,
                        None => return Self::Null,
                    }
                }
                (Self::Map(map), PathSeg::Index(i)) => match map.get(&i.to_string()) {
                    Some(v) => v,
                    None => return Self::Null,
                },
                _ => return Self::Null,
            };
        }
        current.clone()
    }

    /// Loose equality: same-type values compare structurally; a Number and a
    /// numeric String compare numerically. Anything else is unequal.
    pub fn loose_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Number(n), Self::String(s)) | (Self::String(s), Self::Number(n)) => {
                s.trim().parse::<f64>().is_ok_and(|parsed| parsed == *n)
            }
            (a, b) => a.strict_eq(b),
        }
    }

    /// Strict equality: identical variant and equal contents.
    pub fn strict_eq(&self, other: &Self) -> bool {
        self == other
    }

    /// Convert any serializable host value into the template value domain.
    pub fn from_serialize<T: Serialize>(value: &T) -> Option<Self> {
        serde_json::to_value(value).ok().map(Self::from)
    }
}

fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(map) => {
                Self::Map(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map_or(Self::Null, Self::Number),
            Value::String(s) => Self::String(s.clone()),
            Value::List(items) => Self::Array(items.iter().map(Self::from).collect()),
            Value::Map(map) => Self::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from(v)))
                    .collect(),
            ),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        // Integral numbers serialize as integers so `json` output and cached
        // literals stay canonical.
        match self {
            Self::Number(n) if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 => {
                serializer.serialize_i64(*n as i64)
            }
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Number(n) => serializer.serialize_f64(*n),
            Self::String(s) => serializer.serialize_str(s),
            Self::List(items) => items.serialize(serializer),
            Self::Map(map) => map.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Self::from)
    }
}

// Convenience conversions for common host types.
impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<BTreeMap<String, T>> for Value {
    fn from(map: BTreeMap<String, T>) -> Self {
        Self::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(!Value::String(String::new()).is_truthy());
        assert!(!Value::List(vec![]).is_truthy());
        assert!(!Value::Map(BTreeMap::new()).is_truthy());

        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Number(-1.5).is_truthy());
        assert!(Value::from("0").is_truthy());
        assert!(Value::from(vec![Value::Null]).is_truthy());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_integral_numbers_display_without_fraction() {
        assert_eq!(Value::Number(50.0).to_display(), "50");
        assert_eq!(Value::Number(-3.0).to_display(), "-3");
        assert_eq!(Value::Number(2.5).to_display(), "2.5");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_null_displays_empty() {
        assert_eq!(Value::Null.to_display(), "");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_loose_eq_coerces_numeric_strings() {
        assert!(Value::Number(18.0).loose_eq(&Value::from("18")));
        assert!(Value::from("18").loose_eq(&Value::Number(18.0)));
        assert!(!Value::Number(18.0).loose_eq(&Value::from("18a")));
        assert!(!Value::Number(18.0).strict_eq(&Value::from("18")));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_get_path_is_permissive() {
        let mut user = BTreeMap::new();
        user.insert("name".to_owned(), Value::from("Ada"));
        let value = Value::Map(
            [("user".to_owned(), Value::Map(user))]
                .into_iter()
                .collect(),
        );

        let path = [PathSeg::Key("user".to_owned()), PathSeg::Key("name".to_owned())];
        assert_eq!(value.get_path(&path), Value::from("Ada"));

        let missing = [PathSeg::Key("user".to_owned()), PathSeg::Key("age".to_owned())];
        assert_eq!(value.get_path(&missing), Value::Null);

        let scalar = [PathSeg::Key("user".to_owned()), PathSeg::Index(3)];
        assert_eq!(value.get_path(&scalar), Value::Null);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_get_path_indexes_lists() {
        let scores = Value::from(vec![10i64, 20, 30]);
        assert_eq!(scores.get_path(&[PathSeg::Index(1)]), Value::Number(20.0));
        assert_eq!(scores.get_path(&[PathSeg::Index(9)]), Value::Null);
        assert_eq!(
            scores.get_path(&[PathSeg::Key("2".to_owned())]),
            Value::Number(30.0)
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_emptiness_is_structural() {
        assert!(Value::Null.is_empty_value());
        assert!(Value::from("").is_empty_value());
        assert!(Value::List(vec![]).is_empty_value());
        assert!(!Value::Number(0.0).is_empty_value());
        assert!(!Value::Bool(false).is_empty_value());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_json_round_trip() {
        let value = Value::from(vec![Value::Number(1.0), Value::from("two")]);
        let encoded = serde_json::to_string(&value).unwrap();
        assert_eq!(encoded, r#"[1,"two"]"#);
        let decoded: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, value);
    }
}
