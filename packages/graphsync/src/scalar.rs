//! Scalar leaf values shared by the encoder and the mirror graph
//!
//! On the wire every scalar is plain JSON: dates travel as `YYYY-MM-DD`
//! strings and timestamps as RFC 3339 strings. The receiving side recovers
//! the richer type from the column declaration (see [`ColumnType`]).

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as Json;

/// A leaf value: attribute contents, ids, counts, aggregate parts
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Scalar {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Date(NaiveDate),
    Time(DateTime<Utc>),
    /// Plain sequence (id lists, aggregate decompositions)
    List(Vec<Scalar>),
}

impl Scalar {
    pub fn is_nil(&self) -> bool {
        matches!(self, Scalar::Nil)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(i) => Some(*i),
            Scalar::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Scalar::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Key form of an id: `12` for integers, the raw text for string ids.
    ///
    /// Used both for collection-level tree keys and for the mirror's id index.
    pub fn key_string(&self) -> String {
        match self {
            Scalar::Str(s) => s.clone(),
            other => other.to_json().to_string(),
        }
    }

    /// Convert to the JSON wire representation
    pub fn to_json(&self) -> Json {
        match self {
            Scalar::Nil => Json::Null,
            Scalar::Bool(b) => Json::Bool(*b),
            Scalar::Int(i) => Json::from(*i),
            Scalar::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Scalar::Str(s) => Json::String(s.clone()),
            Scalar::Date(d) => Json::String(d.format("%Y-%m-%d").to_string()),
            Scalar::Time(t) => Json::String(t.to_rfc3339()),
            Scalar::List(items) => Json::Array(items.iter().map(Scalar::to_json).collect()),
        }
    }

    /// Parse a wire value. Strings stay strings; use [`Scalar::coerce`] to
    /// recover dates and timestamps.
    pub fn from_json(value: &Json) -> Scalar {
        match value {
            Json::Null => Scalar::Nil,
            Json::Bool(b) => Scalar::Bool(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Scalar::Int(i)
                } else {
                    Scalar::Float(n.as_f64().unwrap_or_default())
                }
            }
            Json::String(s) => Scalar::Str(s.clone()),
            Json::Array(items) => Scalar::List(items.iter().map(Scalar::from_json).collect()),
            Json::Object(_) => Scalar::Str(value.to_string()),
        }
    }

    /// Convert a wire scalar into the declared column type.
    ///
    /// Values that cannot be converted are returned unchanged.
    pub fn coerce(self, column: ColumnType) -> Scalar {
        match (column, self) {
            (_, Scalar::Nil) => Scalar::Nil,
            (ColumnType::Date, Scalar::Str(s)) => match NaiveDate::parse_from_str(&s, "%Y-%m-%d") {
                Ok(d) => Scalar::Date(d),
                Err(_) => Scalar::Str(s),
            },
            (ColumnType::Datetime, Scalar::Str(s)) => match DateTime::parse_from_rfc3339(&s) {
                Ok(t) => Scalar::Time(t.with_timezone(&Utc)),
                Err(_) => Scalar::Str(s),
            },
            (ColumnType::Float, Scalar::Int(i)) => Scalar::Float(i as f64),
            (ColumnType::Float, Scalar::Str(s)) => match s.parse::<f64>() {
                Ok(f) => Scalar::Float(f),
                Err(_) => Scalar::Str(s),
            },
            (ColumnType::Integer, Scalar::Str(s)) => match s.parse::<i64>() {
                Ok(i) => Scalar::Int(i),
                Err(_) => Scalar::Str(s),
            },
            (ColumnType::Boolean, Scalar::Int(i)) => Scalar::Bool(i != 0),
            (ColumnType::String, Scalar::Int(i)) => Scalar::Str(i.to_string()),
            (_, other) => other,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Nil => write!(f, "nil"),
            Scalar::Str(s) => write!(f, "{}", s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Str(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::Str(s)
    }
}

impl From<i64> for Scalar {
    fn from(i: i64) -> Self {
        Scalar::Int(i)
    }
}

impl From<f64> for Scalar {
    fn from(f: f64) -> Self {
        Scalar::Float(f)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Bool(b)
    }
}

impl Serialize for Scalar {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Scalar {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Json::deserialize(deserializer).map(|v| Scalar::from_json(&v))
    }
}

/// Declared type of a stored column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Integer,
    Float,
    Boolean,
    Date,
    Datetime,
    Json,
}

#[cfg(test)]
mod scalar_tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_numbers_keep_kind() {
        assert_eq!(Scalar::from_json(&json!(3)), Scalar::Int(3));
        assert_eq!(Scalar::from_json(&json!(2.5)), Scalar::Float(2.5));
        assert_eq!(Scalar::Float(2.0).to_json(), json!(2.0));
    }

    #[test]
    fn test_date_coercion() {
        let d = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let wire = Scalar::Date(d).to_json();
        assert_eq!(wire, json!("2024-02-29"));
        assert_eq!(Scalar::from_json(&wire).coerce(ColumnType::Date), Scalar::Date(d));
    }

    #[test]
    fn test_timestamp_coercion() {
        let t = DateTime::parse_from_rfc3339("2023-05-01T10:20:30Z")
            .unwrap()
            .with_timezone(&Utc);
        let wire = Scalar::Time(t).to_json();
        assert_eq!(Scalar::from_json(&wire).coerce(ColumnType::Datetime), Scalar::Time(t));
    }

    #[test]
    fn test_coerce_leaves_garbage_alone() {
        let s = Scalar::Str("not a date".to_string());
        assert_eq!(s.clone().coerce(ColumnType::Date), s);
        assert_eq!(Scalar::Nil.coerce(ColumnType::Integer), Scalar::Nil);
    }

    #[test]
    fn test_key_string() {
        assert_eq!(Scalar::Int(12).key_string(), "12");
        assert_eq!(Scalar::Str("abc".into()).key_string(), "abc");
    }
}
