//! Dynamic values.
//!
//! A [`Value`] is the untyped form of a single entity member. Records
//! travel between the repositories, the stores and the expression
//! evaluator in this form; typed entities are recovered through serde.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use uuid::Uuid;

use repokit_core::{AppError, AppResult};

use crate::schema::FieldKind;

/// A dynamic entity row: member name to value.
pub type Record = BTreeMap<String, Value>;

/// A dynamically typed member value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Absent value.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Any integer width.
    Int(i64),
    /// Floating point.
    Float(f64),
    /// Exact decimal.
    Decimal(Decimal),
    /// Text.
    Text(String),
    /// Unique identifier.
    Uuid(Uuid),
    /// Date without time.
    Date(NaiveDate),
    /// UTC timestamp.
    DateTime(DateTime<Utc>),
    /// A loaded to-one relation.
    Record(Record),
    /// A loaded to-many relation, or the operand list of an `IN` test.
    List(Vec<Value>),
}

impl Value {
    /// Whether this is [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Borrow the text of a [`Value::Text`].
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// The boolean of a [`Value::Bool`].
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(flag) => Some(*flag),
            _ => None,
        }
    }

    /// Borrow the record of a [`Value::Record`].
    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Self::Record(record) => Some(record),
            _ => None,
        }
    }

    /// Borrow the elements of a [`Value::List`].
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Numeric view used by aggregates.
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Self::Int(n) => Some(Decimal::from(*n)),
            Self::Float(f) => Decimal::from_f64(*f),
            Self::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    /// Short name of the variant, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Decimal(_) => "decimal",
            Self::Text(_) => "text",
            Self::Uuid(_) => "uuid",
            Self::Date(_) => "date",
            Self::DateTime(_) => "datetime",
            Self::Record(_) => "record",
            Self::List(_) => "list",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) | Self::Float(_) | Self::Decimal(_) => 2,
            Self::Text(_) => 3,
            Self::Uuid(_) => 4,
            Self::Date(_) => 5,
            Self::DateTime(_) => 6,
            Self::Record(_) => 7,
            Self::List(_) => 8,
        }
    }

    /// Total ordering: nulls first, numbers compared across widths,
    /// mismatched variants ordered by variant rank.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::Decimal(a), Self::Decimal(b)) => a.cmp(b),
            (Self::Int(a), Self::Float(b)) => (*a as f64).total_cmp(b),
            (Self::Float(a), Self::Int(b)) => a.total_cmp(&(*b as f64)),
            (Self::Int(a), Self::Decimal(b)) => Decimal::from(*a).cmp(b),
            (Self::Decimal(a), Self::Int(b)) => a.cmp(&Decimal::from(*b)),
            (Self::Float(a), Self::Decimal(b)) => a.total_cmp(&b.to_f64().unwrap_or(f64::MAX)),
            (Self::Decimal(a), Self::Float(b)) => a.to_f64().unwrap_or(f64::MAX).total_cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Uuid(a), Self::Uuid(b)) => a.cmp(b),
            (Self::Date(a), Self::Date(b)) => a.cmp(b),
            (Self::DateTime(a), Self::DateTime(b)) => a.cmp(b),
            (Self::List(a), Self::List(b)) => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| x.compare(y))
                .find(|ord| ord.is_ne())
                .unwrap_or_else(|| a.len().cmp(&b.len())),
            (Self::Record(a), Self::Record(b)) => a
                .iter()
                .zip(b.iter())
                .map(|((ka, va), (kb, vb))| ka.cmp(kb).then_with(|| va.compare(vb)))
                .find(|ord| ord.is_ne())
                .unwrap_or_else(|| a.len().cmp(&b.len())),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    /// Lowercase text rendering used by containment search.
    ///
    /// Returns `None` for null, records and lists.
    pub fn to_search_text(&self) -> Option<String> {
        match self {
            Self::Null | Self::Record(_) | Self::List(_) => None,
            other => Some(other.to_string().to_lowercase()),
        }
    }

    /// Convert this value to the representation of a field of `kind`.
    ///
    /// Used to normalise query constants before they are compared with
    /// stored values or bound as SQL parameters.
    pub fn coerce(self, kind: FieldKind) -> AppResult<Value> {
        let mismatch = |value: &Value| {
            AppError::argument(format!(
                "Value '{value}' of type {} cannot be used as {kind}",
                value.type_name()
            ))
        };

        match (kind, self) {
            (_, Self::Null) => Ok(Self::Null),
            (_, Self::List(items)) => items
                .into_iter()
                .map(|item| item.coerce(kind))
                .collect::<AppResult<Vec<_>>>()
                .map(Self::List),
            (FieldKind::Text, Self::Text(text)) => Ok(Self::Text(text)),
            (FieldKind::Text, value @ Self::Record(_)) => Err(mismatch(&value)),
            (FieldKind::Text, value) => Ok(Self::Text(value.to_string())),
            (FieldKind::Int | FieldKind::BigInt, value) => match value {
                Self::Int(n) => Ok(Self::Int(n)),
                Self::Float(f) if f.fract() == 0.0 => Ok(Self::Int(f as i64)),
                Self::Decimal(d) if d.fract().is_zero() => {
                    d.to_i64().map(Self::Int).ok_or_else(|| mismatch(&Self::Decimal(d)))
                }
                Self::Text(ref text) => text
                    .trim()
                    .parse::<i64>()
                    .map(Self::Int)
                    .map_err(|_| mismatch(&value)),
                other => Err(mismatch(&other)),
            },
            (FieldKind::Float, value) => match value {
                Self::Float(f) => Ok(Self::Float(f)),
                Self::Int(n) => Ok(Self::Float(n as f64)),
                Self::Decimal(d) => d.to_f64().map(Self::Float).ok_or_else(|| mismatch(&Self::Decimal(d))),
                Self::Text(ref text) => text
                    .trim()
                    .parse::<f64>()
                    .map(Self::Float)
                    .map_err(|_| mismatch(&value)),
                other => Err(mismatch(&other)),
            },
            (FieldKind::Decimal, value) => match value {
                Self::Decimal(d) => Ok(Self::Decimal(d)),
                Self::Int(n) => Ok(Self::Decimal(Decimal::from(n))),
                Self::Float(f) => Decimal::from_f64(f).map(Self::Decimal).ok_or_else(|| mismatch(&Self::Float(f))),
                Self::Text(ref text) => Decimal::from_str(text.trim())
                    .map(Self::Decimal)
                    .map_err(|_| mismatch(&value)),
                other => Err(mismatch(&other)),
            },
            (FieldKind::Bool, value) => match value {
                Self::Bool(b) => Ok(Self::Bool(b)),
                Self::Text(ref text) => match text.trim().to_lowercase().as_str() {
                    "true" => Ok(Self::Bool(true)),
                    "false" => Ok(Self::Bool(false)),
                    _ => Err(mismatch(&value)),
                },
                other => Err(mismatch(&other)),
            },
            (FieldKind::Uuid, value) => match value {
                Self::Uuid(id) => Ok(Self::Uuid(id)),
                Self::Text(ref text) => Uuid::parse_str(text.trim())
                    .map(Self::Uuid)
                    .map_err(|_| mismatch(&value)),
                other => Err(mismatch(&other)),
            },
            (FieldKind::Date, value) => match value {
                Self::Date(date) => Ok(Self::Date(date)),
                Self::DateTime(ts) => Ok(Self::Date(ts.date_naive())),
                Self::Text(ref text) => NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
                    .map(Self::Date)
                    .map_err(|_| mismatch(&value)),
                other => Err(mismatch(&other)),
            },
            (FieldKind::DateTime, value) => match value {
                Self::DateTime(ts) => Ok(Self::DateTime(ts)),
                Self::Date(date) => date
                    .and_hms_opt(0, 0, 0)
                    .map(|midnight| Self::DateTime(midnight.and_utc()))
                    .ok_or_else(|| mismatch(&Self::Date(date))),
                Self::Text(ref text) => DateTime::parse_from_rfc3339(text.trim())
                    .map(|ts| Self::DateTime(ts.with_timezone(&Utc)))
                    .map_err(|_| mismatch(&value)),
                other => Err(mismatch(&other)),
            },
        }
    }

    /// Convert a JSON value, guided by the field kind when one is known.
    pub fn from_json(json: &serde_json::Value, kind: Option<FieldKind>) -> AppResult<Value> {
        use serde_json::Value as Json;

        let Some(kind) = kind else {
            return Ok(Self::from_untyped_json(json));
        };
        match json {
            Json::Null => Ok(Self::Null),
            Json::String(text) => Self::Text(text.clone()).coerce(kind),
            other => Self::from_untyped_json(other).coerce(kind),
        }
    }

    fn from_untyped_json(json: &serde_json::Value) -> Value {
        use serde_json::Value as Json;

        match json {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or_default()),
            },
            Json::String(text) => Self::Text(text.clone()),
            Json::Array(items) => Self::List(items.iter().map(Self::from_untyped_json).collect()),
            Json::Object(map) => Self::Record(
                map.iter()
                    .map(|(key, value)| (key.clone(), Self::from_untyped_json(value)))
                    .collect(),
            ),
        }
    }

    /// Convert to JSON in the encoding serde uses for the typed field.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;

        match self {
            Self::Null => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Int(n) => Json::from(*n),
            Self::Float(f) => serde_json::Number::from_f64(*f).map_or(Json::Null, Json::Number),
            Self::Decimal(d) => Json::String(d.to_string()),
            Self::Text(text) => Json::String(text.clone()),
            Self::Uuid(id) => Json::String(id.to_string()),
            Self::Date(date) => Json::String(date.format("%Y-%m-%d").to_string()),
            Self::DateTime(ts) => Json::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            Self::Record(record) => record_to_json(record),
            Self::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
        }
    }
}

/// Convert a record to a JSON object.
pub fn record_to_json(record: &Record) -> serde_json::Value {
    serde_json::Value::Object(
        record
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect(),
    )
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Decimal(d) => write!(f, "{d}"),
            Self::Text(text) => write!(f, "{text}"),
            Self::Uuid(id) => write!(f, "{id}"),
            Self::Date(date) => write!(f, "{}", date.format("%Y-%m-%d")),
            Self::DateTime(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S")),
            Self::Record(_) | Self::List(_) => write!(f, "{}", self.to_json()),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<Decimal> for Value {
    fn from(value: Decimal) -> Self {
        Self::Decimal(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Uuid> for Value {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::DateTime(value)
    }
}

impl<V: Into<Value>> From<Option<V>> for Value {
    fn from(value: Option<V>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl<V: Into<Value>> From<Vec<V>> for Value {
    fn from(values: Vec<V>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nulls_sort_first() {
        let mut values = vec![Value::Int(3), Value::Null, Value::Int(1)];
        values.sort_by(Value::compare);
        assert_eq!(values, vec![Value::Null, Value::Int(1), Value::Int(3)]);
    }

    #[test]
    fn test_numeric_comparison_across_widths() {
        assert_eq!(Value::Int(2).compare(&Value::Float(2.5)), Ordering::Less);
        assert_eq!(
            Value::Decimal(Decimal::new(250, 2)).compare(&Value::Int(2)),
            Ordering::Greater
        );
    }

    #[test]
    fn test_search_text_is_lowercase() {
        let id = Uuid::parse_str("A1B2C3D4-0000-0000-0000-000000000001").unwrap();
        assert_eq!(
            Value::Uuid(id).to_search_text().as_deref(),
            Some("a1b2c3d4-0000-0000-0000-000000000001")
        );
        assert_eq!(Value::from("Item-02").to_search_text().as_deref(), Some("item-02"));
        assert_eq!(Value::Bool(true).to_search_text().as_deref(), Some("true"));
        assert_eq!(Value::Null.to_search_text(), None);
    }

    #[test]
    fn test_coerce_constants() {
        assert_eq!(Value::from("42").coerce(FieldKind::Int).unwrap(), Value::Int(42));
        assert_eq!(Value::Int(2).coerce(FieldKind::Float).unwrap(), Value::Float(2.0));
        assert_eq!(
            Value::from("2024-03-01").coerce(FieldKind::Date).unwrap(),
            Value::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
        );
        assert!(Value::from("nope").coerce(FieldKind::Uuid).is_err());
        assert_eq!(
            Value::from(vec![1, 2]).coerce(FieldKind::Decimal).unwrap(),
            Value::List(vec![Value::Decimal(Decimal::from(1)), Value::Decimal(Decimal::from(2))])
        );
    }

    #[test]
    fn test_json_round_trip_by_kind() {
        let ts = DateTime::parse_from_rfc3339("2024-05-06T07:08:09Z")
            .unwrap()
            .with_timezone(&Utc);
        let value = Value::DateTime(ts);
        let json = value.to_json();
        assert_eq!(json, serde_json::json!("2024-05-06T07:08:09Z"));
        assert_eq!(Value::from_json(&json, Some(FieldKind::DateTime)).unwrap(), value);

        let price = Value::Decimal(Decimal::new(1999, 2));
        assert_eq!(
            Value::from_json(&price.to_json(), Some(FieldKind::Decimal)).unwrap(),
            price
        );
        assert_eq!(
            Value::from_json(&serde_json::json!(7), None).unwrap(),
            Value::Int(7)
        );
    }
}
