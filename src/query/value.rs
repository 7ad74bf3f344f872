//! Canonical literal representation shared by the expression tree, the command
//! state and the literal converters.
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::types::{Error, Result};

time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");

/// Typed literal tagged with explicit type information so the JSON form stays
/// unambiguous for the CLI and for callers persisting commands.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Value {
    /// Null literal.
    Null,
    /// Boolean literal.
    Bool(bool),
    /// Signed 32-bit integer literal.
    Int32(i32),
    /// Signed 64-bit integer literal.
    Int64(i64),
    /// Double precision floating point literal.
    Double(f64),
    /// Decimal literal kept in its textual form to avoid rounding.
    Decimal(String),
    /// UTF-8 string literal.
    String(String),
    /// Globally unique identifier.
    Guid(Uuid),
    /// Calendar date without time of day.
    Date(#[serde(with = "iso_date")] Date),
    /// Timestamp with UTC offset.
    DateTimeOffset(#[serde(with = "time::serde::rfc3339")] OffsetDateTime),
    /// Binary payload.
    Binary(Vec<u8>),
    /// Enumeration member.
    Enum(EnumValue),
}

/// Enumeration member together with its declared type and underlying value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumValue {
    /// Namespace-qualified enum type name, e.g. `NorthwindModel.Color`.
    pub type_name: String,
    /// Member name, e.g. `Red`.
    pub member: String,
    /// Underlying integral value.
    pub value: i64,
}

/// Target of a conversion node.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    /// `Edm.Boolean`
    Bool,
    /// `Edm.Int32`
    Int32,
    /// `Edm.Int64`
    Int64,
    /// `Edm.Double`
    Double,
    /// `Edm.Decimal`
    Decimal,
    /// `Edm.String`
    String,
    /// `Edm.Guid`
    Guid,
    /// `Edm.Date`
    Date,
    /// `Edm.DateTimeOffset`
    DateTimeOffset,
    /// `Edm.Binary`
    Binary,
}

impl ValueType {
    /// Returns the EDM primitive type name.
    pub fn edm_name(self) -> &'static str {
        match self {
            ValueType::Bool => "Edm.Boolean",
            ValueType::Int32 => "Edm.Int32",
            ValueType::Int64 => "Edm.Int64",
            ValueType::Double => "Edm.Double",
            ValueType::Decimal => "Edm.Decimal",
            ValueType::String => "Edm.String",
            ValueType::Guid => "Edm.Guid",
            ValueType::Date => "Edm.Date",
            ValueType::DateTimeOffset => "Edm.DateTimeOffset",
            ValueType::Binary => "Edm.Binary",
        }
    }
}

impl Value {
    /// Builds a decimal literal after checking it is a plain decimal number.
    pub fn decimal(text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        if is_decimal_text(&text) {
            Ok(Value::Decimal(text))
        } else {
            Err(Error::Invalid(format!("'{text}' is not a decimal literal")))
        }
    }

    /// Builds an enum member literal.
    pub fn enum_member(
        type_name: impl Into<String>,
        member: impl Into<String>,
        value: i64,
    ) -> Self {
        Value::Enum(EnumValue {
            type_name: type_name.into(),
            member: member.into(),
            value,
        })
    }

    /// True for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Replaces an enum member by its underlying integer; other values are
    /// returned unchanged.
    pub fn to_underlying(&self) -> Value {
        match self {
            Value::Enum(member) => match i32::try_from(member.value) {
                Ok(v) => Value::Int32(v),
                Err(_) => Value::Int64(member.value),
            },
            other => other.clone(),
        }
    }

    /// Attempts a lossless conversion to `target`.
    ///
    /// Numeric widening, string parsing and string formatting are supported;
    /// anything else yields `None` so callers can keep the original value.
    pub fn try_convert(&self, target: ValueType) -> Option<Value> {
        let value = self.to_underlying();
        match (target, &value) {
            (_, Value::Null) => Some(Value::Null),
            (ValueType::Bool, Value::Bool(_)) => Some(value),
            (ValueType::Bool, Value::String(s)) => s.parse().ok().map(Value::Bool),
            (ValueType::Int32, Value::Int32(_)) => Some(value),
            (ValueType::Int32, Value::Int64(v)) => i32::try_from(*v).ok().map(Value::Int32),
            (ValueType::Int32, Value::String(s)) => s.trim().parse().ok().map(Value::Int32),
            (ValueType::Int64, Value::Int32(v)) => Some(Value::Int64(i64::from(*v))),
            (ValueType::Int64, Value::Int64(_)) => Some(value),
            (ValueType::Int64, Value::String(s)) => s.trim().parse().ok().map(Value::Int64),
            (ValueType::Double, Value::Int32(v)) => Some(Value::Double(f64::from(*v))),
            (ValueType::Double, Value::Int64(v)) => {
                let converted = *v as f64;
                (converted as i64 == *v).then_some(Value::Double(converted))
            }
            (ValueType::Double, Value::Double(_)) => Some(value),
            (ValueType::Double, Value::Decimal(s)) | (ValueType::Double, Value::String(s)) => {
                s.trim().parse().ok().map(Value::Double)
            }
            (ValueType::Decimal, Value::Int32(v)) => Some(Value::Decimal(v.to_string())),
            (ValueType::Decimal, Value::Int64(v)) => Some(Value::Decimal(v.to_string())),
            (ValueType::Decimal, Value::Decimal(_)) => Some(value),
            (ValueType::Decimal, Value::String(s)) => Value::decimal(s.trim()).ok(),
            (ValueType::String, Value::String(_)) => Some(value),
            (ValueType::String, Value::Bool(v)) => Some(Value::String(v.to_string())),
            (ValueType::String, Value::Int32(v)) => Some(Value::String(v.to_string())),
            (ValueType::String, Value::Int64(v)) => Some(Value::String(v.to_string())),
            (ValueType::String, Value::Decimal(v)) => Some(Value::String(v.clone())),
            (ValueType::String, Value::Guid(v)) => Some(Value::String(v.to_string())),
            (ValueType::Guid, Value::Guid(_)) => Some(value),
            (ValueType::Guid, Value::String(s)) => Uuid::parse_str(s.trim()).ok().map(Value::Guid),
            (ValueType::Date, Value::Date(_)) => Some(value),
            (ValueType::Date, Value::DateTimeOffset(dt)) => Some(Value::Date(dt.date())),
            (ValueType::Date, Value::String(s)) => {
                let format = time::macros::format_description!("[year]-[month]-[day]");
                Date::parse(s.trim(), format).ok().map(Value::Date)
            }
            (ValueType::DateTimeOffset, Value::DateTimeOffset(_)) => Some(value),
            (ValueType::DateTimeOffset, Value::Date(d)) => {
                Some(Value::DateTimeOffset(d.midnight().assume_utc()))
            }
            (ValueType::DateTimeOffset, Value::String(s)) => OffsetDateTime::parse(
                s.trim(),
                &time::format_description::well_known::Rfc3339,
            )
            .ok()
            .map(Value::DateTimeOffset),
            (ValueType::Binary, Value::Binary(_)) => Some(value),
            _ => None,
        }
    }
}

fn is_decimal_text(text: &str) -> bool {
    let digits = text.strip_prefix(['-', '+']).unwrap_or(text);
    let mut parts = digits.splitn(2, '.');
    let whole = parts.next().unwrap_or_default();
    let fraction = parts.next();
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    match fraction {
        Some(fraction) => {
            (!whole.is_empty() || !fraction.is_empty()) && all_digits(whole) && all_digits(fraction)
        }
        None => !whole.is_empty() && all_digits(whole),
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int32(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int64(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<Uuid> for Value {
    fn from(value: Uuid) -> Self {
        Value::Guid(value)
    }
}

impl From<Date> for Value {
    fn from(value: Date) -> Self {
        Value::Date(value)
    }
}

impl From<OffsetDateTime> for Value {
    fn from(value: OffsetDateTime) -> Self {
        Value::DateTimeOffset(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Binary(value)
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Value::Binary(value.to_vec())
    }
}

impl From<EnumValue> for Value {
    fn from(value: EnumValue) -> Self {
        Value::Enum(value)
    }
}
