//! Literal encoding.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use time::{format_description::well_known::Rfc3339, macros::format_description};

use crate::query::value::Value;

/// Characters kept verbatim when escaping: the RFC 3986 unreserved set plus
/// the quote and parenthesis sub-delimiters literals are built from.
const LITERAL_SAFE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'!')
    .remove(b'*');

/// Percent-escapes `text` for use inside a URI.
pub fn escape(text: &str) -> String {
    utf8_percent_encode(text, LITERAL_SAFE).to_string()
}

/// Dialect-specific literal syntax.
pub trait LiteralConverter: Send + Sync {
    /// Renders `value` without URI escaping.
    fn literal(&self, value: &Value) -> String;

    /// Renders `value`, percent-escaping the result when `escape_literal` is set.
    fn format(&self, value: &Value, escape_literal: bool) -> String {
        let literal = self.literal(value);
        if escape_literal {
            escape(&literal)
        } else {
            literal
        }
    }
}

/// Literal syntax of OData 1.0 to 3.0.
#[derive(Clone, Copy, Debug, Default)]
pub struct LegacyLiterals;

impl LiteralConverter for LegacyLiterals {
    fn literal(&self, value: &Value) -> String {
        match value {
            Value::Int64(v) => format!("{v}L"),
            Value::Double(v) => format!("{}D", double(*v)),
            Value::Decimal(v) => format!("{v}M"),
            Value::Guid(v) => format!("guid'{v}'"),
            Value::Date(v) => {
                let format = format_description!("[year]-[month]-[day]T00:00:00");
                format!("datetime'{}'", v.format(format).unwrap_or_else(|_| v.to_string()))
            }
            Value::DateTimeOffset(v) => format!(
                "datetimeoffset'{}'",
                v.format(&Rfc3339).unwrap_or_else(|_| v.to_string())
            ),
            Value::Binary(v) => format!("X'{}'", hex::encode_upper(v)),
            Value::Enum(_) => self.literal(&value.to_underlying()),
            other => common(other),
        }
    }
}

/// Literal syntax of OData 4.0 and later.
#[derive(Clone, Copy, Debug, Default)]
pub struct ModernLiterals {
    /// Omit the namespace-qualified type from enum literals.
    pub enum_prefix_free: bool,
}

impl LiteralConverter for ModernLiterals {
    fn literal(&self, value: &Value) -> String {
        match value {
            Value::Int64(v) => v.to_string(),
            Value::Double(v) => double(*v),
            Value::Decimal(v) => v.clone(),
            Value::Guid(v) => v.to_string(),
            Value::Date(v) => {
                let format = format_description!("[year]-[month]-[day]");
                v.format(format).unwrap_or_else(|_| v.to_string())
            }
            Value::DateTimeOffset(v) => v.format(&Rfc3339).unwrap_or_else(|_| v.to_string()),
            Value::Binary(v) => format!("binary'{}'", STANDARD.encode(v)),
            Value::Enum(member) if self.enum_prefix_free => format!("'{}'", member.member),
            Value::Enum(member) => format!("{}'{}'", member.type_name, member.member),
            other => common(other),
        }
    }
}

fn common(value: &Value) -> String {
    match value {
        Value::Null => "null".to_owned(),
        Value::Bool(v) => v.to_string(),
        Value::Int32(v) => v.to_string(),
        Value::String(v) => quote(v),
        other => format!("{other:?}"),
    }
}

/// Single-quotes `text`, doubling embedded quotes.
pub fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn double(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_owned()
    } else if v == f64::INFINITY {
        "INF".to_owned()
    } else if v == f64::NEG_INFINITY {
        "-INF".to_owned()
    } else if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{v:.1}")
    } else {
        v.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime};
    use uuid::Uuid;

    fn both(value: Value) -> (String, String) {
        (
            LegacyLiterals.literal(&value),
            ModernLiterals::default().literal(&value),
        )
    }

    #[test]
    fn numeric_suffixes() {
        assert_eq!(both(Value::Int32(5)), ("5".into(), "5".into()));
        assert_eq!(both(Value::Int64(5)), ("5L".into(), "5".into()));
        assert_eq!(both(Value::Double(2.0)), ("2.0D".into(), "2.0".into()));
        assert_eq!(both(Value::Double(0.25)), ("0.25D".into(), "0.25".into()));
        assert_eq!(both(Value::Double(f64::NEG_INFINITY)), ("-INFD".into(), "-INF".into()));
        assert_eq!(
            both(Value::Decimal("10.50".into())),
            ("10.50M".into(), "10.50".into())
        );
    }

    #[test]
    fn strings_escape_quotes() {
        assert_eq!(
            both(Value::from("O'Neil")),
            ("'O''Neil'".into(), "'O''Neil'".into())
        );
        assert_eq!(both(Value::Null), ("null".into(), "null".into()));
        assert_eq!(both(Value::Bool(true)), ("true".into(), "true".into()));
    }

    #[test]
    fn typed_literals() {
        let guid = Uuid::parse_str("0f8fad5b-d9cb-469f-a165-70867728950e").unwrap();
        assert_eq!(
            both(Value::Guid(guid)),
            (
                "guid'0f8fad5b-d9cb-469f-a165-70867728950e'".into(),
                "0f8fad5b-d9cb-469f-a165-70867728950e".into()
            )
        );
        assert_eq!(
            both(Value::Date(date!(2024 - 03 - 01))),
            ("datetime'2024-03-01T00:00:00'".into(), "2024-03-01".into())
        );
        assert_eq!(
            both(Value::DateTimeOffset(datetime!(2024-03-01 10:30:00 UTC))),
            (
                "datetimeoffset'2024-03-01T10:30:00Z'".into(),
                "2024-03-01T10:30:00Z".into()
            )
        );
        assert_eq!(
            both(Value::Binary(vec![0x01, 0xab, 0xff])),
            ("X'01ABFF'".into(), "binary'Aav/'".into())
        );
    }

    #[test]
    fn enums_follow_dialect() {
        let red = Value::enum_member("NorthwindModel.Color", "Red", 1);
        assert_eq!(
            both(red.clone()),
            ("1".into(), "NorthwindModel.Color'Red'".into())
        );
        let prefix_free = ModernLiterals {
            enum_prefix_free: true,
        };
        assert_eq!(prefix_free.literal(&red), "'Red'");
    }

    #[test]
    fn escaping_keeps_unreserved_characters() {
        assert_eq!(
            LegacyLiterals.format(&Value::from("a b&c"), true),
            "'a%20b%26c'"
        );
        assert_eq!(escape("Tom's-file_1.txt~"), "Tom's-file_1.txt~");
        assert_eq!(
            ModernLiterals::default().format(&Value::from("a/b"), false),
            "'a/b'"
        );
    }
}
