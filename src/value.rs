//! Dynamic value handling.
//!
//! Attribute values travel as `serde_json::Value` between rows, conditions,
//! and bound parameters. This module owns the two conversions that have to
//! stay consistent with each other: decoding driver rows into attribute maps
//! and stringifying values into the composite-key identifiers used to stitch
//! child rows onto parents.

use std::collections::BTreeMap;

use serde_json::Value;
use sqlx::mysql::{MySql, MySqlArguments, MySqlRow};
use sqlx::{Column, Row};

/// Column-name-keyed attributes of one row.
pub type Attributes = BTreeMap<String, Value>;

/// Stable textual identity of a value, used when concatenating join-key
/// tuples into map keys. Both sides of a match go through this function, so
/// the exact rendering only has to be deterministic, not pretty.
pub fn identifier(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => {
            if *b {
                "1".to_string()
            } else {
                "0".to_string()
            }
        }
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Concatenate the named columns of a row into one composite identifier,
/// in the declared key order.
pub fn composite_identifier<'a, I>(attributes: &Attributes, columns: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut id = String::new();
    for column in columns {
        match attributes.get(column) {
            Some(value) => id.push_str(&identifier(value)),
            None => id.push_str(&identifier(&Value::Null)),
        }
    }
    id
}

/// Decode one driver row into an attribute map.
///
/// MySQL result columns are decoded by trying the narrow types first and
/// falling back to text; anything undecodable becomes null.
pub fn row_attributes(row: &MySqlRow) -> Attributes {
    let mut attributes = Attributes::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value = if let Ok(v) = row.try_get::<Option<i64>, _>(i) {
            v.map_or(Value::Null, |v| Value::Number(v.into()))
        } else if let Ok(v) = row.try_get::<Option<u64>, _>(i) {
            v.map_or(Value::Null, |v| Value::Number(v.into()))
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(i) {
            v.map_or(Value::Null, |v| {
                serde_json::Number::from_f64(v)
                    .map_or(Value::Null, Value::Number)
            })
        } else if let Ok(v) = row.try_get::<Option<bool>, _>(i) {
            v.map_or(Value::Null, Value::Bool)
        } else if let Ok(v) = row.try_get::<Option<String>, _>(i) {
            v.map_or(Value::Null, Value::String)
        } else if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(i) {
            v.map_or(Value::Null, |v| Value::String(v.to_string()))
        } else if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(i) {
            v.map_or(Value::Null, |v| Value::String(v.to_string()))
        } else if let Ok(v) = row.try_get::<Option<chrono::NaiveTime>, _>(i) {
            v.map_or(Value::Null, |v| Value::String(v.to_string()))
        } else if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(i) {
            v.map_or(Value::Null, |v| {
                Value::String(String::from_utf8_lossy(&v).into_owned())
            })
        } else {
            Value::Null
        };
        attributes.insert(column.name().to_string(), value);
    }
    attributes
}

/// Bind one value onto a prepared statement.
pub fn bind_value<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    value: Value,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else if let Some(u) = n.as_u64() {
                query.bind(u)
            } else {
                query.bind(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => query.bind(s),
        other => query.bind(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identifier_is_stable_for_scalars() {
        assert_eq!(identifier(&json!(42)), "42");
        assert_eq!(identifier(&json!("42")), "42");
        assert_eq!(identifier(&json!(true)), "1");
        assert_eq!(identifier(&json!(false)), "0");
        assert_eq!(identifier(&Value::Null), "");
    }

    #[test]
    fn composite_identifier_follows_declaration_order() {
        let mut attrs = Attributes::new();
        attrs.insert("a".into(), json!(1));
        attrs.insert("b".into(), json!("x"));
        assert_eq!(composite_identifier(&attrs, ["a", "b"]), "1x");
        assert_eq!(composite_identifier(&attrs, ["b", "a"]), "x1");
        assert_eq!(composite_identifier(&attrs, ["missing"]), "");
    }
}
