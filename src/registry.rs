//! Compile-time result decode registry.
//!
//! Reads carry a `result_type` tag naming how rows should be decoded. The tag
//! set is closed and resolved here at compile time; an unknown tag is a
//! configuration error on the caller's side, not something to look up
//! dynamically at apply time.

use rusqlite::Row;
use serde_json::{Map, Value};

use crate::store::StoreError;

/// Decode function for one row. Registered statically per result type.
pub type RowDecoder = fn(&Row<'_>) -> Result<Value, rusqlite::Error>;

/// Resolve the decoder for a `result_type` tag.
///
/// Scalar tags decode column 0 only; `"row"` decodes every column into a
/// name -> value map.
pub fn decoder_for(result_type: &str) -> Result<RowDecoder, StoreError> {
    match result_type {
        "text" => Ok(decode_text),
        "integer" => Ok(decode_integer),
        "real" => Ok(decode_real),
        "blob" => Ok(decode_blob),
        "row" => Ok(decode_row_map),
        other => Err(StoreError::UnknownResultType {
            result_type: other.to_string(),
        }),
    }
}

fn decode_text(row: &Row<'_>) -> Result<Value, rusqlite::Error> {
    let v: Option<String> = row.get(0)?;
    Ok(v.map(Value::String).unwrap_or(Value::Null))
}

fn decode_integer(row: &Row<'_>) -> Result<Value, rusqlite::Error> {
    let v: Option<i64> = row.get(0)?;
    Ok(v.map(|n| Value::Number(n.into())).unwrap_or(Value::Null))
}

fn decode_real(row: &Row<'_>) -> Result<Value, rusqlite::Error> {
    let v: Option<f64> = row.get(0)?;
    Ok(v.and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null))
}

fn decode_blob(row: &Row<'_>) -> Result<Value, rusqlite::Error> {
    let v: Option<Vec<u8>> = row.get(0)?;
    Ok(v.map(|bytes| Value::Array(bytes.into_iter().map(|b| Value::Number(b.into())).collect()))
        .unwrap_or(Value::Null))
}

/// Generic row decode: every column by name, using the column's declared
/// storage class.
pub fn decode_row_map(row: &Row<'_>) -> Result<Value, rusqlite::Error> {
    let mut map = Map::new();
    for (idx, name) in row.as_ref().column_names().iter().enumerate() {
        let value = match row.get_ref(idx)? {
            rusqlite::types::ValueRef::Null => Value::Null,
            rusqlite::types::ValueRef::Integer(v) => Value::Number(v.into()),
            rusqlite::types::ValueRef::Real(v) => serde_json::Number::from_f64(v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            rusqlite::types::ValueRef::Text(v) => {
                Value::String(String::from_utf8_lossy(v).into_owned())
            }
            rusqlite::types::ValueRef::Blob(v) => {
                Value::Array(v.iter().map(|b| Value::Number((*b).into())).collect())
            }
        };
        map.insert((*name).to_string(), value);
    }
    Ok(Value::Object(map))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rusqlite::Connection;
    use serde_json::json;

    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t (name TEXT, cnt INTEGER, ratio REAL, raw BLOB);
             INSERT INTO t VALUES ('a', 3, 0.5, x'0102'), (NULL, NULL, NULL, NULL);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn unknown_result_type_is_rejected() {
        let err = decoder_for("com.example.SomeMapper").unwrap_err();
        assert!(err.to_string().contains("unknown result type"));
    }

    #[test]
    fn scalar_decoders_handle_null() {
        let conn = test_conn();
        let mut stmt = conn.prepare("SELECT name FROM t ORDER BY name").unwrap();
        let decode = decoder_for("text").unwrap();
        let values: Vec<Value> = stmt
            .query_map([], |row| decode(row))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(values, vec![Value::Null, json!("a")]);
    }

    #[test]
    fn row_map_decodes_every_column_by_name() {
        let conn = test_conn();
        let mut stmt = conn
            .prepare("SELECT name, cnt, ratio FROM t WHERE name = 'a'")
            .unwrap();
        let value = stmt.query_row([], |row| decode_row_map(row)).unwrap();
        assert_eq!(value, json!({ "name": "a", "cnt": 3, "ratio": 0.5 }));
    }
}
