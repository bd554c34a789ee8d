use serde_json::Value as JsonValue;

use crate::error::{Result, StorageError};
use crate::model::Column;

/// Appends one CSV row terminated by `\n`.
///
/// A field containing `,` `"` `\r` or `\n` is quoted and embedded quotes are doubled.
/// Null is written as an empty field; arrays and objects are rejected.
pub fn encode_row(columns: &[Column], values: &[JsonValue], out: &mut Vec<u8>) -> Result<()> {
    if values.len() != columns.len() {
        return Err(StorageError::ColumnsCount { expected: columns.len(), given: values.len() });
    }
    let start = out.len();
    for (i, (col, v)) in columns.iter().zip(values).enumerate() {
        if i > 0 {
            out.push(b',');
        }
        let res = match v {
            JsonValue::Null => Ok(()),
            JsonValue::Bool(b) => { out.extend_from_slice(b.to_string().as_bytes()); Ok(()) }
            JsonValue::Number(n) => { out.extend_from_slice(n.to_string().as_bytes()); Ok(()) }
            JsonValue::String(s) => { write_field(s, out); Ok(()) }
            JsonValue::Array(_) => Err("arrays are not supported"),
            JsonValue::Object(_) => Err("objects are not supported"),
        };
        if let Err(msg) = res {
            out.truncate(start);
            return Err(StorageError::InvalidValue { column: col.name.clone(), message: msg.to_string() });
        }
    }
    out.push(b'\n');
    Ok(())
}

fn write_field(s: &str, out: &mut Vec<u8>) {
    if !s.contains(&[',', '"', '\r', '\n'][..]) {
        out.extend_from_slice(s.as_bytes());
        return;
    }
    out.push(b'"');
    for part in s.split_inclusive('"') {
        out.extend_from_slice(part.as_bytes());
        if part.ends_with('"') {
            out.push(b'"');
        }
    }
    out.push(b'"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cols(n: usize) -> Vec<Column> { (0..n).map(|i| Column::new(format!("c{}", i))).collect() }

    fn encode(values: &[JsonValue]) -> Result<String> {
        let mut out = Vec::new();
        encode_row(&cols(values.len()), values, &mut out)?;
        Ok(String::from_utf8(out).unwrap())
    }

    #[test]
    fn quoting() -> Result<()> {
        assert_eq!(encode(&[json!("abc"), json!(123)])?, "abc,123\n");
        assert_eq!(encode(&[json!("\"def\""), json!(456)])?, "\"\"\"def\"\"\",456\n");
        assert_eq!(encode(&[json!("a,b"), json!("line\nbreak")])?, "\"a,b\",\"line\nbreak\"\n");
        assert_eq!(encode(&[json!("cr\r"), json!("")])?, "\"cr\r\",\n");
        Ok(())
    }

    #[test]
    fn scalars() -> Result<()> {
        assert_eq!(encode(&[json!(null), json!(true), json!(false), json!(1.5), json!(-7)])?, ",true,false,1.5,-7\n");
        Ok(())
    }

    #[test]
    fn rejects_bad_rows() {
        let mut out = b"prev\n".to_vec();
        let err = encode_row(&cols(2), &[json!("x")], &mut out).unwrap_err();
        assert!(matches!(err, StorageError::ColumnsCount { expected: 2, given: 1 }));

        let err = encode_row(&cols(2), &[json!("x"), json!([1, 2])], &mut out).unwrap_err();
        assert_eq!(err.to_string(), "cannot convert value of the column \"c1\" to string: arrays are not supported");
        assert_eq!(out, b"prev\n");
    }
}
