//! Owned parameter and row values shared by both drivers.
//!
//! rusqlite and tokio-postgres have disjoint bind/scan traits, so the facade
//! speaks a small owned value model and converts at the driver boundary.

use std::error::Error as StdError;
use std::sync::Arc;

use bytes::BytesMut;
use rusqlite::types::{ToSqlOutput, ValueRef};
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};

use super::StoreError;

/// A single bind parameter or result cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Integer(v.into())
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

impl rusqlite::ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Bool(b) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*b as i64)),
            Value::Integer(v) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*v)),
            Value::Real(v) => ToSqlOutput::Owned(rusqlite::types::Value::Real(*v)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => b.to_sql(ty, out),
            // Coerce to the width of the target column so an i64 argument can
            // bind against int2/int4 columns.
            Value::Integer(v) => match *ty {
                Type::INT2 => (*v as i16).to_sql(ty, out),
                Type::INT4 => (*v as i32).to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
            Value::Real(v) => match *ty {
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
            Value::Text(s) => s.as_str().to_sql(ty, out),
            Value::Blob(b) => b.as_slice().to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        // Accepted universally; the variant decides how to encode.
        true
    }

    to_sql_checked!();
}

/// One result row with owned values, addressable by column name.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub(crate) fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c == name)?;
        self.values.get(idx)
    }

    fn require(&self, name: &str) -> Result<&Value, StoreError> {
        self.get(name)
            .ok_or_else(|| StoreError::scan(format!("no such column {name:?}")))
    }

    pub fn try_i64(&self, name: &str) -> Result<i64, StoreError> {
        match self.require(name)? {
            Value::Integer(v) => Ok(*v),
            other => Err(StoreError::scan(format!(
                "column {name:?}: expected integer, got {other:?}"
            ))),
        }
    }

    pub fn opt_i64(&self, name: &str) -> Result<Option<i64>, StoreError> {
        match self.require(name)? {
            Value::Null => Ok(None),
            Value::Integer(v) => Ok(Some(*v)),
            other => Err(StoreError::scan(format!(
                "column {name:?}: expected integer or null, got {other:?}"
            ))),
        }
    }

    pub fn try_text(&self, name: &str) -> Result<String, StoreError> {
        match self.require(name)? {
            Value::Text(s) => Ok(s.clone()),
            other => Err(StoreError::scan(format!(
                "column {name:?}: expected text, got {other:?}"
            ))),
        }
    }

    pub fn opt_text(&self, name: &str) -> Result<Option<String>, StoreError> {
        match self.require(name)? {
            Value::Null => Ok(None),
            Value::Text(s) => Ok(Some(s.clone())),
            other => Err(StoreError::scan(format!(
                "column {name:?}: expected text or null, got {other:?}"
            ))),
        }
    }

    pub fn try_f64(&self, name: &str) -> Result<f64, StoreError> {
        match self.require(name)? {
            Value::Real(v) => Ok(*v),
            Value::Integer(v) => Ok(*v as f64),
            other => Err(StoreError::scan(format!(
                "column {name:?}: expected real, got {other:?}"
            ))),
        }
    }

    /// Booleans come back as BOOL from postgres and 0/1 integers from sqlite.
    pub fn try_bool(&self, name: &str) -> Result<bool, StoreError> {
        match self.require(name)? {
            Value::Bool(v) => Ok(*v),
            Value::Integer(v) => Ok(*v != 0),
            other => Err(StoreError::scan(format!(
                "column {name:?}: expected bool, got {other:?}"
            ))),
        }
    }
}

pub(crate) fn row_from_sqlite(
    row: &rusqlite::Row<'_>,
    columns: &Arc<[String]>,
) -> Result<Row, rusqlite::Error> {
    let mut values = Vec::with_capacity(columns.len());
    for i in 0..columns.len() {
        values.push(match row.get_ref(i)? {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(v) => Value::Integer(v),
            ValueRef::Real(v) => Value::Real(v),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        });
    }
    Ok(Row::new(Arc::clone(columns), values))
}

pub(crate) fn row_from_postgres(row: &tokio_postgres::Row) -> Row {
    let columns: Arc<[String]> = row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    let values = row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| extract_pg_value(row, i, col.type_()))
        .collect();
    Row::new(columns, values)
}

fn extract_pg_value(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> Value {
    match *ty {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(idx)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Integer(v.into()))
            .unwrap_or(Value::Null),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Integer(v.into()))
            .unwrap_or(Value::Null),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(idx)
            .ok()
            .flatten()
            .map(Value::Integer)
            .unwrap_or(Value::Null),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Real(v.into()))
            .unwrap_or(Value::Null),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)
            .ok()
            .flatten()
            .map(Value::Real)
            .unwrap_or(Value::Null),
        Type::TEXT | Type::VARCHAR | Type::NAME | Type::CHAR | Type::BPCHAR => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(Value::Text)
            .unwrap_or(Value::Null),
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(idx)
            .ok()
            .flatten()
            .map(Value::Blob)
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(Value::Text)
            .unwrap_or(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row() -> Row {
        let columns: Arc<[String]> = ["id", "name", "ratio", "note", "active"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        Row::new(
            columns,
            vec![
                Value::Integer(7),
                Value::Text("edge-1".into()),
                Value::Real(1.5),
                Value::Null,
                Value::Integer(1),
            ],
        )
    }

    #[test]
    fn from_conversions() {
        assert_eq!(Value::from(42i64), Value::Integer(42));
        assert_eq!(Value::from(42i32), Value::Integer(42));
        assert_eq!(Value::from(true), Value::Bool(true));
        assert_eq!(Value::from("x"), Value::Text("x".into()));
        assert_eq!(Value::from(Some(1i64)), Value::Integer(1));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(1.25f64), Value::Real(1.25));
    }

    #[test]
    fn typed_getters() {
        let row = sample_row();
        assert_eq!(row.try_i64("id").unwrap(), 7);
        assert_eq!(row.try_text("name").unwrap(), "edge-1");
        assert_eq!(row.try_f64("ratio").unwrap(), 1.5);
        assert_eq!(row.opt_text("note").unwrap(), None);
        assert_eq!(row.opt_i64("note").unwrap(), None);
        assert!(row.try_bool("active").unwrap());
    }

    #[test]
    fn integer_promotes_to_f64() {
        let row = sample_row();
        assert_eq!(row.try_f64("id").unwrap(), 7.0);
    }

    #[test]
    fn missing_column_is_a_scan_error() {
        let row = sample_row();
        let err = row.try_i64("nope").unwrap_err();
        assert!(matches!(err, StoreError::Scan(_)));
    }

    #[test]
    fn type_mismatch_is_a_scan_error() {
        let row = sample_row();
        assert!(matches!(row.try_i64("name"), Err(StoreError::Scan(_))));
        assert!(matches!(row.try_text("id"), Err(StoreError::Scan(_))));
        assert!(matches!(row.try_i64("note"), Err(StoreError::Scan(_))));
    }
}
