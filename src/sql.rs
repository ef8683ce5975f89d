//! Identifier quoting, table naming and small statement helpers shared by the
//! tasks and the spatial layer.

use rusqlite::{Connection, OptionalExtension, Transaction};

use crate::error::{Error, Result};
use crate::model::{GroupId, PropertyMatcher, PropertyType, PropertyValue};
use crate::spatial;

pub const GROUPS_TABLE: &str = "GROUPS";
pub const GROUP_ID: &str = "GROUP_ID";
pub const RECORD_ID: &str = "RECORD_ID";
pub const DATA_PREFIX: &str = "DATA_";
pub const INTERVAL_PREFIX: &str = "INTERVAL_";

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

pub fn data_table(group_id: GroupId) -> String {
    format!("{}{}", DATA_PREFIX, group_id)
}

pub fn interval_table(property: &str) -> String {
    format!("{}{}", INTERVAL_PREFIX, property)
}

/// Value columns of an interval table holding a property of type `ty`.
pub fn interval_columns(ty: PropertyType) -> Vec<String> {
    match ty {
        PropertyType::TimeSpan => vec!["VALUE_START".to_string(), "VALUE_END".to_string()],
        _ => vec!["VALUE".to_string()],
    }
}

/// Inline SQL literal for a scalar value, `None` when it has no literal form.
pub fn literal(value: &PropertyValue) -> Option<String> {
    match value {
        PropertyValue::Null => Some("NULL".to_string()),
        PropertyValue::Integer(v) => Some(v.to_string()),
        PropertyValue::Real(v) if v.is_finite() => Some(format!("{:?}", v)),
        PropertyValue::Boolean(v) => Some((*v as i64).to_string()),
        PropertyValue::Text(v) => Some(quote_literal(v)),
        PropertyValue::Geometry(g) => Some(quote_literal(&spatial::to_wkt(g))),
        _ => None,
    }
}

fn real_literal(v: f64) -> Option<String> {
    v.is_finite().then(|| format!("{:?}", v))
}

/// WHERE-clause condition for a non-spatial matcher over `columns` (one
/// column, or the start/end pair of a time span) qualified by `alias`.
/// `None` means the matcher cannot be expressed and must be evaluated in
/// process.
pub fn matcher_condition(alias: &str, columns: &[String], matcher: &PropertyMatcher) -> Option<String> {
    let col = |idx: usize| format!("{}.{}", quote_ident(alias), quote_ident(&columns[idx]));
    match (matcher, columns.len()) {
        (PropertyMatcher::Equals { value: PropertyValue::Null, .. }, 1) => {
            Some(format!("{} IS NULL", col(0)))
        }
        (PropertyMatcher::Equals { value, .. }, 1) => {
            literal(value).map(|lit| format!("{} = {}", col(0), lit))
        }
        (PropertyMatcher::Equals { value: PropertyValue::TimeSpan { start, end }, .. }, 2) => {
            Some(format!("{} = {} AND {} = {}", col(0), start, col(1), end))
        }
        (PropertyMatcher::Range { min, max, .. }, 1) => Some(format!(
            "{} BETWEEN {} AND {}",
            col(0),
            real_literal(*min)?,
            real_literal(*max)?
        )),
        (PropertyMatcher::TimeOverlap { start, end, .. }, 1) => {
            Some(format!("{} BETWEEN {} AND {}", col(0), start, end))
        }
        (PropertyMatcher::TimeOverlap { start, end, .. }, 2) => {
            Some(format!("{} <= {} AND {} >= {}", col(0), end, col(1), start))
        }
        _ => None,
    }
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let sql = "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1";
    let found = conn
        .query_row(sql, [table], |_| Ok(()))
        .optional()
        .map_err(|e| Error::sql(sql, e))?;
    Ok(found.is_some())
}

/// Column names of `table` in declaration order.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let sql = format!("PRAGMA table_info({})", quote_ident(table));
    let mut stmt = conn.prepare(&sql).map_err(|e| Error::sql(&sql, e))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
        .map_err(|e| Error::sql(&sql, e))?;
    Ok(columns)
}

pub fn execute(conn: &Connection, sql: &str) -> Result<usize> {
    conn.execute(sql, []).map_err(|e| Error::sql(sql, e))
}

pub fn execute_batch(conn: &Connection, sql: &str) -> Result<()> {
    conn.execute_batch(sql).map_err(|e| Error::sql(sql, e))
}

/// Runs `work` in a transaction with the engine's transaction log raised to
/// `synchronous = NORMAL`. The connection is returned to `OFF` afterwards,
/// whether or not the work succeeded.
pub fn with_transaction<T, F>(conn: &mut Connection, work: F) -> Result<T>
where
    F: FnOnce(&Transaction<'_>) -> Result<T>,
{
    execute_batch(conn, "PRAGMA synchronous = NORMAL")?;
    let result = (|| -> Result<T> {
        let tx = conn.transaction()?;
        let value = work(&tx)?;
        tx.commit().map_err(|e| Error::sql("COMMIT", e))?;
        Ok(value)
    })();
    let restored = execute_batch(conn, "PRAGMA synchronous = OFF");
    let value = result?;
    restored?;
    Ok(value)
}
