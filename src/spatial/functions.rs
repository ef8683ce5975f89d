//! Spatial SQL functions registered on every connection.
//!
//! Geometry is stored as WKT text. The functions here parse it with `wkt`,
//! evaluate with `geo`, and are what index maintenance triggers and generated
//! predicates call into.

use geo::{BoundingRect, Geometry, Rect, Relate};
use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::Connection;
use wkt::{ToWkt, TryFromWkt};

use super::operator::{EnginePredicate, SpatialOperator};
use crate::error::{Error, Result};

/// Parses WKT into a geometry.
pub fn parse_wkt(text: &str) -> Result<Geometry<f64>> {
    Geometry::try_from_wkt_str(text.trim()).map_err(|e| Error::Decode("geometry", format!("{:?}", e)))
}

/// Writes a geometry as WKT.
pub fn to_wkt(geometry: &Geometry<f64>) -> String {
    geometry.wkt_string()
}

/// Envelope of a geometry, `None` when it is empty.
pub fn envelope(geometry: &Geometry<f64>) -> Option<Rect<f64>> {
    geometry.bounding_rect()
}

fn user_error(err: Error) -> rusqlite::Error {
    rusqlite::Error::UserFunctionError(Box::new(err))
}

fn geometry_arg(ctx: &Context<'_>, idx: usize) -> rusqlite::Result<Option<Geometry<f64>>> {
    match ctx.get::<Option<String>>(idx)? {
        Some(text) => parse_wkt(&text).map(Some).map_err(user_error),
        None => Ok(None),
    }
}

fn flags() -> FunctionFlags {
    FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC | FunctionFlags::SQLITE_INNOCUOUS
}

/// Registers the spatial functions on a connection.
pub fn register(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function("ST_GeomFromText", 1, flags(), |ctx| {
        Ok(geometry_arg(ctx, 0)?.map(|g| to_wkt(&g)))
    })?;
    conn.create_scalar_function("ST_AsText", 1, flags(), |ctx| {
        Ok(geometry_arg(ctx, 0)?.map(|g| to_wkt(&g)))
    })?;

    register_envelope(conn, "ST_MinX", |r| r.min().x)?;
    register_envelope(conn, "ST_MaxX", |r| r.max().x)?;
    register_envelope(conn, "ST_MinY", |r| r.min().y)?;
    register_envelope(conn, "ST_MaxY", |r| r.max().y)?;

    conn.create_scalar_function("ST_Relate", 3, flags(), |ctx| {
        let lhs = geometry_arg(ctx, 0)?;
        let rhs = geometry_arg(ctx, 1)?;
        let pattern: String = ctx.get(2)?;
        match (lhs, rhs) {
            (Some(lhs), Some(rhs)) => lhs
                .relate(&rhs)
                .matches(&pattern)
                .map(Some)
                .map_err(|e| {
                    user_error(Error::InvalidOperation(format!(
                        "bad intersection pattern {:?}: {:?}",
                        pattern, e
                    )))
                }),
            _ => Ok(None),
        }
    })?;

    for op in SpatialOperator::ALL {
        if let EnginePredicate::Named(name) = op.engine_predicate() {
            conn.create_scalar_function(name, 2, flags(), move |ctx| {
                let lhs = geometry_arg(ctx, 0)?;
                let rhs = geometry_arg(ctx, 1)?;
                Ok(lhs.zip(rhs).map(|(lhs, rhs)| op.evaluate(&lhs, &rhs)))
            })?;
        }
    }

    Ok(())
}

fn register_envelope(conn: &Connection, name: &str, pick: fn(&Rect<f64>) -> f64) -> rusqlite::Result<()> {
    conn.create_scalar_function(name, 1, flags(), move |ctx| {
        Ok(geometry_arg(ctx, 0)?
            .as_ref()
            .and_then(envelope)
            .map(|rect| pick(&rect)))
    })
}

#[cfg(test)]
pub(crate) fn test_connection() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    register(&conn).unwrap();
    conn
}
