use crate::geometry::{Envelope, GpkgBlob};
use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::ValueRef;
use rusqlite::Connection;

/// Registers the spatial SQL functions used by the R-tree triggers and the
/// rebuild queries.
///
/// - `ST_MinX(blob)`, `ST_MinY(blob)`, `ST_MaxX(blob)`, `ST_MaxY(blob)`
/// - `ST_IsEmpty(blob)`
///
/// All return NULL for NULL input and for blobs that cannot be parsed.
pub(crate) fn register_spatial_functions(conn: &Connection) -> rusqlite::Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

    conn.create_scalar_function("ST_MinX", 1, flags, |ctx| {
        Ok(envelope_arg(ctx).map(|e| e.min_x))
    })?;
    conn.create_scalar_function("ST_MinY", 1, flags, |ctx| {
        Ok(envelope_arg(ctx).map(|e| e.min_y))
    })?;
    conn.create_scalar_function("ST_MaxX", 1, flags, |ctx| {
        Ok(envelope_arg(ctx).map(|e| e.max_x))
    })?;
    conn.create_scalar_function("ST_MaxY", 1, flags, |ctx| {
        Ok(envelope_arg(ctx).map(|e| e.max_y))
    })?;
    conn.create_scalar_function("ST_IsEmpty", 1, flags, |ctx| {
        let empty = match ctx.get_raw(0) {
            ValueRef::Blob(bytes) => GpkgBlob::parse(bytes).ok().map(|blob| {
                blob.is_empty() || blob.envelope().map(|e| e.is_empty()).unwrap_or(true)
            }),
            _ => None,
        };
        Ok(empty.map(i64::from))
    })?;
    Ok(())
}

fn envelope_arg(ctx: &Context<'_>) -> Option<Envelope> {
    match ctx.get_raw(0) {
        ValueRef::Blob(bytes) => GpkgBlob::parse(bytes)
            .and_then(|blob| blob.envelope())
            .ok()
            .filter(|e| !e.is_empty()),
        _ => None,
    }
}
