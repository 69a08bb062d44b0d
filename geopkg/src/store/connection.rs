use super::functions::register_spatial_functions;
use super::resources::{ResourceTracker, SecondaryConnection};
use crate::errors::{ErrorKind, GpkgError, GpkgResult};
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens the dataset's primary read-write connection.
pub(crate) fn open_primary(path: Option<&Path>, create: bool) -> GpkgResult<Connection> {
    let conn = match path {
        Some(path) => {
            let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX;
            if create {
                flags |= OpenFlags::SQLITE_OPEN_CREATE;
            }
            Connection::open_with_flags(path, flags).map_err(|e| {
                GpkgError::from(e).with_kind(
                    &format!("Cannot open GeoPackage {}", path.display()),
                    ErrorKind::ConnectionError,
                )
            })?
        }
        None => Connection::open_in_memory()?,
    };
    configure(&conn)?;
    Ok(conn)
}

/// Opens a read-only connection for a worker.
///
/// The primary connection must not be shared with workers; each worker owns
/// the connection returned here and closes it when it exits.
pub(crate) fn open_read_only(
    path: &Path,
    tracker: &ResourceTracker,
) -> GpkgResult<SecondaryConnection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags).map_err(|e| {
        GpkgError::from(e).with_kind(
            &format!("Cannot open secondary connection to {}", path.display()),
            ErrorKind::ConnectionError,
        )
    })?;
    let conn = tracker.track_connection(conn);
    configure(&conn)?;
    Ok(conn)
}

/// Opens (creating if needed) a scratch database next to the dataset.
pub(crate) fn open_staging(
    path: &Path,
    page_size: i64,
    tracker: &ResourceTracker,
) -> GpkgResult<SecondaryConnection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags).map_err(|e| {
        GpkgError::from(e).with_kind(
            &format!("Cannot create staging database {}", path.display()),
            ErrorKind::ConnectionError,
        )
    })?;
    let conn = tracker.track_connection(conn);
    // page size must match for node blobs to be copied verbatim
    conn.execute_batch(&format!(
        "PRAGMA page_size = {};\
         PRAGMA journal_mode = MEMORY;\
         PRAGMA synchronous = OFF;",
        page_size
    ))?;
    configure(&conn)?;
    Ok(conn)
}

pub(crate) fn page_size(conn: &Connection) -> GpkgResult<i64> {
    Ok(conn.query_row("PRAGMA page_size", [], |r| r.get(0))?)
}

/// Path of the scratch database used while building the index of `table`.
pub(crate) fn staging_path(dataset: &Path, table: &str) -> PathBuf {
    let sanitized: String = table
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let mut name = dataset.as_os_str().to_os_string();
    name.push(format!(
        ".tmp_rtree_{}_{}.db",
        sanitized,
        uuid::Uuid::new_v4().simple()
    ));
    PathBuf::from(name)
}

/// Removes a staging database and its side files; failures are logged only.
pub(crate) fn remove_staging(path: &Path) {
    for suffix in ["", "-journal", "-wal", "-shm"] {
        let mut name = path.as_os_str().to_os_string();
        name.push(suffix);
        let file = PathBuf::from(name);
        if file.exists() {
            if let Err(e) = std::fs::remove_file(&file) {
                log::warn!("Failed to remove staging file {}: {}", file.display(), e);
            }
        }
    }
}

fn configure(conn: &Connection) -> GpkgResult<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    register_spatial_functions(conn)?;
    Ok(())
}
