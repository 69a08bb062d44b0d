use super::entry::EntryBatch;
use super::sql;
use crate::errors::{ErrorKind, GpkgError, GpkgResult};
use crate::feature::quote_ident;
use crate::store::{
    open_read_only, open_staging, remove_staging, staging_path, ResourceTracker,
    SecondaryConnection,
};
use rusqlite::types::Value;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};

/// Everything a sink needs to know about the index it builds.
#[derive(Debug, Clone)]
pub struct SinkTarget {
    pub dataset_path: PathBuf,
    pub table: String,
    pub rtree: String,
    pub page_size: i64,
    pub(crate) resources: ResourceTracker,
}

/// Destination of the entries written by the background index builder.
///
/// A sink is created on the writer's thread, moved into the builder thread
/// for [`open`](Self::open), [`write_batch`](Self::write_batch) and
/// [`finish`](Self::finish), and handed back to the writer once the builder
/// has been joined.
pub trait IndexSink: Send {
    /// Prepares the storage. Runs on the builder thread.
    fn open(&mut self) -> GpkgResult<()>;

    /// Writes one batch. A failed batch leaves no row behind; batches written
    /// before it stay valid.
    fn write_batch(&mut self, batch: &EntryBatch) -> GpkgResult<()>;

    /// Completes the build and releases the builder-side resources.
    fn finish(&mut self) -> GpkgResult<()>;

    /// Copies every successfully written entry into the R-tree `rtree`
    /// through the dataset's primary connection. Returns the number of
    /// entries merged.
    fn merge_into(&mut self, conn: &Connection, rtree: &str) -> GpkgResult<u64>;

    /// Removes all storage created by this sink. Idempotent.
    fn discard(&mut self);
}

/// Creates one [`IndexSink`] per background build.
pub trait IndexSinkFactory: Send + Sync {
    fn create_sink(&self, target: &SinkTarget) -> GpkgResult<Box<dyn IndexSink>>;
}

/// Default factory: stages entries in a scratch SQLite database next to the
/// GeoPackage file.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteStagingSinkFactory;

impl IndexSinkFactory for SqliteStagingSinkFactory {
    fn create_sink(&self, target: &SinkTarget) -> GpkgResult<Box<dyn IndexSink>> {
        Ok(Box::new(SqliteStagingSink::new(target)))
    }
}

/// Builds an R-tree in a staging database owned by the builder thread.
///
/// At merge time the staging R-tree is copied into the GeoPackage: node by
/// node when the target is empty and has the same node size, entry by entry
/// otherwise.
pub struct SqliteStagingSink {
    path: PathBuf,
    rtree: String,
    page_size: i64,
    resources: ResourceTracker,
    conn: Option<SecondaryConnection>,
    entries_written: u64,
    created: bool,
}

impl SqliteStagingSink {
    pub fn new(target: &SinkTarget) -> SqliteStagingSink {
        SqliteStagingSink {
            path: staging_path(&target.dataset_path, &target.table),
            rtree: target.rtree.clone(),
            page_size: target.page_size,
            resources: target.resources.clone(),
            conn: None,
            entries_written: 0,
            created: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connection(&mut self) -> GpkgResult<&mut SecondaryConnection> {
        self.conn.as_mut().ok_or_else(|| {
            GpkgError::new("Staging database is not open", ErrorKind::InvalidOperation)
        })
    }

    /// Commits one batch. A failed batch rolls back alone: the staging file
    /// is private to this build and is discarded whenever the build fails,
    /// and the producer replays the failed batch onward itself.
    fn write_entries(&mut self, batch: &EntryBatch) -> GpkgResult<()> {
        let rtree = self.rtree.clone();
        let conn = self.connection()?;
        let tx = conn.transaction()?;
        sql::insert_entries(&tx, &rtree, batch.entries())?;
        tx.commit()?;
        Ok(())
    }

    fn copy_nodes(&self, staged: &Connection, conn: &Connection, rtree: &str) -> GpkgResult<()> {
        for (source, target) in sql::shadow_tables(&self.rtree)
            .iter()
            .zip(sql::shadow_tables(rtree).iter())
        {
            conn.execute_batch(&format!("DELETE FROM {}", quote_ident(target)))?;

            let mut select = staged.prepare(&format!("SELECT * FROM {}", quote_ident(source)))?;
            let columns = select.column_count();
            let placeholders = (1..=columns)
                .map(|i| format!("?{}", i))
                .collect::<Vec<_>>()
                .join(", ");
            let mut insert = conn.prepare(&format!(
                "INSERT INTO {} VALUES ({})",
                quote_ident(target),
                placeholders
            ))?;

            let mut rows = select.query([])?;
            while let Some(row) = rows.next()? {
                let values = (0..columns)
                    .map(|i| row.get::<_, Value>(i))
                    .collect::<Result<Vec<_>, _>>()?;
                insert.execute(rusqlite::params_from_iter(values))?;
            }
        }
        Ok(())
    }

    fn copy_entries(&self, staged: &Connection, conn: &Connection, rtree: &str) -> GpkgResult<()> {
        let mut select = staged.prepare(&format!(
            "SELECT id, minx, maxx, miny, maxy FROM {}",
            quote_ident(&self.rtree)
        ))?;
        let mut insert = conn.prepare(&format!(
            "INSERT OR REPLACE INTO {} VALUES (?1, ?2, ?3, ?4, ?5)",
            quote_ident(rtree)
        ))?;
        let mut rows = select.query([])?;
        while let Some(row) = rows.next()? {
            insert.execute(params![
                row.get::<_, i64>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, f64>(4)?
            ])?;
        }
        Ok(())
    }
}

impl IndexSink for SqliteStagingSink {
    fn open(&mut self) -> GpkgResult<()> {
        let conn = open_staging(&self.path, self.page_size, &self.resources)?;
        self.created = true;
        sql::create_rtree_table(&conn, &self.rtree)?;
        self.conn = Some(conn);
        Ok(())
    }

    fn write_batch(&mut self, batch: &EntryBatch) -> GpkgResult<()> {
        self.write_entries(batch).map_err(|e| {
            e.with_kind(
                &format!("Failed to write index batch #{}", batch.seq()),
                ErrorKind::WriteError,
            )
        })?;
        self.entries_written += batch.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> GpkgResult<()> {
        // closing flushes the staging file for the merge connection
        if let Some(conn) = self.conn.take() {
            drop(conn);
        }
        Ok(())
    }

    fn merge_into(&mut self, conn: &Connection, rtree: &str) -> GpkgResult<u64> {
        self.finish()?;
        if !self.created || self.entries_written == 0 {
            return Ok(0);
        }

        let staged = open_read_only(&self.path, &self.resources)?;
        let node_sizes_match = sql::root_node_size(&staged, &self.rtree)?
            == sql::root_node_size(conn, rtree)?;
        if sql::is_empty(conn, rtree)? && node_sizes_match {
            log::debug!(
                "Copying {} staged entries into {} node by node",
                self.entries_written,
                rtree
            );
            self.copy_nodes(&staged, conn, rtree)?;
        } else {
            log::debug!(
                "Inserting {} staged entries into {}",
                self.entries_written,
                rtree
            );
            self.copy_entries(&staged, conn, rtree)?;
        }
        Ok(self.entries_written)
    }

    fn discard(&mut self) {
        self.conn = None;
        if self.created {
            remove_staging(&self.path);
            self.created = false;
        }
    }
}

impl Drop for SqliteStagingSink {
    fn drop(&mut self) {
        self.discard();
    }
}
