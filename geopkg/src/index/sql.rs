use super::entry::IndexEntry;
use crate::errors::GpkgResult;
use crate::feature::quote_ident;
use crate::geometry::Envelope;
use rusqlite::{params, Connection, OptionalExtension};

/// Names of the R-tree table and its triggers for one geometry column.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RTreeNames {
    pub table: String,
    pub column: String,
    pub fid: String,
    pub rtree: String,
}

impl RTreeNames {
    pub(crate) fn new(table: &str, column: &str, fid: &str) -> RTreeNames {
        RTreeNames {
            table: table.to_string(),
            column: column.to_string(),
            fid: fid.to_string(),
            rtree: format!("rtree_{}_{}", table, column),
        }
    }

    fn trigger(&self, suffix: &str) -> String {
        format!("{}_{}", self.rtree, suffix)
    }

    pub(crate) fn insert_trigger(&self) -> String {
        self.trigger("insert")
    }
}

const TRIGGER_SUFFIXES: [&str; 6] = ["insert", "update1", "update2", "update3", "update4", "delete"];

pub(crate) fn create_rtree_table(conn: &Connection, rtree: &str) -> GpkgResult<()> {
    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE {} USING rtree(id, minx, maxx, miny, maxy)",
        quote_ident(rtree)
    ))?;
    Ok(())
}

pub(crate) fn rtree_exists(conn: &Connection, rtree: &str) -> GpkgResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND lower(name) = lower(?1)",
            [rtree],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn insert_trigger_sql(names: &RTreeNames) -> String {
    let t = quote_ident(&names.table);
    let c = quote_ident(&names.column);
    let i = quote_ident(&names.fid);
    let r = quote_ident(&names.rtree);
    format!(
        "CREATE TRIGGER {trigger} AFTER INSERT ON {t} \
         WHEN (new.{c} NOT NULL AND NOT ST_IsEmpty(NEW.{c})) \
         BEGIN \
         INSERT OR REPLACE INTO {r} VALUES (\
         NEW.{i}, ST_MinX(NEW.{c}), ST_MaxX(NEW.{c}), ST_MinY(NEW.{c}), ST_MaxY(NEW.{c})\
         ); \
         END",
        trigger = quote_ident(&names.insert_trigger()),
    )
}

/// Creates the six maintenance triggers of the GeoPackage R-tree extension.
pub(crate) fn create_triggers(conn: &Connection, names: &RTreeNames) -> GpkgResult<()> {
    let t = quote_ident(&names.table);
    let c = quote_ident(&names.column);
    let i = quote_ident(&names.fid);
    let r = quote_ident(&names.rtree);
    let values = format!(
        "NEW.{i}, ST_MinX(NEW.{c}), ST_MaxX(NEW.{c}), ST_MinY(NEW.{c}), ST_MaxY(NEW.{c})"
    );
    let not_empty = format!("(NEW.{c} NOTNULL AND NOT ST_IsEmpty(NEW.{c}))");
    let empty = format!("(NEW.{c} ISNULL OR ST_IsEmpty(NEW.{c}))");

    let sql = format!(
        "{insert};
        CREATE TRIGGER {update1} AFTER UPDATE OF {c} ON {t}
          WHEN OLD.{i} = NEW.{i} AND {not_empty}
        BEGIN
          INSERT OR REPLACE INTO {r} VALUES ({values});
        END;
        CREATE TRIGGER {update2} AFTER UPDATE OF {c} ON {t}
          WHEN OLD.{i} = NEW.{i} AND {empty}
        BEGIN
          DELETE FROM {r} WHERE id = OLD.{i};
        END;
        CREATE TRIGGER {update3} AFTER UPDATE ON {t}
          WHEN OLD.{i} != NEW.{i} AND {not_empty}
        BEGIN
          DELETE FROM {r} WHERE id = OLD.{i};
          INSERT OR REPLACE INTO {r} VALUES ({values});
        END;
        CREATE TRIGGER {update4} AFTER UPDATE ON {t}
          WHEN OLD.{i} != NEW.{i} AND {empty}
        BEGIN
          DELETE FROM {r} WHERE id IN (OLD.{i}, NEW.{i});
        END;
        CREATE TRIGGER {delete} AFTER DELETE ON {t}
          WHEN old.{c} NOT NULL
        BEGIN
          DELETE FROM {r} WHERE id = OLD.{i};
        END;",
        insert = insert_trigger_sql(names),
        update1 = quote_ident(&names.trigger("update1")),
        update2 = quote_ident(&names.trigger("update2")),
        update3 = quote_ident(&names.trigger("update3")),
        update4 = quote_ident(&names.trigger("update4")),
        delete = quote_ident(&names.trigger("delete")),
    );
    conn.execute_batch(&sql)?;
    Ok(())
}

pub(crate) fn drop_triggers(conn: &Connection, names: &RTreeNames) -> GpkgResult<()> {
    for suffix in TRIGGER_SUFFIXES {
        conn.execute_batch(&format!(
            "DROP TRIGGER IF EXISTS {}",
            quote_ident(&names.trigger(suffix))
        ))?;
    }
    Ok(())
}

/// Drops the insert trigger and returns its SQL so it can be re-created.
pub(crate) fn drop_insert_trigger(conn: &Connection, names: &RTreeNames) -> GpkgResult<Option<String>> {
    let sql: Option<String> = conn
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type = 'trigger' AND name = ?1",
            [names.insert_trigger()],
            |r| r.get(0),
        )
        .optional()?;
    if sql.is_some() {
        conn.execute_batch(&format!(
            "DROP TRIGGER {}",
            quote_ident(&names.insert_trigger())
        ))?;
    }
    Ok(sql)
}

pub(crate) fn restore_insert_trigger(conn: &Connection, saved_sql: &str) -> GpkgResult<()> {
    conn.execute_batch(saved_sql)?;
    Ok(())
}

/// Writes entries into the R-tree through `conn`.
pub(crate) fn insert_entries(conn: &Connection, rtree: &str, entries: &[IndexEntry]) -> GpkgResult<()> {
    let mut stmt = conn.prepare_cached(&format!(
        "INSERT OR REPLACE INTO {} VALUES (?1, ?2, ?3, ?4, ?5)",
        quote_ident(rtree)
    ))?;
    for e in entries {
        stmt.execute(params![
            e.id,
            e.min_x as f64,
            e.max_x as f64,
            e.min_y as f64,
            e.max_y as f64
        ])?;
    }
    Ok(())
}

/// Indexes every non-empty geometry of the table.
pub(crate) fn populate_from_table(conn: &Connection, names: &RTreeNames) -> GpkgResult<usize> {
    let c = quote_ident(&names.column);
    let count = conn.execute(
        &format!(
            "INSERT OR REPLACE INTO {r} \
             SELECT {i}, ST_MinX({c}), ST_MaxX({c}), ST_MinY({c}), ST_MaxY({c}) FROM {t} \
             WHERE {c} NOT NULL AND NOT ST_IsEmpty({c})",
            r = quote_ident(&names.rtree),
            i = quote_ident(&names.fid),
            t = quote_ident(&names.table),
        ),
        [],
    )?;
    Ok(count)
}

pub(crate) fn clear(conn: &Connection, rtree: &str) -> GpkgResult<()> {
    conn.execute_batch(&format!("DELETE FROM {}", quote_ident(rtree)))?;
    Ok(())
}

pub(crate) fn drop_rtree(conn: &Connection, names: &RTreeNames) -> GpkgResult<()> {
    drop_triggers(conn, names)?;
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(&names.rtree)))?;
    Ok(())
}

pub(crate) fn entry_count(conn: &Connection, rtree: &str) -> GpkgResult<u64> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", quote_ident(rtree)),
        [],
        |r| r.get(0),
    )?;
    Ok(count as u64)
}

pub(crate) fn is_empty(conn: &Connection, rtree: &str) -> GpkgResult<bool> {
    let any: Option<i64> = conn
        .query_row(
            &format!("SELECT id FROM {} LIMIT 1", quote_ident(rtree)),
            [],
            |r| r.get(0),
        )
        .optional()?;
    Ok(any.is_none())
}

/// Ids whose rectangle intersects `envelope` (inclusive), ascending.
pub(crate) fn query_range(conn: &Connection, rtree: &str, envelope: &Envelope) -> GpkgResult<Vec<i64>> {
    if envelope.is_empty() {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(&format!(
        "SELECT id FROM {} WHERE minx <= ?1 AND maxx >= ?2 AND miny <= ?3 AND maxy >= ?4 \
         ORDER BY id",
        quote_ident(rtree)
    ))?;
    let ids = stmt
        .query_map(
            params![envelope.max_x, envelope.min_x, envelope.max_y, envelope.min_y],
            |r| r.get(0),
        )?
        .collect::<Result<Vec<i64>, _>>()?;
    Ok(ids)
}

/// Bounds of the whole R-tree, or an empty envelope.
pub(crate) fn extent(conn: &Connection, rtree: &str) -> GpkgResult<Envelope> {
    let bounds: (Option<f64>, Option<f64>, Option<f64>, Option<f64>) = conn.query_row(
        &format!(
            "SELECT MIN(minx), MIN(miny), MAX(maxx), MAX(maxy) FROM {}",
            quote_ident(rtree)
        ),
        [],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
    )?;
    match bounds {
        (Some(a), Some(b), Some(c), Some(d)) => Ok(Envelope::new(a, b, c, d)),
        _ => Ok(Envelope::empty()),
    }
}

/// Byte length of the root node blob, which fixes the node size of an
/// R-tree.
pub(crate) fn root_node_size(conn: &Connection, rtree: &str) -> GpkgResult<Option<i64>> {
    let size: Option<i64> = conn
        .query_row(
            &format!(
                "SELECT length(data) FROM {} WHERE nodeno = 1",
                quote_ident(&format!("{}_node", rtree))
            ),
            [],
            |r| r.get(0),
        )
        .optional()?;
    Ok(size)
}

/// Shadow tables backing an R-tree virtual table.
pub(crate) fn shadow_tables(rtree: &str) -> [String; 3] {
    [
        format!("{}_node", rtree),
        format!("{}_rowid", rtree),
        format!("{}_parent", rtree),
    ]
}
