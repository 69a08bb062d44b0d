use crate::errors::{ErrorKind, GpkgError, GpkgResult};
use crate::feature::{quote_ident, Feature, FeatureDefn, FieldValue};
use crate::geometry::{Envelope, GpkgBlob};
use rusqlite::{Connection, Row};
use std::sync::Arc;

/// Columns, filters and order of a feature scan.
///
/// The same query drives row iteration, the inline and single filler
/// columnar paths (keyset pages or one cursor) and the prefetch tasks
/// (`LIMIT`/`OFFSET` slices).
#[derive(Debug, Clone)]
pub(crate) struct ScanQuery {
    defn: Arc<FeatureDefn>,
    attribute_filter: Option<String>,
    spatial_filter: Option<Envelope>,
    rtree: Option<String>,
}

/// A row as read from the table, before geometry decoding.
#[derive(Debug, Clone)]
pub(crate) struct RawFeature {
    pub fid: i64,
    pub geometry: Option<Vec<u8>>,
    pub values: Vec<FieldValue>,
}

/// Result of reading one keyset page.
#[derive(Debug, Default)]
pub(crate) struct Page {
    pub rows: Vec<RawFeature>,
    /// fid of the last row stepped over, accepted or not
    pub last_fid: Option<i64>,
    pub exhausted: bool,
}

impl ScanQuery {
    pub(crate) fn new(defn: Arc<FeatureDefn>) -> ScanQuery {
        ScanQuery {
            defn,
            attribute_filter: None,
            spatial_filter: None,
            rtree: None,
        }
    }

    pub(crate) fn with_attribute_filter(mut self, filter: Option<String>) -> ScanQuery {
        self.attribute_filter = filter;
        self
    }

    /// Restricts the scan to features whose envelope intersects `filter`.
    /// Candidates come from `rtree` when given.
    pub(crate) fn with_spatial_filter(
        mut self,
        filter: Option<Envelope>,
        rtree: Option<String>,
    ) -> ScanQuery {
        self.spatial_filter = filter;
        self.rtree = rtree;
        self
    }

    pub(crate) fn defn(&self) -> &Arc<FeatureDefn> {
        &self.defn
    }

    pub(crate) fn is_filtered(&self) -> bool {
        self.attribute_filter.is_some() || self.active_spatial_filter().is_some()
    }

    fn active_spatial_filter(&self) -> Option<&Envelope> {
        // a spatial filter on a table without geometry matches nothing and
        // is rejected when set
        self.defn.geometry_column().and(self.spatial_filter.as_ref())
    }

    fn select_list(&self) -> String {
        let mut columns = vec![quote_ident(self.defn.fid_column())];
        if let Some(geom) = self.defn.geometry_column() {
            columns.push(quote_ident(&geom.name));
        }
        columns.extend(self.defn.fields().iter().map(|f| quote_ident(f.name())));
        columns.join(", ")
    }

    fn where_clauses(&self) -> Vec<String> {
        let mut clauses = Vec::new();
        if let Some(filter) = &self.attribute_filter {
            clauses.push(format!("({})", filter));
        }
        if let (Some(envelope), Some(geom)) =
            (self.active_spatial_filter(), self.defn.geometry_column())
        {
            let (min_x, min_y, max_x, max_y) = (
                sql_real(envelope.min_x),
                sql_real(envelope.min_y),
                sql_real(envelope.max_x),
                sql_real(envelope.max_y),
            );
            match &self.rtree {
                Some(rtree) => clauses.push(format!(
                    "{} IN (SELECT id FROM {} WHERE minx <= {} AND maxx >= {} AND miny <= {} AND maxy >= {})",
                    quote_ident(self.defn.fid_column()),
                    quote_ident(rtree),
                    max_x,
                    min_x,
                    max_y,
                    min_y
                )),
                None => {
                    let g = quote_ident(&geom.name);
                    clauses.push(format!(
                        "{g} IS NOT NULL AND ST_MinX({g}) <= {} AND ST_MaxX({g}) >= {} \
                         AND ST_MinY({g}) <= {} AND ST_MaxY({g}) >= {}",
                        max_x,
                        min_x,
                        max_y,
                        min_y,
                        g = g
                    ))
                }
            }
        }
        clauses
    }

    fn statement(&self, extra: Option<String>, tail: &str) -> String {
        let mut clauses = self.where_clauses();
        clauses.extend(extra);
        let mut sql = format!(
            "SELECT {} FROM {}",
            self.select_list(),
            quote_ident(self.defn.table_name())
        );
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(&quote_ident(self.defn.fid_column()));
        sql.push_str(tail);
        sql
    }

    /// One ordered cursor over the whole result.
    pub(crate) fn cursor_sql(&self) -> String {
        self.statement(None, "")
    }

    /// Rows after fid `?1`.
    pub(crate) fn page_sql(&self) -> String {
        let after = format!("{} > ?1", quote_ident(self.defn.fid_column()));
        self.statement(Some(after), "")
    }

    /// At most `?1` rows starting at row position `?2`.
    pub(crate) fn slice_sql(&self) -> String {
        self.statement(None, " LIMIT ?1 OFFSET ?2")
    }

    pub(crate) fn count_sql(&self) -> String {
        let clauses = self.where_clauses();
        let mut sql = format!("SELECT COUNT(*) FROM {}", quote_ident(self.defn.table_name()));
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql
    }

    pub(crate) fn count(&self, conn: &Connection) -> GpkgResult<u64> {
        let count: i64 = conn.query_row(&self.count_sql(), [], |r| r.get(0))?;
        Ok(count as u64)
    }

    /// Decodes a row of any of this query's statements.
    ///
    /// Returns `None` for a row rejected by the exact envelope test of the
    /// spatial filter.
    pub(crate) fn decode_row(&self, row: &Row<'_>) -> GpkgResult<Option<RawFeature>> {
        let fid: i64 = row.get(0)?;
        self.decode_columns(fid, row).map_err(|e| {
            e.with_kind(
                &format!(
                    "Cannot read feature {} of {}",
                    fid,
                    self.defn.table_name()
                ),
                ErrorKind::ReadError,
            )
        })
    }

    fn decode_columns(&self, fid: i64, row: &Row<'_>) -> GpkgResult<Option<RawFeature>> {
        let mut column = 1;
        let mut geometry = None;
        if self.defn.geometry_column().is_some() {
            geometry = row.get::<_, Option<Vec<u8>>>(column)?;
            column += 1;
        }

        if let Some(filter) = self.active_spatial_filter() {
            let Some(blob) = &geometry else {
                return Ok(None);
            };
            let envelope = GpkgBlob::parse(blob)?.envelope()?;
            if !envelope.intersects(filter) {
                return Ok(None);
            }
        }

        let mut values = Vec::with_capacity(self.defn.field_count());
        for field in self.defn.fields() {
            values.push(FieldValue::from_sql(row.get_ref(column)?, field.field_type())?);
            column += 1;
        }
        Ok(Some(RawFeature {
            fid,
            geometry,
            values,
        }))
    }

    /// Reads the row with `fid`, if it passes the query's filters.
    pub(crate) fn fetch(&self, conn: &Connection, fid: i64) -> GpkgResult<Option<RawFeature>> {
        let by_fid = format!("{} = ?1", quote_ident(self.defn.fid_column()));
        let mut stmt = conn.prepare_cached(&self.statement(Some(by_fid), ""))?;
        let mut rows = stmt.query([fid])?;
        match rows.next()? {
            Some(row) => self.decode_row(row),
            None => Ok(None),
        }
    }

    /// Reads rows after `after_fid` until `max_rows` rows were accepted or
    /// their estimated size reaches `max_bytes`.
    pub(crate) fn read_page(
        &self,
        conn: &Connection,
        after_fid: i64,
        max_rows: usize,
        max_bytes: usize,
    ) -> GpkgResult<Page> {
        let mut stmt = conn.prepare_cached(&self.page_sql())?;
        let mut rows = stmt.query([after_fid])?;
        let mut page = Page::default();
        let mut bytes = 0;
        loop {
            if page.rows.len() >= max_rows || bytes >= max_bytes {
                return Ok(page);
            }
            let Some(row) = rows.next()? else {
                page.exhausted = true;
                return Ok(page);
            };
            let fid: i64 = row.get(0)?;
            page.last_fid = Some(fid);
            if let Some(raw) = self.decode_row(row)? {
                bytes += raw.approx_size();
                page.rows.push(raw);
            }
        }
    }
}

impl RawFeature {
    /// Rough in-memory size, used to bound columnar batches.
    pub(crate) fn approx_size(&self) -> usize {
        let geometry = self.geometry.as_ref().map_or(0, Vec::len);
        let values: usize = self
            .values
            .iter()
            .map(|v| match v {
                FieldValue::String(s) => s.len() + 4,
                FieldValue::Binary(b) => b.len() + 4,
                _ => 8,
            })
            .sum();
        8 + geometry + values
    }

    pub(crate) fn into_feature(self) -> GpkgResult<Feature> {
        let geometry = match &self.geometry {
            Some(blob) => Some(GpkgBlob::parse(blob)?.to_geometry().map_err(|e| {
                GpkgError::from(e).with_kind(
                    &format!("Cannot decode geometry of feature {}", self.fid),
                    ErrorKind::ReadError,
                )
            })?),
            None => None,
        };
        Ok(Feature::from_parts(Some(self.fid), geometry, self.values))
    }
}

/// Formats a coordinate as an SQL literal. Infinite bounds are clamped.
fn sql_real(v: f64) -> String {
    format!("{:?}", v.clamp(f64::MIN, f64::MAX))
}
