use crate::errors::{ErrorKind, GpkgError, GpkgResult};
use crate::feature::{
    quote_ident, FeatureDefn, FieldDefn, FieldType, GeometryColumnDefn,
};
use crate::geometry::{Envelope, WkbGeometryType};
use rusqlite::{params, Connection, OptionalExtension};

/// `GPKG` in ASCII.
pub(crate) const APPLICATION_ID: i32 = 0x4750_4B47;
/// GeoPackage 1.4.0
pub(crate) const USER_VERSION: i32 = 10_400;

pub(crate) const RTREE_EXTENSION: &str = "gpkg_rtree_index";
const RTREE_EXTENSION_DEFINITION: &str = "http://www.geopackage.org/spec120/#extension_rtree";

const CREATE_METADATA: &str = "
CREATE TABLE IF NOT EXISTS gpkg_spatial_ref_sys (
    srs_name TEXT NOT NULL,
    srs_id INTEGER NOT NULL PRIMARY KEY,
    organization TEXT NOT NULL,
    organization_coordsys_id INTEGER NOT NULL,
    definition TEXT NOT NULL,
    description TEXT
);
CREATE TABLE IF NOT EXISTS gpkg_contents (
    table_name TEXT NOT NULL PRIMARY KEY,
    data_type TEXT NOT NULL,
    identifier TEXT UNIQUE,
    description TEXT DEFAULT '',
    last_change DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
    min_x DOUBLE,
    min_y DOUBLE,
    max_x DOUBLE,
    max_y DOUBLE,
    srs_id INTEGER,
    CONSTRAINT fk_gc_r_srs_id FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys(srs_id)
);
CREATE TABLE IF NOT EXISTS gpkg_geometry_columns (
    table_name TEXT NOT NULL,
    column_name TEXT NOT NULL,
    geometry_type_name TEXT NOT NULL,
    srs_id INTEGER NOT NULL,
    z TINYINT NOT NULL,
    m TINYINT NOT NULL,
    CONSTRAINT pk_geom_cols PRIMARY KEY (table_name, column_name),
    CONSTRAINT fk_gc_tn FOREIGN KEY (table_name) REFERENCES gpkg_contents(table_name),
    CONSTRAINT fk_gc_srs FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys (srs_id)
);
CREATE TABLE IF NOT EXISTS gpkg_extensions (
    table_name TEXT,
    column_name TEXT,
    extension_name TEXT NOT NULL,
    definition TEXT NOT NULL,
    scope TEXT NOT NULL,
    CONSTRAINT ge_tce UNIQUE (table_name, column_name, extension_name)
);
INSERT OR IGNORE INTO gpkg_spatial_ref_sys VALUES
    ('Undefined cartesian SRS', -1, 'NONE', -1, 'undefined', 'undefined cartesian coordinate reference system'),
    ('Undefined geographic SRS', 0, 'NONE', 0, 'undefined', 'undefined geographic coordinate reference system'),
    ('WGS 84 geodetic', 4326, 'EPSG', 4326,
     'GEOGCS[\"WGS 84\",DATUM[\"WGS_1984\",SPHEROID[\"WGS 84\",6378137,298.257223563,AUTHORITY[\"EPSG\",\"7030\"]],AUTHORITY[\"EPSG\",\"6326\"]],PRIMEM[\"Greenwich\",0,AUTHORITY[\"EPSG\",\"8901\"]],UNIT[\"degree\",0.0174532925199433,AUTHORITY[\"EPSG\",\"9122\"]],AXIS[\"Latitude\",NORTH],AXIS[\"Longitude\",EAST],AUTHORITY[\"EPSG\",\"4326\"]]',
     'longitude/latitude coordinates in decimal degrees on the WGS 84 spheroid');
";

/// Writes the container header values and the metadata tables.
pub(crate) fn initialize(conn: &Connection) -> GpkgResult<()> {
    conn.execute_batch(&format!(
        "PRAGMA application_id = {};\nPRAGMA user_version = {};",
        APPLICATION_ID, USER_VERSION
    ))?;
    conn.execute_batch(CREATE_METADATA)?;
    Ok(())
}

/// Checks that `conn` holds a GeoPackage this crate can work with.
pub(crate) fn validate(conn: &Connection) -> GpkgResult<()> {
    let application_id: i32 = conn.query_row("PRAGMA application_id", [], |r| r.get(0))?;
    if application_id != APPLICATION_ID {
        log::warn!(
            "Unexpected application_id {:#x}, opening anyway",
            application_id
        );
    }
    if !table_exists(conn, "gpkg_contents")? {
        return Err(GpkgError::new(
            "Not a GeoPackage: gpkg_contents is missing",
            ErrorKind::ValidationError,
        ));
    }
    conn.execute_batch(CREATE_METADATA)?;
    Ok(())
}

pub(crate) fn table_exists(conn: &Connection, name: &str) -> GpkgResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND lower(name) = lower(?1)",
            [name],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub(crate) fn layer_names(conn: &Connection) -> GpkgResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT table_name FROM gpkg_contents \
         WHERE data_type IN ('features', 'attributes') ORDER BY table_name",
    )?;
    let names = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

/// Creates the feature table and registers it in the metadata tables.
pub(crate) fn create_feature_table(conn: &Connection, defn: &FeatureDefn) -> GpkgResult<()> {
    defn.validate()?;
    if table_exists(conn, defn.table_name())? {
        return Err(GpkgError::new(
            &format!("Table {} already exists", defn.table_name()),
            ErrorKind::InvalidOperation,
        ));
    }

    let mut columns = vec![format!(
        "{} INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL",
        quote_ident(defn.fid_column())
    )];
    if let Some(geom) = defn.geometry_column() {
        columns.push(format!(
            "{} {}",
            quote_ident(&geom.name),
            geom.geometry_type.name()
        ));
    }
    for field in defn.fields() {
        let mut column = format!("{} {}", quote_ident(field.name()), field.field_type().sql_type());
        if !field.is_nullable() {
            column.push_str(" NOT NULL");
        }
        columns.push(column);
    }
    conn.execute_batch(&format!(
        "CREATE TABLE {} ({})",
        quote_ident(defn.table_name()),
        columns.join(", ")
    ))?;

    let (data_type, srs_id) = match defn.geometry_column() {
        Some(geom) => ("features", Some(geom.srs_id)),
        None => ("attributes", None),
    };
    conn.execute(
        "INSERT INTO gpkg_contents (table_name, data_type, identifier, last_change, srs_id) \
         VALUES (?1, ?2, ?1, ?3, ?4)",
        params![defn.table_name(), data_type, timestamp(), srs_id],
    )?;
    if let Some(geom) = defn.geometry_column() {
        conn.execute(
            "INSERT INTO gpkg_geometry_columns \
             (table_name, column_name, geometry_type_name, srs_id, z, m) \
             VALUES (?1, ?2, ?3, ?4, 0, 0)",
            params![defn.table_name(), geom.name, geom.geometry_type.name(), geom.srs_id],
        )?;
    }
    Ok(())
}

/// Reads the schema of an existing feature or attribute table.
pub(crate) fn load_feature_defn(conn: &Connection, table: &str) -> GpkgResult<FeatureDefn> {
    let stored_name: Option<String> = conn
        .query_row(
            "SELECT table_name FROM gpkg_contents \
             WHERE lower(table_name) = lower(?1) AND data_type IN ('features', 'attributes')",
            [table],
            |r| r.get(0),
        )
        .optional()?;
    let table = stored_name.ok_or_else(|| {
        GpkgError::new(&format!("Layer {} not found", table), ErrorKind::NotFound)
    })?;

    let geometry: Option<(String, String, i32)> = conn
        .query_row(
            "SELECT column_name, geometry_type_name, srs_id FROM gpkg_geometry_columns \
             WHERE table_name = ?1",
            [&table],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;

    let mut defn = FeatureDefn::new(&table);
    if let Some((column, type_name, srs_id)) = &geometry {
        let geometry_type = WkbGeometryType::from_name(type_name).ok_or_else(|| {
            GpkgError::new(
                &format!("Unsupported geometry type {} in {}", type_name, table),
                ErrorKind::ValidationError,
            )
        })?;
        defn = defn.with_geometry_column(GeometryColumnDefn::new(column, geometry_type, *srs_id));
    }

    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(&table)))?;
    let columns = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, bool>(3)?,
                r.get::<_, i64>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut fid_found = false;
    for (name, declared, not_null, pk) in columns {
        if pk == 1 && !fid_found {
            defn = defn.with_fid_column(&name);
            fid_found = true;
            continue;
        }
        if geometry
            .as_ref()
            .map(|(column, _, _)| column.eq_ignore_ascii_case(&name))
            .unwrap_or(false)
        {
            continue;
        }
        let mut field = FieldDefn::new(&name, FieldType::from_sql_type(&declared)?);
        if not_null {
            field = field.not_null();
        }
        defn = defn.with_field(field);
    }
    if !fid_found {
        return Err(GpkgError::new(
            &format!("Table {} has no integer primary key", table),
            ErrorKind::ValidationError,
        ));
    }
    Ok(defn)
}

/// Persists the layer extent; an empty extent is stored as NULLs.
pub(crate) fn write_extent(conn: &Connection, table: &str, extent: &Envelope) -> GpkgResult<()> {
    let bounds = (!extent.is_empty()).then_some(*extent);
    conn.execute(
        "UPDATE gpkg_contents SET min_x = ?1, min_y = ?2, max_x = ?3, max_y = ?4, \
         last_change = ?5 WHERE lower(table_name) = lower(?6)",
        params![
            bounds.map(|e| e.min_x),
            bounds.map(|e| e.min_y),
            bounds.map(|e| e.max_x),
            bounds.map(|e| e.max_y),
            timestamp(),
            table
        ],
    )?;
    Ok(())
}

pub(crate) fn read_extent(conn: &Connection, table: &str) -> GpkgResult<Envelope> {
    let bounds: Option<(Option<f64>, Option<f64>, Option<f64>, Option<f64>)> = conn
        .query_row(
            "SELECT min_x, min_y, max_x, max_y FROM gpkg_contents \
             WHERE lower(table_name) = lower(?1)",
            [table],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    match bounds {
        Some((Some(min_x), Some(min_y), Some(max_x), Some(max_y))) => {
            Ok(Envelope::new(min_x, min_y, max_x, max_y))
        }
        _ => Ok(Envelope::empty()),
    }
}

pub(crate) fn register_rtree_extension(
    conn: &Connection,
    table: &str,
    column: &str,
) -> GpkgResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO gpkg_extensions \
         (table_name, column_name, extension_name, definition, scope) \
         VALUES (?1, ?2, ?3, ?4, 'write-only')",
        params![table, column, RTREE_EXTENSION, RTREE_EXTENSION_DEFINITION],
    )?;
    Ok(())
}

pub(crate) fn unregister_rtree_extension(
    conn: &Connection,
    table: &str,
    column: &str,
) -> GpkgResult<()> {
    conn.execute(
        "DELETE FROM gpkg_extensions WHERE lower(table_name) = lower(?1) \
         AND lower(column_name) = lower(?2) AND extension_name = ?3",
        params![table, column, RTREE_EXTENSION],
    )?;
    Ok(())
}

fn timestamp() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
}
