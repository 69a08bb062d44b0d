use crate::errors::{ErrorKind, GpkgError, GpkgResult};
use crate::geometry::WkbGeometryType;
use std::fmt::{Display, Formatter};

/// Attribute field types supported by feature tables.
///
/// # Storage
/// Each type maps to the SQLite declared type written in the table DDL:
///
/// | Type        | Declared type | Stored as                    |
/// |-------------|---------------|------------------------------|
/// | `Integer`   | `MEDIUMINT`   | INTEGER (32-bit range)       |
/// | `Integer64` | `INTEGER`     | INTEGER                      |
/// | `Real`      | `REAL`        | REAL                         |
/// | `String`    | `TEXT`        | TEXT                         |
/// | `Binary`    | `BLOB`        | BLOB                         |
/// | `Boolean`   | `BOOLEAN`     | INTEGER 0/1                  |
/// | `Date`      | `DATE`        | TEXT `YYYY-MM-DD`            |
/// | `DateTime`  | `DATETIME`    | TEXT ISO-8601 with offset    |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Integer,
    Integer64,
    Real,
    String,
    Binary,
    Boolean,
    Date,
    DateTime,
}

impl FieldType {
    /// Declared column type used in `CREATE TABLE`.
    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldType::Integer => "MEDIUMINT",
            FieldType::Integer64 => "INTEGER",
            FieldType::Real => "REAL",
            FieldType::String => "TEXT",
            FieldType::Binary => "BLOB",
            FieldType::Boolean => "BOOLEAN",
            FieldType::Date => "DATE",
            FieldType::DateTime => "DATETIME",
        }
    }

    /// Maps a declared column type back to a field type.
    ///
    /// Width suffixes such as `TEXT(32)` are accepted.
    pub fn from_sql_type(declared: &str) -> GpkgResult<FieldType> {
        let upper = declared.trim().to_ascii_uppercase();
        let base = upper.split('(').next().unwrap_or("").trim();
        match base {
            "MEDIUMINT" | "INT" | "SMALLINT" | "TINYINT" => Ok(FieldType::Integer),
            "INTEGER" => Ok(FieldType::Integer64),
            "REAL" | "DOUBLE" | "FLOAT" => Ok(FieldType::Real),
            "TEXT" => Ok(FieldType::String),
            "BLOB" => Ok(FieldType::Binary),
            "BOOLEAN" => Ok(FieldType::Boolean),
            "DATE" => Ok(FieldType::Date),
            "DATETIME" => Ok(FieldType::DateTime),
            _ => Err(GpkgError::new(
                &format!("Unsupported column type '{}'", declared),
                ErrorKind::ValidationError,
            )),
        }
    }

    /// True for types whose stored text must be parsed row by row.
    pub fn needs_text_parsing(&self) -> bool {
        matches!(self, FieldType::Date | FieldType::DateTime)
    }
}

impl Display for FieldType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.sql_type())
    }
}

/// Definition of one attribute column.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDefn {
    name: String,
    field_type: FieldType,
    nullable: bool,
}

impl FieldDefn {
    pub fn new(name: &str, field_type: FieldType) -> FieldDefn {
        FieldDefn {
            name: name.to_string(),
            field_type,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> FieldDefn {
        self.nullable = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }
}

/// Geometry column of a feature table.
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryColumnDefn {
    pub name: String,
    pub geometry_type: WkbGeometryType,
    pub srs_id: i32,
}

impl GeometryColumnDefn {
    pub fn new(name: &str, geometry_type: WkbGeometryType, srs_id: i32) -> GeometryColumnDefn {
        GeometryColumnDefn {
            name: name.to_string(),
            geometry_type,
            srs_id,
        }
    }
}

/// Schema of a feature table: fid column, optional geometry column and
/// attribute fields in column order.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureDefn {
    table_name: String,
    fid_column: String,
    geometry_column: Option<GeometryColumnDefn>,
    fields: Vec<FieldDefn>,
}

impl FeatureDefn {
    pub const DEFAULT_FID_COLUMN: &'static str = "fid";
    pub const DEFAULT_GEOMETRY_COLUMN: &'static str = "geom";

    pub fn new(table_name: &str) -> FeatureDefn {
        FeatureDefn {
            table_name: table_name.to_string(),
            fid_column: Self::DEFAULT_FID_COLUMN.to_string(),
            geometry_column: None,
            fields: Vec::new(),
        }
    }

    pub fn with_fid_column(mut self, name: &str) -> FeatureDefn {
        self.fid_column = name.to_string();
        self
    }

    pub fn with_geometry(mut self, geometry_type: WkbGeometryType, srs_id: i32) -> FeatureDefn {
        self.geometry_column = Some(GeometryColumnDefn::new(
            Self::DEFAULT_GEOMETRY_COLUMN,
            geometry_type,
            srs_id,
        ));
        self
    }

    pub fn with_geometry_column(mut self, column: GeometryColumnDefn) -> FeatureDefn {
        self.geometry_column = Some(column);
        self
    }

    pub fn with_field(mut self, field: FieldDefn) -> FeatureDefn {
        self.fields.push(field);
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn fid_column(&self) -> &str {
        &self.fid_column
    }

    pub fn geometry_column(&self) -> Option<&GeometryColumnDefn> {
        self.geometry_column.as_ref()
    }

    pub fn fields(&self) -> &[FieldDefn] {
        &self.fields
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn field(&self, index: usize) -> Option<&FieldDefn> {
        self.fields.get(index)
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Checks names for emptiness and duplicates.
    pub fn validate(&self) -> GpkgResult<()> {
        if self.table_name.trim().is_empty() {
            return Err(GpkgError::new(
                "Table name cannot be empty",
                ErrorKind::ValidationError,
            ));
        }

        let mut seen: Vec<&str> = vec![self.fid_column.as_str()];
        if let Some(geom) = &self.geometry_column {
            seen.push(geom.name.as_str());
        }
        for field in &self.fields {
            if field.name.trim().is_empty() {
                return Err(GpkgError::new(
                    "Field name cannot be empty",
                    ErrorKind::ValidationError,
                ));
            }
            if seen.iter().any(|s| s.eq_ignore_ascii_case(&field.name)) {
                return Err(GpkgError::new(
                    &format!("Duplicate column name '{}'", field.name),
                    ErrorKind::ValidationError,
                ));
            }
            seen.push(field.name.as_str());
        }
        Ok(())
    }
}

/// Double-quotes an SQL identifier.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
