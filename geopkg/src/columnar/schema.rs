use crate::errors::{ErrorKind, GpkgError, GpkgResult};
use crate::feature::{FeatureDefn, FieldType};
use arrow_schema::{DataType, Field, Schema, SchemaRef, TimeUnit};
use std::collections::HashMap;
use std::sync::Arc;

pub const EXTENSION_NAME_KEY: &str = "ARROW:extension:name";
pub const GEOARROW_WKB: &str = "geoarrow.wkb";

/// Arrow type of an attribute field.
pub fn arrow_type(field_type: FieldType) -> DataType {
    match field_type {
        FieldType::Integer => DataType::Int32,
        FieldType::Integer64 => DataType::Int64,
        FieldType::Real => DataType::Float64,
        FieldType::String => DataType::Utf8,
        FieldType::Binary => DataType::Binary,
        FieldType::Boolean => DataType::Boolean,
        FieldType::Date => DataType::Date32,
        FieldType::DateTime => DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
    }
}

/// Schema of the record batches produced for a layer: the fid, the geometry
/// as WKB tagged `geoarrow.wkb`, then the attribute fields.
pub fn arrow_schema(defn: &FeatureDefn) -> SchemaRef {
    let mut fields = Vec::with_capacity(defn.field_count() + 2);
    fields.push(Field::new(defn.fid_column(), DataType::Int64, false));
    if let Some(geom) = defn.geometry_column() {
        let metadata = HashMap::from([(EXTENSION_NAME_KEY.to_string(), GEOARROW_WKB.to_string())]);
        fields.push(Field::new(&geom.name, DataType::Binary, true).with_metadata(metadata));
    }
    for field in defn.fields() {
        fields.push(Field::new(
            field.name(),
            arrow_type(field.field_type()),
            field.is_nullable(),
        ));
    }
    Arc::new(Schema::new(fields))
}

/// Checks whether a full scan of `defn` can be split across prefetch tasks.
///
/// Date and datetime columns are stored as text and parsed row by row, which
/// the prefetch path does not do; such layers get
/// [`ErrorKind::SchemaIncompatible`].
pub fn check_prefetch_compatible(defn: &FeatureDefn) -> GpkgResult<()> {
    match defn.fields().iter().find(|f| f.field_type().needs_text_parsing()) {
        Some(field) => Err(GpkgError::new(
            &format!(
                "Field {} of type {} needs per-row parsing",
                field.name(),
                field.field_type()
            ),
            ErrorKind::SchemaIncompatible,
        )),
        None => Ok(()),
    }
}
