use crate::errors::{ErrorKind, GpkgError, GpkgResult};
use crate::feature::{FeatureDefn, FieldType, FieldValue};
use crate::geometry::GpkgBlob;
use crate::layer::RawFeature;
use arrow_array::builder::{
    BinaryBuilder, BooleanBuilder, Date32Builder, Float64Builder, Int32Builder, Int64Builder,
    StringBuilder, TimestampMillisecondBuilder,
};
use arrow_array::{ArrayRef, RecordBatch};
use arrow_schema::SchemaRef;
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;

enum ColumnBuilder {
    Int32(Int32Builder),
    Int64(Int64Builder),
    Float64(Float64Builder),
    Utf8(StringBuilder),
    Binary(BinaryBuilder),
    Boolean(BooleanBuilder),
    Date32(Date32Builder),
    Timestamp(TimestampMillisecondBuilder),
}

impl ColumnBuilder {
    fn for_type(field_type: FieldType, capacity: usize) -> ColumnBuilder {
        match field_type {
            FieldType::Integer => ColumnBuilder::Int32(Int32Builder::with_capacity(capacity)),
            FieldType::Integer64 => ColumnBuilder::Int64(Int64Builder::with_capacity(capacity)),
            FieldType::Real => ColumnBuilder::Float64(Float64Builder::with_capacity(capacity)),
            FieldType::String => ColumnBuilder::Utf8(StringBuilder::new()),
            FieldType::Binary => ColumnBuilder::Binary(BinaryBuilder::new()),
            FieldType::Boolean => ColumnBuilder::Boolean(BooleanBuilder::with_capacity(capacity)),
            FieldType::Date => ColumnBuilder::Date32(Date32Builder::with_capacity(capacity)),
            FieldType::DateTime => ColumnBuilder::Timestamp(
                TimestampMillisecondBuilder::with_capacity(capacity).with_timezone("UTC"),
            ),
        }
    }

    fn append(&mut self, value: &FieldValue) -> GpkgResult<()> {
        match (self, value) {
            (ColumnBuilder::Int32(b), FieldValue::Null) => b.append_null(),
            (ColumnBuilder::Int32(b), FieldValue::Integer(v)) => b.append_value(*v),
            (ColumnBuilder::Int64(b), FieldValue::Null) => b.append_null(),
            (ColumnBuilder::Int64(b), v) => b.append_option(v.as_i64()),
            (ColumnBuilder::Float64(b), FieldValue::Null) => b.append_null(),
            (ColumnBuilder::Float64(b), v) => b.append_option(v.as_f64()),
            (ColumnBuilder::Utf8(b), FieldValue::Null) => b.append_null(),
            (ColumnBuilder::Utf8(b), FieldValue::String(v)) => b.append_value(v),
            (ColumnBuilder::Binary(b), FieldValue::Null) => b.append_null(),
            (ColumnBuilder::Binary(b), FieldValue::Binary(v)) => b.append_value(v),
            (ColumnBuilder::Boolean(b), FieldValue::Null) => b.append_null(),
            (ColumnBuilder::Boolean(b), FieldValue::Boolean(v)) => b.append_value(*v),
            (ColumnBuilder::Date32(b), FieldValue::Null) => b.append_null(),
            (ColumnBuilder::Date32(b), FieldValue::Date(v)) => b.append_value(days_since_epoch(v)),
            (ColumnBuilder::Timestamp(b), FieldValue::Null) => b.append_null(),
            (ColumnBuilder::Timestamp(b), FieldValue::DateTime(v)) => {
                b.append_value(v.timestamp_millis())
            }
            (_, other) => {
                return Err(GpkgError::new(
                    &format!("Value {} does not match its column type", other),
                    ErrorKind::InternalError,
                ))
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            ColumnBuilder::Int32(b) => Arc::new(b.finish()),
            ColumnBuilder::Int64(b) => Arc::new(b.finish()),
            ColumnBuilder::Float64(b) => Arc::new(b.finish()),
            ColumnBuilder::Utf8(b) => Arc::new(b.finish()),
            ColumnBuilder::Binary(b) => Arc::new(b.finish()),
            ColumnBuilder::Boolean(b) => Arc::new(b.finish()),
            ColumnBuilder::Date32(b) => Arc::new(b.finish()),
            ColumnBuilder::Timestamp(b) => Arc::new(b.finish()),
        }
    }
}

fn days_since_epoch(date: &NaiveDate) -> i32 {
    date.signed_duration_since(DateTime::<Utc>::UNIX_EPOCH.date_naive())
        .num_days() as i32
}

/// Accumulates decoded rows into one [`RecordBatch`].
pub(crate) struct ColumnarBatchBuilder {
    schema: SchemaRef,
    fids: Int64Builder,
    geometry: Option<BinaryBuilder>,
    columns: Vec<ColumnBuilder>,
    rows: usize,
    bytes: usize,
}

impl ColumnarBatchBuilder {
    pub(crate) fn new(schema: SchemaRef, defn: &FeatureDefn, capacity: usize) -> ColumnarBatchBuilder {
        let capacity = capacity.min(64 * 1024);
        ColumnarBatchBuilder {
            schema,
            fids: Int64Builder::with_capacity(capacity),
            geometry: defn.geometry_column().map(|_| BinaryBuilder::new()),
            columns: defn
                .fields()
                .iter()
                .map(|f| ColumnBuilder::for_type(f.field_type(), capacity))
                .collect(),
            rows: 0,
            bytes: 0,
        }
    }

    pub(crate) fn append(&mut self, raw: &RawFeature) -> GpkgResult<()> {
        if let Some(builder) = &mut self.geometry {
            match &raw.geometry {
                Some(blob) => {
                    let blob = GpkgBlob::parse(blob).map_err(|e| {
                        GpkgError::from(e).with_kind(
                            &format!("Cannot decode geometry of feature {}", raw.fid),
                            ErrorKind::ReadError,
                        )
                    })?;
                    builder.append_value(blob.wkb());
                }
                None => builder.append_null(),
            }
        }
        for (column, value) in self.columns.iter_mut().zip(&raw.values) {
            column.append(value)?;
        }
        self.fids.append_value(raw.fid);
        self.rows += 1;
        self.bytes += raw.approx_size();
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.rows
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub(crate) fn approx_bytes(&self) -> usize {
        self.bytes
    }

    /// Builds the batch and resets the builder for the next one.
    pub(crate) fn finish(&mut self) -> GpkgResult<RecordBatch> {
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(self.columns.len() + 2);
        arrays.push(Arc::new(self.fids.finish()));
        if let Some(builder) = &mut self.geometry {
            arrays.push(Arc::new(builder.finish()));
        }
        arrays.extend(self.columns.iter_mut().map(ColumnBuilder::finish));
        self.rows = 0;
        self.bytes = 0;
        Ok(RecordBatch::try_new(self.schema.clone(), arrays)?)
    }
}
