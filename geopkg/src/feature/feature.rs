use super::field::FeatureDefn;
use super::value::FieldValue;
use crate::errors::{ErrorKind, GpkgError, GpkgResult};
use crate::geometry::Geometry;

/// One record of a feature table.
///
/// A feature created with [`Feature::new`] has no fid yet; it receives one
/// when it is inserted through [`crate::TableLayer::create_feature`].
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    fid: Option<i64>,
    geometry: Option<Geometry>,
    values: Vec<FieldValue>,
}

impl Feature {
    /// Creates a feature with every field set to null.
    pub fn new(defn: &FeatureDefn) -> Feature {
        Feature {
            fid: None,
            geometry: None,
            values: vec![FieldValue::Null; defn.field_count()],
        }
    }

    pub(crate) fn from_parts(
        fid: Option<i64>,
        geometry: Option<Geometry>,
        values: Vec<FieldValue>,
    ) -> Feature {
        Feature {
            fid,
            geometry,
            values,
        }
    }

    pub fn fid(&self) -> Option<i64> {
        self.fid
    }

    pub fn set_fid(&mut self, fid: Option<i64>) {
        self.fid = fid;
    }

    pub fn geometry(&self) -> Option<&Geometry> {
        self.geometry.as_ref()
    }

    pub fn set_geometry(&mut self, geometry: Option<Geometry>) {
        self.geometry = geometry;
    }

    pub fn with_geometry(mut self, geometry: Geometry) -> Feature {
        self.geometry = Some(geometry);
        self
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    pub fn field(&self, index: usize) -> Option<&FieldValue> {
        self.values.get(index)
    }

    /// Sets the field at `index`.
    pub fn set_field<V: Into<FieldValue>>(&mut self, index: usize, value: V) -> GpkgResult<()> {
        let slot = self.values.get_mut(index).ok_or_else(|| {
            GpkgError::new(
                &format!("Field index {} is out of range", index),
                ErrorKind::ValidationError,
            )
        })?;
        *slot = value.into();
        Ok(())
    }

    /// Sets the field called `name`, resolved against `defn`.
    pub fn set_field_by_name<V: Into<FieldValue>>(
        &mut self,
        defn: &FeatureDefn,
        name: &str,
        value: V,
    ) -> GpkgResult<()> {
        let index = defn.field_index(name).ok_or_else(|| {
            GpkgError::new(
                &format!("No field named '{}' in {}", name, defn.table_name()),
                ErrorKind::NotFound,
            )
        })?;
        self.set_field(index, value)
    }

    /// Checks the value count and the value types against `defn`.
    pub(crate) fn validate(&self, defn: &FeatureDefn) -> GpkgResult<()> {
        if self.values.len() != defn.field_count() {
            return Err(GpkgError::new(
                &format!(
                    "Feature has {} values but {} has {} fields",
                    self.values.len(),
                    defn.table_name(),
                    defn.field_count()
                ),
                ErrorKind::ValidationError,
            ));
        }
        for (value, field) in self.values.iter().zip(defn.fields()) {
            if value.is_null() && !field.is_nullable() {
                return Err(GpkgError::new(
                    &format!("Field '{}' cannot be null", field.name()),
                    ErrorKind::ValidationError,
                ));
            }
            if !value.matches(field.field_type()) {
                return Err(GpkgError::new(
                    &format!(
                        "Value {} does not match field '{}' of type {}",
                        value,
                        field.name(),
                        field.field_type()
                    ),
                    ErrorKind::ValidationError,
                ));
            }
        }
        if self.geometry.is_some() && defn.geometry_column().is_none() {
            return Err(GpkgError::new(
                &format!("{} has no geometry column", defn.table_name()),
                ErrorKind::ValidationError,
            ));
        }
        Ok(())
    }
}
