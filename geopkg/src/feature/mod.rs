//! Feature model: schemas, attribute values and features.

#[allow(clippy::module_inception)]
mod feature;
mod field;
mod value;

pub use feature::Feature;
pub use field::{FeatureDefn, FieldDefn, FieldType, GeometryColumnDefn};
pub use value::FieldValue;

pub(crate) use field::quote_ident;
