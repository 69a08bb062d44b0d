//! Geometry values and their binary encodings.
//!
//! This module provides:
//! - [`Geometry`]: a simple-features value type (XY)
//! - [`Envelope`]: a 2D bounding rectangle
//! - WKB reading, writing and envelope scanning
//! - GeoPackage binary blobs ([`GpkgBlob`]): the `GP` header followed by WKB

mod envelope;
#[allow(clippy::module_inception)]
mod geometry;
mod gpkg_blob;
mod wkb;

pub use envelope::Envelope;
pub use geometry::{Coord, Geometry};
pub use gpkg_blob::{GpkgBlob, GpkgBlobHeader};
pub use wkb::{wkb_envelope, WkbGeometryType};

use crate::errors::{ErrorKind, GpkgError};
use thiserror::Error;

/// Errors raised while decoding or encoding geometry bytes.
#[derive(Debug, Error, PartialEq)]
pub enum GeometryError {
    #[error("Invalid WKB: {0}")]
    InvalidWkb(String),

    #[error("Invalid GeoPackage geometry blob: {0}")]
    InvalidBlob(String),

    #[error("Unsupported geometry type code {0}")]
    UnsupportedType(u32),
}

impl From<GeometryError> for GpkgError {
    fn from(err: GeometryError) -> Self {
        GpkgError::new(&err.to_string(), ErrorKind::EncodingError)
    }
}

/// Result type for geometry decoding
pub type GeometryResult<T> = Result<T, GeometryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_error_converts_to_encoding_error() {
        let err: GpkgError = GeometryError::UnsupportedType(42).into();
        assert_eq!(err.kind(), &ErrorKind::EncodingError);
        assert_eq!(err.message(), "Unsupported geometry type code 42");
    }
}
