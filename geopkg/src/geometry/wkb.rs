use super::envelope::Envelope;
use super::geometry::{Coord, Geometry};
use super::{GeometryError, GeometryResult};

const Z_FLAG_BIT: u32 = 0x8000_0000;
const M_FLAG_BIT: u32 = 0x4000_0000;
const SRID_FLAG_BIT: u32 = 0x2000_0000;
const FLAG_MASK: u32 = Z_FLAG_BIT | M_FLAG_BIT | SRID_FLAG_BIT;

// Guards against hostile nesting of collections
const MAX_NESTING: usize = 32;

/// Base geometry type codes shared by ISO WKB and EWKB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WkbGeometryType {
    /// Any geometry type; only valid as a column type, never in WKB data.
    Geometry = 0,
    Point = 1,
    LineString = 2,
    Polygon = 3,
    MultiPoint = 4,
    MultiLineString = 5,
    MultiPolygon = 6,
    GeometryCollection = 7,
}

impl WkbGeometryType {
    pub fn try_from_code(code: u32) -> GeometryResult<WkbGeometryType> {
        match code {
            1 => Ok(WkbGeometryType::Point),
            2 => Ok(WkbGeometryType::LineString),
            3 => Ok(WkbGeometryType::Polygon),
            4 => Ok(WkbGeometryType::MultiPoint),
            5 => Ok(WkbGeometryType::MultiLineString),
            6 => Ok(WkbGeometryType::MultiPolygon),
            7 => Ok(WkbGeometryType::GeometryCollection),
            other => Err(GeometryError::UnsupportedType(other)),
        }
    }

    /// Parses a `gpkg_geometry_columns.geometry_type_name` value.
    pub fn from_name(name: &str) -> Option<WkbGeometryType> {
        let all = [
            WkbGeometryType::Geometry,
            WkbGeometryType::Point,
            WkbGeometryType::LineString,
            WkbGeometryType::Polygon,
            WkbGeometryType::MultiPoint,
            WkbGeometryType::MultiLineString,
            WkbGeometryType::MultiPolygon,
            WkbGeometryType::GeometryCollection,
        ];
        all.into_iter().find(|t| t.name().eq_ignore_ascii_case(name.trim()))
    }

    /// Upper-case name as used in `gpkg_geometry_columns`.
    pub fn name(&self) -> &'static str {
        match self {
            WkbGeometryType::Geometry => "GEOMETRY",
            WkbGeometryType::Point => "POINT",
            WkbGeometryType::LineString => "LINESTRING",
            WkbGeometryType::Polygon => "POLYGON",
            WkbGeometryType::MultiPoint => "MULTIPOINT",
            WkbGeometryType::MultiLineString => "MULTILINESTRING",
            WkbGeometryType::MultiPolygon => "MULTIPOLYGON",
            WkbGeometryType::GeometryCollection => "GEOMETRYCOLLECTION",
        }
    }
}

/// Decodes a WKB buffer into a [`Geometry`], dropping Z and M ordinates.
pub(crate) fn read_geometry(buf: &[u8]) -> GeometryResult<Geometry> {
    let mut reader = WkbBuffer::new(buf);
    reader.read_geometry(0)
}

/// Computes the XY envelope of a WKB buffer without materializing it.
///
/// Returns an empty envelope for empty geometries.
pub fn wkb_envelope(buf: &[u8]) -> GeometryResult<Envelope> {
    let mut reader = WkbBuffer::new(buf);
    let mut envelope = Envelope::empty();
    reader.scan_geometry(&mut envelope, 0)?;
    Ok(envelope)
}

struct WkbHeader {
    geometry_type: WkbGeometryType,
    // total number of ordinates per coordinate (2 to 4)
    dimensions: usize,
}

struct WkbBuffer<'a> {
    buf: &'a [u8],
    offset: usize,
    big_endian: bool,
}

impl<'a> WkbBuffer<'a> {
    fn new(buf: &'a [u8]) -> Self {
        WkbBuffer {
            buf,
            offset: 0,
            big_endian: false,
        }
    }

    fn take<const N: usize>(&mut self) -> GeometryResult<[u8; N]> {
        let end = self.offset + N;
        if end > self.buf.len() {
            return Err(GeometryError::InvalidWkb(format!(
                "buffer too small. At offset: {}. Need {} bytes.",
                self.offset, N
            )));
        }
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&self.buf[self.offset..end]);
        self.offset = end;
        Ok(bytes)
    }

    fn read_endian(&mut self) -> GeometryResult<()> {
        let [order] = self.take::<1>()?;
        self.big_endian = match order {
            0 => true,
            1 => false,
            other => {
                return Err(GeometryError::InvalidWkb(format!(
                    "unexpected byte order: {}",
                    other
                )))
            }
        };
        Ok(())
    }

    fn read_u32(&mut self) -> GeometryResult<u32> {
        let bytes = self.take::<4>()?;
        Ok(if self.big_endian {
            u32::from_be_bytes(bytes)
        } else {
            u32::from_le_bytes(bytes)
        })
    }

    fn read_f64(&mut self) -> GeometryResult<f64> {
        let bytes = self.take::<8>()?;
        Ok(if self.big_endian {
            f64::from_be_bytes(bytes)
        } else {
            f64::from_le_bytes(bytes)
        })
    }

    fn read_count(&mut self, min_item_size: usize) -> GeometryResult<usize> {
        let count = self.read_u32()? as usize;
        // reject counts the remaining bytes cannot possibly hold
        let remaining = self.buf.len() - self.offset;
        if count.saturating_mul(min_item_size) > remaining {
            return Err(GeometryError::InvalidWkb(format!(
                "count {} exceeds remaining {} bytes at offset {}",
                count, remaining, self.offset
            )));
        }
        Ok(count)
    }

    fn read_header(&mut self) -> GeometryResult<WkbHeader> {
        self.read_endian()?;
        let code = self.read_u32()?;

        let mut has_z = code & Z_FLAG_BIT != 0;
        let mut has_m = code & M_FLAG_BIT != 0;
        if code & SRID_FLAG_BIT != 0 {
            self.read_u32()?;
        }

        let iso = code & !FLAG_MASK;
        match iso / 1000 {
            0 => {}
            1 => has_z = true,
            2 => has_m = true,
            3 => {
                has_z = true;
                has_m = true;
            }
            _ => return Err(GeometryError::UnsupportedType(code)),
        }

        Ok(WkbHeader {
            geometry_type: WkbGeometryType::try_from_code(iso % 1000)?,
            dimensions: 2 + has_z as usize + has_m as usize,
        })
    }

    fn read_coord(&mut self, dimensions: usize) -> GeometryResult<Coord> {
        let x = self.read_f64()?;
        let y = self.read_f64()?;
        for _ in 2..dimensions {
            self.read_f64()?;
        }
        Ok(Coord::new(x, y))
    }

    fn read_coords(&mut self, dimensions: usize) -> GeometryResult<Vec<Coord>> {
        let count = self.read_count(dimensions * 8)?;
        let mut coords = Vec::with_capacity(count);
        for _ in 0..count {
            coords.push(self.read_coord(dimensions)?);
        }
        Ok(coords)
    }

    fn read_rings(&mut self, dimensions: usize) -> GeometryResult<Vec<Vec<Coord>>> {
        let count = self.read_count(4)?;
        let mut rings = Vec::with_capacity(count);
        for _ in 0..count {
            rings.push(self.read_coords(dimensions)?);
        }
        Ok(rings)
    }

    fn check_depth(depth: usize) -> GeometryResult<()> {
        if depth > MAX_NESTING {
            return Err(GeometryError::InvalidWkb(format!(
                "nesting deeper than {} levels",
                MAX_NESTING
            )));
        }
        Ok(())
    }

    fn read_geometry(&mut self, depth: usize) -> GeometryResult<Geometry> {
        Self::check_depth(depth)?;
        let header = self.read_header()?;
        let dims = header.dimensions;

        let geometry = match header.geometry_type {
            WkbGeometryType::Point => {
                let c = self.read_coord(dims)?;
                if c.x.is_nan() && c.y.is_nan() {
                    Geometry::Point(None)
                } else {
                    Geometry::Point(Some(c))
                }
            }
            WkbGeometryType::LineString => Geometry::LineString(self.read_coords(dims)?),
            WkbGeometryType::Polygon => Geometry::Polygon(self.read_rings(dims)?),
            WkbGeometryType::MultiPoint => {
                let parts = self.read_parts(depth)?;
                let mut coords = Vec::with_capacity(parts.len());
                for part in parts {
                    match part {
                        Geometry::Point(Some(c)) => coords.push(c),
                        Geometry::Point(None) => {}
                        other => return Err(unexpected_member("MULTIPOINT", &other)),
                    }
                }
                Geometry::MultiPoint(coords)
            }
            WkbGeometryType::MultiLineString => {
                let parts = self.read_parts(depth)?;
                let mut lines = Vec::with_capacity(parts.len());
                for part in parts {
                    match part {
                        Geometry::LineString(line) => lines.push(line),
                        other => return Err(unexpected_member("MULTILINESTRING", &other)),
                    }
                }
                Geometry::MultiLineString(lines)
            }
            WkbGeometryType::MultiPolygon => {
                let parts = self.read_parts(depth)?;
                let mut polygons = Vec::with_capacity(parts.len());
                for part in parts {
                    match part {
                        Geometry::Polygon(rings) => polygons.push(rings),
                        other => return Err(unexpected_member("MULTIPOLYGON", &other)),
                    }
                }
                Geometry::MultiPolygon(polygons)
            }
            WkbGeometryType::GeometryCollection => {
                Geometry::GeometryCollection(self.read_parts(depth)?)
            }
            WkbGeometryType::Geometry => return Err(GeometryError::UnsupportedType(0)),
        };
        Ok(geometry)
    }

    fn read_parts(&mut self, depth: usize) -> GeometryResult<Vec<Geometry>> {
        // smallest member: byte order + type + one XY point
        let count = self.read_count(1 + 4 + 16)?;
        let mut parts = Vec::with_capacity(count);
        for _ in 0..count {
            parts.push(self.read_geometry(depth + 1)?);
        }
        Ok(parts)
    }

    fn scan_coords(&mut self, dimensions: usize, envelope: &mut Envelope) -> GeometryResult<()> {
        let count = self.read_count(dimensions * 8)?;
        for _ in 0..count {
            let c = self.read_coord(dimensions)?;
            envelope.expand_to_include(c.x, c.y);
        }
        Ok(())
    }

    fn scan_geometry(&mut self, envelope: &mut Envelope, depth: usize) -> GeometryResult<()> {
        Self::check_depth(depth)?;
        let header = self.read_header()?;
        let dims = header.dimensions;

        match header.geometry_type {
            WkbGeometryType::Point => {
                let c = self.read_coord(dims)?;
                envelope.expand_to_include(c.x, c.y);
            }
            WkbGeometryType::LineString => self.scan_coords(dims, envelope)?,
            WkbGeometryType::Polygon => {
                let rings = self.read_count(4)?;
                for _ in 0..rings {
                    self.scan_coords(dims, envelope)?;
                }
            }
            WkbGeometryType::MultiPoint
            | WkbGeometryType::MultiLineString
            | WkbGeometryType::MultiPolygon
            | WkbGeometryType::GeometryCollection => {
                let count = self.read_count(1 + 4 + 16)?;
                for _ in 0..count {
                    self.scan_geometry(envelope, depth + 1)?;
                }
            }
            WkbGeometryType::Geometry => return Err(GeometryError::UnsupportedType(0)),
        }
        Ok(())
    }
}

fn unexpected_member(container: &str, member: &Geometry) -> GeometryError {
    GeometryError::InvalidWkb(format!(
        "{} cannot contain a {}",
        container,
        member.geometry_type().name()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point_zm_iso(x: f64, y: f64, z: f64, m: f64) -> Vec<u8> {
        let mut buf = vec![1u8];
        buf.extend_from_slice(&3001u32.to_le_bytes());
        for v in [x, y, z, m] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf
    }

    fn line_z_ewkb_big_endian(coords: &[(f64, f64, f64)], srid: u32) -> Vec<u8> {
        let mut buf = vec![0u8];
        buf.extend_from_slice(&(2u32 | Z_FLAG_BIT | SRID_FLAG_BIT).to_be_bytes());
        buf.extend_from_slice(&srid.to_be_bytes());
        buf.extend_from_slice(&(coords.len() as u32).to_be_bytes());
        for (x, y, z) in coords {
            buf.extend_from_slice(&x.to_be_bytes());
            buf.extend_from_slice(&y.to_be_bytes());
            buf.extend_from_slice(&z.to_be_bytes());
        }
        buf
    }

    #[test]
    fn reads_written_geometries() {
        let geometries = vec![
            Geometry::point(1.5, -2.5),
            Geometry::Point(None),
            Geometry::line_string(&[(0.0, 0.0), (3.0, 4.0)]),
            Geometry::rectangle(&Envelope::new(-1.0, -1.0, 1.0, 1.0)),
            Geometry::MultiPoint(vec![Coord::new(1.0, 2.0), Coord::new(3.0, 4.0)]),
            Geometry::MultiLineString(vec![vec![Coord::new(0.0, 0.0), Coord::new(1.0, 1.0)]]),
            Geometry::GeometryCollection(vec![
                Geometry::point(9.0, 9.0),
                Geometry::LineString(vec![]),
            ]),
        ];
        for g in geometries {
            assert_eq!(read_geometry(&g.to_wkb()).unwrap(), g);
        }
    }

    #[test]
    fn iso_zm_point_keeps_xy() {
        let g = read_geometry(&point_zm_iso(1.0, 2.0, 3.0, 4.0)).unwrap();
        assert_eq!(g, Geometry::point(1.0, 2.0));
    }

    #[test]
    fn ewkb_big_endian_with_srid() {
        let buf = line_z_ewkb_big_endian(&[(0.0, 5.0, 100.0), (-3.0, 7.0, 200.0)], 4326);
        let envelope = wkb_envelope(&buf).unwrap();
        assert_eq!(envelope, Envelope::new(-3.0, 5.0, 0.0, 7.0));
        let g = read_geometry(&buf).unwrap();
        assert_eq!(g, Geometry::line_string(&[(0.0, 5.0), (-3.0, 7.0)]));
    }

    #[test]
    fn envelope_of_empty_point_is_empty() {
        let envelope = wkb_envelope(&Geometry::Point(None).to_wkb()).unwrap();
        assert!(envelope.is_empty());
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let wkb = Geometry::point(1.0, 2.0).to_wkb();
        let err = read_geometry(&wkb[..10]).unwrap_err();
        assert!(matches!(err, GeometryError::InvalidWkb(_)));
    }

    #[test]
    fn bogus_count_is_rejected() {
        let mut buf = vec![1u8];
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(wkb_envelope(&buf).is_err());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut buf = vec![1u8];
        buf.extend_from_slice(&17u32.to_le_bytes());
        assert_eq!(
            read_geometry(&buf).unwrap_err(),
            GeometryError::UnsupportedType(17)
        );
    }

    #[test]
    fn type_names_parse() {
        assert_eq!(WkbGeometryType::from_name("geometry"), Some(WkbGeometryType::Geometry));
        assert_eq!(WkbGeometryType::from_name("MULTIPOLYGON"), Some(WkbGeometryType::MultiPolygon));
        assert_eq!(WkbGeometryType::from_name("CURVE"), None);
        assert!(WkbGeometryType::try_from_code(0).is_err());
    }

    #[test]
    fn invalid_byte_order_is_rejected() {
        let buf = vec![7u8, 1, 0, 0, 0];
        assert!(matches!(
            read_geometry(&buf).unwrap_err(),
            GeometryError::InvalidWkb(_)
        ));
    }
}
