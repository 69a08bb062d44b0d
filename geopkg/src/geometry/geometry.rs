use super::envelope::Envelope;
use super::wkb::{self, WkbGeometryType};
use super::GeometryResult;

/// A 2D coordinate.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
}

impl Coord {
    pub fn new(x: f64, y: f64) -> Coord {
        Coord { x, y }
    }
}

impl From<(f64, f64)> for Coord {
    fn from((x, y): (f64, f64)) -> Self {
        Coord { x, y }
    }
}

/// A simple-features geometry in two dimensions.
///
/// Geometries read from WKB with Z and/or M ordinates keep only X and Y.
/// Every variant can be empty: `Point(None)`, or a variant with no parts.
#[derive(Clone, PartialEq, Debug)]
pub enum Geometry {
    Point(Option<Coord>),
    LineString(Vec<Coord>),
    Polygon(Vec<Vec<Coord>>),
    MultiPoint(Vec<Coord>),
    MultiLineString(Vec<Vec<Coord>>),
    MultiPolygon(Vec<Vec<Vec<Coord>>>),
    GeometryCollection(Vec<Geometry>),
}

impl Geometry {
    pub fn point(x: f64, y: f64) -> Geometry {
        Geometry::Point(Some(Coord::new(x, y)))
    }

    pub fn line_string(coords: &[(f64, f64)]) -> Geometry {
        Geometry::LineString(coords.iter().map(|&c| c.into()).collect())
    }

    /// Closed rectangle polygon covering `envelope`.
    pub fn rectangle(envelope: &Envelope) -> Geometry {
        Geometry::Polygon(vec![vec![
            Coord::new(envelope.min_x, envelope.min_y),
            Coord::new(envelope.max_x, envelope.min_y),
            Coord::new(envelope.max_x, envelope.max_y),
            Coord::new(envelope.min_x, envelope.max_y),
            Coord::new(envelope.min_x, envelope.min_y),
        ]])
    }

    pub fn geometry_type(&self) -> WkbGeometryType {
        match self {
            Geometry::Point(_) => WkbGeometryType::Point,
            Geometry::LineString(_) => WkbGeometryType::LineString,
            Geometry::Polygon(_) => WkbGeometryType::Polygon,
            Geometry::MultiPoint(_) => WkbGeometryType::MultiPoint,
            Geometry::MultiLineString(_) => WkbGeometryType::MultiLineString,
            Geometry::MultiPolygon(_) => WkbGeometryType::MultiPolygon,
            Geometry::GeometryCollection(_) => WkbGeometryType::GeometryCollection,
        }
    }

    /// True when the geometry has no coordinate at all.
    pub fn is_empty(&self) -> bool {
        match self {
            Geometry::Point(coord) => coord.is_none(),
            Geometry::LineString(coords) | Geometry::MultiPoint(coords) => coords.is_empty(),
            Geometry::Polygon(rings) | Geometry::MultiLineString(rings) => {
                rings.iter().all(|ring| ring.is_empty())
            }
            Geometry::MultiPolygon(polygons) => polygons
                .iter()
                .all(|rings| rings.iter().all(|ring| ring.is_empty())),
            Geometry::GeometryCollection(parts) => parts.iter().all(|g| g.is_empty()),
        }
    }

    /// Bounding rectangle; empty for an empty geometry.
    pub fn envelope(&self) -> Envelope {
        let mut envelope = Envelope::empty();
        self.visit_coords(&mut |c| envelope.expand_to_include(c.x, c.y));
        envelope
    }

    fn visit_coords(&self, f: &mut impl FnMut(&Coord)) {
        match self {
            Geometry::Point(Some(coord)) => f(coord),
            Geometry::Point(None) => {}
            Geometry::LineString(coords) | Geometry::MultiPoint(coords) => coords.iter().for_each(f),
            Geometry::Polygon(rings) | Geometry::MultiLineString(rings) => {
                rings.iter().flatten().for_each(f)
            }
            Geometry::MultiPolygon(polygons) => polygons.iter().flatten().flatten().for_each(f),
            Geometry::GeometryCollection(parts) => {
                for part in parts {
                    part.visit_coords(f);
                }
            }
        }
    }

    /// Encodes the geometry as little-endian ISO WKB (XY).
    pub fn to_wkb(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wkb_size());
        self.write_wkb(&mut buf);
        buf
    }

    /// Decodes WKB (ISO or EWKB, either byte order, any dimension).
    pub fn from_wkb(buf: &[u8]) -> GeometryResult<Geometry> {
        wkb::read_geometry(buf)
    }

    fn wkb_size(&self) -> usize {
        const HEADER: usize = 1 + 4;
        const COORD: usize = 16;
        match self {
            Geometry::Point(_) => HEADER + COORD,
            Geometry::LineString(coords) => HEADER + 4 + coords.len() * COORD,
            Geometry::Polygon(rings) => {
                HEADER + 4 + rings.iter().map(|r| 4 + r.len() * COORD).sum::<usize>()
            }
            Geometry::MultiPoint(coords) => HEADER + 4 + coords.len() * (HEADER + COORD),
            Geometry::MultiLineString(lines) => {
                HEADER + 4 + lines.iter().map(|l| HEADER + 4 + l.len() * COORD).sum::<usize>()
            }
            Geometry::MultiPolygon(polygons) => {
                HEADER
                    + 4
                    + polygons
                        .iter()
                        .map(|rings| {
                            HEADER + 4 + rings.iter().map(|r| 4 + r.len() * COORD).sum::<usize>()
                        })
                        .sum::<usize>()
            }
            Geometry::GeometryCollection(parts) => {
                HEADER + 4 + parts.iter().map(|g| g.wkb_size()).sum::<usize>()
            }
        }
    }

    fn write_wkb(&self, buf: &mut Vec<u8>) {
        buf.push(1);
        buf.extend_from_slice(&(self.geometry_type() as u32).to_le_bytes());
        match self {
            Geometry::Point(coord) => {
                // POINT EMPTY is encoded with NaN ordinates
                let c = coord.unwrap_or(Coord::new(f64::NAN, f64::NAN));
                write_coord(buf, &c);
            }
            Geometry::LineString(coords) => write_coords(buf, coords),
            Geometry::Polygon(rings) => write_rings(buf, rings),
            Geometry::MultiPoint(coords) => {
                write_u32(buf, coords.len());
                for c in coords {
                    Geometry::Point(Some(*c)).write_wkb(buf);
                }
            }
            Geometry::MultiLineString(lines) => {
                write_u32(buf, lines.len());
                for line in lines {
                    buf.push(1);
                    buf.extend_from_slice(&(WkbGeometryType::LineString as u32).to_le_bytes());
                    write_coords(buf, line);
                }
            }
            Geometry::MultiPolygon(polygons) => {
                write_u32(buf, polygons.len());
                for rings in polygons {
                    buf.push(1);
                    buf.extend_from_slice(&(WkbGeometryType::Polygon as u32).to_le_bytes());
                    write_rings(buf, rings);
                }
            }
            Geometry::GeometryCollection(parts) => {
                write_u32(buf, parts.len());
                for part in parts {
                    part.write_wkb(buf);
                }
            }
        }
    }
}

fn write_u32(buf: &mut Vec<u8>, n: usize) {
    buf.extend_from_slice(&(n as u32).to_le_bytes());
}

fn write_coord(buf: &mut Vec<u8>, c: &Coord) {
    buf.extend_from_slice(&c.x.to_le_bytes());
    buf.extend_from_slice(&c.y.to_le_bytes());
}

fn write_coords(buf: &mut Vec<u8>, coords: &[Coord]) {
    write_u32(buf, coords.len());
    for c in coords {
        write_coord(buf, c);
    }
}

fn write_rings(buf: &mut Vec<u8>, rings: &[Vec<Coord>]) {
    write_u32(buf, rings.len());
    for ring in rings {
        write_coords(buf, ring);
    }
}
