use super::envelope::Envelope;
use super::geometry::Geometry;
use super::wkb::{read_geometry, wkb_envelope};
use super::{GeometryError, GeometryResult};

const MAGIC: [u8; 2] = *b"GP";
const VERSION: u8 = 0;

const FLAG_LITTLE_ENDIAN: u8 = 0b0000_0001;
const FLAG_ENVELOPE_SHIFT: u8 = 1;
const FLAG_ENVELOPE_MASK: u8 = 0b0000_1110;
const FLAG_EMPTY: u8 = 0b0001_0000;
const FLAG_EXTENDED: u8 = 0b0010_0000;

/// Parsed fixed part of a GeoPackage geometry blob.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpkgBlobHeader {
    pub srs_id: i32,
    /// XY part of the stored envelope, when the blob carries one.
    pub envelope: Option<Envelope>,
    pub empty: bool,
    /// Offset of the WKB payload.
    pub header_len: usize,
}

/// A borrowed GeoPackage geometry blob: `GP` header followed by WKB.
#[derive(Debug, Clone, Copy)]
pub struct GpkgBlob<'a> {
    header: GpkgBlobHeader,
    wkb: &'a [u8],
}

impl<'a> GpkgBlob<'a> {
    /// Validates the header and splits off the WKB payload.
    pub fn parse(buf: &'a [u8]) -> GeometryResult<GpkgBlob<'a>> {
        if buf.len() < 8 {
            return Err(GeometryError::InvalidBlob(format!(
                "{} bytes is shorter than the fixed header",
                buf.len()
            )));
        }
        if buf[0..2] != MAGIC {
            return Err(GeometryError::InvalidBlob("missing GP magic".to_string()));
        }
        if buf[2] != VERSION {
            return Err(GeometryError::InvalidBlob(format!(
                "unsupported version {}",
                buf[2]
            )));
        }

        let flags = buf[3];
        if flags & FLAG_EXTENDED != 0 {
            return Err(GeometryError::InvalidBlob(
                "extended geometry types are not supported".to_string(),
            ));
        }
        let little_endian = flags & FLAG_LITTLE_ENDIAN != 0;
        let read_f64 = |offset: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[offset..offset + 8]);
            if little_endian {
                f64::from_le_bytes(bytes)
            } else {
                f64::from_be_bytes(bytes)
            }
        };

        let srs_bytes = [buf[4], buf[5], buf[6], buf[7]];
        let srs_id = if little_endian {
            i32::from_le_bytes(srs_bytes)
        } else {
            i32::from_be_bytes(srs_bytes)
        };

        let envelope_len = match (flags & FLAG_ENVELOPE_MASK) >> FLAG_ENVELOPE_SHIFT {
            0 => 0,
            1 => 32,
            2 | 3 => 48,
            4 => 64,
            other => {
                return Err(GeometryError::InvalidBlob(format!(
                    "invalid envelope indicator {}",
                    other
                )))
            }
        };
        let header_len = 8 + envelope_len;
        if buf.len() < header_len {
            return Err(GeometryError::InvalidBlob(format!(
                "envelope needs {} bytes, blob has {}",
                header_len,
                buf.len()
            )));
        }

        // stored order is minx, maxx, miny, maxy
        let envelope = (envelope_len > 0)
            .then(|| Envelope::new(read_f64(8), read_f64(24), read_f64(16), read_f64(32)));

        Ok(GpkgBlob {
            header: GpkgBlobHeader {
                srs_id,
                envelope,
                empty: flags & FLAG_EMPTY != 0,
                header_len,
            },
            wkb: &buf[header_len..],
        })
    }

    pub fn header(&self) -> &GpkgBlobHeader {
        &self.header
    }

    pub fn wkb(&self) -> &'a [u8] {
        self.wkb
    }

    pub fn is_empty(&self) -> bool {
        self.header.empty
    }

    /// XY envelope, taken from the header when present, otherwise scanned
    /// from the WKB payload.
    pub fn envelope(&self) -> GeometryResult<Envelope> {
        if self.header.empty {
            return Ok(Envelope::empty());
        }
        match self.header.envelope {
            Some(envelope) => Ok(envelope),
            None => wkb_envelope(self.wkb),
        }
    }

    pub fn to_geometry(&self) -> GeometryResult<Geometry> {
        read_geometry(self.wkb)
    }

    /// Encodes `geometry` as a little-endian blob.
    ///
    /// Points are written without an envelope; empty geometries set the empty
    /// flag and carry no envelope.
    pub fn encode(geometry: &Geometry, srs_id: i32) -> Vec<u8> {
        let wkb = geometry.to_wkb();
        let empty = geometry.is_empty();
        let with_envelope = !empty && !matches!(geometry, Geometry::Point(_));

        let mut flags = FLAG_LITTLE_ENDIAN;
        if empty {
            flags |= FLAG_EMPTY;
        }
        if with_envelope {
            flags |= 1 << FLAG_ENVELOPE_SHIFT;
        }

        let mut buf = Vec::with_capacity(8 + if with_envelope { 32 } else { 0 } + wkb.len());
        buf.extend_from_slice(&MAGIC);
        buf.push(VERSION);
        buf.push(flags);
        buf.extend_from_slice(&srs_id.to_le_bytes());
        if with_envelope {
            let envelope = geometry.envelope();
            for v in [envelope.min_x, envelope.max_x, envelope.min_y, envelope.max_y] {
                buf.extend_from_slice(&v.to_le_bytes());
            }
        }
        buf.extend_from_slice(&wkb);
        buf
    }
}
