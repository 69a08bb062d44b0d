use crate::errors::GpkgResult;
use crate::geometry::{Envelope, Geometry, GpkgBlob};

/// Bounding rectangle of one feature as stored in the R-tree.
///
/// Bounds are single precision, rounded outward so that the rectangle always
/// contains the feature's true extent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexEntry {
    pub id: i64,
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
}

impl IndexEntry {
    /// True when the stored rectangle contains `envelope`.
    pub fn contains(&self, envelope: &Envelope) -> bool {
        self.min_x as f64 <= envelope.min_x
            && self.min_y as f64 <= envelope.min_y
            && self.max_x as f64 >= envelope.max_x
            && self.max_y as f64 >= envelope.max_y
    }
}

/// Derives index entries from feature geometries.
pub struct EntryTranslator;

impl EntryTranslator {
    /// Entry for `geometry`, or `None` for a null or empty geometry.
    pub fn translate(fid: i64, geometry: Option<&Geometry>) -> Option<IndexEntry> {
        let geometry = geometry?;
        if geometry.is_empty() {
            return None;
        }
        Self::from_envelope(fid, &geometry.envelope())
    }

    /// Entry for a stored geometry blob. The blob's own envelope is used
    /// when it carries one.
    pub fn translate_blob(fid: i64, blob: Option<&[u8]>) -> GpkgResult<Option<IndexEntry>> {
        let Some(bytes) = blob else {
            return Ok(None);
        };
        let blob = GpkgBlob::parse(bytes)?;
        if blob.is_empty() {
            return Ok(None);
        }
        Ok(Self::from_envelope(fid, &blob.envelope()?))
    }

    pub fn from_envelope(fid: i64, envelope: &Envelope) -> Option<IndexEntry> {
        if envelope.is_empty() {
            return None;
        }
        Some(IndexEntry {
            id: fid,
            min_x: round_down(envelope.min_x),
            min_y: round_down(envelope.min_y),
            max_x: round_up(envelope.max_x),
            max_y: round_up(envelope.max_y),
        })
    }
}

/// Largest `f32` not greater than `v`.
pub(crate) fn round_down(v: f64) -> f32 {
    let f = v as f32;
    if (f as f64) > v {
        next_down(f)
    } else {
        f
    }
}

/// Smallest `f32` not less than `v`.
pub(crate) fn round_up(v: f64) -> f32 {
    let f = v as f32;
    if (f as f64) < v {
        next_up(f)
    } else {
        f
    }
}

fn next_up(f: f32) -> f32 {
    if f.is_nan() || f == f32::INFINITY {
        return f;
    }
    if f == 0.0 {
        return f32::from_bits(1);
    }
    let bits = f.to_bits();
    if f > 0.0 {
        f32::from_bits(bits + 1)
    } else {
        f32::from_bits(bits - 1)
    }
}

fn next_down(f: f32) -> f32 {
    -next_up(-f)
}

/// A sealed, ordered group of entries with its position in the push order.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryBatch {
    seq: u64,
    entries: Vec<IndexEntry>,
}

impl EntryBatch {
    pub fn new(seq: u64, entries: Vec<IndexEntry>) -> EntryBatch {
        EntryBatch { seq, entries }
    }

    /// 0-based sequence number in push order.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Collects entries into batches of a fixed target size.
pub(crate) struct BatchAccumulator {
    target: usize,
    current: Vec<IndexEntry>,
    next_seq: u64,
}

impl BatchAccumulator {
    pub(crate) fn new(target: usize) -> BatchAccumulator {
        let target = target.max(1);
        BatchAccumulator {
            target,
            current: Vec::with_capacity(target),
            next_seq: 0,
        }
    }

    /// Adds an entry; returns the sealed batch when the target is reached.
    pub(crate) fn push(&mut self, entry: IndexEntry) -> Option<EntryBatch> {
        self.current.push(entry);
        if self.current.len() >= self.target {
            self.seal()
        } else {
            None
        }
    }

    /// Seals the partial batch, if any.
    pub(crate) fn seal(&mut self) -> Option<EntryBatch> {
        if self.current.is_empty() {
            return None;
        }
        let entries = std::mem::replace(&mut self.current, Vec::with_capacity(self.target));
        let batch = EntryBatch::new(self.next_seq, entries);
        self.next_seq += 1;
        Some(batch)
    }

    pub(crate) fn pending(&self) -> usize {
        self.current.len()
    }
}
