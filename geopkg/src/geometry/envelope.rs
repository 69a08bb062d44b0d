use std::fmt::{Display, Formatter};

/// A 2D rectangle given by its minimum and maximum corners.
///
/// An envelope that has not yet seen any coordinate is *empty*; it is
/// represented with inverted infinite bounds so that [`Envelope::merge`]
/// works without special-casing the first coordinate.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Envelope {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Default for Envelope {
    fn default() -> Self {
        Envelope::empty()
    }
}

impl Display for Envelope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            write!(f, "Envelope(EMPTY)")
        } else {
            write!(
                f,
                "Envelope({}, {}, {}, {})",
                self.min_x, self.min_y, self.max_x, self.max_y
            )
        }
    }
}

impl Envelope {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Envelope {
        Envelope {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// An envelope containing nothing.
    pub fn empty() -> Envelope {
        Envelope {
            min_x: f64::INFINITY,
            min_y: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_y: f64::NEG_INFINITY,
        }
    }

    /// Envelope of a single coordinate.
    pub fn of_point(x: f64, y: f64) -> Envelope {
        Envelope::new(x, y, x, y)
    }

    pub fn is_empty(&self) -> bool {
        !(self.min_x <= self.max_x && self.min_y <= self.max_y)
    }

    /// Grows the envelope to include `(x, y)`. NaN ordinates are ignored.
    pub fn expand_to_include(&mut self, x: f64, y: f64) {
        if x.is_nan() || y.is_nan() {
            return;
        }
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
    }

    /// Grows the envelope to include `other`.
    pub fn merge(&mut self, other: &Envelope) {
        if other.is_empty() {
            return;
        }
        self.min_x = self.min_x.min(other.min_x);
        self.min_y = self.min_y.min(other.min_y);
        self.max_x = self.max_x.max(other.max_x);
        self.max_y = self.max_y.max(other.max_y);
    }

    pub fn union(&self, other: &Envelope) -> Envelope {
        let mut merged = *self;
        merged.merge(other);
        merged
    }

    /// Inclusive intersection test.
    pub fn intersects(&self, other: &Envelope) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    /// Inclusive containment test.
    pub fn contains(&self, other: &Envelope) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && other.min_x >= self.min_x
            && other.max_x <= self.max_x
            && other.min_y >= self.min_y
            && other.max_y <= self.max_y
    }

    pub fn width(&self) -> f64 {
        if self.is_empty() {
            0.0
        } else {
            self.max_x - self.min_x
        }
    }

    pub fn height(&self) -> f64 {
        if self.is_empty() {
            0.0
        } else {
            self.max_y - self.min_y
        }
    }
}
