use std::fmt;

/// Identifies an optical module by its string and its position along it.
///
/// Keys order by string first, then by position.
///
/// # Examples
///
/// ```
/// use trigsim::key::OmKey;
///
/// let a = OmKey::new(21, 30);
/// let b = OmKey::new(21, 31);
/// assert!(a < b);
/// assert_eq!(a.to_string(), "OMKey(21,30)");
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OmKey {
    pub string: i32,
    pub om: u32,
}

impl OmKey {
    pub const fn new(string: i32, om: u32) -> Self {
        Self { string, om }
    }
    /// Surface tank modules occupy positions 61 to 64 of their station.
    pub const fn is_ice_top(&self) -> bool {
        self.string > 0 && self.om >= 61 && self.om <= 64
    }

    pub const fn is_in_ice(&self) -> bool {
        self.string > 0 && self.om >= 1 && self.om <= 60
    }
}

impl fmt::Display for OmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OMKey({},{})", self.string, self.om)
    }
}

/// Cartesian position in detector coordinates (m).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
    /// Euclidean distance to another position.
    pub fn distance(&self, other: &Position) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2) + (self.z - other.z).powi(2))
            .sqrt()
    }
    /// Distance projected on the horizontal plane.
    pub fn horizontal_distance(&self, other: &Position) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}
