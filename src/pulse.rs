use crate::key::OmKey;
use std::collections::BTreeMap;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Photo-electron arriving at a PMT cathode.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct McPulse {
    pub time: f64,
    /// Charge in photo-electrons.
    pub charge: f64,
}

impl McPulse {
    pub const fn new(time: f64, charge: f64) -> Self {
        Self { time, charge }
    }
}

pub type McPulseMap = BTreeMap<OmKey, Vec<McPulse>>;

/// Origin of the data that constrained a reconstructed pulse.
///
/// # Examples
///
/// ```
/// use trigsim::pulse::PulseFlags;
///
/// let flags = PulseFlags::ATWD | PulseFlags::LC;
/// assert!(flags.contains(PulseFlags::LC));
/// assert!(!flags.contains(PulseFlags::FADC));
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PulseFlags(u8);

impl PulseFlags {
    pub const LC: Self = Self(1);
    pub const ATWD: Self = Self(2);
    pub const FADC: Self = Self(4);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }
    /// Returns `true` if all flags in `other` are set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PulseFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for PulseFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for PulseFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// Pulse unfolded from digitized waveforms.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RecoPulse {
    pub time: f64,
    pub charge: f32,
    pub width: f32,
    pub flags: PulseFlags,
}

pub type RecoPulseMap = BTreeMap<OmKey, Vec<RecoPulse>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_algebra() {
        let mut flags = PulseFlags::empty();
        assert!(!flags.contains(PulseFlags::ATWD));
        flags |= PulseFlags::FADC;
        flags |= PulseFlags::LC;
        assert!(flags.contains(PulseFlags::FADC | PulseFlags::LC));
        assert_eq!(flags & PulseFlags::ATWD, PulseFlags::empty());
        assert_eq!(flags.bits(), 5);
    }
}
