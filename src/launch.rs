use crate::key::OmKey;
use std::collections::BTreeMap;
use std::ops::{BitOr, BitOrAssign};

/// What caused a module to read out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TriggerType {
    TestPattern,
    CpuRequested,
    #[default]
    SpeDiscriminator,
    Flasher,
    OnboardLed,
}

/// Conditions that were met when a module launched.
///
/// # Examples
///
/// ```
/// use trigsim::launch::TriggerMode;
///
/// let mode = TriggerMode::SPE_DISCRIMINATOR | TriggerMode::LC_UPPER;
/// assert!(mode.contains(TriggerMode::LC_UPPER));
/// assert!(!mode.contains(TriggerMode::LC_LOWER));
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TriggerMode(u8);

impl TriggerMode {
    pub const MIN_BIAS: Self = Self(1);
    pub const LC_UPPER: Self = Self(2);
    pub const LC_LOWER: Self = Self(4);
    pub const SPE_DISCRIMINATOR: Self = Self(8);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TriggerMode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for TriggerMode {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Atwd {
    #[default]
    A,
    B,
}

impl Atwd {
    pub(crate) fn index(self) -> usize {
        match self {
            Atwd::A => 0,
            Atwd::B => 1,
        }
    }
}

/// A single readout of a module.
///
/// Raw digitizer samples are in counts. Channels that were not digitized are
/// empty.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DomLaunch {
    pub start_time: f64,
    pub trigger_type: TriggerType,
    pub trigger_mode: TriggerMode,
    pub lc_bit: bool,
    pub which_atwd: Atwd,
    pub raw_atwd: [Vec<u16>; 3],
    pub raw_fadc: Vec<u16>,
    /// FADC samples around the peak of the first bins, kept for soft local
    /// coincidence readouts.
    pub raw_charge_stamp: Vec<u16>,
    /// FADC bin of the first entry of `raw_charge_stamp`.
    pub charge_stamp_bin: usize,
}

impl DomLaunch {
    pub fn new(start_time: f64) -> Self {
        Self {
            start_time,
            ..Self::default()
        }
    }
}

pub type LaunchMap = BTreeMap<OmKey, Vec<DomLaunch>>;
