//! Geometry, calibration and status inputs read by the readout chain.
//!
//! These are plain containers: they hold only what the launcher, the waveform
//! calibration and the unfolding read, and make no attempt at being complete
//! detector descriptions.
use crate::key::{OmKey, Position};
use std::collections::BTreeMap;

/// One millivolt expressed in volts.
pub const MILLIVOLT: f64 = 1e-3;

/// Hardware flavour of an optical module, as recorded in the geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OmType {
    IceCube,
    IceTop,
    Scintillator,
    UnknownType,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OmGeo {
    pub position: Position,
    pub om_type: OmType,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Geometry {
    pub omgeo: BTreeMap<OmKey, OmGeo>,
}

impl Geometry {
    pub fn position(&self, dom: &OmKey) -> Option<Position> {
        self.omgeo.get(dom).map(|g| g.position)
    }
}

/// Single photo-electron pulse shape, normalized to unit charge (1/ns).
pub trait PulseTemplate {
    fn amplitude(&self, t: f64) -> f64;
}

/// The analytic SPE shape `c / (exp(-(t - x0) / b1) + exp((t - x0) / b2))^8`.
///
/// # Examples
///
/// ```
/// use trigsim::detector::{PulseTemplate, SpeTemplate};
///
/// let template = SpeTemplate::normalized(-4.0, 5.5, 42.0);
/// assert!(template.amplitude(5.0) > template.amplitude(-10.0));
/// assert!(template.amplitude(5.0) > template.amplitude(100.0));
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpeTemplate {
    pub c: f64,
    pub x0: f64,
    pub b1: f64,
    pub b2: f64,
}

impl SpeTemplate {
    pub const fn new(c: f64, x0: f64, b1: f64, b2: f64) -> Self {
        Self { c, x0, b1, b2 }
    }
    /// Builds a template whose integral is one.
    pub fn normalized(x0: f64, b1: f64, b2: f64) -> Self {
        let shape = Self::new(1.0, x0, b1, b2);
        // The shape falls by e^-8 per b1 before and per b2 after the peak.
        let step = 0.01;
        let from = x0 - 20.0 * b1;
        let to = x0 + 20.0 * b2;
        let n = ((to - from) / step).ceil() as usize;
        let integral: f64 = (0..n)
            .map(|i| shape.amplitude(from + (i as f64 + 0.5) * step) * step)
            .sum();

        Self::new(1.0 / integral, x0, b1, b2)
    }
}

impl PulseTemplate for SpeTemplate {
    fn amplitude(&self, t: f64) -> f64 {
        let u = t - self.x0;
        let denominator = (-u / self.b1).exp() + (u / self.b2).exp();
        self.c / denominator.powi(8)
    }
}

/// PMT toroid generation. Selects the pulse shapes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToroidType {
    Old,
    New,
}

/// Pulse shapes seen by the discriminator and each digitizer channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PulseTemplates {
    pub discriminator: SpeTemplate,
    pub atwd: [SpeTemplate; 3],
    pub fadc: SpeTemplate,
}

impl PulseTemplates {
    pub fn for_toroid(toroid: ToroidType) -> Self {
        match toroid {
            ToroidType::New => Self {
                discriminator: SpeTemplate::normalized(-2.0, 3.0, 20.0),
                atwd: [
                    SpeTemplate::normalized(-4.0, 5.5, 42.0),
                    SpeTemplate::normalized(-3.5, 5.8, 44.0),
                    SpeTemplate::normalized(-3.0, 6.2, 47.0),
                ],
                fadc: SpeTemplate::normalized(-14.0, 11.0, 72.0),
            },
            ToroidType::Old => Self {
                discriminator: SpeTemplate::normalized(-2.0, 3.2, 22.0),
                atwd: [
                    SpeTemplate::normalized(-4.5, 5.8, 48.0),
                    SpeTemplate::normalized(-4.0, 6.1, 50.0),
                    SpeTemplate::normalized(-3.5, 6.5, 53.0),
                ],
                fadc: SpeTemplate::normalized(-15.0, 12.0, 80.0),
            },
        }
    }
}

/// Per-DOM calibration constants.
///
/// Voltages are in volts, times in ns, charges in pC and the front-end
/// impedance in Ohm, so that `spe_mean * front_end_impedance` times a
/// template amplitude is a voltage in mV.
#[derive(Clone, Debug, PartialEq)]
pub struct DomCalibration {
    pub front_end_impedance: f64,
    pub spe_mean: f64,
    pub transit_time: f64,
    pub toroid: ToroidType,
    pub templates: PulseTemplates,
    /// Relative channel gains (channel 0 is the high gain one).
    pub atwd_gain: [f64; 3],
    /// Volts per count, indexed by chip then channel.
    pub atwd_bin_calib_slope: [[f64; 3]; 2],
    /// Pedestal in counts, indexed by chip then channel.
    pub atwd_baseline: [[f64; 3]; 2],
    /// Sampling rate in GHz, per chip.
    pub atwd_sampling_rate: [f64; 2],
    pub atwd_delta_t: [f64; 2],
    /// Volts per count.
    pub fadc_gain: f64,
    pub fadc_baseline: f64,
    pub fadc_delta_t: f64,
    pub mean_atwd_charge: Option<f64>,
    pub mean_fadc_charge: Option<f64>,
}

impl DomCalibration {
    /// Nominal constants of a healthy in-ice DOM.
    pub fn nominal(toroid: ToroidType) -> Self {
        Self {
            front_end_impedance: 43.0,
            spe_mean: 1.6,
            transit_time: 100.0,
            toroid,
            templates: PulseTemplates::for_toroid(toroid),
            atwd_gain: [-16.0, -2.0, -0.25],
            atwd_bin_calib_slope: [[-0.002; 3]; 2],
            atwd_baseline: [[128.0; 3]; 2],
            atwd_sampling_rate: [0.3, 0.3],
            atwd_delta_t: [0.0, 0.0],
            fadc_gain: 0.0001,
            fadc_baseline: 128.0,
            fadc_delta_t: -112.0,
            mean_atwd_charge: None,
            mean_fadc_charge: None,
        }
    }
}

pub type CalibrationMap = BTreeMap<OmKey, DomCalibration>;

/// Which neighbours can provide a local coincidence signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LcMode {
    Off,
    UpOrDown,
    Up,
    Down,
    UpAndDown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnOff {
    On,
    Off,
}

/// Per-DOM run configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DomStatus {
    /// PMT high voltage (V).
    pub pmt_hv: f64,
    pub lc_window_pre: f64,
    pub lc_window_post: f64,
    pub lc_mode: LcMode,
    /// Number of modules above and below that can provide LC.
    pub lc_span: u32,
    pub atwd_a: OnOff,
    pub atwd_b: OnOff,
    /// Discriminator threshold (V).
    pub spe_threshold: f64,
}

impl Default for DomStatus {
    fn default() -> Self {
        Self {
            pmt_hv: 1300.0,
            lc_window_pre: 1000.0,
            lc_window_post: 1000.0,
            lc_mode: LcMode::UpOrDown,
            lc_span: 2,
            atwd_a: OnOff::On,
            atwd_b: OnOff::On,
            spe_threshold: 0.0011,
        }
    }
}
