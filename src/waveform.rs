//! Calibrated digitizer readouts.
use crate::detector::{CalibrationMap, DomCalibration};
use crate::error::WavedeformError;
use crate::key::OmKey;
use crate::launch::{DomLaunch, LaunchMap};
use crate::launcher::dom::{CLOCK_CYCLE, DYNAMIC_RANGE};
use std::collections::BTreeMap;
use std::ops::Range;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Digitizer {
    Atwd,
    Fadc,
}

/// Condition of a run of samples.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WaveformStatus {
    /// Straight from a single channel.
    #[default]
    Virginal,
    /// Taken from a lower gain channel because a higher one clipped.
    Combined,
    /// Every channel clipped.
    Saturated,
    Undershoot,
}

/// Status of the samples in `interval`, which were read from ATWD
/// `channel` (always 0 for the FADC).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusCompound {
    pub interval: Range<usize>,
    pub status: WaveformStatus,
    pub channel: usize,
}

/// Calibrated waveform.
///
/// Sample `k` is the voltage at the right edge of its bin,
/// `start_time + (k + 1) * bin_width`.
#[derive(Clone, Debug, PartialEq)]
pub struct Waveform {
    pub start_time: f64,
    pub bin_width: f64,
    /// Volts.
    pub samples: Vec<f64>,
    pub digitizer: Digitizer,
    /// Read out in hard local coincidence.
    pub hlc: bool,
    /// Covers every sample, in order.
    pub info: Vec<StatusCompound>,
}

impl Waveform {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.samples.len() as f64 * self.bin_width
    }
    /// ATWD channel of every sample.
    pub fn channels(&self) -> Vec<usize> {
        let mut channels = vec![0; self.samples.len()];
        for compound in &self.info {
            let end = compound.interval.end.min(channels.len());
            let start = compound.interval.start.min(end);
            channels[start..end].fill(compound.channel);
        }
        channels
    }
}

pub type WaveformMap = BTreeMap<OmKey, Vec<Waveform>>;

/// Converts the counts of a launch back into voltages.
///
/// A launch gives at most one ATWD waveform, combined from its digitized
/// channels by taking every sample from the highest gain channel that did not
/// clip, and one FADC waveform. Soft coincidence launches without full
/// readouts give a short FADC waveform from the charge stamp.
///
/// # Examples
///
/// ```
/// use trigsim::detector::{DomCalibration, ToroidType};
/// use trigsim::launch::DomLaunch;
/// use trigsim::waveform::{calibrate_launch, Digitizer};
///
/// let cal = DomCalibration::nominal(ToroidType::New);
/// let mut launch = DomLaunch::new(1000.0);
/// launch.lc_bit = true;
/// launch.raw_atwd[0] = vec![128; 128];
/// launch.raw_fadc = vec![128; 256];
///
/// let waveforms = calibrate_launch(&launch, &cal);
/// assert_eq!(waveforms.len(), 2);
/// assert_eq!(waveforms[0].digitizer, Digitizer::Atwd);
/// assert!(waveforms[0].samples.iter().all(|&v| v == 0.0));
/// ```
pub fn calibrate_launch(launch: &DomLaunch, cal: &DomCalibration) -> Vec<Waveform> {
    let mut waveforms = Vec::with_capacity(2);
    if let Some(atwd) = calibrate_atwd(launch, cal) {
        waveforms.push(atwd);
    }

    let fadc_start = launch.start_time - (cal.transit_time - cal.fadc_delta_t);
    if !launch.raw_fadc.is_empty() {
        waveforms.push(calibrate_fadc(&launch.raw_fadc, fadc_start, launch.lc_bit, cal));
    } else if !launch.raw_charge_stamp.is_empty() {
        let start = fadc_start + launch.charge_stamp_bin as f64 * CLOCK_CYCLE;
        waveforms.push(calibrate_fadc(&launch.raw_charge_stamp, start, launch.lc_bit, cal));
    }
    waveforms
}

/// Calibrates every launch of every module.
pub fn calibrate(
    launches: &LaunchMap,
    calibration: &CalibrationMap,
) -> Result<WaveformMap, WavedeformError> {
    launches
        .iter()
        .map(|(dom, launches)| {
            let cal = calibration
                .get(dom)
                .ok_or(WavedeformError::MissingCalibration(*dom))?;
            let waveforms = launches
                .iter()
                .flat_map(|launch| calibrate_launch(launch, cal))
                .collect();
            Ok((*dom, waveforms))
        })
        .collect()
}

/// Time span covered by all waveforms, or `None` if there are none.
pub fn waveform_range(waveforms: &WaveformMap) -> Option<Range<f64>> {
    waveforms
        .values()
        .flatten()
        .filter(|wf| !wf.samples.is_empty())
        .fold(None, |range: Option<Range<f64>>, wf| {
            let (start, end) = (wf.start_time, wf.end_time());
            Some(match range {
                Some(r) => r.start.min(start)..r.end.max(end),
                None => start..end,
            })
        })
}

fn calibrate_atwd(launch: &DomLaunch, cal: &DomCalibration) -> Option<Waveform> {
    let chip = launch.which_atwd.index();
    let digitized: Vec<usize> = (0..3).filter(|&ch| !launch.raw_atwd[ch].is_empty()).collect();
    let &last = digitized.last()?;
    let len = digitized
        .iter()
        .map(|&ch| launch.raw_atwd[ch].len())
        .min()
        .unwrap_or(0);

    let mut samples = Vec::with_capacity(len);
    let mut info: Vec<StatusCompound> = Vec::new();
    for i in 0..len {
        let unclipped = digitized.iter().copied().find(|&ch| !clipped(launch.raw_atwd[ch][i]));
        let (channel, status) = match unclipped {
            Some(ch) if ch == digitized[0] => (ch, WaveformStatus::Virginal),
            Some(ch) => (ch, WaveformStatus::Combined),
            None => (last, WaveformStatus::Saturated),
        };
        let counts = f64::from(launch.raw_atwd[channel][i]);
        samples.push(
            (counts - cal.atwd_baseline[chip][channel]) * cal.atwd_bin_calib_slope[chip][channel]
                / cal.atwd_gain[channel],
        );

        match info.last_mut() {
            Some(c) if c.channel == channel && c.status == status => c.interval.end = i + 1,
            _ => info.push(StatusCompound {
                interval: i..i + 1,
                status,
                channel,
            }),
        }
    }

    let bin_width = 1.0 / cal.atwd_sampling_rate[chip];
    Some(Waveform {
        start_time: launch.start_time - cal.transit_time - cal.atwd_delta_t[chip],
        bin_width,
        samples,
        digitizer: Digitizer::Atwd,
        hlc: launch.lc_bit,
        info,
    })
}

fn calibrate_fadc(raw: &[u16], start_time: f64, hlc: bool, cal: &DomCalibration) -> Waveform {
    let samples = raw
        .iter()
        .map(|&counts| (f64::from(counts) - cal.fadc_baseline) * cal.fadc_gain)
        .collect();

    let mut info: Vec<StatusCompound> = Vec::new();
    for (i, &counts) in raw.iter().enumerate() {
        let status = if clipped(counts) {
            WaveformStatus::Saturated
        } else {
            WaveformStatus::Virginal
        };
        match info.last_mut() {
            Some(c) if c.status == status => c.interval.end = i + 1,
            _ => info.push(StatusCompound {
                interval: i..i + 1,
                status,
                channel: 0,
            }),
        }
    }

    Waveform {
        start_time,
        bin_width: CLOCK_CYCLE,
        samples,
        digitizer: Digitizer::Fadc,
        hlc,
        info,
    }
}

fn clipped(counts: u16) -> bool {
    counts == 0 || f64::from(counts) >= DYNAMIC_RANGE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::ToroidType;
    use crate::launch::Atwd;
    use assert_approx_eq::assert_approx_eq;

    fn hlc_launch() -> DomLaunch {
        let mut launch = DomLaunch::new(1000.0);
        launch.lc_bit = true;
        launch.raw_atwd[0] = vec![128; 128];
        launch.raw_fadc = vec![128; 256];
        launch
    }

    #[test]
    fn atwd_counts_to_volts() {
        let cal = DomCalibration::nominal(ToroidType::New);
        let mut launch = hlc_launch();
        launch.raw_atwd[0][10] = 228;

        let waveforms = calibrate_launch(&launch, &cal);
        let atwd = &waveforms[0];
        // 100 counts at 2 mV per count through a gain of 16.
        assert_approx_eq!(atwd.samples[10], 0.0125);
        assert_approx_eq!(atwd.bin_width, 1.0 / 0.3);
        assert_approx_eq!(atwd.start_time, 900.0);
        assert!(atwd.hlc);
        assert_eq!(
            atwd.info,
            vec![StatusCompound {
                interval: 0..128,
                status: WaveformStatus::Virginal,
                channel: 0,
            }]
        );
    }

    #[test]
    fn fadc_counts_to_volts() {
        let cal = DomCalibration::nominal(ToroidType::New);
        let mut launch = hlc_launch();
        launch.raw_fadc[3] = 138;

        let fadc = &calibrate_launch(&launch, &cal)[1];
        assert_eq!(fadc.digitizer, Digitizer::Fadc);
        assert_approx_eq!(fadc.samples[3], 0.001);
        assert_approx_eq!(fadc.start_time, 1000.0 - 100.0 - 112.0);
        assert_approx_eq!(fadc.end_time(), fadc.start_time + 256.0 * 25.0);
    }

    #[test]
    fn clipped_samples_fall_back_to_lower_gain() {
        let cal = DomCalibration::nominal(ToroidType::New);
        let mut launch = hlc_launch();
        launch.which_atwd = Atwd::B;
        launch.raw_atwd[1] = vec![128; 128];
        launch.raw_atwd[0][5..8].fill(1023);
        launch.raw_atwd[1][6] = 1023;

        let atwd = &calibrate_launch(&launch, &cal)[0];
        assert_eq!(
            atwd.info,
            vec![
                StatusCompound { interval: 0..5, status: WaveformStatus::Virginal, channel: 0 },
                StatusCompound { interval: 5..6, status: WaveformStatus::Combined, channel: 1 },
                StatusCompound { interval: 6..7, status: WaveformStatus::Saturated, channel: 1 },
                StatusCompound { interval: 7..8, status: WaveformStatus::Combined, channel: 1 },
                StatusCompound { interval: 8..128, status: WaveformStatus::Virginal, channel: 0 },
            ]
        );
        let channels = atwd.channels();
        assert_eq!(&channels[4..9], &[0, 1, 1, 1, 0]);
    }

    #[test]
    fn charge_stamp_of_soft_launch() {
        let cal = DomCalibration::nominal(ToroidType::New);
        let mut launch = DomLaunch::new(1000.0);
        launch.raw_charge_stamp = vec![130, 1023, 140];
        launch.charge_stamp_bin = 2;

        let waveforms = calibrate_launch(&launch, &cal);
        assert_eq!(waveforms.len(), 1);
        let stamp = &waveforms[0];
        assert!(!stamp.hlc);
        assert_eq!(stamp.samples.len(), 3);
        assert_approx_eq!(stamp.start_time, 1000.0 - 212.0 + 50.0);
        assert_eq!(stamp.info[1].status, WaveformStatus::Saturated);
        assert_eq!(stamp.info.len(), 3);
    }

    #[test]
    fn range_spans_all_waveforms() {
        let cal = DomCalibration::nominal(ToroidType::New);
        let mut map = WaveformMap::new();
        map.insert(OmKey::new(1, 1), calibrate_launch(&hlc_launch(), &cal));
        let mut late = hlc_launch();
        late.start_time = 5000.0;
        map.insert(OmKey::new(1, 2), calibrate_launch(&late, &cal));

        let range = waveform_range(&map).unwrap();
        assert_approx_eq!(range.start, 788.0);
        assert_approx_eq!(range.end, 5000.0 - 212.0 + 6400.0);
        assert!(waveform_range(&WaveformMap::new()).is_none());
    }

    #[test]
    fn missing_calibration() {
        let mut launches = LaunchMap::new();
        launches.insert(OmKey::new(3, 3), vec![hlc_launch()]);
        assert_eq!(
            calibrate(&launches, &CalibrationMap::new()),
            Err(WavedeformError::MissingCalibration(OmKey::new(3, 3)))
        );
    }
}
