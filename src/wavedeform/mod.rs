//! Unfolding of calibrated waveforms into pulses.
//!
//! The waveforms of a module are modelled as a non-negative sum of single
//! photo-electron templates placed on a grid of candidate times. Candidates
//! are only placed where the data is significant, the fit is restricted to
//! the samples that some candidate can explain, and the amplitudes are found
//! with [`nnls`].
use crate::detector::{CalibrationMap, DomCalibration, ToroidType, MILLIVOLT};
use crate::error::{NnlsError, WavedeformError};
use crate::nnls::{nnls, NnlsOptions};
use crate::pulse::{PulseFlags, RecoPulse, RecoPulseMap};
use crate::sparse::{CscMatrix, TripletMatrix};
use crate::status::DetectorStatus;
use crate::waveform::{Digitizer, Waveform, WaveformMap, WaveformStatus};
use bon::bon;
use std::ops::Range;
use tracing::{debug, instrument, warn};

pub mod template;

pub use template::{TemplateGrid, WaveformTemplate};
use template::{pulse_width, PULSE_MIN};

/// FADC samples affected by the ATWD readout, down-weighted on request.
const FADC_EARLY_BINS: usize = 16;
const FADC_EARLY_WEIGHT: f64 = 20.0;

/// Unfolded pulses and the time span they may cover.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WavedeformOutput {
    pub pulses: RecoPulseMap,
    pub range: Range<f64>,
}

pub struct Wavedeform {
    spes_per_bin: f64,
    tolerance: f64,
    noise_threshold: f64,
    basis_threshold: f64,
    deweight_fadc: bool,
    apply_spe_corrections: bool,
    grid: TemplateGrid,
    // Indexed by toroid type.
    templates: [Option<WaveformTemplate>; 2],
}

#[bon]
impl Wavedeform {
    #[builder]
    pub fn new(
        // Candidate pulses per digitizer bin.
        #[builder(default = 4.0)] spes_per_bin: f64,
        // NNLS stopping tolerance (mV² per photo-electron).
        #[builder(default = 9.0)] tolerance: f64,
        // Samples below this many counts are treated as baseline.
        #[builder(default = 2.0)] noise_threshold: f64,
        // Samples above this many counts seed candidate pulses.
        #[builder(default = 3.0)] basis_threshold: f64,
        #[builder(default = true)] deweight_fadc: bool,
        #[builder(default)] apply_spe_corrections: bool,
    ) -> Self {
        Self {
            spes_per_bin,
            tolerance,
            noise_threshold,
            basis_threshold,
            deweight_fadc,
            apply_spe_corrections,
            grid: TemplateGrid::new(spes_per_bin),
            templates: [None, None],
        }
    }
}

impl Default for Wavedeform {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// One digitizer sample entering the fit.
#[derive(Clone, Copy, Debug)]
struct Bin {
    edge: f64,
    source: PulseFlags,
    channel: usize,
    value: f64,
    weight: f64,
    seeds_basis: bool,
}

impl Wavedeform {
    /// Drops the cached templates. They are rebuilt from the next
    /// calibration seen.
    pub fn calibration_changed(&mut self) {
        self.templates = [None, None];
    }
    /// Unfolds the waveforms of every module in `waveforms`.
    ///
    /// Modules that are switched off in `status` get no pulses. Returns the
    /// pulses together with the time range they may cover, from 25 ns before
    /// `range` to its end.
    #[instrument(skip_all, fields(doms = waveforms.len()))]
    pub fn process(
        &mut self,
        waveforms: &WaveformMap,
        calibration: &CalibrationMap,
        status: &DetectorStatus,
        range: Range<f64>,
    ) -> Result<WavedeformOutput, WavedeformError> {
        for dom in waveforms.keys() {
            let cal = calibration
                .get(dom)
                .ok_or(WavedeformError::MissingCalibration(*dom))?;
            let slot = toroid_slot(cal.toroid);
            if self.templates[slot].is_none() {
                debug!(toroid = ?cal.toroid, "tabulating templates");
                self.templates[slot] = Some(WaveformTemplate::new(self.grid, cal));
            }
        }

        let mut pulses = RecoPulseMap::new();
        for (dom, series) in waveforms {
            let Some(cal) = calibration.get(dom) else {
                continue;
            };
            let Some(template) = &self.templates[toroid_slot(cal.toroid)] else {
                continue;
            };
            let spe_charge = match status.dom_status.get(dom) {
                Some(s) if s.pmt_hv > 0.0 => cal.spe_mean * cal.front_end_impedance,
                Some(_) => 0.0,
                None => {
                    debug!(%dom, "no status, skipping");
                    0.0
                }
            };

            let found = self
                .pulses(series, template, cal, spe_charge)
                .map_err(|source| WavedeformError::Unfold { dom: *dom, source })?;
            pulses.insert(*dom, found);
        }

        let n: usize = pulses.values().map(Vec::len).sum();
        debug!(pulses = n, "unfolded");
        Ok(WavedeformOutput {
            pulses,
            range: range.start - 25.0..range.end,
        })
    }

    /// Unfolds the waveforms of a single module.
    ///
    /// `spe_charge` is the integral of a single photo-electron pulse in
    /// mV·ns. Pulse times strictly increase. Each pulse is as wide as the gap
    /// to its closest neighbouring candidate.
    pub fn pulses(
        &self,
        waveforms: &[Waveform],
        template: &WaveformTemplate,
        cal: &DomCalibration,
        spe_charge: f64,
    ) -> Result<Vec<RecoPulse>, NnlsError> {
        let nbins: usize = waveforms.iter().map(|wf| wf.samples.len()).sum();
        if nbins == 0 || !spe_charge.is_finite() || spe_charge == 0.0 {
            return Ok(Vec::new());
        }

        let mut bins = Vec::with_capacity(nbins);
        for wf in waveforms {
            self.push_bins(wf, cal, &mut bins);
        }

        let Some(start_times) = self.basis_times(waveforms, &bins, template) else {
            return Ok(Vec::new());
        };

        // Drop samples that no candidate can explain.
        let mut offset = 0;
        for wf in waveforms {
            let samples = &mut bins[offset..offset + wf.samples.len()];
            offset += wf.samples.len();
            prune_unsupported(samples, &start_times);
        }
        bins.retain(|bin| bin.weight > 0.0);

        let (matrix, flags) = design_matrix(&bins, &start_times, template, spe_charge);
        let data: Vec<f64> = bins.iter().map(|bin| bin.value).collect();
        let options = NnlsOptions::builder()
            .tolerance(self.tolerance)
            .min_iterations(0)
            .max_iterations(1000)
            .build();
        let charges = nnls(&matrix, &data, &options)?;

        let (atwd_correction, fadc_correction) = if self.apply_spe_corrections {
            (
                spe_correction(cal.mean_atwd_charge),
                spe_correction(cal.mean_fadc_charge),
            )
        } else {
            (1.0, 1.0)
        };

        let pulses = charges
            .iter()
            .enumerate()
            .filter(|&(_, &charge)| charge != 0.0)
            .map(|(i, &charge)| {
                let correction = if flags[i].contains(PulseFlags::ATWD) {
                    atwd_correction
                } else {
                    fadc_correction
                };
                let before = i.checked_sub(1).map(|j| start_times[i] - start_times[j]);
                let after = start_times.get(i + 1).map(|t| t - start_times[i]);
                let width = match (before, after) {
                    (Some(b), Some(a)) => b.min(a),
                    (Some(gap), None) | (None, Some(gap)) => gap,
                    (None, None) => f64::INFINITY,
                };
                RecoPulse {
                    time: start_times[i],
                    charge: (charge * correction) as f32,
                    width: width as f32,
                    flags: flags[i],
                }
            })
            .collect();
        Ok(pulses)
    }

    // Converts a waveform to mV and assigns the fit weight of every sample.
    fn push_bins(&self, wf: &Waveform, cal: &DomCalibration, bins: &mut Vec<Bin>) {
        let channels = wf.channels();
        let mut source = match wf.digitizer {
            Digitizer::Atwd => PulseFlags::ATWD,
            Digitizer::Fadc => PulseFlags::FADC,
        };
        if wf.hlc {
            source |= PulseFlags::LC;
        }

        let mut base_weight = if wf.digitizer == Digitizer::Fadc { 3.0 } else { 1.0 };
        // Short waveforms constrain a long template poorly.
        let duration = wf.samples.len() as f64 * wf.bin_width;
        if duration < pulse_width(source) {
            base_weight *= pulse_width(source) / duration;
        }

        // Volts per count, in mV. Soft readouts have no usable baseline.
        let first_channel = channels.first().copied().unwrap_or(0);
        let gain = if !wf.hlc {
            0.0
        } else if wf.digitizer == Digitizer::Atwd {
            cal.atwd_bin_calib_slope[0][first_channel] / cal.atwd_gain[first_channel] / MILLIVOLT
        } else {
            cal.fadc_gain / MILLIVOLT
        };
        let noise = self.noise_threshold * gain;
        let basis_threshold = self.basis_threshold * gain;

        let first = bins.len();
        for (k, &sample) in wf.samples.iter().enumerate() {
            let channel = channels[k];
            let mut value = sample / MILLIVOLT;
            let mut weight = base_weight;
            let mut seeds_basis = false;

            if wf.digitizer == Digitizer::Atwd {
                weight /= 1.0 + channel as f64;
            }
            if self.deweight_fadc
                && k < FADC_EARLY_BINS
                && source.contains(PulseFlags::FADC | PulseFlags::LC)
            {
                weight /= FADC_EARLY_WEIGHT;
            }
            if !value.is_finite() {
                value = 0.0;
                weight = 0.0;
            }

            if value.abs() < noise {
                value = 0.0;
                weight /= 4.0;
            } else if value.abs() > basis_threshold {
                seeds_basis = true;
            }
            // Low gain channels are only read when the high gain ones clip.
            if wf.digitizer == Digitizer::Atwd && channel > 0 && value.abs() < 10.0 * noise {
                value = 0.0;
                weight = 0.0;
            }

            bins.push(Bin {
                edge: wf.start_time + (k + 1) as f64 * wf.bin_width,
                source,
                channel,
                value,
                weight,
                seeds_basis,
            });
        }

        let samples = &mut bins[first..];
        for compound in &wf.info {
            if compound.status != WaveformStatus::Saturated {
                continue;
            }
            let end = compound.interval.end.min(samples.len());
            let start = compound.interval.start.min(end);
            for bin in &mut samples[start..end] {
                bin.weight = 0.0;
            }
        }
        for bin in samples {
            bin.value *= bin.weight;
        }
    }

    // Candidate pulse times: a grid across the half maximum region of the
    // template before every significant sample, thinned to the finest
    // spacing. `None` if no sample is significant.
    fn basis_times(
        &self,
        waveforms: &[Waveform],
        bins: &[Bin],
        template: &WaveformTemplate,
    ) -> Option<Vec<f64>> {
        let mut times = Vec::new();
        let mut min_spacing = f64::INFINITY;

        let mut offset = 0;
        for wf in waveforms {
            let samples = &bins[offset..offset + wf.samples.len()];
            offset += wf.samples.len();
            let Some(first) = samples.first() else {
                continue;
            };

            let mut present = wf.start_time - 2.0 * wf.bin_width;
            let max = present + wf.samples.len() as f64 * wf.bin_width;
            let spacing = wf.bin_width / self.spes_per_bin;
            min_spacing = min_spacing.min(spacing);

            let (fwhm_start, fwhm_stop) = match wf.digitizer {
                Digitizer::Atwd => template.atwd_fwhm[first.channel.min(2)],
                Digitizer::Fadc => template.fadc_fwhm,
            };
            for bin in samples.iter().filter(|bin| bin.value != 0.0 && bin.seeds_basis) {
                if present < bin.edge - fwhm_stop - spacing {
                    present = bin.edge - fwhm_stop;
                }
                while present < bin.edge - fwhm_start && present < max {
                    times.push(present);
                    present += spacing;
                }
            }
        }
        if times.is_empty() {
            return None;
        }

        times.sort_by(f64::total_cmp);
        let mut kept: Vec<f64> = Vec::with_capacity(times.len());
        for t in times {
            match kept.last() {
                Some(&last) if t - last < 0.9 * min_spacing => {}
                _ => kept.push(t),
            }
        }
        Some(kept)
    }
}

fn toroid_slot(toroid: ToroidType) -> usize {
    match toroid {
        ToroidType::Old => 0,
        ToroidType::New => 1,
    }
}

fn spe_correction(mean_charge: Option<f64>) -> f64 {
    mean_charge
        .filter(|&c| c.is_finite() && c > 0.0)
        .map_or_else(
            || {
                warn!("no valid mean SPE charge, leaving charges uncorrected");
                1.0
            },
            |c| 1.0 / c,
        )
}

// Zeroes the weight of samples of one waveform outside the support of every
// candidate. Samples are in time order.
fn prune_unsupported(samples: &mut [Bin], start_times: &[f64]) {
    let Some(width) = samples.first().map(|bin| pulse_width(bin.source)) else {
        return;
    };

    let mut k = 0;
    for &t in start_times {
        let (start, end) = (t + PULSE_MIN, t + width);
        while k < samples.len() && samples[k].edge < end {
            if samples[k].edge < start {
                samples[k].weight = 0.0;
            }
            k += 1;
        }
        if k == samples.len() {
            break;
        }
    }
    for bin in &mut samples[k..] {
        bin.weight = 0.0;
    }
}

// Template response of every candidate in every sample, scaled by the sample
// weight. Also returns the digitizers that constrain each candidate.
fn design_matrix(
    bins: &[Bin],
    start_times: &[f64],
    template: &WaveformTemplate,
    spe_charge: f64,
) -> (CscMatrix<f64>, Vec<PulseFlags>) {
    let mut triplets = TripletMatrix::new(bins.len(), start_times.len());
    let mut flags = vec![PulseFlags::empty(); start_times.len()];

    let mut first = 0;
    let mut last_edge = f64::NEG_INFINITY;
    for (i, bin) in bins.iter().enumerate() {
        // Next waveform.
        if bin.edge < last_edge {
            first = 0;
        }
        last_edge = bin.edge;

        let width = pulse_width(bin.source);
        while first < start_times.len() && bin.edge - start_times[first] > width {
            first += 1;
        }
        let weighted_charge = spe_charge * bin.weight;
        if first == start_times.len() || weighted_charge == 0.0 {
            continue;
        }

        let (shape, spacing) = if bin.source.contains(PulseFlags::ATWD) {
            (&template.atwd[bin.channel.min(2)], template.grid.atwd_spacing)
        } else {
            (&template.fadc, template.grid.fadc_spacing)
        };
        for (j, &t) in start_times.iter().enumerate().skip(first) {
            let x = ((bin.edge - t) - PULSE_MIN) / spacing;
            // Truncation towards zero, so the sample just before the
            // template start still reads its first value.
            if x <= -1.0 {
                break;
            }
            let Some(&value) = shape.get(x as usize) else {
                continue;
            };
            triplets.push(i, j, value * weighted_charge);
            flags[j] |= bin.source;
        }
    }

    (CscMatrix::from(triplets), flags)
}
