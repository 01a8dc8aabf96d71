use crate::detector::{DomCalibration, PulseTemplate};
use crate::pulse::PulseFlags;

/// Earliest template time relative to the pulse time (ns).
pub const PULSE_MIN: f64 = -2.0;
/// Latest ATWD template time relative to the pulse time (ns).
pub const ATWD_PULSE_WIDTH: f64 = 50.0;
/// Latest FADC template time relative to the pulse time (ns).
pub const FADC_PULSE_WIDTH: f64 = 170.0;

/// Extent of the template of a basis function fitted to data from `source`.
pub fn pulse_width(source: PulseFlags) -> f64 {
    if source.contains(PulseFlags::FADC) {
        FADC_PULSE_WIDTH
    } else {
        ATWD_PULSE_WIDTH
    }
}

/// Sampling of the tabulated templates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TemplateGrid {
    pub atwd_spacing: f64,
    pub atwd_bins: usize,
    pub fadc_spacing: f64,
    pub fadc_bins: usize,
}

impl TemplateGrid {
    /// Ten template samples per basis function spacing.
    pub fn new(spes_per_bin: f64) -> Self {
        let atwd_spacing = 3.3 / spes_per_bin / 10.0;
        let fadc_spacing = 25.0 / spes_per_bin / 10.0;
        Self {
            atwd_spacing,
            atwd_bins: ((ATWD_PULSE_WIDTH - PULSE_MIN) / atwd_spacing).ceil() as usize,
            fadc_spacing,
            fadc_bins: ((FADC_PULSE_WIDTH - PULSE_MIN) / fadc_spacing).ceil() as usize,
        }
    }
}

/// Pulse shapes of one toroid type, tabulated from [`PULSE_MIN`].
#[derive(Clone, Debug, PartialEq)]
pub struct WaveformTemplate {
    pub atwd: [Vec<f64>; 3],
    pub atwd_fwhm: [(f64, f64); 3],
    pub fadc: Vec<f64>,
    pub fadc_fwhm: (f64, f64),
    pub grid: TemplateGrid,
}

impl WaveformTemplate {
    pub fn new(grid: TemplateGrid, cal: &DomCalibration) -> Self {
        let tabulate = |shape: &dyn PulseTemplate, spacing: f64, bins: usize| -> Vec<f64> {
            (0..bins)
                .map(|i| shape.amplitude(PULSE_MIN + i as f64 * spacing))
                .collect()
        };

        let atwd = [0, 1, 2].map(|ch| {
            tabulate(&cal.templates.atwd[ch], grid.atwd_spacing, grid.atwd_bins)
        });
        let atwd_fwhm = [0, 1, 2].map(|ch| fwhm(&atwd[ch], grid.atwd_spacing));
        let fadc = tabulate(&cal.templates.fadc, grid.fadc_spacing, grid.fadc_bins);
        let fadc_fwhm = fwhm(&fadc, grid.fadc_spacing);

        Self {
            atwd,
            atwd_fwhm,
            fadc,
            fadc_fwhm,
            grid,
        }
    }
}

/// Bounds of the half maximum region of a tabulated template, widened by one
/// sample on each side.
pub fn fwhm(data: &[f64], spacing: f64) -> (f64, f64) {
    let max = data.iter().fold(f64::MIN_POSITIVE, |m, &v| m.max(v));
    let half = max / 2.0;

    let first = data.iter().position(|&v| v > half).unwrap_or(0);
    let first = first.saturating_sub(1);
    let start = PULSE_MIN + first as f64 * spacing;

    let mut last = data.iter().rposition(|&v| v > half).unwrap_or(first);
    if last + 1 < data.len() {
        last += 1;
    }
    let mut stop = PULSE_MIN + last as f64 * spacing;
    if stop == start {
        stop += spacing;
    }
    (start, stop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::ToroidType;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn grid_for_four_spes_per_bin() {
        let grid = TemplateGrid::new(4.0);
        assert_approx_eq!(grid.atwd_spacing, 0.0825);
        assert_eq!(grid.atwd_bins, 631);
        assert_approx_eq!(grid.fadc_spacing, 0.625);
        assert_eq!(grid.fadc_bins, 276);
    }

    #[test]
    fn fwhm_of_triangle() {
        let data = [0.0, 1.0, 2.0, 3.0, 4.0, 3.0, 2.0, 1.0, 0.0];
        assert_eq!(fwhm(&data, 1.0), (PULSE_MIN + 2.0, PULSE_MIN + 6.0));
    }

    #[test]
    fn fwhm_of_spike() {
        assert_eq!(fwhm(&[5.0], 0.5), (PULSE_MIN, PULSE_MIN + 0.5));
        assert_eq!(fwhm(&[], 0.5), (PULSE_MIN, PULSE_MIN + 0.5));
    }

    #[test]
    fn templates_peak_inside_half_maximum() {
        let cal = DomCalibration::nominal(ToroidType::New);
        let template = WaveformTemplate::new(TemplateGrid::new(4.0), &cal);
        let (start, stop) = template.fadc_fwhm;
        let max = template.fadc.iter().fold(0.0, |m: f64, &v| m.max(v));
        assert!(start < stop);
        assert!(cal.templates.fadc.amplitude((start + stop) / 2.0) > max / 2.0);
        assert_eq!(template.atwd[2].len(), 631);
        assert_eq!(pulse_width(PulseFlags::FADC | PulseFlags::LC), FADC_PULSE_WIDTH);
        assert_eq!(pulse_width(PulseFlags::ATWD), ATWD_PULSE_WIDTH);
    }
}
