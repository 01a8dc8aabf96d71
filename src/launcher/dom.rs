//! Discriminator and launch logic of a single module.
//!
//! A [`Dom`] turns its PMT pulses into discriminator crossings, and replays
//! the time ordered crossing stream of the whole detector into launches. Times
//! are in ns and every decision is taken at the time of the crossing being
//! processed (the "global" time), which the caller passes in.
use crate::detector::{DomCalibration, DomStatus, LcMode, OnOff, PulseTemplate, MILLIVOLT};
use crate::key::OmKey;
use crate::launch::{Atwd, DomLaunch, TriggerMode, TriggerType};
use crate::pulse::McPulse;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use std::collections::VecDeque;
use tracing::{error, warn};

/// Time the module stays busy after a hard local coincidence launch.
pub const HLC_READOUT_TIME: f64 = 6400.0;
/// Readout and digitization time of one ATWD channel.
pub const ATWD_READOUT_DIGITIZE_TIME: f64 = 29000.0;
pub const ATWD_RESTART_TIME: f64 = 225.0;
/// Time to clear one ATWD channel that was not digitized.
pub const ATWD_CLEAR_TIME: f64 = 950.0;
pub const CLOCK_CYCLE: f64 = 25.0;
pub const DELAY_LINE: f64 = 75.0;
/// A local coincidence line is not raised again within this time.
pub const LC_WAIT: f64 = 350.0;
pub const FADC_BINS: usize = 256;
pub const ATWD_BINS: usize = 128;
/// FADC bins searched for the coarse charge stamp.
pub const CHARGE_STAMP_BINS: usize = 16;
/// Counts above which the next ATWD channel is digitized.
pub const ATWD_THRESHOLD: f64 = 768.0;
/// Largest count of both digitizers.
pub const DYNAMIC_RANGE: f64 = 1023.0;

const FADC_NOISE: f64 = 0.5;
const ATWD_NOISE: f64 = 0.8;
const RAPCAL_UNCERTAINTY: f64 = 2.0;
const TIMESTEP: f64 = 0.5;
// Pulses outside [t - LOOKBACK, t + LOOKAHEAD] do not contribute at time t.
const PULSE_LOOKBACK: f64 = 1000.0;
const PULSE_LOOKAHEAD: f64 = 60.0;
// Baseline measurements are biased low by half a count due to flooring.
const BASELINE_BIAS: f64 = 0.5;

/// Hardware flavour of a module. Decides its local coincidence partners and
/// the cable delay of the coincidence signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleKind {
    InIce,
    IceTop,
}

impl ModuleKind {
    /// Propagation delay of the local coincidence signal (ns).
    pub fn cable_correction(self, lc_span: u32) -> f64 {
        match self {
            ModuleKind::InIce => 100.0 * f64::from(lc_span.saturating_sub(1)),
            ModuleKind::IceTop => 850.0,
        }
    }
    /// Modules that can provide a local coincidence signal to `dom`, with the
    /// line the signal arrives on.
    ///
    /// In-ice modules listen to `lc_span` modules above and below on their
    /// string. A surface tank module listens to the modules of the other tank
    /// of its station (positions 61-62 and 63-64 form a tank).
    ///
    /// # Examples
    ///
    /// ```
    /// use trigsim::detector::DomStatus;
    /// use trigsim::key::OmKey;
    /// use trigsim::launch::TriggerMode;
    /// use trigsim::launcher::dom::ModuleKind;
    ///
    /// let partners = ModuleKind::InIce.lc_partners(OmKey::new(1, 1), &DomStatus::default());
    /// assert_eq!(
    ///     partners,
    ///     vec![
    ///         (OmKey::new(1, 2), TriggerMode::LC_LOWER),
    ///         (OmKey::new(1, 3), TriggerMode::LC_LOWER),
    ///     ]
    /// );
    /// ```
    pub fn lc_partners(self, dom: OmKey, status: &DomStatus) -> Vec<(OmKey, TriggerMode)> {
        let (up, down) = match status.lc_mode {
            LcMode::Off => return Vec::new(),
            LcMode::Up => (true, false),
            LcMode::Down => (false, true),
            LcMode::UpOrDown | LcMode::UpAndDown => (true, true),
        };

        let candidates: Vec<u32> = match self {
            ModuleKind::InIce => (1..=status.lc_span)
                .flat_map(|d| [dom.om.checked_sub(d), Some(dom.om + d)])
                .flatten()
                .filter(|&om| (1..=60).contains(&om))
                .collect(),
            ModuleKind::IceTop => {
                let tank = if dom.om <= 62 { 63..=64 } else { 61..=62 };
                tank.collect()
            }
        };

        let mut partners: Vec<_> = candidates
            .into_iter()
            .filter_map(|om| {
                let side = if om < dom.om {
                    TriggerMode::LC_UPPER
                } else {
                    TriggerMode::LC_LOWER
                };
                let accepted = if om < dom.om { up } else { down };
                accepted.then_some((OmKey::new(dom.string, om), side))
            })
            .collect();
        partners.sort_by_key(|(key, _)| *key);
        partners
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrossingKind {
    /// The discriminator fired.
    Discriminator,
    /// A beacon launch requested by the module CPU.
    CpuRequested,
}

/// Discriminator threshold crossing (or beacon request) of one module.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Crossing {
    pub dom: OmKey,
    pub time: f64,
    pub kind: CrossingKind,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum LaunchKind {
    /// Hard local coincidence, with the lines that were high.
    Hlc(TriggerMode),
    Slc,
    CpuRequested,
}

/// State of one module across a frame.
#[derive(Clone, Debug)]
pub struct Dom {
    key: OmKey,
    kind: ModuleKind,
    // Baselines include the flooring bias.
    cal: DomCalibration,
    status: DomStatus,
    threshold: f64,
    peak_time: f64,
    disc_delay: f64,
    cable_correction: f64,
    beacon_period: f64,
    rapcal_shift: f64,
    clock_phase: f64,
    beacon_phase: f64,
    // Sorted by time.
    pulses: Vec<McPulse>,
    // Crossings waiting for a launch decision.
    pending: VecDeque<Crossing>,
    launches: Vec<DomLaunch>,
    lc_high: Option<f64>,
    // Time of the latest state update.
    dom_time: f64,
    atwd_alive: [bool; 2],
    atwd_dead_to: [Option<f64>; 2],
    busy: bool,
    busy_to: Option<f64>,
}

impl Dom {
    /// Sets up a module from its calibration and status.
    ///
    /// Returns `None` (after logging an error) if the calibration does not
    /// give a usable discriminator threshold or transit time.
    pub fn configure<R: Rng + ?Sized>(
        key: OmKey,
        kind: ModuleKind,
        cal: &DomCalibration,
        status: &DomStatus,
        beacon_rate: f64,
        rng: &mut R,
    ) -> Option<Self> {
        let template = &cal.templates.discriminator;
        let peak_time = template_peak(template);
        let peak = template.amplitude(peak_time);
        let fraction =
            status.spe_threshold / MILLIVOLT / (peak * cal.spe_mean * cal.front_end_impedance);
        let threshold = peak * fraction;

        if threshold.is_nan() {
            error!(dom = %key, "NaN discriminator threshold");
            return None;
        }
        if cal.transit_time.is_nan() {
            error!(dom = %key, "NaN transit time, module discarded");
            return None;
        }
        if status.lc_span > 2 {
            warn!(dom = %key, span = status.lc_span, "cable corrections are only valid for LC spans up to 2");
        }

        let mut cal = cal.clone();
        for baseline in cal.atwd_baseline.iter_mut().flatten() {
            *baseline += BASELINE_BIAS;
        }
        cal.fadc_baseline += BASELINE_BIAS;

        let mut dom = Self {
            key,
            kind,
            disc_delay: cal.transit_time - DELAY_LINE,
            cal,
            status: *status,
            threshold,
            peak_time,
            cable_correction: kind.cable_correction(status.lc_span),
            beacon_period: 1e9 / beacon_rate,
            rapcal_shift: 0.0,
            clock_phase: 0.0,
            beacon_phase: 0.0,
            pulses: Vec::new(),
            pending: VecDeque::new(),
            launches: Vec::new(),
            lc_high: None,
            dom_time: 0.0,
            atwd_alive: [true; 2],
            atwd_dead_to: [None; 2],
            busy: false,
            busy_to: None,
        };
        dom.sample_phases(rng);
        Some(dom)
    }

    fn sample_phases<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let shift: f64 = StandardNormal.sample(rng);
        self.rapcal_shift = RAPCAL_UNCERTAINTY * shift;
        self.clock_phase = rng.random::<f64>() * CLOCK_CYCLE;
        // The beacon phase sits on the clock grid.
        let phase = (rng.random::<f64>() * self.beacon_period).trunc();
        self.beacon_phase = (phase - (phase % CLOCK_CYCLE - self.clock_phase)).trunc();
    }

    pub fn key(&self) -> OmKey {
        self.key
    }

    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    pub fn status(&self) -> &DomStatus {
        &self.status
    }
    /// Last time this module raised its local coincidence line.
    pub fn lc_high(&self) -> Option<f64> {
        self.lc_high
    }

    pub fn launches(&self) -> &[DomLaunch] {
        &self.launches
    }

    pub fn take_launches(&mut self) -> Vec<DomLaunch> {
        std::mem::take(&mut self.launches)
    }
    /// A module stays active while it holds undecided crossings or pulses
    /// that can still shape later readouts.
    pub fn is_active(&self) -> bool {
        !self.pending.is_empty() || !self.pulses.is_empty()
    }
    /// Scans `pulses` and appends the discriminator crossings to `stream`.
    ///
    /// The summed pulse shape is sampled every 0.5 ns from the start of each
    /// pulse. The first sample above threshold is moved to the next clock
    /// edge, and the crossing is reported one clock cycle and the
    /// discriminator delay later. A pulse stops being scanned once its shape
    /// is past the peak and falling.
    pub fn discriminator(&mut self, pulses: &[McPulse], stream: &mut Vec<Crossing>) {
        if pulses.is_empty() {
            warn!(dom = %self.key, "no pulses to discriminate");
            return;
        }
        let mut pulses = pulses.to_vec();
        pulses.sort_by(|a, b| a.time.total_cmp(&b.time));
        self.pulses.extend_from_slice(&pulses);
        self.pulses.sort_by(|a, b| a.time.total_cmp(&b.time));

        let template = self.cal.templates.discriminator;
        let end = pulses[pulses.len() - 1].time + CLOCK_CYCLE;
        let mut time = pulses[0].time;

        for (i, pulse) in pulses.iter().enumerate() {
            let next = pulses.get(i + 1).map_or(end, |p| p.time + CLOCK_CYCLE);
            if pulse.time < time {
                continue;
            }
            time = pulse.time;

            let mut last_amplitude = f64::MIN;
            while time < next {
                let amplitude = amplitude(&self.pulses, time, &template);
                if amplitude > self.threshold {
                    time += CLOCK_CYCLE - (time as i64 % CLOCK_CYCLE as i64) as f64 - time.fract();
                    let crossing = time + self.clock_phase + CLOCK_CYCLE + self.disc_delay;
                    if !crossing.is_nan() {
                        stream.push(Crossing {
                            dom: self.key,
                            time: crossing,
                            kind: CrossingKind::Discriminator,
                        });
                    }
                    break;
                }
                if amplitude <= last_amplitude && time - pulse.time > self.peak_time {
                    break;
                }
                last_amplitude = amplitude;
                time += TIMESTEP;
            }
        }
    }
    /// Appends the beacon requests falling in `[start, end)` to `stream`.
    /// Returns whether any was added.
    pub fn add_beacon_launches(&self, start: f64, end: f64, stream: &mut Vec<Crossing>) -> bool {
        if !(start < end) || !self.beacon_period.is_finite() {
            return false;
        }
        let phase = (self.beacon_phase as i64).max(1);
        let period = (self.beacon_period as i64).max(1);

        let mut added = false;
        let mut t = start;
        t += (phase - t as i64 % phase) as f64 - t.fract();
        while t < end {
            added = true;
            stream.push(Crossing {
                dom: self.key,
                time: t,
                kind: CrossingKind::CpuRequested,
            });
            t += (period - t as i64 % period) as f64 - t.fract();
        }
        added
    }
    /// Processes one crossing of this module at global time `crossing.time`.
    ///
    /// `neighbours` holds the local coincidence lines of the partner modules
    /// that are currently high.
    pub fn add_trigger<R: Rng + ?Sized>(
        &mut self,
        crossing: Crossing,
        neighbours: TriggerMode,
        rng: &mut R,
    ) {
        let global = crossing.time;
        self.update_state(global);
        self.evaluate(global, TriggerMode::empty(), false, rng);

        let lc_off = self.status.lc_mode == LcMode::Off;
        if crossing.kind == CrossingKind::CpuRequested {
            // Beacons never raise the coincidence line.
            if (lc_off || self.pending.is_empty()) && !self.busy {
                self.launch(crossing.time, LaunchKind::CpuRequested, rng);
            }
            return;
        }

        if self.lc_high.is_none_or(|high| global - high > LC_WAIT) {
            self.lc_high = Some(global);
        }

        let lc_neighbour = !neighbours.is_empty();
        self.update_state(global);

        if (lc_off || (lc_neighbour && self.pending.is_empty())) && !self.busy {
            self.launch(crossing.time, LaunchKind::Hlc(neighbours), rng);
        } else if lc_neighbour && !self.busy {
            self.pending.push_back(crossing);
            self.evaluate(global, TriggerMode::empty(), false, rng);
        } else if !self.busy {
            self.pending.push_back(crossing);
        }
    }
    /// Resolves pending crossings at global time `global`, oldest first.
    ///
    /// Crossings seen while busy are dropped. A non-empty `lc_signal` turns
    /// crossings younger than the post window into hard coincidence launches.
    /// Crossings older than the post window, or all of them when `force` is
    /// set, become soft coincidence launches. Resolution stops at the first
    /// crossing that cannot be decided yet.
    pub fn evaluate<R: Rng + ?Sized>(
        &mut self,
        global: f64,
        lc_signal: TriggerMode,
        force: bool,
        rng: &mut R,
    ) {
        while let Some(&crossing) = self.pending.front() {
            self.update_state(crossing.time);
            let age = global - crossing.time;

            if self.busy {
                // dropped
            } else if age < self.status.lc_window_post && !lc_signal.is_empty() {
                if self.atwd_available() {
                    self.launch(crossing.time, LaunchKind::Hlc(lc_signal), rng);
                }
            } else if age > self.status.lc_window_post || force {
                if self.atwd_alive.iter().any(|&alive| alive) {
                    self.launch(crossing.time, LaunchKind::Slc, rng);
                }
            } else {
                break;
            }
            self.pending.pop_front();
        }
        self.update_state(global);
    }
    /// Decides every pending crossing that can be decided at `global`. With
    /// `force`, no crossing is left pending.
    pub fn trigger_launch<R: Rng + ?Sized>(&mut self, global: f64, force: bool, rng: &mut R) {
        self.evaluate(global, TriggerMode::empty(), force, rng);
    }
    /// Clears the launches. A `full` reset also forgets every other piece
    /// of state and samples new clock phases; otherwise only the pulses that
    /// can still affect readouts after `global` are kept.
    pub fn reset<R: Rng + ?Sized>(&mut self, full: bool, global: Option<f64>, rng: &mut R) {
        if full {
            self.atwd_alive = [true; 2];
            self.atwd_dead_to = [None; 2];
            self.busy = false;
            self.busy_to = None;
            self.pending.clear();
            self.lc_high = None;
            self.dom_time = 0.0;
            self.pulses.clear();
            self.sample_phases(rng);
        } else {
            match global {
                Some(global) => self.pulses.retain(|p| p.time > global - PULSE_LOOKBACK),
                None => self.pulses.clear(),
            }
        }
        self.launches.clear();
    }

    fn atwd_on(&self, chip: Atwd) -> bool {
        let status = match chip {
            Atwd::A => self.status.atwd_a,
            Atwd::B => self.status.atwd_b,
        };
        status == OnOff::On
    }

    fn atwd_available(&self) -> bool {
        [Atwd::A, Atwd::B]
            .into_iter()
            .any(|chip| self.atwd_alive[chip.index()] && self.atwd_on(chip))
    }

    fn update_state(&mut self, t: f64) {
        for chip in [Atwd::A, Atwd::B] {
            let c = chip.index();
            self.atwd_alive[c] = match self.atwd_dead_to[c] {
                Some(dead_to) => t > dead_to,
                None => self.atwd_on(chip),
            };
        }
        self.busy = match self.busy_to {
            Some(busy_to) => !(t > busy_to && self.atwd_alive.iter().any(|&alive| alive)),
            None => false,
        };
        self.dom_time = t;
    }

    fn launch<R: Rng + ?Sized>(&mut self, time: f64, kind: LaunchKind, rng: &mut R) {
        let Some(chip) = [Atwd::A, Atwd::B]
            .into_iter()
            .find(|&chip| self.atwd_alive[chip.index()] && self.atwd_on(chip))
        else {
            return;
        };
        let c = chip.index();

        let mut launch = DomLaunch::new(time + self.rapcal_shift);
        launch.which_atwd = chip;

        match kind {
            LaunchKind::Hlc(_) | LaunchKind::CpuRequested => {
                let digitizations: u8 = if let LaunchKind::Hlc(lines) = kind {
                    let mut n = 1;
                    for channel in 0..3 {
                        let overflow = match self.digitize_atwd(time, channel, chip, rng) {
                            Some((samples, overflow)) => {
                                launch.raw_atwd[channel] = samples;
                                overflow
                            }
                            None => false,
                        };
                        if !overflow || channel == 2 {
                            break;
                        }
                        n += 1;
                    }
                    launch.trigger_type = TriggerType::SpeDiscriminator;
                    launch.trigger_mode = TriggerMode::SPE_DISCRIMINATOR | lines;
                    launch.lc_bit = true;
                    n
                } else {
                    for channel in 0..3 {
                        if let Some((samples, _)) = self.digitize_atwd(time, channel, chip, rng) {
                            launch.raw_atwd[channel] = samples;
                        }
                    }
                    launch.trigger_type = TriggerType::CpuRequested;
                    launch.trigger_mode = TriggerMode::empty();
                    launch.lc_bit = false;
                    3
                };
                launch.raw_fadc = self.digitize_fadc(time, FADC_BINS, rng);

                let n = f64::from(digitizations);
                self.atwd_dead_to[c] = Some(
                    self.dom_time
                        + n * ATWD_READOUT_DIGITIZE_TIME
                        + ATWD_RESTART_TIME
                        + (4.0 - n) * ATWD_CLEAR_TIME,
                );
                self.atwd_alive[c] = false;
                self.busy_to = Some(time + HLC_READOUT_TIME);

                let (bin, stamp) = charge_stamp(&launch.raw_fadc);
                launch.charge_stamp_bin = bin;
                launch.raw_charge_stamp = stamp;
            }
            LaunchKind::Slc => {
                // All four channels are cleared, none digitized.
                self.atwd_dead_to[c] = Some(
                    self.dom_time
                        + self.cable_correction
                        + 5.0 * CLOCK_CYCLE
                        + 4.0 * ATWD_CLEAR_TIME
                        + ATWD_RESTART_TIME,
                );
                self.busy_to = Some(time + self.cable_correction + 7.0 * CLOCK_CYCLE);
                launch.trigger_type = TriggerType::SpeDiscriminator;
                launch.trigger_mode = TriggerMode::SPE_DISCRIMINATOR;
                launch.lc_bit = false;

                let fadc = self.digitize_fadc(time, CHARGE_STAMP_BINS, rng);
                let (bin, stamp) = charge_stamp(&fadc);
                launch.charge_stamp_bin = bin;
                launch.raw_charge_stamp = stamp;
            }
        }

        self.busy = true;
        self.launches.push(launch);
    }
    /// Digitizes one ATWD channel. Returns the samples and whether any
    /// sample exceeded the overflow threshold, or `None` if the channel
    /// cannot be simulated.
    fn digitize_atwd<R: Rng + ?Sized>(
        &self,
        time: f64,
        channel: usize,
        chip: Atwd,
        rng: &mut R,
    ) -> Option<(Vec<u16>, bool)> {
        let c = chip.index();
        if self.cal.spe_mean.is_nan() {
            warn!(dom = %self.key, "NaN SPE mean");
            return None;
        }
        if self.cal.atwd_gain[channel].is_nan() {
            warn!(dom = %self.key, channel, "NaN ATWD gain");
            return None;
        }

        let transit = self.cal.transit_time + self.cal.atwd_delta_t[c];
        let norm = self.cal.spe_mean * self.cal.atwd_gain[channel] * self.cal.front_end_impedance;
        let bin_width = 1.0 / self.cal.atwd_sampling_rate[c];
        let slope = self.cal.atwd_bin_calib_slope[c][channel];
        let baseline = self.cal.atwd_baseline[c][channel];
        let template = &self.cal.templates.atwd[channel];

        let mut overflow = false;
        let samples = (0..ATWD_BINS)
            .map(|i| {
                let t = time + (i + 1) as f64 * bin_width - transit;
                let volts = norm * amplitude(&self.pulses, t, template) * MILLIVOLT;
                let noise: f64 = StandardNormal.sample(rng);
                let counts = (volts / slope + ATWD_NOISE * noise + baseline).trunc();
                if counts > ATWD_THRESHOLD {
                    overflow = true;
                }
                counts.clamp(0.0, DYNAMIC_RANGE) as u16
            })
            .collect();
        Some((samples, overflow))
    }

    fn digitize_fadc<R: Rng + ?Sized>(&self, time: f64, bins: usize, rng: &mut R) -> Vec<u16> {
        let transit = self.cal.transit_time - self.cal.fadc_delta_t;
        let norm = self.cal.spe_mean * self.cal.front_end_impedance;
        let template = &self.cal.templates.fadc;

        (0..bins)
            .map(|i| {
                let t = time + (i + 1) as f64 * CLOCK_CYCLE - transit;
                let volts = norm * amplitude(&self.pulses, t, template) * MILLIVOLT;
                let noise: f64 = StandardNormal.sample(rng);
                let counts = (volts / self.cal.fadc_gain + self.cal.fadc_baseline + FADC_NOISE * noise)
                    .trunc();
                counts.clamp(0.0, DYNAMIC_RANGE) as u16
            })
            .collect()
    }
}

/// Charge weighted sum of the pulse shapes at time `t`. `pulses` must be
/// sorted by time.
fn amplitude(pulses: &[McPulse], t: f64, template: &impl PulseTemplate) -> f64 {
    let from = pulses.partition_point(|p| p.time < t - PULSE_LOOKBACK);
    let to = pulses.partition_point(|p| p.time <= t + PULSE_LOOKAHEAD);
    pulses[from..to.max(from)]
        .iter()
        .map(|p| p.charge * template.amplitude(t - p.time))
        .sum()
}

/// Time of the template maximum: a 1 ns scan followed by bisection on the
/// sign of the slope.
fn template_peak(template: &impl PulseTemplate) -> f64 {
    const EPSILON: f64 = 1e-6;
    const H: f64 = EPSILON * 0.1;

    let mut index = 0;
    let mut max = 0.0;
    for i in -40..40 {
        let a = template.amplitude(f64::from(i));
        if a > max {
            max = a;
            index = i;
        }
    }

    let slope = |t: f64| template.amplitude(t) - template.amplitude(t + H);
    let mut left = f64::from(index - 3);
    let mut right = f64::from(index + 3);
    let mut middle = left + (right - left) / 2.0;
    while right - left > EPSILON {
        middle = left + (right - left) / 2.0;
        if slope(middle) * slope(right) < 0.0 {
            left = middle;
        } else {
            right = middle;
        }
    }
    middle
}

/// Three FADC samples around the largest of the first bins, and the bin of
/// the first one.
fn charge_stamp(fadc: &[u16]) -> (usize, Vec<u16>) {
    let head = &fadc[..fadc.len().min(CHARGE_STAMP_BINS)];
    let peak = head
        .iter()
        .enumerate()
        .max_by_key(|&(_, &counts)| counts)
        .map_or(0, |(i, _)| i);
    let start = peak.saturating_sub(1).min(head.len().saturating_sub(3));
    let stop = (start + 3).min(head.len());
    (start, head[start..stop].to_vec())
}
