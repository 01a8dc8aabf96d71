//! Turns simulated PMT pulses into module launches.
//!
//! Every configured module is simulated by a [`Dom`]. For each frame the
//! discriminator of every module with pulses is run first, then all crossings
//! of the detector are replayed in time order so that local coincidence
//! between neighbours is resolved causally.
use crate::detector::{CalibrationMap, Geometry, OmType};
use crate::error::LauncherError;
use crate::key::OmKey;
use crate::launch::{LaunchMap, TriggerMode};
use crate::pulse::McPulseMap;
use crate::status::DetectorStatus;
use bon::bon;
use dom::{Crossing, CrossingKind, Dom, ModuleKind};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, instrument, warn};

/// Per-module discriminator and launch state machine.
pub mod dom;

const MAX_FRAME_SPAN: f64 = 60e9;

/// Discriminator crossing times per module.
pub type DotMap = BTreeMap<OmKey, Vec<f64>>;

/// Result of processing one frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LauncherOutput {
    pub launches: LaunchMap,
    /// Every crossing of the frame, beacons included, when requested.
    pub dot: Option<DotMap>,
}

/// Arena of module states with the local coincidence links between them.
#[derive(Debug)]
pub struct DomLauncher {
    doms: Vec<Dom>,
    index: BTreeMap<OmKey, usize>,
    // Partners each module listens to, with the line their signal uses.
    links: Vec<Vec<(usize, TriggerMode)>>,
    active: BTreeSet<usize>,
    global_time: Option<f64>,
    multi_frame_events: bool,
    beacon_launches: bool,
    dot_output: bool,
    rng: StdRng,
}

#[bon]
impl DomLauncher {
    /// Configures one [`Dom`] per module found in both the calibration and
    /// the detector status.
    ///
    /// Modules with zero high voltage are skipped. A negative or NaN high
    /// voltage is an error.
    #[builder]
    pub fn new(
        geometry: &Geometry,
        calibration: &CalibrationMap,
        status: &DetectorStatus,
        // Keep module state across frames instead of forcing every decision
        // at the end of each frame.
        #[builder(default)]
        multi_frame_events: bool,
        #[builder(default = true)] beacon_launches: bool,
        // Hz.
        #[builder(default = 0.6)]
        beacon_launch_rate: f64,
        // Report the discriminator crossings of each frame.
        #[builder(default)]
        dot_output: bool,
        seed: Option<u64>,
    ) -> Result<Self, LauncherError> {
        info!("configuring modules");
        let mut rng = seed.map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64);

        let mut doms = Vec::new();
        let mut index = BTreeMap::new();
        for (&key, cal) in calibration {
            let Some(dom_status) = status.dom_status.get(&key) else {
                debug!(dom = %key, "not in the detector status");
                continue;
            };
            let voltage = dom_status.pmt_hv;
            if voltage == 0.0 {
                debug!(dom = %key, "disabled (zero high voltage), skipping");
                continue;
            } else if voltage < 0.0 || voltage.is_nan() {
                return Err(LauncherError::InvalidHighVoltage { dom: key, voltage });
            }

            let Some(omgeo) = geometry.omgeo.get(&key) else {
                error!(dom = %key, "not in the geometry");
                continue;
            };
            let kind = match omgeo.om_type {
                OmType::IceCube => ModuleKind::InIce,
                OmType::IceTop => ModuleKind::IceTop,
                other => {
                    error!(dom = %key, om_type = ?other, "unsupported module type");
                    continue;
                }
            };

            match Dom::configure(key, kind, cal, dom_status, beacon_launch_rate, &mut rng) {
                Some(dom) => {
                    index.insert(key, doms.len());
                    doms.push(dom);
                }
                None => error!(dom = %key, "module was not configured, skipping"),
            }
        }

        let links = doms
            .iter()
            .map(|dom| {
                dom.kind()
                    .lc_partners(dom.key(), dom.status())
                    .into_iter()
                    .filter_map(|(partner, line)| index.get(&partner).map(|&id| (id, line)))
                    .collect()
            })
            .collect();
        debug!(doms = doms.len(), "modules configured");

        Ok(Self {
            doms,
            index,
            links,
            active: BTreeSet::new(),
            global_time: None,
            multi_frame_events,
            beacon_launches: beacon_launches && beacon_launch_rate > 0.0,
            dot_output,
            rng,
        })
    }
}

impl DomLauncher {
    pub fn len(&self) -> usize {
        self.doms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doms.is_empty()
    }

    pub fn contains(&self, dom: &OmKey) -> bool {
        self.index.contains_key(dom)
    }
    /// Simulates the launches of one frame of pulses.
    ///
    /// # Examples
    ///
    /// ```
    /// use trigsim::detector::{DomCalibration, Geometry, OmGeo, OmType, ToroidType};
    /// use trigsim::key::{OmKey, Position};
    /// use trigsim::launcher::DomLauncher;
    /// use trigsim::pulse::{McPulse, McPulseMap};
    /// use trigsim::status::DetectorStatus;
    ///
    /// let key = OmKey::new(1, 1);
    /// let mut geometry = Geometry::default();
    /// geometry.omgeo.insert(key, OmGeo { position: Position::default(), om_type: OmType::IceCube });
    /// let calibration = [(key, DomCalibration::nominal(ToroidType::New))].into();
    /// let mut status = DetectorStatus::default();
    /// status.dom_status.insert(key, Default::default());
    ///
    /// let mut launcher = DomLauncher::builder()
    ///     .geometry(&geometry)
    ///     .calibration(&calibration)
    ///     .status(&status)
    ///     .beacon_launches(false)
    ///     .seed(7)
    ///     .build()?;
    ///
    /// let pulses = McPulseMap::from([(key, vec![McPulse::new(100.0, 1.0)])]);
    /// let output = launcher.process(&pulses)?;
    /// // Without a neighbour the launch is a soft local coincidence.
    /// assert!(!output.launches[&key][0].lc_bit);
    /// # Ok::<(), trigsim::error::LauncherError>(())
    /// ```
    #[instrument(skip_all, fields(doms = pulses.len()))]
    pub fn process(&mut self, pulses: &McPulseMap) -> Result<LauncherOutput, LauncherError> {
        let mut stream = Vec::new();
        let mut start = f64::INFINITY;
        let mut end = f64::NEG_INFINITY;

        for (key, series) in pulses {
            let Some(&id) = self.index.get(key) else {
                return Err(LauncherError::UnknownDom(*key));
            };
            for pulse in series {
                start = start.min(pulse.time);
                end = end.max(pulse.time);
            }
            if !series.is_empty() {
                self.doms[id].discriminator(series, &mut stream);
            }
            self.active.insert(id);
        }
        if end - start > MAX_FRAME_SPAN {
            warn!(span_s = (end - start) * 1e-9, "pulses cover more than one minute");
        }

        if self.beacon_launches {
            for (id, dom) in self.doms.iter().enumerate() {
                if dom.add_beacon_launches(start, end, &mut stream) {
                    self.active.insert(id);
                }
            }
        }
        debug!(crossings = stream.len(), "replaying crossings");

        stream.sort_by(|a, b| a.time.total_cmp(&b.time));
        let dot = self.dot_output.then(|| {
            let mut dot = DotMap::new();
            for crossing in &stream {
                dot.entry(crossing.dom).or_default().push(crossing.time);
            }
            dot
        });

        for crossing in stream {
            self.add_trigger(crossing);
        }

        let force = !self.multi_frame_events;
        if let Some(global) = self.global_time {
            for &id in &self.active {
                self.doms[id].trigger_launch(global, force, &mut self.rng);
            }
        }

        let mut launches = LaunchMap::new();
        for &id in &self.active {
            let dom = &mut self.doms[id];
            let dom_launches = dom.take_launches();
            if !dom_launches.is_empty() {
                launches.insert(dom.key(), dom_launches);
            }
        }

        let full = !self.multi_frame_events;
        for &id in &self.active {
            self.doms[id].reset(full, self.global_time, &mut self.rng);
        }
        if full {
            self.global_time = None;
        }
        let doms = &self.doms;
        self.active.retain(|&id| doms[id].is_active());
        debug!(launching = launches.len(), "frame done");

        Ok(LauncherOutput { launches, dot })
    }
    /// Hands a crossing to its module, then lets the partners listening to
    /// that module react to its coincidence signal.
    fn add_trigger(&mut self, crossing: Crossing) {
        let Some(&id) = self.index.get(&crossing.dom) else {
            return;
        };
        let global = crossing.time;
        self.global_time = Some(global);

        let pre = self.doms[id].status().lc_window_pre;
        let mut lines = TriggerMode::empty();
        for &(partner, line) in &self.links[id] {
            if self.doms[partner]
                .lc_high()
                .is_some_and(|high| high > global - pre)
            {
                lines |= line;
            }
        }
        self.doms[id].add_trigger(crossing, lines, &mut self.rng);

        if crossing.kind != CrossingKind::Discriminator {
            return;
        }
        for &(partner, _) in &self.links[id] {
            // Only partners that listen to this module see its signal.
            let Some(&(_, line)) = self.links[partner].iter().find(|(other, _)| *other == id)
            else {
                continue;
            };
            self.doms[partner].evaluate(global, line, false, &mut self.rng);
        }
    }
}
