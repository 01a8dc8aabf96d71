use crate::detector::{CalibrationMap, Geometry};
use crate::domset::DomSets;
use crate::error::Error;
use crate::launch::LaunchMap;
use crate::launcher::{DomLauncher, LauncherOutput};
use crate::pulse::McPulseMap;
use crate::status::{DetectorStatus, ReadoutConfig};
use crate::trigger::global::{prune_launches, GlobalTriggerSim};
use crate::trigger::hierarchy::TriggerHierarchy;
use crate::trigger::{Trigger, TriggerAlgorithm, TriggerContext};
use crate::wavedeform::{Wavedeform, WavedeformOutput};
use crate::waveform::{calibrate, waveform_range};
use bon::bon;
use tracing::{debug, instrument};

/// Geometry, calibration and per-module status containers.
pub mod detector;
/// Named module sets.
pub mod domset;
pub mod error;
/// Trigger hits.
pub mod hit;
/// Module keys and positions.
pub mod key;
/// Module readouts.
pub mod launch;
/// Discriminator and local coincidence simulation.
pub mod launcher;
/// Non-negative least squares.
pub mod nnls;
/// Simulated and reconstructed pulses.
pub mod pulse;
/// Sparse matrices.
pub mod sparse;
/// Detector status and its text format.
pub mod status;
/// Time window grouping of hits.
pub mod time_window;
/// Trigger algorithms and the global trigger.
pub mod trigger;
/// Waveform unfolding.
pub mod wavedeform;
/// Calibrated waveforms.
pub mod waveform;

/// A trait that defines the interface for an observer of the readout chain.
///
/// The default implementation of all methods is a no-op. Users are expected to
/// override the methods they are interested in. `frame` counts the frames
/// passed to [`World::run`] from zero.
#[allow(unused_variables)]
pub trait Observer {
    /// Called with the launches of every module in a frame.
    fn on_launches(&mut self, frame: usize, output: &LauncherOutput) {}
    /// Called with the triggers of all algorithms, in the order the
    /// algorithms were added.
    fn on_triggers(&mut self, frame: usize, triggers: &[Trigger]) {}
    /// Called with the global trigger hierarchy of a frame.
    fn on_hierarchy(&mut self, frame: usize, hierarchy: &TriggerHierarchy) {}
    /// Called with the launches inside the readout windows.
    fn on_readout(&mut self, frame: usize, launches: &LaunchMap) {}
    /// Called with the pulses unfolded from the read out launches.
    fn on_pulses(&mut self, frame: usize, pulses: &WavedeformOutput) {}
}

/// The full chain from PMT pulses to triggers and unfolded pulses.
pub struct World<O> {
    triggers: Vec<Box<dyn TriggerAlgorithm>>,
    launcher: DomLauncher,
    wavedeform: Wavedeform,
    geometry: Geometry,
    calibration: CalibrationMap,
    status: DetectorStatus,
    dom_sets: Option<DomSets>,
    default_readout: Option<ReadoutConfig>,
    observer: O,
}

#[bon]
impl<O> World<O> {
    #[builder]
    pub fn new(
        #[builder(field)] triggers: Vec<Box<dyn TriggerAlgorithm>>,
        geometry: Geometry,
        calibration: CalibrationMap,
        status: DetectorStatus,
        // Explicit module sets. The built-in definitions apply without one.
        dom_sets: Option<DomSets>,
        // Readout window of triggers without one in the status.
        default_readout: Option<ReadoutConfig>,
        #[builder(default)] wavedeform: Wavedeform,
        #[builder(default)] multi_frame_events: bool,
        #[builder(default = true)] beacon_launches: bool,
        seed: Option<u64>,
        observer: O,
    ) -> Result<Self, Error> {
        let launcher = DomLauncher::builder()
            .geometry(&geometry)
            .calibration(&calibration)
            .status(&status)
            .multi_frame_events(multi_frame_events)
            .beacon_launches(beacon_launches)
            .maybe_seed(seed)
            .build()?;

        Ok(Self {
            triggers,
            launcher,
            wavedeform,
            geometry,
            calibration,
            status,
            dom_sets,
            default_readout,
            observer,
        })
    }
}

impl<O, S: world_builder::State> WorldBuilder<O, S> {
    /// Add a trigger algorithm to the [`World`].
    pub fn add_trigger<T>(mut self, trigger: T) -> Self
    where
        T: TriggerAlgorithm + 'static,
    {
        self.triggers.push(Box::new(trigger));
        self
    }
}

impl<O: Observer> World<O> {
    /// Runs every frame through the readout chain and returns the observer.
    ///
    /// Frames without a global trigger are not read out.
    pub fn run<I>(mut self, frames: I) -> Result<O, Error>
    where
        I: IntoIterator<Item = McPulseMap>,
    {
        for (frame, pulses) in frames.into_iter().enumerate() {
            self.process(frame, &pulses)?;
        }
        Ok(self.observer)
    }

    #[instrument(skip(self, pulses), fields(doms = pulses.len()))]
    fn process(&mut self, frame: usize, pulses: &McPulseMap) -> Result<(), Error> {
        let output = self.launcher.process(pulses)?;
        self.observer.on_launches(frame, &output);

        let context = TriggerContext {
            geometry: &self.geometry,
            dom_sets: self.dom_sets.as_ref(),
        };
        let triggers: Vec<Trigger> = self
            .triggers
            .iter_mut()
            .flat_map(|algorithm| algorithm.run(&output.launches, &context))
            .collect();
        self.observer.on_triggers(frame, &triggers);

        let global = GlobalTriggerSim::new(&self.status, self.default_readout);
        let pairs = global.insert_throughput_triggers(&triggers)?;
        let hierarchy = global.merge(&pairs);
        self.observer.on_hierarchy(frame, &hierarchy);
        if hierarchy.is_empty() {
            debug!("no global trigger");
            return Ok(());
        }

        let readout = prune_launches(&output.launches, &hierarchy, global.readout());
        self.observer.on_readout(frame, &readout);

        let waveforms = calibrate(&readout, &self.calibration)?;
        let Some(range) = waveform_range(&waveforms) else {
            return Ok(());
        };
        let pulses = self
            .wavedeform
            .process(&waveforms, &self.calibration, &self.status, range)?;
        self.observer.on_pulses(frame, &pulses);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{DomCalibration, DomStatus, OmGeo, OmType, ToroidType};
    use crate::error::LauncherError;
    use crate::key::{OmKey, Position};
    use crate::pulse::McPulse;
    use crate::status::{Subdetector, TriggerStatus};
    use crate::trigger::smt::SimpleMajorityTrigger;
    use crate::trigger::{SourceId, TriggerKey, TypeId};

    #[derive(Default)]
    struct TestObserver {
        launches: Vec<usize>,
        triggers: Vec<Trigger>,
        roots: Vec<usize>,
        readout: Vec<usize>,
        pulses: Vec<WavedeformOutput>,
    }

    impl Observer for TestObserver {
        fn on_launches(&mut self, _: usize, output: &LauncherOutput) {
            self.launches.push(output.launches.values().map(Vec::len).sum());
        }

        fn on_triggers(&mut self, _: usize, triggers: &[Trigger]) {
            self.triggers.extend_from_slice(triggers);
        }

        fn on_hierarchy(&mut self, _: usize, hierarchy: &TriggerHierarchy) {
            self.roots.push(hierarchy.roots().len());
        }

        fn on_readout(&mut self, _: usize, launches: &LaunchMap) {
            self.readout.push(launches.len());
        }

        fn on_pulses(&mut self, _: usize, pulses: &WavedeformOutput) {
            self.pulses.push(pulses.clone());
        }
    }

    const SMT: TriggerKey = TriggerKey::new(SourceId::InIce, TypeId::SimpleMultiplicity, Some(1006));

    // One string of ten modules with a three-fold majority trigger.
    fn world() -> World<TestObserver> {
        let mut geometry = Geometry::default();
        let mut calibration = CalibrationMap::new();
        let mut status = DetectorStatus::default();
        for om in 1..=10 {
            let key = OmKey::new(1, om);
            geometry.omgeo.insert(
                key,
                OmGeo {
                    position: Position::new(0.0, 0.0, -17.0 * om as f64),
                    om_type: OmType::IceCube,
                },
            );
            calibration.insert(key, DomCalibration::nominal(ToroidType::New));
            status.dom_status.insert(key, DomStatus::default());
        }
        status.triggers.insert(
            SMT,
            TriggerStatus::default()
                .with_setting("threshold", 3)
                .with_setting("timeWindow", 5000)
                .with_readout(Subdetector::All, ReadoutConfig::new(4000.0, 6000.0, 0.0)),
        );
        let smt = SimpleMajorityTrigger::from_status(&status, SourceId::InIce, None).unwrap();

        World::builder()
            .add_trigger(smt)
            .geometry(geometry)
            .calibration(calibration)
            .status(status)
            .beacon_launches(false)
            .seed(7)
            .observer(TestObserver::default())
            .build()
            .unwrap()
    }

    fn track(oms: impl IntoIterator<Item = u32>) -> McPulseMap {
        oms.into_iter()
            .map(|om| {
                let pulses = vec![McPulse::new(1000.0 + 10.0 * om as f64, 5.0)];
                (OmKey::new(1, om), pulses)
            })
            .collect()
    }

    #[test]
    fn triggered_frame_is_read_out() {
        let observer = world().run([track(3..=7)]).unwrap();

        assert_eq!(observer.launches, vec![5]);
        assert_eq!(observer.triggers.len(), 1);
        assert_eq!(observer.triggers[0].key, SMT);
        assert_eq!(observer.roots, vec![1]);
        assert_eq!(observer.readout, vec![5]);

        let pulses = &observer.pulses[0].pulses;
        assert_eq!(pulses.len(), 5);
        let charge: f32 = pulses[&OmKey::new(1, 5)].iter().map(|p| p.charge).sum();
        assert!(charge > 0.0);
    }

    #[test]
    fn quiet_frame_is_not_read_out() {
        let frames = [McPulseMap::new(), track([2])];
        let observer = world().run(frames).unwrap();

        assert_eq!(observer.launches, vec![0, 1]);
        assert!(observer.triggers.is_empty());
        assert_eq!(observer.roots, vec![0, 0]);
        assert!(observer.readout.is_empty());
        assert!(observer.pulses.is_empty());
    }

    #[test]
    fn unknown_module_aborts() {
        let mut frame = track(3..=5);
        frame.insert(OmKey::new(2, 1), vec![McPulse::new(1000.0, 1.0)]);

        let result = world().run([frame]);
        assert!(matches!(
            result,
            Err(Error::Launcher(LauncherError::UnknownDom(dom))) if dom == OmKey::new(2, 1)
        ));
    }
}
