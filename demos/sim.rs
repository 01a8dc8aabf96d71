/// This is a general example of how you would typically set up a readout
/// simulation: a small detector, a handful of vertical muons, and the
/// standard in-ice trigger configuration.
use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Exp};
use std::collections::BTreeMap;
use trigsim::detector::{
    CalibrationMap, DomCalibration, DomStatus, Geometry, OmGeo, OmType, ToroidType,
};
use trigsim::key::{OmKey, Position};
use trigsim::launcher::LauncherOutput;
use trigsim::pulse::{McPulse, McPulseMap};
use trigsim::status::{DetectorStatus, TriggerStatusMap};
use trigsim::trigger::cluster::ClusterTrigger;
use trigsim::trigger::cylinder::CylinderTrigger;
use trigsim::trigger::hierarchy::TriggerHierarchy;
use trigsim::trigger::smt::SimpleMajorityTrigger;
use trigsim::trigger::{SourceId, Trigger};
use trigsim::wavedeform::WavedeformOutput;
use trigsim::{Observer, World};
use uom::si::f64::{Length, Time, Velocity};
use uom::si::{length::meter, ratio::ratio, time::nanosecond, velocity::meter_per_second};

const STATUS: &str = "
trigger IN_ICE SIMPLE_MULTIPLICITY 1006
setting threshold 8
setting timeWindow 5000
readout ALL 4000 6000 0

trigger IN_ICE STRING 1007
setting multiplicity 5
setting timeWindow 1500
setting coherenceLength 7
readout ALL 4000 6000 0

trigger IN_ICE VOLUME 21001
setting timeWindow 1000
setting multiplicity 4
setting radius 175
setting height 75
setting simpleMultiplicity 8
readout ALL 4000 6000 0
";

#[derive(Default)]
struct Summary {
    launches: usize,
    hlc: usize,
    triggers: BTreeMap<String, usize>,
    global: usize,
    merged: usize,
    pulses: usize,
    charge: f64,
}

impl Observer for Summary {
    fn on_launches(&mut self, _: usize, output: &LauncherOutput) {
        for launch in output.launches.values().flatten() {
            self.launches += 1;
            self.hlc += usize::from(launch.lc_bit);
        }
    }

    fn on_triggers(&mut self, _: usize, triggers: &[Trigger]) {
        for trigger in triggers {
            *self.triggers.entry(trigger.key.to_string()).or_default() += 1;
        }
    }

    fn on_hierarchy(&mut self, _: usize, hierarchy: &TriggerHierarchy) {
        for &root in hierarchy.roots() {
            self.global += 1;
            self.merged += usize::from(hierarchy.children(root).len() > 1);
        }
    }

    fn on_pulses(&mut self, _: usize, output: &WavedeformOutput) {
        for pulse in output.pulses.values().flatten() {
            self.pulses += 1;
            self.charge += f64::from(pulse.charge);
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // ===========================================
    // These are most likely your free parameters:
    let n_events = 20;
    let string_spacing = Length::new::<meter>(125.0);
    let dom_spacing = Length::new::<meter>(17.0);
    // ===========================================

    // ===========================================
    // Then, these are properties of the ice and the muons:
    let attenuation = Length::new::<meter>(30.0);
    let light_yield = 25.0;
    let speed_of_light = Velocity::new::<meter_per_second>(2.998e8);
    let group_velocity = speed_of_light / 1.35;
    let scattering_delay = Time::new::<nanosecond>(20.0);
    // ===========================================

    let mut geometry = Geometry::default();
    let mut calibration = CalibrationMap::new();
    let mut dom_status = BTreeMap::new();
    // Two rows of strings on a triangular grid.
    for string in 1..=10 {
        let row = f64::from((string - 1) / 5);
        let column = f64::from((string - 1) % 5) + row / 2.0;
        let x = column * string_spacing.get::<meter>();
        let y = row * string_spacing.get::<meter>() * 3f64.sqrt() / 2.0;
        for om in 1..=60 {
            let key = OmKey::new(string, om);
            let z = 500.0 - f64::from(om) * dom_spacing.get::<meter>();
            geometry.omgeo.insert(
                key,
                OmGeo {
                    position: Position::new(x, y, z),
                    om_type: OmType::IceCube,
                },
            );
            calibration.insert(key, DomCalibration::nominal(ToroidType::New));
            dom_status.insert(key, DomStatus::default());
        }
    }
    let status = DetectorStatus {
        triggers: STATUS.parse::<TriggerStatusMap>()?,
        dom_status,
    };

    let mut rng = StdRng::seed_from_u64(1);
    let delay = Exp::new(1.0 / scattering_delay.get::<nanosecond>())?;
    let frames: Vec<McPulseMap> = (0..n_events)
        .map(|_| {
            // A vertical muon through the footprint of the detector.
            let x = rng.random::<f64>() * 5.0 * string_spacing.get::<meter>();
            let y = rng.random::<f64>() * 2.0 * string_spacing.get::<meter>();
            let t0 = 10_000.0;

            let mut frame = McPulseMap::new();
            for (&key, geo) in &geometry.omgeo {
                let p = geo.position;
                let track = Position::new(x, y, p.z);
                let distance = Length::new::<meter>(p.horizontal_distance(&track));
                let expected = light_yield * (-(distance / attenuation).get::<ratio>()).exp();
                let n = (expected + rng.random::<f64>()).floor() as usize;
                if n == 0 {
                    continue;
                }

                let arrival = t0
                    + (500.0 - p.z) / speed_of_light.get::<meter_per_second>() * 1e9
                    + (distance / group_velocity).get::<nanosecond>();
                let mut pulses: Vec<McPulse> = (0..n)
                    .map(|_| McPulse::new(arrival + delay.sample(&mut rng), 1.0))
                    .collect();
                pulses.sort_by(|a, b| a.time.total_cmp(&b.time));
                frame.insert(key, pulses);
            }
            frame
        })
        .collect();

    let summary = World::builder()
        .add_trigger(SimpleMajorityTrigger::from_status(&status, SourceId::InIce, None)?)
        .add_trigger(ClusterTrigger::from_status(&status, None)?)
        .add_trigger(CylinderTrigger::from_status(&status, None)?)
        .geometry(geometry)
        .calibration(calibration)
        .status(status)
        .seed(2)
        .observer(Summary::default())
        .build()?
        .run(frames)?;

    println!("launches: {} ({} HLC)", summary.launches, summary.hlc);
    for (key, count) in &summary.triggers {
        println!("{key}: {count}");
    }
    println!("global triggers: {} ({} merged)", summary.global, summary.merged);
    println!("pulses: {} ({:.1} PE)", summary.pulses, summary.charge);

    Ok(())
}
