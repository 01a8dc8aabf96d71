use crate::error::GlobalTriggerError;
use crate::launch::LaunchMap;
use crate::status::{DetectorStatus, ReadoutConfig, Subdetector, TriggerStatusMap};
use crate::trigger::hierarchy::TriggerHierarchy;
use crate::trigger::{SourceId, Trigger, TriggerKey, TypeId};
use tracing::{debug, error, instrument};

const THROUGHPUT: TriggerKey = TriggerKey::new(SourceId::Global, TypeId::Throughput, None);
const MERGED: TriggerKey = TriggerKey::new(SourceId::Global, TypeId::Merged, None);

/// Computes which part of the detector is read out for a trigger.
#[derive(Clone, Copy, Debug)]
pub struct ReadoutWindow<'a> {
    triggers: &'a TriggerStatusMap,
}

impl<'a> ReadoutWindow<'a> {
    pub fn new(status: &'a DetectorStatus) -> Self {
        Self {
            triggers: &status.triggers,
        }
    }
    /// Readout window `(start, stop)` of `subdetector` for `trigger`.
    ///
    /// A readout configuration for [`Subdetector::All`] takes precedence over
    /// the one for the requested subdetector. Returns `None` if the trigger
    /// key is unknown or has neither.
    ///
    /// # Examples
    ///
    /// ```
    /// use trigsim::status::{DetectorStatus, ReadoutConfig, Subdetector, TriggerStatus};
    /// use trigsim::trigger::global::ReadoutWindow;
    /// use trigsim::trigger::{SourceId, Trigger, TriggerKey, TypeId};
    ///
    /// let key = TriggerKey::new(SourceId::InIce, TypeId::SimpleMultiplicity, Some(1006));
    /// let mut status = DetectorStatus::default();
    /// status.triggers.insert(
    ///     key,
    ///     TriggerStatus::default()
    ///         .with_readout(Subdetector::All, ReadoutConfig::new(4000.0, 6000.0, 500.0)),
    /// );
    ///
    /// let readout = ReadoutWindow::new(&status);
    /// let trigger = Trigger::new(key, 100.0, 50.0);
    /// assert_eq!(readout.in_ice(&trigger), Some((-3900.0, 6150.0)));
    /// assert_eq!(readout.ice_top(&trigger), Some((-3400.0, 6600.0)));
    /// ```
    pub fn window(&self, subdetector: Subdetector, trigger: &Trigger) -> Option<(f64, f64)> {
        let Some(status) = self.triggers.get(&trigger.key) else {
            debug!(key = %trigger.key, "no trigger status for readout window");
            return None;
        };
        let config = status
            .readout
            .get(&Subdetector::All)
            .or_else(|| status.readout.get(&subdetector))?;

        let same_subdetector = match trigger.key.source {
            SourceId::InIce => matches!(subdetector, Subdetector::InIce | Subdetector::All),
            SourceId::IceTop => matches!(subdetector, Subdetector::IceTop | Subdetector::All),
            _ => false,
        };
        Some(if same_subdetector {
            (trigger.time - config.minus, trigger.end() + config.plus)
        } else {
            let shifted = trigger.time + config.offset;
            (shifted - config.minus, shifted + config.plus)
        })
    }

    pub fn in_ice(&self, trigger: &Trigger) -> Option<(f64, f64)> {
        self.window(Subdetector::InIce, trigger)
    }

    pub fn ice_top(&self, trigger: &Trigger) -> Option<(f64, f64)> {
        self.window(Subdetector::IceTop, trigger)
    }
    /// Earliest start over the in-ice and surface windows that exist.
    pub fn earliest(&self, trigger: &Trigger) -> Option<f64> {
        [self.in_ice(trigger), self.ice_top(trigger)]
            .into_iter()
            .flatten()
            .map(|(start, _)| start)
            .reduce(f64::min)
    }
    /// Latest stop over the in-ice and surface windows that exist.
    pub fn latest(&self, trigger: &Trigger) -> Option<f64> {
        [self.in_ice(trigger), self.ice_top(trigger)]
            .into_iter()
            .flatten()
            .map(|(_, stop)| stop)
            .reduce(f64::max)
    }
}

/// Combines the triggers of all subdetectors into the global trigger
/// hierarchy.
#[derive(Clone, Debug)]
pub struct GlobalTriggerSim<'a> {
    readout: ReadoutWindow<'a>,
    default_readout: Option<ReadoutConfig>,
}

impl<'a> GlobalTriggerSim<'a> {
    /// `default_readout` is used for triggers whose key has no readout
    /// configuration.
    pub fn new(status: &'a DetectorStatus, default_readout: Option<ReadoutConfig>) -> Self {
        Self {
            readout: ReadoutWindow::new(status),
            default_readout,
        }
    }

    pub fn readout(&self) -> &ReadoutWindow<'a> {
        &self.readout
    }
    /// Pairs every in-ice and surface trigger with a global throughput
    /// trigger covering its full readout window.
    ///
    /// Triggers are processed in time order; triggers from other sources are
    /// skipped. The default readout only applies to triggers without any
    /// readout window. A trigger with a window for one subdetector uses that
    /// window on both sides.
    #[instrument(skip_all, fields(triggers = triggers.len()))]
    pub fn insert_throughput_triggers(
        &self,
        triggers: &[Trigger],
    ) -> Result<Vec<(Trigger, Trigger)>, GlobalTriggerError> {
        let mut sorted = triggers.to_vec();
        sorted.sort_by(|a, b| a.time.total_cmp(&b.time));

        let mut pairs = Vec::with_capacity(sorted.len());
        for trigger in sorted {
            if !matches!(trigger.key.source, SourceId::InIce | SourceId::IceTop) {
                error!(key = %trigger.key, "only IN_ICE and ICE_TOP triggers get a readout; skipping");
                continue;
            }

            let window = match (self.readout.earliest(&trigger), self.readout.latest(&trigger)) {
                (Some(start), Some(stop)) => (start, stop),
                _ => {
                    let default = self
                        .default_readout
                        .ok_or(GlobalTriggerError::NoReadoutWindow(trigger.key))?;
                    debug!(key = %trigger.key, "using the default readout window");
                    (trigger.time - default.minus, trigger.end() + default.plus)
                }
            };
            let throughput = Trigger::new(THROUGHPUT, window.0, window.1 - window.0);
            pairs.push((throughput, trigger));
        }
        Ok(pairs)
    }
    /// Builds the global trigger hierarchy from `(throughput, trigger)` pairs.
    ///
    /// Throughput triggers whose windows overlap, directly or through a chain
    /// of overlapping windows, are grouped under a single `GLOBAL MERGED`
    /// trigger spanning all of them. Every other throughput trigger is a root
    /// of its own. Each throughput trigger has its subdetector trigger as its
    /// only child. The result does not depend on the order of `pairs`.
    pub fn merge(&self, pairs: &[(Trigger, Trigger)]) -> TriggerHierarchy {
        let mut sorted = pairs.to_vec();
        sorted.sort_by(|(a, x), (b, y)| {
            a.time
                .total_cmp(&b.time)
                .then(a.end().total_cmp(&b.end()))
                .then(x.time.total_cmp(&y.time))
                .then(x.key.cmp(&y.key))
        });

        let mut groups: Vec<Vec<(Trigger, Trigger)>> = Vec::new();
        let mut group_end = f64::NEG_INFINITY;
        for pair in sorted {
            if groups.is_empty() || pair.0.time > group_end {
                group_end = pair.0.end();
                groups.push(vec![pair]);
            } else if let Some(group) = groups.last_mut() {
                group_end = group_end.max(pair.0.end());
                group.push(pair);
            }
        }

        let mut hierarchy = TriggerHierarchy::new();
        for group in groups {
            if let [(throughput, trigger)] = group.as_slice() {
                let root = hierarchy.insert_root(*throughput);
                hierarchy.append_child(root, *trigger);
                continue;
            }

            let start = group
                .iter()
                .map(|(tp, _)| tp.time)
                .fold(f64::INFINITY, f64::min);
            let stop = group
                .iter()
                .map(|(tp, _)| tp.end())
                .fold(f64::NEG_INFINITY, f64::max);
            let root = hierarchy.insert_root(Trigger::new(MERGED, start, stop - start));
            for (throughput, trigger) in group {
                let node = hierarchy.append_child(root, throughput);
                hierarchy.append_child(node, trigger);
            }
        }
        hierarchy
    }
}

/// Drops the launches that fall outside the readout window of every in-ice
/// and surface trigger in `hierarchy`. Modules left without launches are
/// removed.
pub fn prune_launches(
    launches: &LaunchMap,
    hierarchy: &TriggerHierarchy,
    readout: &ReadoutWindow<'_>,
) -> LaunchMap {
    let windows: Vec<_> = hierarchy
        .iter()
        .map(|(_, trigger)| trigger)
        .filter(|trigger| matches!(trigger.key.source, SourceId::InIce | SourceId::IceTop))
        .map(|trigger| (readout.in_ice(trigger), readout.ice_top(trigger)))
        .collect();

    let mut pruned = LaunchMap::new();
    for (dom, series) in launches {
        let ice_top = dom.is_ice_top();
        let kept: Vec<_> = series
            .iter()
            .filter(|launch| {
                windows.iter().any(|&(in_ice, top)| {
                    let window = if ice_top { top } else { in_ice };
                    window.is_some_and(|(start, stop)| {
                        (start..=stop).contains(&launch.start_time)
                    })
                })
            })
            .cloned()
            .collect();
        if !kept.is_empty() {
            pruned.insert(*dom, kept);
        }
    }
    pruned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::OmKey;
    use crate::launch::DomLaunch;
    use crate::status::TriggerStatus;
    use assert_approx_eq::assert_approx_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const IN_ICE_SMT: TriggerKey =
        TriggerKey::new(SourceId::InIce, TypeId::SimpleMultiplicity, None);
    const ICE_TOP_SMT: TriggerKey =
        TriggerKey::new(SourceId::IceTop, TypeId::SimpleMultiplicity, None);

    fn detector_status() -> DetectorStatus {
        let config = ReadoutConfig::new(1000.0, 1000.0, 0.0);
        let status = TriggerStatus::default()
            .with_readout(Subdetector::InIce, config)
            .with_readout(Subdetector::IceTop, config);
        let mut detector = DetectorStatus::default();
        detector.triggers.insert(IN_ICE_SMT, status.clone());
        detector.triggers.insert(ICE_TOP_SMT, status);
        detector
    }
    // `clusters` groups of `size` overlapping triggers, 100 µs apart.
    fn make_triggers(rng: &mut StdRng, clusters: usize, size: usize) -> Vec<Trigger> {
        const SPACING: f64 = 100_000.0;
        let mut triggers = Vec::new();
        for i in 0..clusters {
            let time = i as f64 * SPACING;
            let length = rng.random_range(10.0..1e-2 * SPACING);
            for _ in 0..size {
                let dt = rng.random_range(0.0..0.1 * length);
                triggers.push(Trigger::new(IN_ICE_SMT, time + dt, length));
            }
        }
        triggers
    }

    #[test]
    fn same_and_other_subdetector_windows() {
        let mut status = DetectorStatus::default();
        status.triggers.insert(
            IN_ICE_SMT,
            TriggerStatus::default()
                .with_readout(Subdetector::InIce, ReadoutConfig::new(10.0, 20.0, 0.0))
                .with_readout(Subdetector::IceTop, ReadoutConfig::new(5.0, 5.0, 100.0)),
        );
        let readout = ReadoutWindow::new(&status);
        let trigger = Trigger::new(IN_ICE_SMT, 50.0, 30.0);
        assert_eq!(readout.in_ice(&trigger), Some((40.0, 100.0)));
        assert_eq!(readout.ice_top(&trigger), Some((145.0, 155.0)));
        assert_eq!(readout.earliest(&trigger), Some(40.0));
        assert_eq!(readout.latest(&trigger), Some(155.0));

        let unknown = Trigger::new(ICE_TOP_SMT, 0.0, 0.0);
        assert_eq!(readout.in_ice(&unknown), None);
        assert_eq!(readout.earliest(&unknown), None);
    }

    #[test]
    fn no_triggers() {
        let status = detector_status();
        let sim = GlobalTriggerSim::new(&status, None);
        assert_eq!(sim.insert_throughput_triggers(&[]), Ok(Vec::new()));
        assert!(sim.merge(&[]).is_empty());
    }

    #[test]
    fn throughput_window_from_all_config() {
        let key = TriggerKey::new(SourceId::InIce, TypeId::UnknownType, None);
        let config = ReadoutConfig::new(4000.0, 6000.0, 3000.0);
        let mut status = DetectorStatus::default();
        status.triggers.insert(
            key,
            TriggerStatus::default().with_readout(Subdetector::All, config),
        );
        let sim = GlobalTriggerSim::new(&status, None);

        let trigger = Trigger::new(key, 0.0, 3.14);
        let pairs = sim.insert_throughput_triggers(&[trigger]).unwrap();
        assert_eq!(pairs.len(), 1);
        let (throughput, child) = pairs[0];
        assert_eq!(throughput.key, THROUGHPUT);
        assert!(throughput.fired);
        assert_approx_eq!(throughput.time, -config.minus);
        assert_approx_eq!(throughput.length, config.minus + config.plus + config.offset);
        assert_eq!(child, trigger);
    }

    #[test]
    fn other_sources_are_skipped() {
        let status = detector_status();
        let sim = GlobalTriggerSim::new(&status, None);
        let trigger = Trigger::new(TriggerKey::default(), 0.0, 3.14);
        assert_eq!(sim.insert_throughput_triggers(&[trigger]), Ok(Vec::new()));
    }

    #[test]
    fn default_readout_fallback() {
        let status = DetectorStatus::default();
        let key = TriggerKey::new(SourceId::InIce, TypeId::Volume, Some(21000));
        let trigger = Trigger::new(key, 100.0, 50.0);

        let sim = GlobalTriggerSim::new(&status, None);
        assert_eq!(
            sim.insert_throughput_triggers(&[trigger]),
            Err(GlobalTriggerError::NoReadoutWindow(key))
        );

        let sim = GlobalTriggerSim::new(&status, Some(ReadoutConfig::new(10.0, 20.0, 0.0)));
        let pairs = sim.insert_throughput_triggers(&[trigger]).unwrap();
        assert_eq!((pairs[0].0.time, pairs[0].0.end()), (90.0, 170.0));
    }

    #[test]
    fn one_subdetector_window_beats_default() {
        let mut status = DetectorStatus::default();
        let key = TriggerKey::new(SourceId::InIce, TypeId::Volume, Some(21000));
        status.triggers.insert(
            key,
            TriggerStatus::default()
                .with_readout(Subdetector::IceTop, ReadoutConfig::new(1000.0, 2000.0, 500.0)),
        );
        let trigger = Trigger::new(key, 100.0, 50.0);

        let sim = GlobalTriggerSim::new(&status, Some(ReadoutConfig::new(10.0, 20.0, 0.0)));
        assert_eq!(sim.readout().in_ice(&trigger), None);
        let pairs = sim.insert_throughput_triggers(&[trigger]).unwrap();
        assert_eq!((pairs[0].0.time, pairs[0].0.end()), (-400.0, 2600.0));
    }

    #[test]
    fn single_trigger() {
        let status = detector_status();
        let sim = GlobalTriggerSim::new(&status, None);
        let mut rng = StdRng::seed_from_u64(99999);
        let triggers = make_triggers(&mut rng, 1, 1);

        let pairs = sim.insert_throughput_triggers(&triggers).unwrap();
        let hierarchy = sim.merge(&pairs);
        assert_eq!(hierarchy.len(), 2);

        let root = hierarchy.roots()[0];
        let throughput = hierarchy.get(root).copied().unwrap();
        assert_eq!(throughput.key, THROUGHPUT);
        let (start, stop) = sim.readout().in_ice(&triggers[0]).unwrap();
        assert_approx_eq!(throughput.time, start);
        assert_approx_eq!(throughput.length, stop - start);

        let children = hierarchy.children(root);
        assert_eq!(children.len(), 1);
        assert_eq!(hierarchy.get(children[0]).map(|t| t.key), Some(IN_ICE_SMT));
    }

    #[test]
    fn separate_triggers() {
        let status = detector_status();
        let sim = GlobalTriggerSim::new(&status, None);
        let mut rng = StdRng::seed_from_u64(99999);
        let triggers = make_triggers(&mut rng, 100, 1);

        let pairs = sim.insert_throughput_triggers(&triggers).unwrap();
        assert_eq!(pairs.len(), 100);
        let hierarchy = sim.merge(&pairs);
        assert_eq!(hierarchy.len(), 200);
        for &root in hierarchy.roots() {
            assert_eq!(hierarchy.get(root).map(|t| t.key), Some(THROUGHPUT));
            let children = hierarchy.children(root);
            assert_eq!(children.len(), 1);
            assert_eq!(hierarchy.get(children[0]).map(|t| t.key), Some(IN_ICE_SMT));
        }
    }

    #[test]
    fn overlapping_triggers_are_merged() {
        let status = detector_status();
        let sim = GlobalTriggerSim::new(&status, None);
        let mut rng = StdRng::seed_from_u64(99999);

        for clusters in 1..=20 {
            for size in 2..=10 {
                let triggers = make_triggers(&mut rng, clusters, size);
                let pairs = sim.insert_throughput_triggers(&triggers).unwrap();
                let hierarchy = sim.merge(&pairs);
                assert_eq!(hierarchy.len(), clusters * (2 * size + 1));
                assert_eq!(hierarchy.roots().len(), clusters);

                for &root in hierarchy.roots() {
                    let merged = hierarchy.get(root).copied().unwrap();
                    assert_eq!(merged.key, MERGED);
                    let children = hierarchy.children(root);
                    assert_eq!(children.len(), size);

                    let mut earliest = f64::INFINITY;
                    let mut latest = f64::NEG_INFINITY;
                    for &child in children {
                        let throughput = hierarchy.get(child).copied().unwrap();
                        assert_eq!(throughput.key, THROUGHPUT);
                        let grandchildren = hierarchy.children(child);
                        assert_eq!(grandchildren.len(), 1);
                        assert_eq!(
                            hierarchy.get(grandchildren[0]).map(|t| t.key),
                            Some(IN_ICE_SMT)
                        );
                        earliest = earliest.min(throughput.time);
                        latest = latest.max(throughput.end());
                    }
                    assert_approx_eq!(merged.time, earliest);
                    assert_approx_eq!(merged.length, latest - earliest);
                }
            }
        }
    }

    #[test]
    fn merge_does_not_depend_on_order() {
        let throughput = |time: f64, length: f64| Trigger::new(THROUGHPUT, time, length);
        let child = |time: f64| Trigger::new(IN_ICE_SMT, time, 0.0);
        // The last window only overlaps the first once it has been widened
        // by the second.
        let mut pairs = vec![
            (throughput(0.0, 10.0), child(5.0)),
            (throughput(8.0, 10.0), child(13.0)),
            (throughput(16.0, 10.0), child(21.0)),
            (throughput(100.0, 10.0), child(105.0)),
        ];
        let status = DetectorStatus::default();
        let sim = GlobalTriggerSim::new(&status, None);
        let forward = sim.merge(&pairs);
        pairs.reverse();
        let backward = sim.merge(&pairs);

        assert_eq!(forward, backward);
        assert_eq!(forward.roots().len(), 2);
        let merged = forward.get(forward.roots()[0]).copied().unwrap();
        assert_eq!((merged.key, merged.time, merged.length), (MERGED, 0.0, 26.0));
    }

    #[test]
    fn pruning_keeps_launches_in_readout() {
        let status = detector_status();
        let sim = GlobalTriggerSim::new(&status, None);
        let trigger = Trigger::new(IN_ICE_SMT, 10_000.0, 500.0);
        let hierarchy = sim.merge(&sim.insert_throughput_triggers(&[trigger]).unwrap());

        let mut launches = LaunchMap::new();
        launches.insert(
            OmKey::new(21, 30),
            vec![DomLaunch::new(8000.0), DomLaunch::new(9500.0)],
        );
        launches.insert(OmKey::new(21, 61), vec![DomLaunch::new(10_500.0)]);
        launches.insert(OmKey::new(22, 1), vec![DomLaunch::new(20_000.0)]);

        let pruned = prune_launches(&launches, &hierarchy, sim.readout());
        assert_eq!(pruned.len(), 2);
        assert_eq!(pruned[&OmKey::new(21, 30)], vec![DomLaunch::new(9500.0)]);
        assert_eq!(pruned[&OmKey::new(21, 61)].len(), 1);
    }
}
