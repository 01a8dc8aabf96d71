use crate::domset::in_dom_set;
use crate::error::ConfigError;
use crate::hit::{lc_hits, TriggerHit};
use crate::launch::LaunchMap;
use crate::status::DetectorStatus;
use crate::time_window::TimeWindow;
use crate::trigger::{
    SourceId, Trigger, TriggerAlgorithm, TriggerContext, TriggerKey, TriggerQuery, TypeId,
};
use tracing::debug;

const DOM_SET: i32 = 2;

/// Finds clusters of hits that are close both in time and along a string.
///
/// Hits are first grouped with a sliding time window. A window fires when,
/// on some string, at least `multiplicity` of its hits lie within
/// `coherence_length` consecutive module positions. Each window fires at most
/// once; the trigger spans the hits that took part in any such cluster.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterTrigger {
    key: TriggerKey,
    time_window: TimeWindow,
    coherence_length: u32,
}

impl ClusterTrigger {
    pub fn new(
        config_id: Option<i32>,
        multiplicity: usize,
        time_window: f64,
        coherence_length: u32,
    ) -> Self {
        Self {
            key: TriggerKey::new(SourceId::InIce, TypeId::String, config_id),
            time_window: TimeWindow::new(multiplicity, time_window),
            coherence_length,
        }
    }
    /// Reads `multiplicity`, `timeWindow` and `coherenceLength` from the
    /// matching `IN_ICE STRING` configuration.
    pub fn from_status(status: &DetectorStatus, config_id: Option<i32>) -> Result<Self, ConfigError> {
        let query = TriggerQuery::builder()
            .source(SourceId::InIce)
            .type_id(TypeId::String)
            .maybe_config_id(config_id)
            .build();
        let (key, trigger_status) = status.trigger_status(&query)?;

        let mut trigger = Self::new(
            key.config_id,
            trigger_status.require("multiplicity")?,
            trigger_status.require("timeWindow")?,
            trigger_status.require("coherenceLength")?,
        );
        trigger.key = key;
        Ok(trigger)
    }
    /// Runs the algorithm directly on a set of hits.
    ///
    /// Returns the `(time, length)` of every trigger found.
    pub fn find(&self, hits: &mut [TriggerHit]) -> Vec<(f64, f64)> {
        let mut found = Vec::new();
        for window in self.time_window.sliding_time_windows(hits) {
            let window = &hits[window];
            let coherent = self.coherent_hits(window);
            let (Some(first), Some(last)) = (coherent.first(), coherent.last()) else {
                continue;
            };
            found.push((first.time, last.time - first.time));
        }
        found
    }
    // Hits (in time order) belonging to a cluster on their own string.
    fn coherent_hits(&self, window: &[TriggerHit]) -> Vec<TriggerHit> {
        let threshold = self.time_window.threshold();
        let span = self.coherence_length.saturating_sub(1);

        let mut member = vec![false; window.len()];
        for anchor in window {
            let in_span = |hit: &TriggerHit| {
                hit.string == anchor.string
                    && hit.pos >= anchor.pos
                    && hit.pos <= anchor.pos.saturating_add(span)
            };
            if window.iter().filter(|hit| in_span(hit)).count() >= threshold {
                for (flag, hit) in member.iter_mut().zip(window) {
                    *flag |= in_span(hit);
                }
            }
        }

        window
            .iter()
            .zip(member)
            .filter_map(|(hit, member)| member.then_some(*hit))
            .collect()
    }
}

impl TriggerAlgorithm for ClusterTrigger {
    fn key(&self) -> TriggerKey {
        self.key
    }

    fn run(&mut self, launches: &LaunchMap, context: &TriggerContext<'_>) -> Vec<Trigger> {
        let mut hits = lc_hits(launches, |dom| in_dom_set(dom, DOM_SET, context.dom_sets));
        let triggers: Vec<_> = self
            .find(&mut hits)
            .into_iter()
            .map(|(time, length)| Trigger::new(self.key, time, length))
            .collect();
        debug!(key = %self.key, hits = hits.len(), triggers = triggers.len(), "cluster trigger");
        triggers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::OmKey;
    use crate::launch::DomLaunch;
    use crate::status::TriggerStatus;
    use crate::detector::Geometry;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn hit(time: f64, pos: u32, string: i32) -> TriggerHit {
        TriggerHit::new(time, OmKey::new(string, pos))
    }

    #[test]
    fn simple_clusters() {
        let trigger = ClusterTrigger::new(None, 3, 1500.0, 7);
        let mut hits = vec![
            hit(1.0, 1, 1),
            hit(2.0, 2, 1),
            hit(3.0, 3, 1),
            hit(2001.0, 4, 1),
            hit(2002.0, 5, 1),
            hit(2003.0, 6, 1),
        ];
        assert_eq!(trigger.find(&mut hits), vec![(1.0, 2.0), (2001.0, 2.0)]);
    }

    #[test]
    fn one_trigger_per_window() {
        let trigger = ClusterTrigger::new(None, 3, 1500.0, 7);
        let mut hits = vec![
            hit(1.0, 1, 2),
            hit(2.0, 2, 2),
            hit(3.0, 3, 2),
            hit(4.0, 1, 1),
            hit(5.0, 2, 1),
            hit(6.0, 3, 1),
            hit(7.0, 4, 3),
        ];
        // The lone hit on string 3 is pruned from the trigger.
        assert_eq!(trigger.find(&mut hits), vec![(1.0, 5.0)]);
    }

    #[test]
    fn no_trigger_when_hits_are_far_apart() {
        let trigger = ClusterTrigger::new(None, 3, 1500.0, 7);
        let mut hits: Vec<_> = [1.0, 2001.0, 4001.0, 5001.0, 6001.0, 8001.0]
            .into_iter()
            .zip(1..)
            .map(|(time, pos)| hit(time, pos, 1))
            .collect();
        assert!(trigger.find(&mut hits).is_empty());
    }

    #[test]
    fn hits_outside_coherence_length() {
        let trigger = ClusterTrigger::new(None, 3, 1500.0, 7);
        let mut hits = vec![hit(1.0, 1, 1), hit(2.0, 4, 1), hit(3.0, 8, 1)];
        assert!(trigger.find(&mut hits).is_empty());
    }

    #[test]
    fn random_hits_on_one_string() {
        let mut rng = StdRng::seed_from_u64(42);
        let trigger = ClusterTrigger::new(None, 5, 2500.0, 7);
        let mut hits: Vec<_> = (0..5)
            .map(|_| hit(rng.random_range(1.0..2500.0), rng.random_range(27..34), 21))
            .collect();
        assert_eq!(trigger.find(&mut hits).len(), 1);
    }

    #[test]
    fn configured_from_status() {
        let mut status = DetectorStatus::default();
        status.triggers.insert(
            TriggerKey::new(SourceId::InIce, TypeId::String, Some(1007)),
            TriggerStatus::default()
                .with_setting("multiplicity", 3)
                .with_setting("timeWindow", 1500)
                .with_setting("coherenceLength", 7),
        );
        let mut trigger = ClusterTrigger::from_status(&status, None).unwrap();
        assert_eq!(trigger.key().config_id, Some(1007));

        let mut launches = LaunchMap::new();
        for (om, time) in [(30, 100.0), (31, 150.0), (33, 180.0)] {
            let mut launch = DomLaunch::new(time);
            launch.lc_bit = true;
            launches.insert(OmKey::new(21, om), vec![launch]);
        }
        // Not in DOM set 2.
        let mut launch = DomLaunch::new(120.0);
        launch.lc_bit = true;
        launches.insert(OmKey::new(21, 62), vec![launch]);

        let geometry = Geometry::default();
        let context = TriggerContext {
            geometry: &geometry,
            dom_sets: None,
        };
        let triggers = trigger.run(&launches, &context);
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].time, 100.0);
        assert_eq!(triggers[0].length, 80.0);
    }

    #[test]
    fn missing_setting() {
        let mut status = DetectorStatus::default();
        status.triggers.insert(
            TriggerKey::new(SourceId::InIce, TypeId::String, Some(1007)),
            TriggerStatus::default().with_setting("multiplicity", 3),
        );
        assert_eq!(
            ClusterTrigger::from_status(&status, Some(1007)),
            Err(ConfigError::MissingSetting {
                name: "timeWindow".to_string()
            })
        );
    }
}
