use crate::error::ConfigError;
use crate::hit::{lc_hits, TriggerHit};
use crate::launch::LaunchMap;
use crate::status::DetectorStatus;
use crate::time_window::TimeWindow;
use crate::trigger::{
    SourceId, Trigger, TriggerAlgorithm, TriggerContext, TriggerKey, TriggerQuery, TypeId,
};
use std::collections::BTreeMap;
use tracing::debug;

/// Multiplicity condition evaluated string by string.
///
/// Each string gets its own sliding time windows. A window is vetoed if any
/// of its hits sits at a position at or above `veto_depth` (numerically
/// smaller or equal). Otherwise it fires when some hit at position `p` has at
/// least `threshold` hits of the window in `[p, p + max_span - 1]`. A firing
/// window produces one trigger spanning all of its hits.
#[derive(Clone, Debug, PartialEq)]
pub struct MultiplicityStringTrigger {
    key: TriggerKey,
    time_window: TimeWindow,
    max_span: u32,
    veto_depth: u32,
    string: Option<i32>,
}

impl MultiplicityStringTrigger {
    pub fn new(
        config_id: Option<i32>,
        threshold: usize,
        time_window: f64,
        max_span: u32,
        veto_depth: u32,
    ) -> Self {
        Self {
            key: TriggerKey::new(SourceId::InIce, TypeId::String, config_id),
            time_window: TimeWindow::new(threshold, time_window),
            max_span,
            veto_depth,
            string: None,
        }
    }
    /// Restricts the trigger to a single string.
    pub fn with_string(mut self, string: i32) -> Self {
        self.string = Some(string);
        self
    }
    /// Reads `multiplicity`, `timeWindow` and either `coherenceLength` or
    /// `maxLength` plus `string` from the matching `IN_ICE STRING`
    /// configuration. The veto depth is read from the setting named
    /// `veto_depth_setting`, if given; it defaults to no veto.
    pub fn from_status(
        status: &DetectorStatus,
        config_id: Option<i32>,
        veto_depth_setting: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let query = TriggerQuery::builder()
            .source(SourceId::InIce)
            .type_id(TypeId::String)
            .maybe_config_id(config_id)
            .build();
        let (key, trigger_status) = status.trigger_status(&query)?;

        let (max_span, string) = match trigger_status.value("coherenceLength")? {
            Some(span) => (span, None),
            None => {
                let span = trigger_status.value("maxLength")?.ok_or_else(|| {
                    ConfigError::Inconsistent(format!(
                        "{key} has neither `coherenceLength` nor `maxLength`"
                    ))
                })?;
                (span, Some(trigger_status.require("string")?))
            }
        };
        let veto_depth = match veto_depth_setting {
            Some(name) => trigger_status.value(name)?.unwrap_or(0),
            None => 0,
        };

        Ok(Self {
            key,
            time_window: TimeWindow::new(
                trigger_status.require("multiplicity")?,
                trigger_status.require("timeWindow")?,
            ),
            max_span,
            veto_depth,
            string,
        })
    }
    /// Runs the algorithm on the hits of a single string.
    ///
    /// Returns the `(time, length)` of every trigger found.
    pub fn find(&self, hits: &mut [TriggerHit]) -> Vec<(f64, f64)> {
        self.time_window
            .sliding_time_windows(hits)
            .into_iter()
            .map(|window| &hits[window])
            .filter(|window| !self.is_vetoed(window) && self.has_span(window))
            .map(|window| {
                let first = window[0].time;
                (first, window[window.len() - 1].time - first)
            })
            .collect()
    }

    fn is_vetoed(&self, window: &[TriggerHit]) -> bool {
        window.iter().any(|hit| hit.pos <= self.veto_depth)
    }

    fn has_span(&self, window: &[TriggerHit]) -> bool {
        let stop = |start: u32| start.saturating_add(self.max_span.saturating_sub(1));
        window.iter().any(|start| {
            let count = window
                .iter()
                .filter(|hit| (start.pos..=stop(start.pos)).contains(&hit.pos))
                .count();
            count >= self.time_window.threshold()
        })
    }
}

impl TriggerAlgorithm for MultiplicityStringTrigger {
    fn key(&self) -> TriggerKey {
        self.key
    }

    fn run(&mut self, launches: &LaunchMap, _: &TriggerContext<'_>) -> Vec<Trigger> {
        let mut strings: BTreeMap<i32, Vec<TriggerHit>> = BTreeMap::new();
        let hits = lc_hits(launches, |dom| {
            dom.string >= 0 && self.string.is_none_or(|s| s == dom.string)
        });
        for hit in hits {
            strings.entry(hit.string).or_default().push(hit);
        }

        let mut triggers = Vec::new();
        for (string, mut hits) in strings {
            let found = self.find(&mut hits);
            debug!(key = %self.key, string, hits = hits.len(), triggers = found.len(), "string trigger");
            triggers.extend(
                found
                    .into_iter()
                    .map(|(time, length)| Trigger::new(self.key, time, length)),
            );
        }
        triggers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::Geometry;
    use crate::key::OmKey;
    use crate::launch::DomLaunch;
    use crate::status::TriggerStatus;

    fn hits(times_and_positions: &[(f64, u32)]) -> Vec<TriggerHit> {
        times_and_positions
            .iter()
            .map(|&(time, pos)| TriggerHit::new(time, OmKey::new(1, pos)))
            .collect()
    }

    #[test]
    fn separate_windows() {
        let trigger = MultiplicityStringTrigger::new(None, 3, 1500.0, 7, 0);
        let mut hits = hits(&[
            (1.0, 1),
            (2.0, 2),
            (3.0, 3),
            (2001.0, 4),
            (2002.0, 5),
            (2003.0, 6),
        ]);
        assert_eq!(trigger.find(&mut hits).len(), 2);
    }

    #[test]
    fn multiple_clusters_in_one_window() {
        let trigger = MultiplicityStringTrigger::new(None, 3, 1500.0, 7, 0);
        let mut hits = hits(&[(1.0, 1), (2.0, 2), (3.0, 3), (4.0, 58), (5.0, 59), (6.0, 60)]);
        assert_eq!(trigger.find(&mut hits), vec![(1.0, 5.0)]);
    }

    #[test]
    fn window_spans_all_hits() {
        let trigger = MultiplicityStringTrigger::new(None, 3, 1000.0, 5, 0);
        let mut hits = hits(&[(0.0, 40), (10.0, 41), (20.0, 43), (30.0, 20)]);
        assert_eq!(trigger.find(&mut hits), vec![(0.0, 30.0)]);
    }

    #[test]
    fn positions_too_spread() {
        let trigger = MultiplicityStringTrigger::new(None, 3, 1000.0, 5, 0);
        let mut hits = hits(&[(0.0, 40), (10.0, 44), (20.0, 45)]);
        assert!(trigger.find(&mut hits).is_empty());
        let trigger = MultiplicityStringTrigger::new(None, 3, 1000.0, 6, 0);
        assert_eq!(trigger.find(&mut hits).len(), 1);
    }

    #[test]
    fn veto_depth() {
        let trigger = MultiplicityStringTrigger::new(None, 3, 1000.0, 60, 10);
        let mut vetoed = hits(&[(0.0, 10), (10.0, 30), (20.0, 31), (30.0, 32)]);
        assert!(trigger.find(&mut vetoed).is_empty());
        let mut clean = hits(&[(0.0, 11), (10.0, 30), (20.0, 31)]);
        assert_eq!(trigger.find(&mut clean).len(), 1);
    }

    #[test]
    fn strings_are_independent() {
        let geometry = Geometry::default();
        let context = TriggerContext {
            geometry: &geometry,
            dom_sets: None,
        };
        let mut launches = LaunchMap::new();
        for (string, om, time) in [(1, 30, 0.0), (1, 31, 5.0), (2, 30, 10.0), (2, 31, 15.0)] {
            let mut launch = DomLaunch::new(time);
            launch.lc_bit = true;
            launches.insert(OmKey::new(string, om), vec![launch]);
        }

        let mut trigger = MultiplicityStringTrigger::new(None, 3, 1000.0, 7, 0);
        assert!(trigger.run(&launches, &context).is_empty());

        let mut trigger = MultiplicityStringTrigger::new(None, 2, 1000.0, 7, 0);
        assert_eq!(trigger.run(&launches, &context).len(), 2);

        let mut trigger = MultiplicityStringTrigger::new(None, 2, 1000.0, 7, 0).with_string(2);
        let triggers = trigger.run(&launches, &context);
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].time, 10.0);
    }

    #[test]
    fn configured_from_status() {
        let mut status = DetectorStatus::default();
        status.triggers.insert(
            TriggerKey::new(SourceId::InIce, TypeId::String, Some(1007)),
            TriggerStatus::default()
                .with_setting("multiplicity", 5)
                .with_setting("timeWindow", 1500)
                .with_setting("coherenceLength", 7),
        );
        status.triggers.insert(
            TriggerKey::new(SourceId::InIce, TypeId::String, Some(2000)),
            TriggerStatus::default()
                .with_setting("multiplicity", 3)
                .with_setting("timeWindow", 1000)
                .with_setting("maxLength", 4)
                .with_setting("string", 81)
                .with_setting("vetoLayer", 20),
        );

        let trigger = MultiplicityStringTrigger::from_status(&status, Some(1007), None).unwrap();
        assert_eq!((trigger.max_span, trigger.string), (7, None));

        let trigger =
            MultiplicityStringTrigger::from_status(&status, Some(2000), Some("vetoLayer")).unwrap();
        assert_eq!((trigger.max_span, trigger.string), (4, Some(81)));
        assert_eq!(trigger.veto_depth, 20);

        // Both configurations match without a config id.
        assert!(MultiplicityStringTrigger::from_status(&status, None, None).is_err());
    }
}
