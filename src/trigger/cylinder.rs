use crate::detector::Geometry;
use crate::domset::in_dom_set;
use crate::error::ConfigError;
use crate::hit::{lc_hits, TriggerHit};
use crate::key::Position;
use crate::launch::LaunchMap;
use crate::status::DetectorStatus;
use crate::time_window::TimeWindow;
use crate::trigger::{
    SourceId, Trigger, TriggerAlgorithm, TriggerContext, TriggerKey, TriggerQuery, TypeId,
};
use tracing::{debug, warn};

/// Volume trigger: enough hits inside a vertical cylinder within a sliding
/// time window.
///
/// Windows hold at least `multiplicity` hits. A window fires if it holds at
/// least `simple_multiplicity` hits, or if some hit has `multiplicity` hits
/// (itself included) within `radius` horizontally and `height / 2`
/// vertically. Each firing window gives one trigger spanning all its hits.
#[derive(Clone, Debug, PartialEq, bon::Builder)]
pub struct CylinderTrigger {
    #[builder(default = TriggerKey::new(SourceId::InIce, TypeId::Volume, None))]
    key: TriggerKey,
    time_window: f64,
    multiplicity: usize,
    radius: f64,
    height: f64,
    simple_multiplicity: usize,
    dom_set: Option<i32>,
}

impl CylinderTrigger {
    /// Reads `timeWindow`, `multiplicity`, `radius`, `height`,
    /// `simpleMultiplicity` and the optional `domSet` from the matching
    /// `IN_ICE VOLUME` configuration.
    pub fn from_status(status: &DetectorStatus, config_id: Option<i32>) -> Result<Self, ConfigError> {
        let query = TriggerQuery::builder()
            .source(SourceId::InIce)
            .type_id(TypeId::Volume)
            .maybe_config_id(config_id)
            .build();
        let (key, ts) = status.trigger_status(&query)?;

        Ok(Self::builder()
            .key(key)
            .time_window(ts.require("timeWindow")?)
            .multiplicity(ts.require("multiplicity")?)
            .radius(ts.require("radius")?)
            .height(ts.require("height")?)
            .simple_multiplicity(ts.require("simpleMultiplicity")?)
            .maybe_dom_set(ts.value("domSet")?)
            .build())
    }
    /// Runs the algorithm on a set of hits.
    ///
    /// Returns the `(time, length)` of every trigger found.
    pub fn find(&self, hits: &mut [TriggerHit], geometry: &Geometry) -> Vec<(f64, f64)> {
        let windows = TimeWindow::new(self.multiplicity, self.time_window).sliding_time_windows(hits);

        let mut found = Vec::new();
        for window in windows {
            let window = &hits[window];
            if window.len() >= self.simple_multiplicity || self.has_cylinder(window, geometry) {
                let first = window[0].time;
                found.push((first, window[window.len() - 1].time - first));
            }
        }
        found
    }

    fn has_cylinder(&self, window: &[TriggerHit], geometry: &Geometry) -> bool {
        let positions: Vec<Position> = window
            .iter()
            .filter_map(|hit| {
                let position = geometry.position(&hit.dom());
                if position.is_none() {
                    warn!(dom = %hit.dom(), "hit without geometry");
                }
                position
            })
            .collect();

        let half_height = self.height / 2.0;
        positions.iter().any(|center| {
            positions
                .iter()
                .filter(|p| {
                    center.horizontal_distance(p) <= self.radius
                        && (p.z - center.z).abs() <= half_height
                })
                .count()
                >= self.multiplicity
        })
    }
}

impl TriggerAlgorithm for CylinderTrigger {
    fn key(&self) -> TriggerKey {
        self.key
    }

    fn run(&mut self, launches: &LaunchMap, context: &TriggerContext<'_>) -> Vec<Trigger> {
        let mut hits = lc_hits(launches, |dom| {
            self.dom_set
                .is_none_or(|set| in_dom_set(dom, set, context.dom_sets))
        });
        let triggers: Vec<_> = self
            .find(&mut hits, context.geometry)
            .into_iter()
            .map(|(time, length)| Trigger::new(self.key, time, length))
            .collect();
        debug!(key = %self.key, hits = hits.len(), triggers = triggers.len(), "cylinder trigger");
        triggers
    }
}
