use crate::domset::in_dom_set;
use crate::error::ConfigError;
use crate::hit::lc_hits;
use crate::launch::LaunchMap;
use crate::status::DetectorStatus;
use crate::time_window::TimeWindow;
use crate::trigger::{
    SourceId, Trigger, TriggerAlgorithm, TriggerContext, TriggerKey, TriggerQuery, TypeId,
};
use tracing::debug;

/// At least `threshold` LC hits within a sliding window of `time_window` ns.
///
/// Consecutive windows that keep satisfying the condition form a single
/// trigger spanning all of their hits.
///
/// # Examples
///
/// ```
/// use trigsim::detector::Geometry;
/// use trigsim::key::OmKey;
/// use trigsim::launch::{DomLaunch, LaunchMap};
/// use trigsim::trigger::smt::SimpleMajorityTrigger;
/// use trigsim::trigger::{SourceId, TriggerAlgorithm, TriggerContext};
///
/// let mut launches = LaunchMap::new();
/// for (om, time) in [(1, 10.0), (5, 20.0), (9, 60.0)] {
///     let mut launch = DomLaunch::new(time);
///     launch.lc_bit = true;
///     launches.insert(OmKey::new(36, om), vec![launch]);
/// }
///
/// let geometry = Geometry::default();
/// let context = TriggerContext { geometry: &geometry, dom_sets: None };
/// let mut smt = SimpleMajorityTrigger::new(SourceId::InIce, None, 3, 100.0, None);
/// let triggers = smt.run(&launches, &context);
/// assert_eq!(triggers.len(), 1);
/// assert_eq!((triggers[0].time, triggers[0].length), (10.0, 50.0));
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct SimpleMajorityTrigger {
    key: TriggerKey,
    time_window: TimeWindow,
    dom_set: Option<i32>,
}

impl SimpleMajorityTrigger {
    pub fn new(
        source: SourceId,
        config_id: Option<i32>,
        threshold: usize,
        time_window: f64,
        dom_set: Option<i32>,
    ) -> Self {
        Self {
            key: TriggerKey::new(source, TypeId::SimpleMultiplicity, config_id),
            time_window: TimeWindow::new(threshold, time_window),
            dom_set,
        }
    }
    /// Reads `threshold`, `timeWindow` and the optional `domSet` from the
    /// matching `SIMPLE_MULTIPLICITY` configuration of `source`.
    pub fn from_status(
        status: &DetectorStatus,
        source: SourceId,
        config_id: Option<i32>,
    ) -> Result<Self, ConfigError> {
        let query = TriggerQuery::builder()
            .source(source)
            .type_id(TypeId::SimpleMultiplicity)
            .maybe_config_id(config_id)
            .build();
        let (key, trigger_status) = status.trigger_status(&query)?;

        Ok(Self {
            key,
            time_window: TimeWindow::new(
                trigger_status.require("threshold")?,
                trigger_status.require("timeWindow")?,
            ),
            dom_set: trigger_status.value("domSet")?,
        })
    }
}

impl TriggerAlgorithm for SimpleMajorityTrigger {
    fn key(&self) -> TriggerKey {
        self.key
    }

    fn run(&mut self, launches: &LaunchMap, context: &TriggerContext<'_>) -> Vec<Trigger> {
        let mut hits = lc_hits(launches, |dom| {
            self.dom_set
                .is_none_or(|set| in_dom_set(dom, set, context.dom_sets))
        });
        debug!(key = %self.key, hits = hits.len(), "simple majority trigger");

        self.time_window
            .sliding_time_windows(&mut hits)
            .into_iter()
            .map(|window| {
                let first = hits[window.start].time;
                let last = hits[window.end - 1].time;
                Trigger::new(self.key, first, last - first)
            })
            .collect()
    }
}
