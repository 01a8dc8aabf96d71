use crate::detector::Geometry;
use crate::domset::in_dom_set;
use crate::error::ConfigError;
use crate::hit::{lc_hits, TriggerHit};
use crate::launch::LaunchMap;
use crate::status::DetectorStatus;
use crate::trigger::{
    SourceId, Trigger, TriggerAlgorithm, TriggerContext, TriggerKey, TriggerQuery, TypeId,
};
use std::collections::VecDeque;
use tracing::{debug, warn};

// Two hits form an HLC pair when on the same string within this many
// positions of each other, and at most this far apart in time (ns).
const PAIR_MAX_POSITIONS: u32 = 2;
const PAIR_MAX_TIME: f64 = 1000.0;

/// How the three hits of a candidate triple must line up.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GeometricCriterion {
    /// `d12 + d23 - d13` must not exceed this many meters.
    MaxPathExcess(f64),
    /// The angle at the middle hit must be at least this many degrees.
    MinOpeningAngle(f64),
}

impl GeometricCriterion {
    fn accepts(&self, d12: f64, d23: f64, d13: f64) -> bool {
        match *self {
            GeometricCriterion::MaxPathExcess(delta_d) => d12 + d23 - d13 <= delta_d,
            GeometricCriterion::MinOpeningAngle(alpha_min) => {
                let cos_alpha = (d12.powi(2) + d23.powi(2) - d13.powi(2)) / (2.0 * d12 * d23);
                cos_alpha <= alpha_min.to_radians().cos()
            }
        }
    }
}

// A trigger being assembled from overlapping triples.
#[derive(Clone, Copy, Debug)]
struct Candidate {
    start: f64,
    end: f64,
    n_tuples: u32,
}

/// Trigger for slow, bright particles crossing the detector.
///
/// Pairs of nearby hits on the same string (HLC pairs) are collected in time
/// order; pairs closer than `t_proximity` to the previous one are treated as
/// a muon and suppressed. Whenever the pair list can no longer grow, every
/// triple of pairs is checked for consistent timing, geometry and speed.
/// Accepted triples that overlap in time are merged into one candidate, which
/// becomes a trigger if it holds at least `min_n_tuples` triples.
#[derive(Clone, Debug, PartialEq, bon::Builder)]
pub struct SlowMonopoleTrigger {
    #[builder(default = TriggerKey::new(SourceId::InIce, TypeId::SlowParticle, None))]
    key: TriggerKey,
    t_proximity: f64,
    t_min: f64,
    t_max: f64,
    #[builder(default = 0.5)]
    rel_v: f64,
    #[builder(default = 0)]
    min_n_tuples: u32,
    max_event_length: f64,
    criterion: GeometricCriterion,
    dom_set: Option<i32>,
}

impl SlowMonopoleTrigger {
    /// Configures the trigger from the matching `IN_ICE SLOW_PARTICLE` status.
    ///
    /// `dc_algo` selects the geometric criterion: `true` requires `delta_d`,
    /// `false` requires `alpha_min`. Without `dc_algo`, `delta_d` is used if
    /// present, then `alpha_min`.
    pub fn from_status(status: &DetectorStatus, config_id: Option<i32>) -> Result<Self, ConfigError> {
        let query = TriggerQuery::builder()
            .source(SourceId::InIce)
            .type_id(TypeId::SlowParticle)
            .maybe_config_id(config_id)
            .build();
        let (key, ts) = status.trigger_status(&query)?;

        let delta_d: Option<f64> = ts.value("delta_d")?;
        let alpha_min: Option<f64> = ts.value("alpha_min")?;
        let criterion = match (ts.value::<bool>("dc_algo")?, delta_d, alpha_min) {
            (Some(true), Some(d), _) | (None, Some(d), _) => GeometricCriterion::MaxPathExcess(d),
            (Some(false), _, Some(a)) | (None, None, Some(a)) => {
                GeometricCriterion::MinOpeningAngle(a)
            }
            (Some(true), None, _) => {
                return Err(ConfigError::Inconsistent(format!(
                    "{key}: `dc_algo` is true but `delta_d` is not set"
                )))
            }
            (Some(false), _, None) => {
                return Err(ConfigError::Inconsistent(format!(
                    "{key}: `dc_algo` is false but `alpha_min` is not set"
                )))
            }
            (None, None, None) => {
                return Err(ConfigError::Inconsistent(format!(
                    "{key}: neither `delta_d` nor `alpha_min` is set"
                )))
            }
        };
        // A negative minimum accepts every candidate.
        let min_n_tuples = ts
            .value::<i64>("min_n_tuples")?
            .map_or(0, |n| u32::try_from(n.max(0)).unwrap_or(u32::MAX));

        Ok(Self::builder()
            .key(key)
            .t_proximity(ts.require("t_proximity")?)
            .t_min(ts.require("t_min")?)
            .t_max(ts.require("t_max")?)
            .rel_v(ts.value("rel_v")?.unwrap_or(0.5))
            .min_n_tuples(min_n_tuples)
            .max_event_length(ts.require("max_event_length")?)
            .criterion(criterion)
            .maybe_dom_set(ts.value("domSet")?)
            .build())
    }
    /// Runs the algorithm on time-ordered hits.
    pub fn find(&self, hits: &[TriggerHit], geometry: &Geometry) -> Vec<Trigger> {
        let mut state = State {
            config: self,
            geometry,
            singles: VecDeque::new(),
            pairs: Vec::new(),
            muon_time: None,
            triggers: Vec::new(),
        };
        for hit in hits {
            state.add_hit(*hit);
        }
        state.check_pairs();
        state.triggers
    }
}

struct State<'a> {
    config: &'a SlowMonopoleTrigger,
    geometry: &'a Geometry,
    singles: VecDeque<TriggerHit>,
    pairs: Vec<TriggerHit>,
    // Time of the last pair attributed to a muon.
    muon_time: Option<f64>,
    triggers: Vec<Trigger>,
}

impl State<'_> {
    fn add_hit(&mut self, hit: TriggerHit) {
        while self
            .singles
            .front()
            .is_some_and(|first| (hit.time - first.time).abs() > PAIR_MAX_TIME)
        {
            self.singles.pop_front();
        }

        let mut i = 0;
        while i < self.singles.len() {
            let single = self.singles[i];
            if single.string == hit.string && single.pos.abs_diff(hit.pos) <= PAIR_MAX_POSITIONS {
                self.add_pair(single);
                self.singles.remove(i);
            } else {
                i += 1;
            }
        }
        self.singles.push_back(hit);

        // No later hit can extend the pair list.
        let stale = match (self.singles.front(), self.pairs.last()) {
            (Some(first), Some(last)) => first.time - last.time > self.config.t_max,
            _ => false,
        };
        if stale {
            self.check_pairs();
        }
    }

    fn add_pair(&mut self, pair: TriggerHit) {
        let t_proximity = self.config.t_proximity;
        if let Some(muon_time) = self.muon_time {
            if pair.time - muon_time <= t_proximity {
                self.muon_time = Some(pair.time);
                return;
            }
            self.muon_time = None;
            if self.pairs.is_empty() {
                self.pairs.push(pair);
                return;
            }
        } else if let Some(last) = self.pairs.last() {
            if pair.time - last.time <= t_proximity {
                self.muon_time = Some(pair.time);
                self.pairs.pop();
                return;
            }
        } else {
            self.pairs.push(pair);
            return;
        }

        // The pair list is not empty here.
        let (Some(first), Some(last)) = (self.pairs.first(), self.pairs.last()) else {
            return;
        };
        if pair.time - last.time >= self.config.t_max
            || pair.time - first.time >= self.config.max_event_length
        {
            self.check_pairs();
        }
        self.pairs.push(pair);
    }
    // Evaluates every triple in the pair list, then clears it.
    fn check_pairs(&mut self) {
        let pairs = std::mem::take(&mut self.pairs);
        let mut candidates: Vec<Candidate> = Vec::new();
        for i in 0..pairs.len() {
            for j in i + 1..pairs.len() {
                for k in j + 1..pairs.len() {
                    if self.is_triple(&pairs[i], &pairs[j], &pairs[k]) {
                        add_triple(&mut candidates, pairs[i].time, pairs[k].time);
                    }
                }
            }
        }

        for candidate in candidates {
            if candidate.n_tuples >= self.config.min_n_tuples {
                debug!(
                    start = candidate.start,
                    end = candidate.end,
                    n_tuples = candidate.n_tuples,
                    "slow particle trigger"
                );
                self.triggers.push(Trigger::new(
                    self.config.key,
                    candidate.start,
                    candidate.end - candidate.start,
                ));
            }
        }
    }

    fn is_triple(&self, h1: &TriggerHit, h2: &TriggerHit, h3: &TriggerHit) -> bool {
        let config = self.config;
        let dt12 = h2.time - h1.time;
        let dt23 = h3.time - h2.time;
        if !(dt12 > config.t_min && dt23 > config.t_min && dt12 < config.t_max && dt23 < config.t_max)
        {
            return false;
        }

        let d12 = self.distance(h1, h2);
        let d23 = self.distance(h2, h3);
        let d13 = self.distance(h1, h3);
        // Also rejects hits without a known position.
        if !(d12 > 0.0 && d23 > 0.0 && d13 > 0.0) {
            return false;
        }
        if !config.criterion.accepts(d12, d23, d13) {
            return false;
        }

        let inv_v12 = dt12 / d12;
        let inv_v23 = dt23 / d23;
        let inv_v13 = (h3.time - h1.time) / d13;
        let inv_v_mean = (inv_v12 + inv_v23 + inv_v13) / 3.0;
        (inv_v23 - inv_v12).abs() / inv_v_mean <= config.rel_v
    }

    fn distance(&self, a: &TriggerHit, b: &TriggerHit) -> f64 {
        match (self.geometry.position(&a.dom()), self.geometry.position(&b.dom())) {
            (Some(pa), Some(pb)) => pa.distance(&pb),
            _ => {
                warn!(a = %a.dom(), b = %b.dom(), "hit without geometry");
                f64::NAN
            }
        }
    }
}

fn add_triple(candidates: &mut Vec<Candidate>, start: f64, end: f64) {
    let Some(last) = candidates.last_mut() else {
        candidates.push(Candidate {
            start,
            end,
            n_tuples: 1,
        });
        return;
    };
    if start >= last.start && start <= last.end {
        last.end = last.end.max(end);
        last.n_tuples += 1;
    } else if start > last.end {
        candidates.push(Candidate {
            start,
            end,
            n_tuples: 1,
        });
    }
}

impl TriggerAlgorithm for SlowMonopoleTrigger {
    fn key(&self) -> TriggerKey {
        self.key
    }

    fn run(&mut self, launches: &LaunchMap, context: &TriggerContext<'_>) -> Vec<Trigger> {
        let hits = lc_hits(launches, |dom| {
            self.dom_set
                .is_none_or(|set| in_dom_set(dom, set, context.dom_sets))
        });
        self.find(&hits, context.geometry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{OmGeo, OmType};
    use crate::key::{OmKey, Position};
    use crate::status::TriggerStatus;

    // Strings on a line 125 m apart, modules 17 m apart.
    fn geometry() -> Geometry {
        let mut geometry = Geometry::default();
        for string in 1..=10 {
            for om in 1..=60 {
                geometry.omgeo.insert(
                    OmKey::new(string, om),
                    OmGeo {
                        position: Position::new(125.0 * string as f64, 0.0, 500.0 - 17.0 * om as f64),
                        om_type: OmType::IceCube,
                    },
                );
            }
        }
        geometry
    }

    fn trigger() -> SlowMonopoleTrigger {
        SlowMonopoleTrigger::builder()
            .t_proximity(2500.0)
            .t_min(0.0)
            .t_max(500_000.0)
            .min_n_tuples(1)
            .max_event_length(5_000_000.0)
            .criterion(GeometricCriterion::MaxPathExcess(100.0))
            .build()
    }
    // An HLC pair on `string` starting at module `om` and time `t`.
    fn pair_at(string: i32, om: u32, t: f64) -> [TriggerHit; 2] {
        [
            TriggerHit::new(t, OmKey::new(string, om)),
            TriggerHit::new(t + 100.0, OmKey::new(string, om + 1)),
        ]
    }

    fn pair(string: i32, t: f64) -> [TriggerHit; 2] {
        pair_at(string, 30, t)
    }

    #[test]
    fn slow_track_across_strings() {
        // 125 m every 20 µs, about 2e-5 c.
        let hits: Vec<_> = (0..4).flat_map(|i| pair(i + 1, 20_000.0 * i as f64)).collect();
        let triggers = trigger().find(&hits, &geometry());
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].time, 0.0);
        assert_eq!(triggers[0].length, 60_000.0);
    }

    #[test]
    fn inconsistent_speed() {
        let hits: Vec<_> = [0.0, 20_000.0, 200_000.0]
            .into_iter()
            .zip(1..)
            .flat_map(|(t, string)| pair(string, t))
            .collect();
        assert!(trigger().find(&hits, &geometry()).is_empty());
    }

    #[test]
    fn fast_pairs_are_suppressed_as_muons() {
        // Consecutive pairs within t_proximity look like a muon.
        let hits: Vec<_> = (0..4).flat_map(|i| pair(i + 1, 1000.0 * i as f64)).collect();
        assert!(trigger().find(&hits, &geometry()).is_empty());
    }

    #[test]
    fn opening_angle() {
        // Out along the row of strings, then back and down.
        let hits: Vec<_> = [(1, 30, 0.0), (2, 30, 20_000.0), (1, 40, 40_000.0)]
            .into_iter()
            .flat_map(|(string, om, t)| pair_at(string, om, t))
            .collect();
        let geometry = geometry();
        let mut trigger = trigger();
        trigger.criterion = GeometricCriterion::MinOpeningAngle(140.0);
        assert!(trigger.find(&hits, &geometry).is_empty());
        trigger.criterion = GeometricCriterion::MinOpeningAngle(10.0);
        assert_eq!(trigger.find(&hits, &geometry).len(), 1);
    }

    #[test]
    fn min_n_tuples() {
        let hits: Vec<_> = (0..4).flat_map(|i| pair(i + 1, 20_000.0 * i as f64)).collect();
        let mut trigger = trigger();
        // Four collinear pairs give four triples.
        trigger.min_n_tuples = 4;
        assert_eq!(trigger.find(&hits, &geometry()).len(), 1);
        trigger.min_n_tuples = 5;
        assert!(trigger.find(&hits, &geometry()).is_empty());
    }

    #[test]
    fn criterion_from_status() {
        let key = TriggerKey::new(SourceId::InIce, TypeId::SlowParticle, Some(24002));
        let base = TriggerStatus::default()
            .with_setting("t_proximity", 2500)
            .with_setting("t_min", 0)
            .with_setting("t_max", 500000)
            .with_setting("max_event_length", 5000000)
            .with_setting("min_n_tuples", -1);
        let configure = |status: TriggerStatus| {
            let mut detector = DetectorStatus::default();
            detector.triggers.insert(key, status);
            SlowMonopoleTrigger::from_status(&detector, None)
        };

        let smt = configure(base.clone().with_setting("dc_algo", true).with_setting("delta_d", 100))
            .unwrap();
        assert_eq!(smt.criterion, GeometricCriterion::MaxPathExcess(100.0));
        assert_eq!(smt.min_n_tuples, 0);
        assert_eq!(smt.key, key);

        let smt = configure(
            base.clone()
                .with_setting("dc_algo", false)
                .with_setting("delta_d", 100)
                .with_setting("alpha_min", 140),
        )
        .unwrap();
        assert_eq!(smt.criterion, GeometricCriterion::MinOpeningAngle(140.0));

        assert!(matches!(
            configure(base.clone().with_setting("dc_algo", true)),
            Err(ConfigError::Inconsistent(_))
        ));
        let mut no_t_max = base.with_setting("alpha_min", 140);
        no_t_max.settings.remove("t_max");
        assert_eq!(
            configure(no_t_max),
            Err(ConfigError::MissingSetting {
                name: "t_max".to_string()
            })
        );
    }
}
