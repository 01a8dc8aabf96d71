use crate::launch::LaunchMap;
use crate::key::OmKey;
use std::cmp::Ordering;

/// A launch reduced to what the trigger algorithms look at.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TriggerHit {
    pub time: f64,
    /// Position of the module along its string.
    pub pos: u32,
    pub string: i32,
}

impl TriggerHit {
    pub fn new(time: f64, dom: OmKey) -> Self {
        Self {
            time,
            pos: dom.om,
            string: dom.string,
        }
    }

    pub fn dom(&self) -> OmKey {
        OmKey::new(self.string, self.pos)
    }
    /// Orders hits by time only.
    pub fn cmp_time(&self, other: &Self) -> Ordering {
        self.time.total_cmp(&other.time)
    }
}

/// Sorts hits by time, keeping the relative order of equal times.
pub fn sort_hits(hits: &mut [TriggerHit]) {
    hits.sort_by(TriggerHit::cmp_time);
}

/// Collects one hit per launch with the LC bit set, for the modules accepted
/// by `filter`. The result is sorted by time.
pub fn lc_hits<F>(launches: &LaunchMap, mut filter: F) -> Vec<TriggerHit>
where
    F: FnMut(&OmKey) -> bool,
{
    let mut hits: Vec<TriggerHit> = launches
        .iter()
        .filter(|(dom, _)| filter(dom))
        .flat_map(|(dom, series)| {
            series
                .iter()
                .filter(|launch| launch.lc_bit)
                .map(move |launch| TriggerHit::new(launch.start_time, *dom))
        })
        .collect();
    sort_hits(&mut hits);
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::DomLaunch;

    #[test]
    fn sort_is_stable() {
        let mut hits = vec![
            TriggerHit::new(2.0, OmKey::new(1, 1)),
            TriggerHit::new(1.0, OmKey::new(1, 2)),
            TriggerHit::new(2.0, OmKey::new(1, 3)),
        ];
        sort_hits(&mut hits);
        assert_eq!(
            hits.iter().map(|h| h.pos).collect::<Vec<_>>(),
            vec![2, 1, 3]
        );
    }

    #[test]
    fn only_lc_launches_become_hits() {
        let mut launches = LaunchMap::new();
        let mut hlc = DomLaunch::new(10.0);
        hlc.lc_bit = true;
        let slc = DomLaunch::new(5.0);
        launches.insert(OmKey::new(3, 4), vec![slc.clone(), hlc.clone()]);
        launches.insert(OmKey::new(90, 4), vec![hlc]);

        let hits = lc_hits(&launches, |dom| dom.string < 80);
        assert_eq!(hits, vec![TriggerHit::new(10.0, OmKey::new(3, 4))]);
    }
}
