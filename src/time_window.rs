//! Grouping of hits into time windows.
use crate::hit::{sort_hits, TriggerHit};
use std::collections::VecDeque;
use std::ops::Range;

/// Multiplicity condition over a time window.
///
/// A window is any group of at least `threshold` hits that fit within
/// `window` ns of each other.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeWindow {
    threshold: usize,
    window: f64,
}

impl TimeWindow {
    pub fn new(threshold: usize, window: f64) -> Self {
        Self { threshold, window }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn window(&self) -> f64 {
        self.window
    }
    /// Sorts `hits` and returns the index ranges of every sliding window.
    ///
    /// The window opens once `threshold` hits fall within `window` of the
    /// earliest of them. An open window keeps extending while consecutive
    /// hits are at most `window` apart, and closes at the first larger gap.
    ///
    /// # Examples
    ///
    /// ```
    /// use trigsim::hit::TriggerHit;
    /// use trigsim::key::OmKey;
    /// use trigsim::time_window::TimeWindow;
    ///
    /// let mut hits: Vec<_> = [0.0, 5.0, 8.0, 100.0]
    ///     .into_iter()
    ///     .map(|t| TriggerHit::new(t, OmKey::new(1, 1)))
    ///     .collect();
    ///
    /// let windows = TimeWindow::new(3, 10.0).sliding_time_windows(&mut hits);
    /// assert_eq!(windows, vec![0..3]);
    /// ```
    pub fn sliding_time_windows(&self, hits: &mut [TriggerHit]) -> Vec<Range<usize>> {
        sort_hits(hits);

        let mut windows = Vec::new();
        if self.threshold == 0 || hits.is_empty() {
            return windows;
        }

        let mut buffer: VecDeque<usize> = VecDeque::new();
        let mut triggered = false;
        for (i, hit) in hits.iter().enumerate() {
            if triggered {
                let last = buffer.back().copied().unwrap_or(i);
                if hit.time - hits[last].time <= self.window {
                    buffer.push_back(i);
                    continue;
                }
                if let (Some(&first), Some(&last)) = (buffer.front(), buffer.back()) {
                    windows.push(first..last + 1);
                }
                buffer.clear();
                triggered = false;
            }

            while let Some(&front) = buffer.front() {
                if hit.time - hits[front].time > self.window {
                    buffer.pop_front();
                } else {
                    break;
                }
            }
            buffer.push_back(i);
            if buffer.len() >= self.threshold {
                triggered = true;
            }
        }
        if triggered {
            if let (Some(&first), Some(&last)) = (buffer.front(), buffer.back()) {
                windows.push(first..last + 1);
            }
        }

        windows
    }
    /// Sorts `hits` and returns the index ranges of every fixed bin
    /// `[t0 + k·window, t0 + (k+1)·window)` holding at least `threshold` hits,
    /// where `t0` is the time of the earliest hit.
    pub fn fixed_time_windows(&self, hits: &mut [TriggerHit]) -> Vec<Range<usize>> {
        sort_hits(hits);

        let mut windows = Vec::new();
        let Some(first) = hits.first() else {
            return windows;
        };
        let t0 = first.time;

        let mut start = 0;
        while start < hits.len() {
            let bin = ((hits[start].time - t0) / self.window).floor();
            let stop = t0 + (bin + 1.0) * self.window;
            let end = start + hits[start..].partition_point(|h| h.time < stop);
            if end - start >= self.threshold.max(1) {
                windows.push(start..end);
            }
            start = end.max(start + 1);
        }

        windows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::OmKey;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn hit(time: f64) -> TriggerHit {
        TriggerHit::new(time, OmKey::new(1, 1))
    }

    #[test]
    fn multiple_windows() {
        let mut rng = StdRng::seed_from_u64(1);
        for threshold in 3..20 {
            let window = rng.random_range(1000.0..11000.0);
            let n_windows = rng.random_range(1..10);

            let mut hits = Vec::new();
            let mut bounds = Vec::new();
            for n in 0..n_windows {
                let shift = 2.0 * n as f64 * (window + 1.0);
                let times: Vec<f64> = (0..threshold)
                    .map(|_| shift + rng.random_range(0.0..window))
                    .collect();
                let first = times.iter().copied().fold(f64::INFINITY, f64::min);
                let last = times.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                bounds.push((first, last));
                hits.extend(times.into_iter().map(hit));
            }

            let windows = TimeWindow::new(threshold, window).sliding_time_windows(&mut hits);
            assert_eq!(windows.len(), n_windows);
            for (range, (first, last)) in windows.into_iter().zip(bounds) {
                assert_eq!(range.len(), threshold);
                assert_eq!(hits[range.start].time, first);
                assert_eq!(hits[range.end - 1].time, last);
            }
        }
    }

    #[test]
    fn straggler() {
        // The time window is extended until the time difference between
        // consecutive hits is outside the time window.
        let mut rng = StdRng::seed_from_u64(2);
        for threshold in 2..10 {
            let window = rng.random_range(100.0..1000.0);
            let mut hits: Vec<_> = (0..threshold - 1)
                .map(|_| hit(rng.random_range(0.0..1.0)))
                .collect();
            for n in 1..50 {
                hits.push(hit(n as f64 * 0.999 * window));
            }

            let windows = TimeWindow::new(threshold, window).sliding_time_windows(&mut hits);
            assert_eq!(windows, vec![0..hits.len()]);
        }
    }

    #[test]
    fn connector() {
        let mut rng = StdRng::seed_from_u64(3);
        for threshold in 2..10 {
            let window = rng.random_range(100.0..1000.0);
            let mut hits = Vec::new();
            for n in 0..5 {
                let start = 2.0 * n as f64 * 0.99 * window;
                for _ in 0..threshold - 1 {
                    hits.push(hit(start + rng.random_range(0.0..1.0)));
                }
                hits.push(hit((2 * n + 1) as f64 * 0.99 * window));
            }

            let windows = TimeWindow::new(threshold, window).sliding_time_windows(&mut hits);
            assert_eq!(windows, vec![0..hits.len()]);
        }
    }

    #[test]
    fn threshold() {
        for threshold in 1..20 {
            let mut hits: Vec<_> = (1..=10).map(|t| hit(t as f64)).collect();
            let windows = TimeWindow::new(threshold, 15.0).sliding_time_windows(&mut hits);
            assert_eq!(windows.len(), usize::from(threshold <= 10));
        }
    }

    #[test]
    fn unsorted_input() {
        let mut hits = vec![hit(50.0), hit(0.0), hit(10.0), hit(1000.0), hit(20.0)];
        let windows = TimeWindow::new(3, 30.0).sliding_time_windows(&mut hits);
        assert_eq!(windows, vec![0..4]);
        assert_eq!(hits[3].time, 50.0);
    }

    #[test]
    fn fixed_bins() {
        let mut hits: Vec<_> = [0.0, 1.0, 2.0, 9.9, 10.0, 25.0, 26.0, 27.0]
            .into_iter()
            .map(hit)
            .collect();
        let windows = TimeWindow::new(3, 10.0).fixed_time_windows(&mut hits);
        assert_eq!(windows, vec![0..4, 5..8]);
    }

    #[test]
    fn empty_input() {
        let window = TimeWindow::new(1, 10.0);
        assert!(window.sliding_time_windows(&mut []).is_empty());
        assert!(window.fixed_time_windows(&mut []).is_empty());
    }
}
