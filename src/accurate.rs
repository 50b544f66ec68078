//! Exact reference methods and error observation
//!
//! Protocol estimates are only meaningful next to the ground truth. The
//! methods here maintain the *exact* value of a monitored query from the
//! raw stream, incrementally: a frequency histogram per operand stream,
//! with the query value updated in O(1) per record. Standalone sketch
//! estimators (no distribution, no protocol) sit between the two extremes
//! and isolate the sketching error from the monitoring error.
//!
//! All of these attach to a run as plain ECA rules; see the tests for the
//! wiring.

use std::collections::BTreeMap;
use std::collections::VecDeque;

use crate::records::{Key, StreamId, StreamRecord};
use crate::sketch::{Projection, Sketch};

/// A sparse frequency counter over keys. It resembles a materialized
/// function more than a vector: absent keys count zero.
#[derive(Debug, Clone, Default)]
pub struct FrequencyVector {
    counts: BTreeMap<Key, i64>,
}

impl FrequencyVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current count of `key`.
    pub fn get(&self, key: Key) -> i64 {
        self.counts.get(&key).copied().unwrap_or(0)
    }

    /// Add `delta` to the count of `key`, returning the previous count.
    /// Counts that reach zero are dropped to keep the map packed.
    pub fn add(&mut self, key: Key, delta: i64) -> i64 {
        let slot = self.counts.entry(key).or_insert(0);
        let old = *slot;
        *slot += delta;
        if *slot == 0 {
            self.counts.remove(&key);
        }
        old
    }

    /// Number of keys with non-zero count.
    pub fn support(&self) -> usize {
        self.counts.len()
    }

    /// `Σ f(x)²` over the support.
    pub fn selfjoin(&self) -> f64 {
        self.counts.values().map(|&f| (f * f) as f64).sum()
    }

    /// Inner product with another frequency vector.
    pub fn inner_product(&self, other: &FrequencyVector) -> f64 {
        // walk the smaller support
        let (a, b) = if self.support() <= other.support() {
            (self, other)
        } else {
            (other, self)
        };
        a.counts.iter().map(|(&k, &f)| (f * b.get(k)) as f64).sum()
    }
}

/// Exact self-join size of one stream, maintained incrementally:
/// a record with multiplicity `u` on a key of count `f` moves the value by
/// `2fu + u²`.
#[derive(Debug, Clone)]
pub struct SelfjoinExact {
    sid: StreamId,
    histogram: FrequencyVector,
    curest: f64,
}

impl SelfjoinExact {
    pub fn new(sid: StreamId) -> Self {
        Self { sid, histogram: FrequencyVector::new(), curest: 0.0 }
    }

    /// Fold one record; non-matching streams are ignored.
    pub fn process_record(&mut self, rec: &StreamRecord) {
        if rec.sid != self.sid {
            return;
        }
        let u = rec.upd as i64;
        let f = self.histogram.add(rec.key, u);
        self.curest += (2 * f * u + u * u) as f64;
    }

    /// The exact query value.
    pub fn current_estimate(&self) -> f64 {
        self.curest
    }
}

/// Exact two-way join size, maintained incrementally: an update `u` to one
/// operand's key moves the value by `u · f_other(key)`.
#[derive(Debug, Clone)]
pub struct TwowayJoinExact {
    s1: StreamId,
    s2: StreamId,
    hist1: FrequencyVector,
    hist2: FrequencyVector,
    curest: f64,
}

impl TwowayJoinExact {
    pub fn new(s1: StreamId, s2: StreamId) -> Self {
        Self {
            s1,
            s2,
            hist1: FrequencyVector::new(),
            hist2: FrequencyVector::new(),
            curest: 0.0,
        }
    }

    pub fn process_record(&mut self, rec: &StreamRecord) {
        let u = rec.upd as i64;
        if rec.sid == self.s1 {
            self.hist1.add(rec.key, u);
            self.curest += (u * self.hist2.get(rec.key)) as f64;
        } else if rec.sid == self.s2 {
            self.hist2.add(rec.key, u);
            self.curest += (u * self.hist1.get(rec.key)) as f64;
        }
    }

    pub fn current_estimate(&self) -> f64 {
        self.curest
    }
}

/// A centralized (non-distributed) sketch estimator of a self-join: one
/// sketch fed by the whole stream, with the per-row estimate vector
/// maintained incrementally.
#[derive(Debug, Clone)]
pub struct SelfjoinAgmsEstimator {
    sid: StreamId,
    sk: Sketch,
    rows: Vec<f64>,
}

impl SelfjoinAgmsEstimator {
    pub fn new(sid: StreamId, proj: Projection) -> Self {
        let rows = vec![0.0; proj.depth()];
        Self { sid, sk: Sketch::new(proj), rows }
    }

    pub fn process_record(&mut self, rec: &StreamRecord) {
        if rec.sid != self.sid {
            return;
        }
        let delta = self.sk.update(rec.key as i64, rec.upd as f64);
        self.sk.projection().dot_est_vec_inc(&mut self.rows, &delta);
    }

    /// Median-of-rows estimate from the incrementally maintained rows.
    pub fn current_estimate(&self) -> f64 {
        crate::linalg::median(self.rows.clone())
    }
}

/// A centralized sketch estimator of a two-way join.
#[derive(Debug, Clone)]
pub struct TwowayJoinAgmsEstimator {
    s1: StreamId,
    s2: StreamId,
    sk1: Sketch,
    sk2: Sketch,
    rows: Vec<f64>,
}

impl TwowayJoinAgmsEstimator {
    pub fn new(s1: StreamId, s2: StreamId, proj: Projection) -> Self {
        let rows = vec![0.0; proj.depth()];
        Self { s1, s2, sk1: Sketch::new(proj.clone()), sk2: Sketch::new(proj), rows }
    }

    pub fn process_record(&mut self, rec: &StreamRecord) {
        let proj = self.sk1.projection().clone();
        if rec.sid == self.s1 {
            let delta = self.sk1.update(rec.key as i64, rec.upd as f64);
            proj.dot_est_vec_inc_pair(&mut self.rows, &delta, &self.sk2);
        } else if rec.sid == self.s2 {
            let delta = self.sk2.update(rec.key as i64, rec.upd as f64);
            proj.dot_est_vec_inc_pair(&mut self.rows, &delta, &self.sk1);
        }
    }

    pub fn current_estimate(&self) -> f64 {
        crate::linalg::median(self.rows.clone())
    }
}

/// Streaming error statistics between an exact value and an estimate:
/// overall mean and variance (Welford) plus a rolling-window mean of the
/// relative error.
#[derive(Debug, Clone)]
pub struct EstimateErrorObserver {
    window: usize,
    recent: VecDeque<f64>,
    recent_sum: f64,
    count: usize,
    mean: f64,
    m2: f64,
}

impl EstimateErrorObserver {
    /// An observer with the given rolling-window length.
    pub fn new(window: usize) -> Self {
        assert!(window > 0, "rolling window cannot be empty");
        Self { window, recent: VecDeque::new(), recent_sum: 0.0, count: 0, mean: 0.0, m2: 0.0 }
    }

    /// Record one observation.
    pub fn observe(&mut self, exact: f64, estimate: f64) {
        let err = crate::linalg::relative_error(exact, estimate);

        self.count += 1;
        let d = err - self.mean;
        self.mean += d / self.count as f64;
        self.m2 += d * (err - self.mean);

        self.recent.push_back(err);
        self.recent_sum += err;
        if self.recent.len() > self.window {
            self.recent_sum -= self.recent.pop_front().expect("non-empty window");
        }
    }

    /// Number of observations.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Mean relative error over all observations.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Variance of the relative error over all observations.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    /// Mean relative error over the rolling window.
    pub fn rolling_mean(&self) -> f64 {
        if self.recent.is_empty() {
            0.0
        } else {
            self.recent_sum / self.recent.len() as f64
        }
    }
}
