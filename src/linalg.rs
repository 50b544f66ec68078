//! Dense vectors, delta vectors, and incremental computation primitives
//!
//! The whole monitoring stack runs on flat `f64` vectors. A function `F(X)`
//! has a "from-scratch" form and, where it pays off, an incremental form
//! `F_inc(state, ΔX)` that is mathematically equal to `F(X')` where `X'` is
//! `X` with the delta applied. The incremental state is either the previous
//! scalar result (dot products, squared norms) or a small per-row vector
//! (sketch estimators, see `sketch`).
//!
//! ## The delta contract
//!
//! A [`DeltaVector`] is a triple `(index, xold, xnew)` of equal length with
//! `index` sorted strictly increasing: element `index[i]` of the underlying
//! vector changed from `xold[i]` to `xnew[i]`. Every incremental routine in
//! this crate consumes deltas under this contract; constructing one with an
//! unsorted index is a programmer error and is rejected loudly.

use rand::distributions::{Distribution, Uniform};
use rand::Rng;

/// Errors for malformed delta shapes.
#[derive(Debug, thiserror::Error)]
pub enum DeltaError {
    #[error("delta arrays have mismatched lengths ({index}/{xold}/{xnew})")]
    LengthMismatch { index: usize, xold: usize, xnew: usize },
    #[error("delta index is not sorted strictly increasing at position {0}")]
    UnsortedIndex(usize),
}

/// A compressed description of a change to a few cells of a large vector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaVector {
    /// Changed positions, sorted strictly increasing.
    pub index: Vec<usize>,
    /// Values before the change.
    pub xold: Vec<f64>,
    /// Values after the change.
    pub xnew: Vec<f64>,
}

impl DeltaVector {
    /// An empty delta (no change).
    pub fn empty() -> Self {
        Self::default()
    }

    /// A zero delta over the given positions.
    pub fn with_index(index: Vec<usize>) -> Self {
        let n = index.len();
        Self { index, xold: vec![0.0; n], xnew: vec![0.0; n] }
    }

    /// Validate and build a delta from raw parts.
    pub fn from_parts_r(
        index: Vec<usize>,
        xold: Vec<f64>,
        xnew: Vec<f64>,
    ) -> Result<Self, DeltaError> {
        if index.len() != xold.len() || index.len() != xnew.len() {
            return Err(DeltaError::LengthMismatch {
                index: index.len(),
                xold: xold.len(),
                xnew: xnew.len(),
            });
        }
        for i in 1..index.len() {
            if index[i - 1] >= index[i] {
                return Err(DeltaError::UnsortedIndex(i));
            }
        }
        Ok(Self { index, xold, xnew })
    }

    /// Build a delta from raw parts, panicking on a malformed shape.
    pub fn from_parts(index: Vec<usize>, xold: Vec<f64>, xnew: Vec<f64>) -> Self {
        Self::from_parts_r(index, xold, xnew).expect("malformed delta vector")
    }

    /// Number of changed cells.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// True when the delta describes no change.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Apply this delta to a vector: `a[index[i]] += xnew[i] - xold[i]`.
    pub fn apply_to(&self, a: &mut [f64]) {
        for i in 0..self.len() {
            a[self.index[i]] += self.xnew[i] - self.xold[i];
        }
    }

    /// Re-express the delta against a new base vector `a`, keeping the
    /// difference `xnew - xold` unchanged.
    pub fn rebase(&mut self, a: &[f64]) {
        for i in 0..self.len() {
            let diff = self.xnew[i] - self.xold[i];
            self.xold[i] = a[self.index[i]];
            self.xnew[i] = self.xold[i] + diff;
        }
    }

    /// Re-express against the zero vector.
    pub fn rebase_zero(&mut self) {
        for i in 0..self.len() {
            self.xnew[i] -= self.xold[i];
            self.xold[i] = 0.0;
        }
    }

    /// Rebase onto `a` and write the new values back into it. Equivalent to
    /// `rebase(a)` followed by `a[index] = xnew`.
    pub fn rebase_apply(&mut self, a: &mut [f64]) {
        self.rebase(a);
        for i in 0..self.len() {
            a[self.index[i]] = self.xnew[i];
        }
    }

    /// Shift all indices by `offset` (used to place an operand delta inside
    /// a concatenated state vector).
    pub fn shift_index(&mut self, offset: usize) {
        for ix in &mut self.index {
            *ix += offset;
        }
    }

    /// Shift all indices down by `offset` (inverse of
    /// [`shift_index`](Self::shift_index)).
    pub fn shift_index_back(&mut self, offset: usize) {
        for ix in &mut self.index {
            debug_assert!(*ix >= offset);
            *ix -= offset;
        }
    }

    /// Add the matching cells of `a` to both `xold` and `xnew`, turning a
    /// drift delta into a delta of `E + U`.
    pub fn offset_by(&mut self, a: &[f64]) {
        for i in 0..self.len() {
            self.xold[i] += a[self.index[i]];
            self.xnew[i] += a[self.index[i]];
        }
    }

    /// Scale both old and new values by `c`.
    pub fn scale(&mut self, c: f64) {
        for i in 0..self.len() {
            self.xold[i] *= c;
            self.xnew[i] *= c;
        }
    }

    /// Keep only the cells whose index satisfies `pred`.
    pub fn filtered(&self, pred: impl Fn(usize) -> bool) -> DeltaVector {
        let mut out = DeltaVector::empty();
        for i in 0..self.len() {
            if pred(self.index[i]) {
                out.index.push(self.index[i]);
                out.xold.push(self.xold[i]);
                out.xnew.push(self.xnew[i]);
            }
        }
        out
    }

    /// Merge two deltas over the same underlying vector with a pointwise
    /// combiner; absent cells contribute 0. Both inputs must honour the
    /// sorted-index contract, and so does the result.
    pub fn combine(a: &DeltaVector, b: &DeltaVector, f: impl Fn(f64, f64) -> f64) -> DeltaVector {
        let mut out = DeltaVector::empty();
        let (mut i, mut j) = (0usize, 0usize);
        while i < a.len() || j < b.len() {
            let take_a = j >= b.len() || (i < a.len() && a.index[i] < b.index[j]);
            let take_b = i >= a.len() || (j < b.len() && b.index[j] < a.index[i]);
            if take_a {
                out.index.push(a.index[i]);
                out.xold.push(f(a.xold[i], 0.0));
                out.xnew.push(f(a.xnew[i], 0.0));
                i += 1;
            } else if take_b {
                out.index.push(b.index[j]);
                out.xold.push(f(0.0, b.xold[j]));
                out.xnew.push(f(0.0, b.xnew[j]));
                j += 1;
            } else {
                out.index.push(a.index[i]);
                out.xold.push(f(a.xold[i], b.xold[j]));
                out.xnew.push(f(a.xnew[i], b.xnew[j]));
                i += 1;
                j += 1;
            }
        }
        out
    }

    /// Pointwise sum of two deltas.
    pub fn sum(a: &DeltaVector, b: &DeltaVector) -> DeltaVector {
        Self::combine(a, b, |x, y| x + y)
    }

    /// Pointwise difference of two deltas.
    pub fn diff(a: &DeltaVector, b: &DeltaVector) -> DeltaVector {
        Self::combine(a, b, |x, y| x - y)
    }
}

// ---------------------------------------------------------------------------
// Dot products and norms
// ---------------------------------------------------------------------------

/// Dot product of two equal-length slices.
pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `x · x`.
pub fn dot_self(a: &[f64]) -> f64 {
    a.iter().map(|x| x * x).sum()
}

/// Incremental dot product against a fixed second operand:
/// updates and returns `x' · y` given the previous value of `x · y`.
pub fn dot_inc(old: &mut f64, dx: &DeltaVector, y: &[f64]) -> f64 {
    for i in 0..dx.len() {
        *old += (dx.xnew[i] - dx.xold[i]) * y[dx.index[i]];
    }
    *old
}

/// Incremental `x · x`: updates and returns the squared norm.
pub fn dot_self_inc(old: &mut f64, dx: &DeltaVector) -> f64 {
    for i in 0..dx.len() {
        *old += dx.xnew[i] * dx.xnew[i] - dx.xold[i] * dx.xold[i];
    }
    *old
}

/// L1 norm.
pub fn norm_l1(a: &[f64]) -> f64 {
    a.iter().map(|x| x.abs()).sum()
}

/// L2 (Euclidean) norm.
pub fn norm_l2(a: &[f64]) -> f64 {
    dot_self(a).sqrt()
}

/// L∞ (Chebyshev) norm.
pub fn norm_linf(a: &[f64]) -> f64 {
    a.iter().fold(0.0, |m, x| m.max(x.abs()))
}

/// From-scratch L2 norm that also initializes the incremental state (the
/// squared norm). Taking the square root of the maintained square avoids the
/// drift of repeatedly rooting and squaring the result.
pub fn norm_l2_with_inc(state: &mut f64, a: &[f64]) -> f64 {
    *state = dot_self(a);
    state.sqrt()
}

/// Incremental L2 norm; `state` is the maintained squared norm.
pub fn norm_l2_inc(state: &mut f64, dx: &DeltaVector) -> f64 {
    dot_self_inc(state, dx);
    // Numerical cancellation can push the square slightly negative.
    state.max(0.0).sqrt()
}

// ---------------------------------------------------------------------------
// Order statistics
// ---------------------------------------------------------------------------

/// Return the `k`-th order statistic (0-based) of `v` in expected O(n).
pub fn order_select(k: usize, mut v: Vec<f64>) -> f64 {
    assert!(k < v.len(), "order statistic {k} out of range {}", v.len());
    let (_, kth, _) = v.select_nth_unstable_by(k, |a, b| a.partial_cmp(b).expect("NaN in order_select"));
    *kth
}

/// Median of `v` (upper median for even length, matching the estimator
/// convention for sketches of even depth).
pub fn median(v: Vec<f64>) -> f64 {
    let k = v.len() / 2;
    order_select(k, v)
}

// ---------------------------------------------------------------------------
// Small numeric helpers
// ---------------------------------------------------------------------------

/// `x²`.
#[inline]
pub fn sq(x: f64) -> f64 {
    x * x
}

/// Sign of `x` as ±1.0 or 0.0.
#[inline]
pub fn sgn(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Relative error of `estimate` with respect to `exact`.
pub fn relative_error(exact: f64, estimate: f64) -> f64 {
    if exact == 0.0 {
        if estimate == 0.0 {
            0.0
        } else {
            estimate
        }
    } else {
        ((exact - estimate) / exact).abs()
    }
}

/// A vector with elements drawn uniformly from `[a, b]`.
pub fn uniform_random_vector(n: usize, a: f64, b: f64, rng: &mut impl Rng) -> Vec<f64> {
    let dist = Uniform::new_inclusive(a, b);
    (0..n).map(|_| dist.sample(rng)).collect()
}
