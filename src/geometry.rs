//! Geometric safe-zone primitives: quorums, hyperbolas, bilinear zones
//!
//! These are the scalar building blocks every composite safe zone is made
//! of. A safe-zone function `ζ` maps a state vector to a real such that
//! `ζ ≥ 0` implies the monitored condition holds; the *eikonal* variants
//! additionally return the signed distance to the admissible boundary, which
//! is what makes the geometric protocols communication-optimal.
//!
//! ## Quorum composition
//!
//! A `(n,k)`-quorum lifts `n` per-row safe-zone values to a single scalar
//! that is non-negative iff at least `k` of the inputs are. Two forms are
//! provided: the eikonal form enumerates `m`-subsets of the legal index set
//! (`O(k·C(l, k-1))` per call) and the fast form uses an order statistic
//! (`O(l)`, not eikonal in general but sign-correct).

use crate::linalg::{sgn, sq};

/// Construction errors for geometric safe zones.
#[derive(Debug, thiserror::Error)]
pub enum GeometryError {
    #[error("quorum must satisfy 1 <= k <= n (k={k}, n={n})")]
    BadQuorum { k: usize, n: usize },
    #[error("the reference vector is non-admissible ({legal} legal rows < quorum {k})")]
    NonAdmissibleReference { legal: usize, k: usize },
}

/// Safe zone for boolean `(n,k)`-quorum conditions over per-row zone values.
///
/// `k = 1` is logical OR, `k = n` is AND, `k = (n+1)/2` the majority
/// function used by median-of-rows estimators.
#[derive(Debug, Clone)]
pub struct QuorumSafeZone {
    n: usize,
    k: usize,
    /// Indices of the legal inputs (rows with `ζ_i(E) > 0`).
    legal: Vec<usize>,
    /// The reference values `ζ_i(E)` restricted to the legal rows.
    zeta_e: Vec<f64>,
    eikonal: bool,
}

impl QuorumSafeZone {
    /// Prepare a quorum zone from the reference per-row values `z_e`.
    pub fn new_r(z_e: &[f64], k: usize, eikonal: bool) -> Result<Self, GeometryError> {
        let n = z_e.len();
        if k == 0 || k > n {
            return Err(GeometryError::BadQuorum { k, n });
        }
        let legal: Vec<usize> = (0..n).filter(|&i| z_e[i] > 0.0).collect();
        if legal.len() < k {
            return Err(GeometryError::NonAdmissibleReference { legal: legal.len(), k });
        }
        let zeta_e = legal.iter().map(|&i| z_e[i]).collect();
        Ok(Self { n, k, legal, zeta_e, eikonal })
    }

    /// Like [`new_r`](Self::new_r), panicking on a non-admissible reference.
    pub fn new(z_e: &[f64], k: usize, eikonal: bool) -> Self {
        Self::new_r(z_e, k, eikonal).expect("quorum construction failed")
    }

    /// Number of inputs `n`.
    pub fn n(&self) -> usize {
        self.n
    }

    /// Quorum threshold `k`.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Number of legal (admissible-at-reference) inputs.
    pub fn legal_len(&self) -> usize {
        self.legal.len()
    }

    /// Evaluate on the per-row values `z_x` of the current state.
    pub fn zeta(&self, z_x: &[f64]) -> f64 {
        if self.eikonal {
            self.zeta_eikonal(z_x)
        } else {
            self.zeta_non_eikonal(z_x)
        }
    }

    /// The eikonal composition: minimum over all `m`-subsets `I` of the
    /// legal set of `Σ_I ζ_i(E)ζ_i(X) / sqrt(Σ_I ζ_i(E)²)`, `m = l-k+1`.
    pub fn zeta_eikonal(&self, z_x: &[f64]) -> f64 {
        debug_assert_eq!(z_x.len(), self.n);
        let l = self.legal.len();
        let m = l - self.k + 1;

        // precompute ζ_i(E)·ζ_i(X) and ζ_i(E)² over the legal set
        let zezx: Vec<f64> =
            self.legal.iter().zip(&self.zeta_e).map(|(&i, &ze)| ze * z_x[i]).collect();
        let ze2: Vec<f64> = self.zeta_e.iter().map(|&ze| ze * ze).collect();

        let zeta_of = |ix: &[usize]| {
            let mut num = 0.0;
            let mut denom = 0.0;
            for &i in ix {
                num += zezx[i];
                denom += ze2[i];
            }
            num / denom.sqrt()
        };

        // exhaustively enumerate m-subsets in lexicographic order
        let mut subset: Vec<usize> = (0..m).collect();
        let mut zinf = zeta_of(&subset);
        while next_subset(&mut subset, l) {
            zinf = zinf.min(zeta_of(&subset));
        }
        zinf
    }

    /// The fast composition: sum of the `l-k+1` smallest values of
    /// `ζ_i(E)·ζ_i(X)` over the legal set. Sign-correct, not eikonal.
    pub fn zeta_non_eikonal(&self, z_x: &[f64]) -> f64 {
        debug_assert_eq!(z_x.len(), self.n);
        let mut zezx: Vec<f64> =
            self.legal.iter().zip(&self.zeta_e).map(|(&i, &ze)| ze * z_x[i]).collect();
        let l = zezx.len();
        let cut = l - self.k;
        zezx.select_nth_unstable_by(cut, |a, b| a.partial_cmp(b).expect("NaN in quorum"));
        zezx[..=cut].iter().sum()
    }
}

/// Advance `ix` to the next strictly-increasing `m`-sequence over `[0, l)`,
/// returning false after the last one.
fn next_subset(ix: &mut [usize], l: usize) -> bool {
    let m = ix.len();
    for i in 1..=m {
        if ix[m - i] < l - i {
            ix[m - i] += 1;
            for j in 1..i {
                ix[m - i + j] = ix[m - i] + j;
            }
            return true;
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Hyperbola nearest neighbor
// ---------------------------------------------------------------------------

/// Default relative accuracy for the hyperbola root find, close to the
/// precision of IEEE 754 doubles.
pub const HYPERBOLA_EPSILON: f64 = 1e-13;

/// Return `ξ ≥ 0` minimizing the distance from `(p, q)` to the curve
/// `y(x) = sqrt(x² + T)`, for `T ≥ 0`.
///
/// The nearest point satisfies `p/ξ + q/y(ξ) = 2`; the root of
/// `g(x) = 2 − p/x − q/y(x)` is found by bracketed bisection with the
/// brackets `x₀ = sgn(p)·|p|/(2.1 + |q|/√T)` and
/// `x₁ = sgn(p)·0.51·(|p| + max(0, q))`, terminating at relative tolerance
/// `epsilon` or after 50 iterations. The cases `T = 0`, `p = 0` and `q = 0`
/// have closed-form answers and do not enter the iteration.
///
/// Calling with `T < 0` is a domain error and panics.
pub fn hyperbola_nearest_neighbor(p: f64, q: f64, t: f64, epsilon: f64) -> f64 {
    assert!(t >= 0.0, "hyperbola_nearest_neighbor called with T<0");

    if t == 0.0 {
        // the curve degenerates to y = |x|
        return if p < 0.0 {
            if q <= p {
                0.0
            } else {
                0.5 * (p - q)
            }
        } else if q <= -p {
            0.0
        } else {
            0.5 * (p + q)
        };
    }
    if p == 0.0 {
        return if q > 2.0 * t.sqrt() { (sq(q / 2.0) - t).sqrt() } else { 0.0 };
    }
    if q == 0.0 {
        return p / 2.0;
    }

    let g = |x: f64| 2.0 - p / x - q / (sq(x) + t).sqrt();

    let x0 = (p.abs() / (2.1 + q.abs() / t.sqrt())).copysign(p);
    let x1 = (0.51 * (p.abs() + q.max(0.0))).copysign(p);
    let g0 = g(x0);
    let g1 = g(x1);
    debug_assert!(g0 <= 0.0, "lower bracket does not bound the root");
    debug_assert!(g1 >= 0.0, "upper bracket does not bound the root");
    if g0 == 0.0 {
        return x0;
    }
    if g1 == 0.0 {
        return x1;
    }

    // g(xneg) < 0 < g(xpos) throughout
    let (mut xneg, mut xpos) = (x0, x1);
    let mut xm = 0.5 * (xneg + xpos);
    for _ in 0..50 {
        if ((xpos - xneg) / xm).abs() < epsilon {
            break;
        }
        let gm = g(xm);
        if gm > 0.0 {
            xpos = xm;
        } else if gm < 0.0 {
            xneg = xm;
        } else {
            break;
        }
        xm = 0.5 * (xneg + xpos);
    }
    xm
}

// ---------------------------------------------------------------------------
// Bilinear 2-D safe zone
// ---------------------------------------------------------------------------

/// A safe zone for the two-dimensional condition `x² − y² ≥ T`.
///
/// The reference point `(ξ, ψ)` must satisfy the condition. For `T > 0` the
/// value is the signed Euclidean distance of `(x·sgn ξ, y)` to the branch
/// `u = sqrt(v² + T)`. For `T ≤ 0` the zone is the eikonal half-plane
/// `u·x − v·|y| − T' ≥ 0` through the (normalized) conic point nearest the
/// reference, cached at construction. When `T = 0` and `ξ = 0` the
/// positive-`x` zone is selected.
#[derive(Debug, Clone)]
pub struct Bilinear2dSafeZone {
    epsilon: f64,
    t: f64,
    /// `sgn ξ`, cached for the `T > 0` branch.
    xi_hat: f64,
    /// Half-plane coefficients, cached for the `T ≤ 0` branch.
    u: f64,
    v: f64,
}

impl Bilinear2dSafeZone {
    /// Construct the zone for reference point `(xi, psi)` and threshold `t`.
    pub fn new(xi: f64, psi: f64, t: f64) -> Self {
        let epsilon = HYPERBOLA_EPSILON;
        let (mut u, mut v) = (0.0, 0.0);
        let mut t_out = t;
        if t < 0.0 {
            u = hyperbola_nearest_neighbor(xi, psi.abs(), -t, epsilon);
            v = (sq(u) - t).sqrt();
            let norm_uv = (sq(u) + sq(v)).sqrt();
            debug_assert!(norm_uv > 0.0);
            u /= norm_uv;
            v /= norm_uv;
            t_out = t / norm_uv;
        } else if t == 0.0 {
            u = if xi >= 0.0 { 1.0 / 2f64.sqrt() } else { -1.0 / 2f64.sqrt() };
            v = 1.0 / 2f64.sqrt();
        }
        Self { epsilon, t: t_out, xi_hat: sgn(xi), u, v }
    }

    /// The zone value at `(x, y)`.
    pub fn zeta(&self, x: f64, y: f64) -> f64 {
        if self.t > 0.0 {
            let x_hat = x * self.xi_hat;
            let sgn_delta = sgn(x_hat - (sq(y) + self.t).sqrt());
            let v = hyperbola_nearest_neighbor(y, x_hat, self.t, self.epsilon);
            let u = (sq(v) + self.t).sqrt();
            sgn_delta * (sq(x_hat - u) + sq(y - v)).sqrt()
        } else {
            self.u * x - self.v * y.abs() - self.t
        }
    }
}
