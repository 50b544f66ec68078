//! Safe zones for AGMS-sketched queries
//!
//! Composite safe-zone functions over sketch state vectors, built from the
//! primitives in `geometry`. Each function follows the incremental API
//! pattern of this crate: `zeta(X)` computes from scratch, `with_inc` does
//! the same while initializing an incremental state, and `inc` consumes a
//! [`DeltaVector`] and is mathematically equal to the from-scratch value on
//! the updated input.
//!
//! The input of every function here is a *state vector* (for arity-2 queries
//! the concatenation of two sketches), not a drift vector; the protocol
//! layer translates drifts by the current global estimate before calling in.

use std::f64::consts::FRAC_1_SQRT_2;

use crate::geometry::{Bilinear2dSafeZone, GeometryError, QuorumSafeZone};
use crate::linalg::{dot, dot_inc, norm_l2, norm_l2_inc, norm_l2_with_inc, DeltaVector};
use crate::sketch::Projection;

/// Construction errors for composite safe zones.
#[derive(Debug, thiserror::Error)]
pub enum SafeZoneError {
    #[error("admissible region is empty (T_low={tlow} >= T_high={thigh})")]
    EmptyRegion { tlow: f64, thigh: f64 },
    #[error(transparent)]
    Geometry(#[from] GeometryError),
}

// ---------------------------------------------------------------------------
// Selfjoin upper bound:  med{ ‖X_i‖² } <= T
// ---------------------------------------------------------------------------

/// Safe zone for the upper bound on the selfjoin estimate: per row,
/// `ζ_i(X) = √T − ‖X_i‖`, composed by the median quorum.
#[derive(Debug, Clone)]
pub struct SelfjoinUpperBound {
    proj: Projection,
    sqrt_t: f64,
    median: QuorumSafeZone,
}

impl SelfjoinUpperBound {
    pub fn new_r(
        proj: &Projection,
        e: &[f64],
        t: f64,
        eikonal: bool,
    ) -> Result<Self, SafeZoneError> {
        let sqrt_t = t.sqrt();
        let z_e: Vec<f64> =
            proj.dot_est_vec(e).iter().map(|&n2| sqrt_t - n2.sqrt()).collect();
        let median = QuorumSafeZone::new_r(&z_e, (proj.depth() + 1) / 2, eikonal)?;
        Ok(Self { proj: proj.clone(), sqrt_t, median })
    }

    fn from_row_norms(&self, norms2: &[f64]) -> f64 {
        let z: Vec<f64> = norms2.iter().map(|&n2| self.sqrt_t - n2.max(0.0).sqrt()).collect();
        self.median.zeta(&z)
    }

    /// From-scratch value.
    pub fn zeta(&self, x: &[f64]) -> f64 {
        self.from_row_norms(&self.proj.dot_est_vec(x))
    }

    /// From-scratch value, initializing the per-row squared-norm state.
    pub fn with_inc(&self, state: &mut Vec<f64>, x: &[f64]) -> f64 {
        *state = self.proj.dot_est_vec(x);
        self.from_row_norms(state)
    }

    /// Incremental value.
    pub fn inc(&self, state: &mut [f64], dx: &DeltaVector) -> f64 {
        self.proj.dot_est_vec_inc(state, dx);
        self.from_row_norms(state)
    }
}

// ---------------------------------------------------------------------------
// Selfjoin lower bound:  med{ ‖X_i‖² } >= T
// ---------------------------------------------------------------------------

/// Safe zone for the lower bound on the selfjoin estimate: per row,
/// `ζ_i(X) = X_i·Ê_i − √T` with `Ê` the row-normalized reference, composed
/// by the median quorum. Degenerates to `+∞` when `T <= 0`.
#[derive(Debug, Clone)]
pub struct SelfjoinLowerBound {
    proj: Projection,
    sqrt_t: f64,
    /// Row-normalized reference; empty in the degenerate case.
    e_hat: Vec<f64>,
    median: Option<QuorumSafeZone>,
}

impl SelfjoinLowerBound {
    pub fn new_r(
        proj: &Projection,
        e: &[f64],
        t: f64,
        eikonal: bool,
    ) -> Result<Self, SafeZoneError> {
        if t <= 0.0 {
            return Ok(Self {
                proj: proj.clone(),
                sqrt_t: 0.0,
                e_hat: Vec::new(),
                median: None,
            });
        }
        let sqrt_t = t.sqrt();
        let dest: Vec<f64> = proj.dot_est_vec(e).iter().map(|&n2| n2.sqrt()).collect();
        let z_e: Vec<f64> = dest.iter().map(|&n| n - sqrt_t).collect();
        let median = Some(QuorumSafeZone::new_r(&z_e, (proj.depth() + 1) / 2, eikonal)?);

        // normalize each reference row by its norm; all-zero rows stay zero
        let mut e_hat = e.to_vec();
        let l = proj.width();
        for (d, &n) in dest.iter().enumerate() {
            if n > 0.0 {
                for v in &mut e_hat[d * l..(d + 1) * l] {
                    *v /= n;
                }
            }
        }
        Ok(Self { proj: proj.clone(), sqrt_t, e_hat, median })
    }

    fn from_row_dots(&self, dots: &[f64]) -> f64 {
        match &self.median {
            None => f64::INFINITY,
            Some(median) => {
                let z: Vec<f64> = dots.iter().map(|&d| d - self.sqrt_t).collect();
                median.zeta(&z)
            }
        }
    }

    /// From-scratch value.
    pub fn zeta(&self, x: &[f64]) -> f64 {
        if self.median.is_none() {
            return f64::INFINITY;
        }
        self.from_row_dots(&self.proj.dot_est_vec_pair(x, &self.e_hat))
    }

    /// From-scratch value, initializing the per-row dot state.
    pub fn with_inc(&self, state: &mut Vec<f64>, x: &[f64]) -> f64 {
        if self.median.is_none() {
            return f64::INFINITY;
        }
        *state = self.proj.dot_est_vec_pair(x, &self.e_hat);
        self.from_row_dots(state)
    }

    /// Incremental value.
    pub fn inc(&self, state: &mut [f64], dx: &DeltaVector) -> f64 {
        if self.median.is_none() {
            return f64::INFINITY;
        }
        self.proj.dot_est_vec_inc_pair(state, dx, &self.e_hat);
        self.from_row_dots(state)
    }
}

// ---------------------------------------------------------------------------
// Selfjoin combined:  T_low <= med{ ‖X_i‖² } <= T_high
// ---------------------------------------------------------------------------

/// Incremental state bundling both selfjoin bounds.
#[derive(Debug, Clone, Default)]
pub struct SelfjoinIncState {
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

/// Safe zone for `T_low <= dot_est(X) <= T_high`: the minimum of the lower-
/// and upper-bound zones.
#[derive(Debug, Clone)]
pub struct SelfjoinSafeZone {
    pub lower: SelfjoinLowerBound,
    pub upper: SelfjoinUpperBound,
}

impl SelfjoinSafeZone {
    pub fn new_r(
        proj: &Projection,
        e: &[f64],
        tlow: f64,
        thigh: f64,
        eikonal: bool,
    ) -> Result<Self, SafeZoneError> {
        if tlow >= thigh {
            return Err(SafeZoneError::EmptyRegion { tlow, thigh });
        }
        Ok(Self {
            lower: SelfjoinLowerBound::new_r(proj, e, tlow, eikonal)?,
            upper: SelfjoinUpperBound::new_r(proj, e, thigh, eikonal)?,
        })
    }

    pub fn zeta(&self, x: &[f64]) -> f64 {
        self.lower.zeta(x).min(self.upper.zeta(x))
    }

    pub fn with_inc(&self, state: &mut SelfjoinIncState, x: &[f64]) -> f64 {
        self.lower.with_inc(&mut state.lower, x).min(self.upper.with_inc(&mut state.upper, x))
    }

    pub fn inc(&self, state: &mut SelfjoinIncState, dx: &DeltaVector) -> f64 {
        self.lower.inc(&mut state.lower, dx).min(self.upper.inc(&mut state.upper, dx))
    }
}

// ---------------------------------------------------------------------------
// Inner product:  X_1 · X_2 {>=,<=} T
// ---------------------------------------------------------------------------

/// Incremental state for the inner-product zone: the polarized vectors and
/// the scalars fed to the 2-D zone.
#[derive(Debug, Clone, Default)]
pub struct InnerProductIncState {
    x: Vec<f64>,
    y: Vec<f64>,
    x2: f64,
    y2: f64,
}

/// An eikonal safe zone for `X_1·X_2 >= T` (or `<= T`), via the polarization
/// `ξ = X_1 + X_2`, `ψ = X_1 − X_2` and the 2-D zone for
/// `‖ξ‖² − ‖ψ‖² >= 4T`.
#[derive(Debug, Clone)]
pub struct InnerProductSafeZone {
    geq: bool,
    xi_hat: Vec<f64>,
    sqdiff: Bilinear2dSafeZone,
}

impl InnerProductSafeZone {
    /// Build for reference point `e` (the concatenation of the two operand
    /// vectors). `geq` selects the lower (`>=`) or upper (`<=`) condition.
    pub fn new(e: &[f64], geq: bool, t: f64) -> Self {
        assert!(e.len() % 2 == 0, "inner-product reference must have even length");
        let n = e.len() / 2;
        let (e1, e2) = e.split_at(n);

        let mut xi: Vec<f64> = e1.iter().zip(e2).map(|(a, b)| a + b).collect();
        let mut psi: Vec<f64> = e1.iter().zip(e2).map(|(a, b)| a - b).collect();
        let mut t_eff = t;
        if !geq {
            std::mem::swap(&mut xi, &mut psi);
            t_eff = -t;
        }

        let norm_xi = norm_l2(&xi);
        let norm_psi = norm_l2(&psi);
        let sqdiff = Bilinear2dSafeZone::new(norm_xi, norm_psi, 4.0 * t_eff);

        let xi_hat = if norm_xi > 0.0 {
            xi.iter().map(|v| v / norm_xi).collect()
        } else if t_eff < 0.0 {
            vec![0.0; n]
        } else {
            vec![(2.0 / e.len() as f64).sqrt(); n]
        };

        Self { geq, xi_hat, sqdiff }
    }

    fn polarize(&self, x_full: &[f64]) -> (Vec<f64>, Vec<f64>) {
        let n = self.xi_hat.len();
        debug_assert_eq!(x_full.len(), 2 * n);
        let (x1, x2) = x_full.split_at(n);
        let mut x: Vec<f64> = x1.iter().zip(x2).map(|(a, b)| a + b).collect();
        let mut y: Vec<f64> = x1.iter().zip(x2).map(|(a, b)| a - b).collect();
        if !self.geq {
            std::mem::swap(&mut x, &mut y);
        }
        (x, y)
    }

    /// From-scratch value.
    pub fn zeta(&self, x_full: &[f64]) -> f64 {
        let (x, y) = self.polarize(x_full);
        self.sqdiff.zeta(dot(&x, &self.xi_hat), norm_l2(&y)) * FRAC_1_SQRT_2
    }

    /// From-scratch value with incremental-state initialization.
    pub fn with_inc(&self, inc: &mut InnerProductIncState, x_full: &[f64]) -> f64 {
        let (x, y) = self.polarize(x_full);
        inc.x2 = dot(&x, &self.xi_hat);
        let ynorm = norm_l2_with_inc(&mut inc.y2, &y);
        inc.x = x;
        inc.y = y;
        self.sqdiff.zeta(inc.x2, ynorm) * FRAC_1_SQRT_2
    }

    /// Incremental value from a delta over the concatenated state.
    pub fn inc(&self, inc: &mut InnerProductIncState, dx_full: &DeltaVector) -> f64 {
        let n = self.xi_hat.len();
        let d1 = dx_full.filtered(|ix| ix < n);
        let mut d2 = dx_full.filtered(|ix| ix >= n);
        d2.shift_index_back(n);

        let mut dx = DeltaVector::sum(&d1, &d2);
        let mut dy = DeltaVector::diff(&d1, &d2);
        if !self.geq {
            std::mem::swap(&mut dx, &mut dy);
        }

        dx.rebase_apply(&mut inc.x);
        dy.rebase_apply(&mut inc.y);

        let x2 = dot_inc(&mut inc.x2, &dx, &self.xi_hat);
        let ynorm = norm_l2_inc(&mut inc.y2, &dy);
        self.sqdiff.zeta(x2, ynorm) * FRAC_1_SQRT_2
    }
}

// ---------------------------------------------------------------------------
// Two-way join:  T_low <= med{ X_i · Y_i } <= T_high
// ---------------------------------------------------------------------------

/// Per-bound incremental state: per-row `x·x̂` and per-row `‖y‖²`.
#[derive(Debug, Clone, Default)]
pub struct TwowayBoundState {
    x2: Vec<f64>,
    y2: Vec<f64>,
}

/// One polarized constraint `med{ x_i² − y_i² } >= T` of a two-way join
/// zone: a per-row bilinear 2-D zone composed by the median quorum.
#[derive(Debug, Clone)]
struct TwowayBound {
    /// Per-row normalized reference of the `x` role, size `D`.
    hat: Vec<f64>,
    zones: Vec<Bilinear2dSafeZone>,
    median: QuorumSafeZone,
}

impl TwowayBound {
    fn new_r(
        proj: &Projection,
        xi: &[f64],
        psi: &[f64],
        t: f64,
        eikonal: bool,
    ) -> Result<Self, SafeZoneError> {
        let norm_xi: Vec<f64> = proj.dot_est_vec(xi).iter().map(|&n2| n2.sqrt()).collect();
        let norm_psi: Vec<f64> = proj.dot_est_vec(psi).iter().map(|&n2| n2.sqrt()).collect();

        let zones: Vec<Bilinear2dSafeZone> = norm_xi
            .iter()
            .zip(&norm_psi)
            .map(|(&nx, &ny)| Bilinear2dSafeZone::new(nx, ny, t))
            .collect();
        let z_e: Vec<f64> = zones
            .iter()
            .zip(norm_xi.iter().zip(&norm_psi))
            .map(|(z, (&nx, &ny))| z.zeta(nx, ny) * FRAC_1_SQRT_2)
            .collect();
        let median = QuorumSafeZone::new_r(&z_e, (proj.depth() + 1) / 2, eikonal)?;

        let mut hat = xi.to_vec();
        let l = proj.width();
        for (d, &n) in norm_xi.iter().enumerate() {
            if n > 0.0 {
                for v in &mut hat[d * l..(d + 1) * l] {
                    *v /= n;
                }
            }
        }
        Ok(Self { hat, zones, median })
    }

    fn from_rows(&self, x2: &[f64], y2: &[f64]) -> f64 {
        let z: Vec<f64> = self
            .zones
            .iter()
            .zip(x2.iter().zip(y2))
            .map(|(zone, (&a, &b))| zone.zeta(a, b.max(0.0).sqrt()) * FRAC_1_SQRT_2)
            .collect();
        self.median.zeta(&z)
    }

    fn with_inc(&self, proj: &Projection, st: &mut TwowayBoundState, x: &[f64], y: &[f64]) -> f64 {
        st.x2 = proj.dot_est_vec_pair(x, &self.hat);
        st.y2 = proj.dot_est_vec(y);
        self.from_rows(&st.x2, &st.y2)
    }

    fn inc(
        &self,
        proj: &Projection,
        st: &mut TwowayBoundState,
        dx: &DeltaVector,
        dy: &DeltaVector,
    ) -> f64 {
        proj.dot_est_vec_inc_pair(&mut st.x2, dx, &self.hat);
        proj.dot_est_vec_inc(&mut st.y2, dy);
        self.from_rows(&st.x2, &st.y2)
    }
}

/// Incremental state for the two-way join zone: the polarized vectors plus
/// one [`TwowayBoundState`] per bound.
#[derive(Debug, Clone, Default)]
pub struct TwowayJoinIncState {
    x: Vec<f64>,
    y: Vec<f64>,
    lower: TwowayBoundState,
    upper: TwowayBoundState,
}

/// Safe zone for `T_low <= med{ X_i·Y_i } <= T_high` on the concatenation of
/// two sketches, per Garofalakis & Samoladas (ICDT 2017): polarize into
/// `x = X+Y`, `y = X−Y`; the lower bound becomes `med{x_i² − y_i²} >= 4·T_low`
/// and the upper becomes the same constraint with the roles of `x` and `y`
/// swapped and threshold `−4·T_high`.
#[derive(Debug, Clone)]
pub struct TwowayJoinSafeZone {
    proj: Projection,
    d: usize,
    lower: TwowayBound,
    upper: TwowayBound,
}

impl TwowayJoinSafeZone {
    pub fn new_r(
        proj: &Projection,
        e: &[f64],
        tlow: f64,
        thigh: f64,
        eikonal: bool,
    ) -> Result<Self, SafeZoneError> {
        if tlow >= thigh {
            return Err(SafeZoneError::EmptyRegion { tlow, thigh });
        }
        let d = proj.size();
        assert_eq!(e.len(), 2 * d, "two-way join reference must concatenate two sketches");
        let (e1, e2) = e.split_at(d);
        let x: Vec<f64> = e1.iter().zip(e2).map(|(a, b)| a + b).collect();
        let y: Vec<f64> = e1.iter().zip(e2).map(|(a, b)| a - b).collect();

        Ok(Self {
            proj: proj.clone(),
            d,
            lower: TwowayBound::new_r(proj, &x, &y, 4.0 * tlow, eikonal)?,
            upper: TwowayBound::new_r(proj, &y, &x, -4.0 * thigh, eikonal)?,
        })
    }

    fn polarize(&self, u: &[f64]) -> (Vec<f64>, Vec<f64>) {
        debug_assert_eq!(u.len(), 2 * self.d);
        let (u1, u2) = u.split_at(self.d);
        (
            u1.iter().zip(u2).map(|(a, b)| a + b).collect(),
            u1.iter().zip(u2).map(|(a, b)| a - b).collect(),
        )
    }

    /// From-scratch value on the concatenated state `u`.
    pub fn zeta(&self, u: &[f64]) -> f64 {
        let mut st = TwowayJoinIncState::default();
        self.with_inc(&mut st, u)
    }

    /// From-scratch value with incremental-state initialization.
    pub fn with_inc(&self, st: &mut TwowayJoinIncState, u: &[f64]) -> f64 {
        let (x, y) = self.polarize(u);
        let zl = self.lower.with_inc(&self.proj, &mut st.lower, &x, &y);
        let zu = self.upper.with_inc(&self.proj, &mut st.upper, &y, &x);
        st.x = x;
        st.y = y;
        zl.min(zu)
    }

    /// Incremental value from a delta over the concatenated state.
    pub fn inc(&self, st: &mut TwowayJoinIncState, du: &DeltaVector) -> f64 {
        let d1 = du.filtered(|ix| ix < self.d);
        let mut d2 = du.filtered(|ix| ix >= self.d);
        d2.shift_index_back(self.d);

        let mut dx = DeltaVector::sum(&d1, &d2);
        let mut dy = DeltaVector::diff(&d1, &d2);
        dx.rebase_apply(&mut st.x);
        dy.rebase_apply(&mut st.y);

        let zl = self.lower.inc(&self.proj, &mut st.lower, &dx, &dy);
        let zu = self.upper.inc(&self.proj, &mut st.upper, &dy, &dx);
        zl.min(zu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::uniform_random_vector;
    use crate::sketch::{HashFamilyRegistry, Sketch};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const SEED: u64 = 24534623;

    fn proj(depth: usize, width: usize) -> Projection {
        let reg = HashFamilyRegistry::with_seed(SEED);
        Projection::from_registry(&reg, depth, width)
    }

    #[test]
    fn upper_bound_never_admits_outside_region() {
        let p = proj(5, 10);
        let mut rng = StdRng::seed_from_u64(21);
        for _ in 0..10 {
            let e = uniform_random_vector(p.size(), -10.0, 10.0, &mut rng);
            let emed = p.dot_est(&e);
            let sz = SelfjoinUpperBound::new_r(&p, &e, 1.1 * emed.abs().max(1.0), true).unwrap();
            assert!(sz.zeta(&e) > 0.0);
            for _ in 0..200 {
                let noise = uniform_random_vector(p.size(), -5.0, 5.0, &mut rng);
                let x: Vec<f64> = e.iter().zip(&noise).map(|(a, b)| a + b).collect();
                let in_a = p.dot_est(&x) <= 1.1 * emed.abs().max(1.0);
                let in_z = sz.zeta(&x) > 0.0;
                assert!(!in_z || in_a, "safe zone admitted a non-admissible point");
            }
        }
    }

    #[test]
    fn lower_bound_never_admits_outside_region() {
        let p = proj(5, 10);
        let mut rng = StdRng::seed_from_u64(22);
        for _ in 0..10 {
            // keep the reference away from zero so 0.9·Emed is meaningful
            let e = uniform_random_vector(p.size(), 1.0, 10.0, &mut rng);
            let emed = p.dot_est(&e);
            let sz = SelfjoinLowerBound::new_r(&p, &e, 0.9 * emed, true).unwrap();
            assert!(sz.zeta(&e) > 0.0);
            for _ in 0..200 {
                let noise = uniform_random_vector(p.size(), -5.0, 5.0, &mut rng);
                let x: Vec<f64> = e.iter().zip(&noise).map(|(a, b)| a + b).collect();
                let in_a = p.dot_est(&x) >= 0.9 * emed;
                let in_z = sz.zeta(&x) > 0.0;
                assert!(!in_z || in_a, "safe zone admitted a non-admissible point");
            }
        }
    }

    #[test]
    fn lower_bound_degenerates_to_infinity() {
        let p = proj(5, 10);
        let e = vec![0.0; p.size()];
        let sz = SelfjoinLowerBound::new_r(&p, &e, 0.0, true).unwrap();
        assert_eq!(sz.zeta(&e), f64::INFINITY);
    }

    #[test]
    fn combined_zone_incremental_matches_from_scratch() {
        let reg = HashFamilyRegistry::with_seed(SEED);
        let p2 = Projection::from_registry(&reg, 5, 10);

        // build a reference from 100 random keys
        let mut esk = Sketch::new(p2.clone());
        let mut rng = StdRng::seed_from_u64(23);
        let keys: Vec<i64> = (0..100).map(|_| rand::Rng::gen_range(&mut rng, 1..100_000)).collect();
        for &k in &keys {
            esk.insert(k);
        }
        let emed = p2.dot_est(&esk);
        let sz = SelfjoinSafeZone::new_r(&p2, &esk, 0.8 * emed, 1.2 * emed, true).unwrap();

        let mut x = Sketch::new(p2.clone());
        for v in x.iter_mut().zip(esk.iter()) {
            *v.0 = *v.1;
        }
        let mut st = SelfjoinIncState::default();
        let z_e = sz.with_inc(&mut st, &x);
        assert!((z_e - sz.zeta(&esk)).abs() < 1e-9);

        let path: Vec<i64> = (0..100).map(|_| rand::Rng::gen_range(&mut rng, 1..100_000)).collect();
        for &k in &path {
            let dx = x.update(k, 1.0);
            let scratch = sz.zeta(&x);
            let incr = sz.inc(&mut st, &dx);
            assert!((scratch - incr).abs() < 1e-9, "inc diverged at key {k}");
        }
        for &k in path.iter().rev() {
            let dx = x.update(k, -1.0);
            let scratch = sz.zeta(&x);
            let incr = sz.inc(&mut st, &dx);
            assert!((scratch - incr).abs() < 1e-9, "inc diverged at key {k}");
        }
    }

    #[test]
    fn inner_product_zone_signs_and_increments() {
        let n = 20;
        let mut rng = StdRng::seed_from_u64(24);
        let e1 = uniform_random_vector(n, 0.5, 2.0, &mut rng);
        let e2 = e1.clone(); // strongly correlated reference: E1·E2 > 0
        let mut e = e1.clone();
        e.extend_from_slice(&e2);

        let t = 0.5 * dot(&e1, &e2);
        let sz = InnerProductSafeZone::new(&e, true, t);
        assert!(sz.zeta(&e) > 0.0);

        // the opposite-signed point violates the condition
        let mut bad = e1.clone();
        bad.extend(e2.iter().map(|v| -v));
        assert!(sz.zeta(&bad) < 0.0);

        // incremental agrees with from-scratch along an update path
        let mut st = InnerProductIncState::default();
        let mut x = e.clone();
        sz.with_inc(&mut st, &x);
        for step in 0..200 {
            let i = (step * 13) % (2 * n);
            let dx = DeltaVector::from_parts(vec![i], vec![x[i]], vec![x[i] + 0.05]);
            x[i] += 0.05;
            let scratch = sz.zeta(&x);
            let incr = sz.inc(&mut st, &dx);
            assert!((scratch - incr).abs() < 1e-9, "step {step}");
        }
    }

    #[test]
    fn twoway_zone_admits_reference_and_tracks_increments() {
        let reg = HashFamilyRegistry::with_seed(SEED);
        let p2 = Projection::from_registry(&reg, 5, 12);
        let d = p2.size();

        // two correlated sketches
        let mut s1 = Sketch::new(p2.clone());
        let mut s2 = Sketch::new(p2.clone());
        let mut rng = StdRng::seed_from_u64(25);
        for _ in 0..300 {
            let k: i64 = rand::Rng::gen_range(&mut rng, 1..5_000);
            s1.insert(k);
            if rand::Rng::gen_bool(&mut rng, 0.8) {
                s2.insert(k);
            }
        }
        let mut e: Vec<f64> = s1.to_vec();
        e.extend_from_slice(&s2);

        let qest = p2.dot_est_pair(&s1, &s2);
        let sz = TwowayJoinSafeZone::new_r(&p2, &e, 0.5 * qest, 1.5 * qest, true).unwrap();
        assert!(sz.zeta(&e) > 0.0, "reference must be admissible");

        let mut st = TwowayJoinIncState::default();
        let mut u = e.clone();
        let z0 = sz.with_inc(&mut st, &u);
        assert!((z0 - sz.zeta(&e)).abs() < 1e-9);

        // apply sketch updates to either operand and check inc == scratch
        for step in 0..100 {
            let k: i64 = rand::Rng::gen_range(&mut rng, 1..5_000);
            let op = step % 2;
            let slice = &mut u[op * d..(op + 1) * d];
            let mut delta = p2.update_slice(slice, k, 1.0);
            delta.shift_index(op * d);
            let scratch = sz.zeta(&u);
            let incr = sz.inc(&mut st, &delta);
            assert!((scratch - incr).abs() < 1e-9, "step {step}");
        }
    }

    #[test]
    fn eikonal_zeta_is_bounded_by_distance_to_reference() {
        // An eikonal function is 1-Lipschitz, so its value anywhere is at
        // most the distance to any point of the zone, in particular to E.
        let reg = HashFamilyRegistry::with_seed(SEED);
        let p = Projection::from_registry(&reg, 5, 10);
        let mut rng = StdRng::seed_from_u64(31);
        let e = uniform_random_vector(p.size(), 1.0, 10.0, &mut rng);
        let emed = p.dot_est(&e);
        let sz = SelfjoinSafeZone::new_r(&p, &e, 0.8 * emed, 1.2 * emed, true).unwrap();
        assert!(sz.zeta(&e) > 0.0);

        for _ in 0..500 {
            let noise = uniform_random_vector(p.size(), -4.0, 4.0, &mut rng);
            let x: Vec<f64> = e.iter().zip(&noise).map(|(a, b)| a + b).collect();
            let dist = crate::linalg::norm_l2(&noise);
            assert!(sz.zeta(&x) <= dist + 1e-9, "zeta exceeded the distance to E");
        }
    }

    #[test]
    fn averaging_admissible_drifts_stays_admissible() {
        // Eikonal zones are concave, so the mean of drifts that each keep
        // zeta non-negative also does; the monitored value of E + mean(U)
        // then lies in the admissible region.
        let reg = HashFamilyRegistry::with_seed(SEED);
        let p = Projection::from_registry(&reg, 5, 10);
        let mut rng = StdRng::seed_from_u64(32);
        let e = uniform_random_vector(p.size(), 1.0, 10.0, &mut rng);
        let emed = p.dot_est(&e);
        let (tlow, thigh) = (0.8 * emed, 1.2 * emed);
        let sz = SelfjoinSafeZone::new_r(&p, &e, tlow, thigh, true).unwrap();

        let k = 8;
        let mut trials = 0;
        while trials < 20 {
            // draw k admissible drifts
            let mut drifts = Vec::new();
            while drifts.len() < k {
                let u = uniform_random_vector(p.size(), -0.5, 0.5, &mut rng);
                let x: Vec<f64> = e.iter().zip(&u).map(|(a, b)| a + b).collect();
                if sz.zeta(&x) >= 0.0 {
                    drifts.push(u);
                }
            }
            let mut mean = vec![0.0; p.size()];
            for u in &drifts {
                for (m, v) in mean.iter_mut().zip(u) {
                    *m += v / k as f64;
                }
            }
            let x: Vec<f64> = e.iter().zip(&mean).map(|(a, b)| a + b).collect();
            assert!(sz.zeta(&x) >= -1e-9, "mean of admissible drifts left the zone");
            let q = p.dot_est(&x);
            assert!(
                (tlow - 1e-9..=thigh + 1e-9).contains(&q),
                "monitored value {q} escaped [{tlow}, {thigh}]"
            );
            trials += 1;
        }
    }

    #[test]
    fn empty_region_is_rejected() {
        let p = proj(3, 8);
        let e = vec![1.0; p.size()];
        assert!(matches!(
            SelfjoinSafeZone::new_r(&p, &e, 2.0, 1.0, true),
            Err(SafeZoneError::EmptyRegion { .. })
        ));
    }
}
