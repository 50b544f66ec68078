//! Query states and transmissible safe-zone functions
//!
//! The protocol layer never talks to the concrete zones in `safezone`
//! directly. It sees two things:
//!
//! - [`SafeZoneFunc`], a closed enumeration of safe-zone kinds that carries
//!   the reference point and knows its own transmission cost
//!   ([`zeta_size`](SafeZoneFunc::zeta_size), in 4-byte floats). Its
//!   `compute_*` methods take *drift vectors*: the function internally
//!   evaluates the underlying zone at `E + U`.
//! - [`QueryState`], the coordinator-owned object holding the global
//!   estimate `E`, the current query estimate and admissible bounds, and a
//!   factory for safe-zone functions.
//!
//! Nodes hold a [`Safezone`] wrapper: a shared (`Rc`) function plus their
//! own lazily-allocated incremental state. Cloning a wrapper shares the
//! function and resets the state, matching safe-zone shipment semantics.

use std::rc::Rc;

use crate::linalg::{norm_l2, norm_l2_inc, norm_l2_with_inc, norm_linf, DeltaVector};
use crate::proto::ProtocolConfig;
use crate::records::{QueryKind, StreamId, StreamQuery, StreamRecord};
use crate::safezone::{
    SafeZoneError, SelfjoinIncState, SelfjoinSafeZone, TwowayJoinIncState, TwowayJoinSafeZone,
};
use crate::sketch::Projection;

/// Query construction errors (configuration errors; the run never starts).
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("query arity {got} does not match {kind} (expected {want})")]
    ArityMismatch { kind: QueryKind, want: usize, got: usize },
    #[error("total error is less than sketch error (epsilon={epsilon} >= beta={beta})")]
    SketchErrorTooLarge { epsilon: f64, beta: f64 },
    #[error("unsupported query type {0}")]
    UnsupportedQuery(QueryKind),
    #[error(transparent)]
    SafeZone(#[from] SafeZoneError),
}

// ---------------------------------------------------------------------------
// Safe-zone functions
// ---------------------------------------------------------------------------

/// Incremental state for a [`SafeZoneFunc`]; variants mirror the function
/// kinds.
#[derive(Debug, Clone)]
pub enum IncState {
    Selfjoin(SelfjoinIncState),
    Twoway(TwowayJoinIncState),
    /// Maintained squared norm of the drift.
    Ball(f64),
}

/// A transmissible safe-zone function over drift vectors.
///
/// The full zones carry a copy of the reference point `E`; the ball zone is
/// described by its radius alone, which is what makes it cheap to ship.
#[derive(Debug, Clone)]
pub enum SafeZoneFunc {
    Selfjoin { zone: SelfjoinSafeZone, e: Vec<f64> },
    TwowayJoin { zone: TwowayJoinSafeZone, e: Vec<f64> },
    /// The radial zone `ζ(U) = r − ‖U‖₂`.
    Ball { radius: f64 },
}

impl SafeZoneFunc {
    /// Allocate a fresh incremental state for this function.
    pub fn alloc_incstate(&self) -> IncState {
        match self {
            SafeZoneFunc::Selfjoin { .. } => IncState::Selfjoin(SelfjoinIncState::default()),
            SafeZoneFunc::TwowayJoin { .. } => IncState::Twoway(TwowayJoinIncState::default()),
            SafeZoneFunc::Ball { .. } => IncState::Ball(0.0),
        }
    }

    /// Descriptor size of the function, in 4-byte floats. This is the
    /// amount of data needed to reconstruct the function remotely, not the
    /// dimension of its input.
    pub fn zeta_size(&self) -> usize {
        match self {
            SafeZoneFunc::Selfjoin { e, .. } => e.len(),
            SafeZoneFunc::TwowayJoin { e, .. } => e.len(),
            SafeZoneFunc::Ball { .. } => 1,
        }
    }

    /// From-scratch evaluation on a drift vector.
    pub fn compute_zeta(&self, u: &[f64]) -> f64 {
        match self {
            SafeZoneFunc::Selfjoin { zone, e } => zone.zeta(&add(e, u)),
            SafeZoneFunc::TwowayJoin { zone, e } => zone.zeta(&add(e, u)),
            SafeZoneFunc::Ball { radius } => radius - norm_l2(u),
        }
    }

    /// From-scratch evaluation that initializes `st`.
    pub fn compute_zeta_with(&self, st: &mut IncState, u: &[f64]) -> f64 {
        match (self, st) {
            (SafeZoneFunc::Selfjoin { zone, e }, IncState::Selfjoin(st)) => {
                zone.with_inc(st, &add(e, u))
            }
            (SafeZoneFunc::TwowayJoin { zone, e }, IncState::Twoway(st)) => {
                zone.with_inc(st, &add(e, u))
            }
            (SafeZoneFunc::Ball { radius }, IncState::Ball(n2)) => {
                radius - norm_l2_with_inc(n2, u)
            }
            _ => panic!("incremental state does not match safe-zone kind"),
        }
    }

    /// Incremental evaluation from a drift delta.
    pub fn compute_zeta_inc(&self, st: &mut IncState, du: &DeltaVector) -> f64 {
        match (self, st) {
            (SafeZoneFunc::Selfjoin { zone, e }, IncState::Selfjoin(st)) => {
                let mut d = du.clone();
                d.offset_by(e);
                zone.inc(st, &d)
            }
            (SafeZoneFunc::TwowayJoin { zone, e }, IncState::Twoway(st)) => {
                let mut d = du.clone();
                d.offset_by(e);
                zone.inc(st, &d)
            }
            (SafeZoneFunc::Ball { radius }, IncState::Ball(n2)) => radius - norm_l2_inc(n2, du),
            _ => panic!("incremental state does not match safe-zone kind"),
        }
    }
}

fn add(a: &[f64], b: &[f64]) -> Vec<f64> {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| x + y).collect()
}

/// A node-side handle to a shipped safe-zone function: shared function,
/// privately owned incremental state.
#[derive(Debug, Clone, Default)]
pub struct Safezone {
    func: Option<Rc<SafeZoneFunc>>,
    inc: Option<IncState>,
}

impl Safezone {
    /// A handle on a concrete function.
    pub fn new(func: Rc<SafeZoneFunc>) -> Self {
        Self { func: Some(func), inc: None }
    }

    /// The null handle (no zone installed yet).
    pub fn null() -> Self {
        Self::default()
    }

    /// Whether a function is installed.
    pub fn is_valid(&self) -> bool {
        self.func.is_some()
    }

    /// Transmission cost of the wrapped function, in bytes.
    pub fn byte_size(&self) -> usize {
        self.func.as_ref().map_or(0, |f| f.zeta_size() * 4)
    }

    /// Evaluate on a drift vector, (re)initializing the incremental state.
    pub fn zeta(&mut self, u: &[f64]) -> f64 {
        let func = self.func.as_ref().expect("evaluating a null safezone");
        let mut st = func.alloc_incstate();
        let z = func.compute_zeta_with(&mut st, u);
        self.inc = Some(st);
        z
    }

    /// Evaluate incrementally; `du` is the delta of the drift vector.
    /// Falls back to a full evaluation when no state exists yet.
    pub fn zeta_inc(&mut self, du: &DeltaVector, u: &[f64]) -> f64 {
        let func = self.func.as_ref().expect("evaluating a null safezone");
        match &mut self.inc {
            Some(st) => func.compute_zeta_inc(st, du),
            None => {
                let mut st = func.alloc_incstate();
                let z = func.compute_zeta_with(&mut st, u);
                self.inc = Some(st);
                z
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Query states
// ---------------------------------------------------------------------------

/// Common fields of every query state.
#[derive(Debug, Clone)]
pub struct EstimateCore {
    /// The current global estimate vector.
    pub e: Vec<f64>,
    /// The current query estimate `Q(E)`.
    pub qest: f64,
    /// Admissible region lower bound.
    pub tlow: f64,
    /// Admissible region upper bound.
    pub thigh: f64,
    /// `ζ(E)` of the current safe zone.
    pub zeta_e: f64,
}

/// Selfjoin query state: monitors `med{‖E_i‖²}` within `[T_low, T_high]`.
#[derive(Debug, Clone)]
pub struct SelfjoinQueryState {
    pub core: EstimateCore,
    proj: Projection,
    beta: f64,
    epsilon: f64,
    eikonal: bool,
    zone: SelfjoinSafeZone,
}

impl SelfjoinQueryState {
    pub fn new_r(beta: f64, proj: Projection, eikonal: bool) -> Result<Self, QueryError> {
        let epsilon = proj.epsilon();
        if epsilon >= beta {
            return Err(QueryError::SketchErrorTooLarge { epsilon, beta });
        }
        let e = vec![0.0; proj.size()];
        debug_assert_eq!(norm_linf(&e), 0.0);
        let zone = SelfjoinSafeZone::new_r(&proj, &e, 0.0, 1.0, eikonal)?;
        let zeta_e = zone.zeta(&e);
        let mut qs = Self {
            core: EstimateCore { e, qest: 0.0, tlow: 0.0, thigh: 1.0, zeta_e },
            proj,
            beta,
            epsilon,
            eikonal,
            zone,
        };
        qs.compute();
        Ok(qs)
    }

    fn compute(&mut self) {
        self.core.qest = self.proj.dot_est(&self.core.e);
        if self.core.qest > 0.0 {
            self.core.tlow = (1.0 + self.epsilon) * self.core.qest / (1.0 + self.beta);
            self.core.thigh = (1.0 - self.epsilon) * self.core.qest / (1.0 - self.beta);
        } else {
            self.core.tlow = 0.0;
            self.core.thigh = 1.0;
        }
        self.zone = SelfjoinSafeZone::new_r(
            &self.proj,
            &self.core.e,
            self.core.tlow,
            self.core.thigh,
            self.eikonal,
        )
        .expect("estimate produced a non-admissible reference");
        self.core.zeta_e = self.zone.zeta(&self.core.e);
    }
}

/// Two-way join query state: monitors `med{E¹_i·E²_i}` within
/// `[T_low, T_high]` on the concatenated estimate of size `2D`.
#[derive(Debug, Clone)]
pub struct TwowayJoinQueryState {
    pub core: EstimateCore,
    proj: Projection,
    beta: f64,
    epsilon: f64,
    eikonal: bool,
    zone: TwowayJoinSafeZone,
}

impl TwowayJoinQueryState {
    pub fn new_r(beta: f64, proj: Projection, eikonal: bool) -> Result<Self, QueryError> {
        let epsilon = proj.epsilon();
        if epsilon >= beta {
            return Err(QueryError::SketchErrorTooLarge { epsilon, beta });
        }
        let e = vec![0.0; 2 * proj.size()];
        let zone = TwowayJoinSafeZone::new_r(&proj, &e, -1.0, 1.0, eikonal)?;
        let zeta_e = zone.zeta(&e);
        let mut qs = Self {
            core: EstimateCore { e, qest: 0.0, tlow: -1.0, thigh: 1.0, zeta_e },
            proj,
            beta,
            epsilon,
            eikonal,
            zone,
        };
        qs.compute();
        Ok(qs)
    }

    fn compute(&mut self) {
        let d = self.proj.size();
        let (e1, e2) = self.core.e.split_at(d);
        self.core.qest = self.proj.dot_est_pair(e1, e2);
        if self.core.qest != 0.0 {
            let a = (1.0 + self.epsilon) * self.core.qest / (1.0 + self.beta);
            let b = (1.0 - self.epsilon) * self.core.qest / (1.0 - self.beta);
            // a negative estimate flips the bound order
            self.core.tlow = a.min(b);
            self.core.thigh = a.max(b);
        } else {
            self.core.tlow = -1.0;
            self.core.thigh = 1.0;
        }
        self.zone = TwowayJoinSafeZone::new_r(
            &self.proj,
            &self.core.e,
            self.core.tlow,
            self.core.thigh,
            self.eikonal,
        )
        .expect("estimate produced a non-admissible reference");
        self.core.zeta_e = self.zone.zeta(&self.core.e);
    }
}

/// The coordinator-owned query state for either query type.
#[derive(Debug, Clone)]
pub enum QueryState {
    Selfjoin(SelfjoinQueryState),
    Twoway(TwowayJoinQueryState),
}

impl QueryState {
    fn core(&self) -> &EstimateCore {
        match self {
            QueryState::Selfjoin(q) => &q.core,
            QueryState::Twoway(q) => &q.core,
        }
    }

    /// The current global estimate.
    pub fn e(&self) -> &[f64] {
        &self.core().e
    }

    /// The current query estimate.
    pub fn qest(&self) -> f64 {
        self.core().qest
    }

    /// The admissible region `[T_low, T_high]`.
    pub fn bounds(&self) -> (f64, f64) {
        (self.core().tlow, self.core().thigh)
    }

    /// The current `ζ(E)`.
    pub fn zeta_e(&self) -> f64 {
        self.core().zeta_e
    }

    /// The query function `Q(x)` on an arbitrary state vector.
    pub fn query_func(&self, x: &[f64]) -> f64 {
        match self {
            QueryState::Selfjoin(q) => q.proj.dot_est(x),
            QueryState::Twoway(q) => {
                let d = q.proj.size();
                let (x1, x2) = x.split_at(d);
                q.proj.dot_est_pair(x1, x2)
            }
        }
    }

    /// The safe-zone value on a state vector.
    pub fn zeta(&self, x: &[f64]) -> f64 {
        match self {
            QueryState::Selfjoin(q) => q.zone.zeta(x),
            QueryState::Twoway(q) => q.zone.zeta(x),
        }
    }

    /// The safe-zone value on a drift vector, i.e. `ζ(E + U)`.
    pub fn compute_zeta(&self, u: &[f64]) -> f64 {
        let x = add(self.e(), u);
        self.zeta(&x)
    }

    /// Shift the estimate by `dE`, recomputing bounds, safe zone and
    /// `ζ(E)`. All outstanding incremental states become stale and must be
    /// re-initialized by their owners.
    pub fn update_estimate(&mut self, de: &[f64]) {
        match self {
            QueryState::Selfjoin(q) => {
                assert_eq!(de.len(), q.core.e.len());
                for (a, b) in q.core.e.iter_mut().zip(de) {
                    *a += b;
                }
                q.compute();
            }
            QueryState::Twoway(q) => {
                assert_eq!(de.len(), q.core.e.len());
                for (a, b) in q.core.e.iter_mut().zip(de) {
                    *a += b;
                }
                q.compute();
            }
        }
    }

    /// A transmissible safe-zone function for the current round. The
    /// returned function snapshots `E`; it stays valid while the estimate
    /// moves on.
    pub fn safezone(&self) -> Rc<SafeZoneFunc> {
        match self {
            QueryState::Selfjoin(q) => Rc::new(SafeZoneFunc::Selfjoin {
                zone: q.zone.clone(),
                e: q.core.e.clone(),
            }),
            QueryState::Twoway(q) => Rc::new(SafeZoneFunc::TwowayJoin {
                zone: q.zone.clone(),
                e: q.core.e.clone(),
            }),
        }
    }

    /// The radial (cheap) safe-zone function `ζ_E − ‖U‖`. It is dominated
    /// by the full zone everywhere and coincides with it at `E`.
    pub fn radial_safezone(&self) -> Option<Rc<SafeZoneFunc>> {
        Some(Rc::new(SafeZoneFunc::Ball { radius: self.zeta_e() }))
    }
}

// ---------------------------------------------------------------------------
// Continuous query
// ---------------------------------------------------------------------------

/// The immutable description of a monitored query: operand streams,
/// projection, accuracy target and protocol configuration, plus the site
/// count used to keep the global state site-scale-invariant.
#[derive(Debug, Clone)]
pub struct ContinuousQuery {
    kind: QueryKind,
    sids: Vec<StreamId>,
    proj: Projection,
    beta: f64,
    k: usize,
    /// Protocol knobs shared by all GM variants.
    pub config: ProtocolConfig,
}

impl ContinuousQuery {
    pub fn new_r(
        query: &StreamQuery,
        proj: Projection,
        k: usize,
        config: ProtocolConfig,
    ) -> Result<Self, QueryError> {
        let want = match query.kind {
            QueryKind::Selfjoin => 1,
            QueryKind::Join => 2,
            QueryKind::Void => return Err(QueryError::UnsupportedQuery(query.kind)),
        };
        if query.operands.len() != want {
            return Err(QueryError::ArityMismatch {
                kind: query.kind,
                want,
                got: query.operands.len(),
            });
        }
        if proj.epsilon() >= query.beta {
            return Err(QueryError::SketchErrorTooLarge {
                epsilon: proj.epsilon(),
                beta: query.beta,
            });
        }
        Ok(Self {
            kind: query.kind,
            sids: query.operands.clone(),
            proj,
            beta: query.beta,
            k,
            config,
        })
    }

    /// Query arity (number of operand sketches in the state vector).
    pub fn arity(&self) -> usize {
        self.sids.len()
    }

    /// Size of the state vector: `arity · d·L`.
    pub fn state_vector_size(&self) -> usize {
        self.arity() * self.proj.size()
    }

    /// The sketch projection.
    pub fn projection(&self) -> &Projection {
        &self.proj
    }

    /// Number of sites the query is monitored over.
    pub fn sites(&self) -> usize {
        self.k
    }

    /// The operand streams.
    pub fn streams(&self) -> &[StreamId] {
        &self.sids
    }

    /// Operand position of `sid`, or `None` when the stream is not part of
    /// this query.
    pub fn stream_operand(&self, sid: StreamId) -> Option<usize> {
        self.sids.iter().position(|&s| s == sid)
    }

    /// Safe-zone monitoring accuracy θ; the residual slack between the user
    /// target β and the sketch error ε. Used for reporting.
    pub fn theta(&self) -> f64 {
        (self.beta - self.proj.epsilon()) / (1.0 - self.beta * self.beta)
    }

    /// The query descriptor.
    pub fn query(&self) -> StreamQuery {
        StreamQuery { kind: self.kind, operands: self.sids.clone(), beta: self.beta }
    }

    /// Apply a record to a state vector, scaled by the site count so the
    /// averaged global state is independent of `k`, and return the delta
    /// (rebased into the concatenated state). `None` when the record's
    /// stream is not an operand.
    pub fn delta_update(&self, s: &mut [f64], rec: &StreamRecord) -> Option<DeltaVector> {
        assert_eq!(s.len(), self.state_vector_size());
        let op = self.stream_operand(rec.sid)?;
        let d = self.proj.size();
        let slice = &mut s[op * d..(op + 1) * d];
        let mut delta =
            self.proj.update_slice(slice, rec.key as i64, (self.k as i32 * rec.upd) as f64);
        delta.shift_index(op * d);
        Some(delta)
    }

    /// Apply a record to a state vector without producing a delta. Returns
    /// whether the record belonged to the query.
    pub fn update(&self, s: &mut [f64], rec: &StreamRecord) -> bool {
        self.delta_update(s, rec).is_some()
    }

    /// Build the query state for a fresh coordinator.
    pub fn make_query_state(&self) -> Result<QueryState, QueryError> {
        match self.kind {
            QueryKind::Selfjoin => Ok(QueryState::Selfjoin(SelfjoinQueryState::new_r(
                self.beta,
                self.proj.clone(),
                self.config.eikonal,
            )?)),
            QueryKind::Join => Ok(QueryState::Twoway(TwowayJoinQueryState::new_r(
                self.beta,
                self.proj.clone(),
                self.config.eikonal,
            )?)),
            QueryKind::Void => Err(QueryError::UnsupportedQuery(self.kind)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::ProtocolConfig;
    use crate::sketch::HashFamilyRegistry;

    const SEED: u64 = 24534623;

    fn proj(depth: usize, width: usize) -> Projection {
        let reg = HashFamilyRegistry::with_seed(SEED);
        Projection::from_registry(&reg, depth, width)
    }

    #[test]
    fn fresh_selfjoin_state_has_trivial_region() {
        let qs = SelfjoinQueryState::new_r(0.5, proj(5, 400), true).unwrap();
        assert_eq!(qs.core.qest, 0.0);
        assert_eq!((qs.core.tlow, qs.core.thigh), (0.0, 1.0));
        // ζ(E) at the zero estimate equals sqrt((d+1)/2) for the upper
        // bound at T_high = 1
        let expect = (3.0f64).sqrt();
        assert!((qs.core.zeta_e - expect).abs() < 1e-12, "zeta_E = {}", qs.core.zeta_e);
    }

    #[test]
    fn sketch_error_must_stay_below_beta() {
        // epsilon = 4/sqrt(16) = 1.0 >= beta
        assert!(matches!(
            SelfjoinQueryState::new_r(0.5, proj(5, 16), true),
            Err(QueryError::SketchErrorTooLarge { .. })
        ));
    }

    #[test]
    fn update_estimate_moves_bounds_around_qest() {
        let p = proj(5, 400);
        let mut qs = QueryState::Selfjoin(SelfjoinQueryState::new_r(0.5, p.clone(), true).unwrap());
        let mut de = vec![0.0; p.size()];
        for key in 0..500i64 {
            p.update_slice(&mut de, key * 3 + 1, 1.0);
        }
        qs.update_estimate(&de);
        assert!(qs.qest() > 0.0);
        let (tlow, thigh) = qs.bounds();
        assert!(tlow < qs.qest() && qs.qest() < thigh);
        assert!(qs.zeta_e() > 0.0, "reference must lie inside its own zone");
    }

    #[test]
    fn ball_zone_dominates_nothing_at_e_and_shrinks_with_drift() {
        let p = proj(5, 400);
        let mut qs = QueryState::Selfjoin(SelfjoinQueryState::new_r(0.5, p.clone(), true).unwrap());
        let mut de = vec![0.0; p.size()];
        for key in 0..500i64 {
            p.update_slice(&mut de, key * 7 + 3, 1.0);
        }
        qs.update_estimate(&de);

        let full = qs.safezone();
        let ball = qs.radial_safezone().unwrap();
        let zero = vec![0.0; p.size()];
        // both agree at U = 0
        assert!((full.compute_zeta(&zero) - ball.compute_zeta(&zero)).abs() < 1e-9);
        // the ball is dominated by the full zone
        let mut u = zero;
        p.update_slice(&mut u, 42, 5.0);
        assert!(ball.compute_zeta(&u) <= full.compute_zeta(&u) + 1e-9);
        assert_eq!(ball.zeta_size(), 1);
        assert_eq!(full.zeta_size(), p.size());
    }

    #[test]
    fn safezone_wrapper_incremental_path() {
        let p = proj(5, 400);
        let mut qs = QueryState::Selfjoin(SelfjoinQueryState::new_r(0.5, p.clone(), true).unwrap());
        let mut de = vec![0.0; p.size()];
        for key in 0..400i64 {
            p.update_slice(&mut de, key * 11 + 1, 1.0);
        }
        qs.update_estimate(&de);

        let mut wrapper = Safezone::new(qs.safezone());
        let mut u = vec![0.0; p.size()];
        let z0 = wrapper.zeta(&u);
        assert!((z0 - qs.zeta_e()).abs() < 1e-9);

        for key in 0..50i64 {
            let du = p.update_slice(&mut u, key * 5 + 2, 1.0);
            let z_inc = wrapper.zeta_inc(&du, &u);
            let z_scratch = qs.compute_zeta(&u);
            assert!((z_inc - z_scratch).abs() < 1e-9, "key {key}");
        }
    }

    #[test]
    fn continuous_query_scales_and_rebases_deltas() {
        let p = proj(5, 400);
        let q = StreamQuery::join(1, 2, 0.5);
        let cq = ContinuousQuery::new_r(&q, p.clone(), 4, ProtocolConfig::default()).unwrap();
        assert_eq!(cq.state_vector_size(), 2 * p.size());
        assert_eq!(cq.stream_operand(2), Some(1));
        assert_eq!(cq.stream_operand(9), None);

        let mut s = vec![0.0; cq.state_vector_size()];
        let rec = StreamRecord::new(2, 0, 77, 1, 1);
        let delta = cq.delta_update(&mut s, &rec).unwrap();
        // second operand: all indices in the upper half, scaled by k
        assert!(delta.index.iter().all(|&ix| ix >= p.size()));
        assert!(delta.xnew.iter().all(|&v| v.abs() == 4.0));

        let skip = StreamRecord::new(3, 0, 77, 1, 1);
        assert!(cq.delta_update(&mut s, &skip).is_none());
    }

    #[test]
    fn arity_mismatch_is_rejected() {
        let p = proj(5, 400);
        let bad = StreamQuery { kind: QueryKind::Join, operands: vec![1], beta: 0.5 };
        assert!(matches!(
            ContinuousQuery::new_r(&bad, p, 4, ProtocolConfig::default()),
            Err(QueryError::ArityMismatch { .. })
        ));
    }

    #[test]
    fn twoway_state_handles_negative_estimates() {
        let p = proj(5, 400);
        let mut qs = TwowayJoinQueryState::new_r(0.5, p.clone(), true).unwrap();
        // anti-correlated operands: negative join estimate
        let d = p.size();
        let mut de = vec![0.0; 2 * d];
        for key in 0..300i64 {
            p.update_slice(&mut de[..d], key * 3 + 1, 1.0);
            p.update_slice(&mut de[d..], key * 3 + 1, -1.0);
        }
        for (a, b) in qs.core.e.iter_mut().zip(&de) {
            *a += b;
        }
        qs.compute();
        assert!(qs.core.qest < 0.0);
        assert!(qs.core.tlow < qs.core.qest && qs.core.qest < qs.core.thigh);
        assert!(qs.core.zeta_e > 0.0);
    }
}
