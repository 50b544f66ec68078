//! AGMS sketches: hash families, projections, and estimators
//!
//! An AGMS sketch is a `d × L` random linear projection of a frequency
//! vector, stored row-major as a flat `d·L` vector of doubles. Updating a
//! key touches exactly one cell per row; self-join sizes and inner products
//! are estimated as the median of per-row values.
//!
//! ## Invariants
//!
//! - A [`HashFamily`] is immutable after construction and shared (by `Rc`)
//!   between all projections of the same depth obtained from one registry.
//! - Two sketches may be combined only when their projections are equal,
//!   which requires pointer equality of the hash family objects; violating
//!   this is a programmer error and panics.
//! - [`Sketch::update`] returns the [`DeltaVector`] of the touched cells so
//!   downstream incremental estimators run in O(d) per update.
//!
//! Seeded construction makes runs bit-reproducible: the registry draws all
//! seed words from one `StdRng`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::linalg::{median, DeltaVector};

/// Sketch construction errors.
#[derive(Debug, thiserror::Error)]
pub enum SketchError {
    #[error("hash family depth must be positive")]
    ZeroDepth,
    #[error("projection width must be positive")]
    ZeroWidth,
}

/// A hash family for AGMS sketches: per-row seeds for a pairwise-independent
/// bucket hash and a 4-wise independent sign hash.
pub struct HashFamily {
    depth: usize,
    f: [Vec<i64>; 6],
}

impl fmt::Debug for HashFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashFamily").field("depth", &self.depth).finish()
    }
}

/// The 31-bit mixing step shared by both hashes; the high half is folded
/// in with XOR before masking to 31 bits.
#[inline]
fn hash31(a: i64, b: i64, x: i64) -> i64 {
    let r = a.wrapping_mul(x).wrapping_add(b);
    ((r >> 31) ^ r) & 0x7fff_ffff
}

impl HashFamily {
    /// Build a family of the given depth, drawing seeds from `rng`.
    pub fn new_r(depth: usize, rng: &mut StdRng) -> Result<Self, SketchError> {
        if depth == 0 {
            return Err(SketchError::ZeroDepth);
        }
        let mut f: [Vec<i64>; 6] = Default::default();
        for arr in &mut f {
            *arr = (0..depth).map(|_| rng.gen::<i64>()).collect();
        }
        Ok(Self { depth, f })
    }

    /// Depth of the family (number of sketch rows it serves).
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The 31-bit bucket hash for row `d`.
    #[inline]
    pub fn hash(&self, d: usize, x: i64) -> i64 {
        debug_assert!(d < self.depth);
        hash31(self.f[0][d], self.f[1][d], x)
    }

    /// A 4-wise independent bit for row `d`, obtained by composing the
    /// 31-bit hash three times over the remaining seed arrays.
    #[inline]
    pub fn fourwise(&self, d: usize, x: i64) -> bool {
        let h = hash31(
            hash31(hash31(x, self.f[2][d], self.f[3][d]), x, self.f[4][d]),
            x,
            self.f[5][d],
        );
        h & (1 << 15) != 0
    }
}

/// A cache of hash families keyed by depth.
///
/// An explicit registry rather than a process-global cache: seeds must not
/// leak across runs that expect deterministic reproduction. All projections
/// of one simulation should come from the same registry.
pub struct HashFamilyRegistry {
    rng: RefCell<StdRng>,
    cache: RefCell<HashMap<usize, Rc<HashFamily>>>,
}

impl HashFamilyRegistry {
    /// A registry whose families are derived from `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: RefCell::new(StdRng::seed_from_u64(seed)),
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// Return the cached family of the given depth, creating it on first use.
    pub fn get_r(&self, depth: usize) -> Result<Rc<HashFamily>, SketchError> {
        if let Some(hf) = self.cache.borrow().get(&depth) {
            return Ok(hf.clone());
        }
        let hf = Rc::new(HashFamily::new_r(depth, &mut self.rng.borrow_mut())?);
        self.cache.borrow_mut().insert(depth, hf.clone());
        Ok(hf)
    }

    /// Like [`get_r`](Self::get_r), panicking on zero depth.
    pub fn get(&self, depth: usize) -> Rc<HashFamily> {
        self.get_r(depth).expect("invalid hash family depth")
    }
}

/// An AGMS projection: a shared hash family plus a width `L`. It maps a key
/// to one cell index and one sign per row.
#[derive(Clone)]
pub struct Projection {
    hf: Rc<HashFamily>,
    width: usize,
}

impl fmt::Debug for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Projection")
            .field("depth", &self.depth())
            .field("width", &self.width)
            .finish()
    }
}

impl PartialEq for Projection {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.hf, &other.hf) && self.width == other.width
    }
}

impl Projection {
    /// Build a projection over an existing family.
    pub fn new_r(hf: Rc<HashFamily>, width: usize) -> Result<Self, SketchError> {
        if width == 0 {
            return Err(SketchError::ZeroWidth);
        }
        Ok(Self { hf, width })
    }

    /// Build a projection over an existing family, panicking on zero width.
    pub fn new(hf: Rc<HashFamily>, width: usize) -> Self {
        Self::new_r(hf, width).expect("invalid projection width")
    }

    /// Convenience: fetch the family of `depth` from `reg` and project at
    /// `width`.
    pub fn from_registry(reg: &HashFamilyRegistry, depth: usize, width: usize) -> Self {
        Self::new(reg.get(depth), width)
    }

    /// Sketch depth `d`.
    pub fn depth(&self) -> usize {
        self.hf.depth()
    }

    /// Sketch width `L`.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Flat size `d·L`.
    pub fn size(&self) -> usize {
        self.depth() * self.width
    }

    /// The shared hash family.
    pub fn hash_family(&self) -> &Rc<HashFamily> {
        &self.hf
    }

    /// AGMS ε bound: `4/√L`.
    pub fn epsilon(&self) -> f64 {
        4.0 / (self.width as f64).sqrt()
    }

    /// AGMS failure probability bound: `(1/√2)^d`.
    pub fn prob_failure(&self) -> f64 {
        (1.0 / 2f64.sqrt()).powi(self.depth() as i32)
    }

    /// Fill `idx` with the flat cell index of `key` in every row.
    pub fn update_index(&self, key: i64, idx: &mut [usize]) {
        debug_assert_eq!(idx.len(), self.depth());
        let mut stride = 0;
        for (d, slot) in idx.iter_mut().enumerate() {
            *slot = stride + (self.hf.hash(d, key) as usize) % self.width;
            stride += self.width;
        }
    }

    /// Fill `mask` with the sign bit of `key` in every row.
    pub fn update_mask(&self, key: i64, mask: &mut [bool]) {
        debug_assert_eq!(mask.len(), self.depth());
        for (d, slot) in mask.iter_mut().enumerate() {
            *slot = self.hf.fourwise(d, key);
        }
    }

    /// Apply the update `key → key + freq·sign` to a flat sketch slice of
    /// size [`size`](Self::size) and return the resulting delta.
    pub fn update_slice(&self, v: &mut [f64], key: i64, freq: f64) -> DeltaVector {
        debug_assert_eq!(v.len(), self.size());
        let d = self.depth();
        let mut delta = DeltaVector {
            index: vec![0; d],
            xold: vec![0.0; d],
            xnew: vec![0.0; d],
        };
        self.update_index(key, &mut delta.index);
        for (j, &ix) in delta.index.iter().enumerate() {
            let old = v[ix];
            let new = if self.hf.fourwise(j, key) { old + freq } else { old - freq };
            delta.xold[j] = old;
            delta.xnew[j] = new;
            v[ix] = new;
        }
        delta
    }

    // -- Estimators -------------------------------------------------------

    /// Per-row self-join estimates: `Σ_j x[i,j]²` for each row `i`.
    pub fn dot_est_vec(&self, x: &[f64]) -> Vec<f64> {
        debug_assert_eq!(x.len(), self.size());
        x.chunks(self.width).map(|row| row.iter().map(|v| v * v).sum()).collect()
    }

    /// Per-row inner products of two sketches over this projection.
    pub fn dot_est_vec_pair(&self, x: &[f64], y: &[f64]) -> Vec<f64> {
        debug_assert_eq!(x.len(), self.size());
        debug_assert_eq!(y.len(), self.size());
        x.chunks(self.width)
            .zip(y.chunks(self.width))
            .map(|(rx, ry)| rx.iter().zip(ry).map(|(a, b)| a * b).sum())
            .collect()
    }

    /// Median-of-rows self-join estimate.
    pub fn dot_est(&self, x: &[f64]) -> f64 {
        median(self.dot_est_vec(x))
    }

    /// Median-of-rows inner-product estimate.
    pub fn dot_est_pair(&self, x: &[f64], y: &[f64]) -> f64 {
        median(self.dot_est_vec_pair(x, y))
    }

    /// Incremental update of a per-row self-join estimate vector. `state`
    /// must hold the per-row estimates of the pre-delta sketch.
    pub fn dot_est_vec_inc(&self, state: &mut [f64], dx: &DeltaVector) {
        debug_assert_eq!(state.len(), self.depth());
        for i in 0..dx.len() {
            let row = dx.index[i] / self.width;
            state[row] += dx.xnew[i] * dx.xnew[i] - dx.xold[i] * dx.xold[i];
        }
    }

    /// Incremental update of a per-row inner-product vector against a fixed
    /// second operand `y`.
    pub fn dot_est_vec_inc_pair(&self, state: &mut [f64], dx: &DeltaVector, y: &[f64]) {
        debug_assert_eq!(state.len(), self.depth());
        for i in 0..dx.len() {
            let row = dx.index[i] / self.width;
            state[row] += (dx.xnew[i] - dx.xold[i]) * y[dx.index[i]];
        }
    }
}

/// An AGMS sketch: a projection plus its flat value vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Sketch {
    proj: Projection,
    v: Vec<f64>,
}

impl Sketch {
    /// The zero sketch over `proj`.
    pub fn new(proj: Projection) -> Self {
        let n = proj.size();
        Self { proj, v: vec![0.0; n] }
    }

    /// The sketch's projection.
    pub fn projection(&self) -> &Projection {
        &self.proj
    }

    /// Sketch width.
    pub fn width(&self) -> usize {
        self.proj.width()
    }

    /// Sketch depth.
    pub fn depth(&self) -> usize {
        self.proj.depth()
    }

    /// True when `other` can be combined with this sketch.
    pub fn compatible(&self, other: &Sketch) -> bool {
        self.proj == other.proj
    }

    /// Apply one key update and return the delta of the touched cells.
    pub fn update(&mut self, key: i64, freq: f64) -> DeltaVector {
        self.proj.update_slice(&mut self.v, key, freq)
    }

    /// Insert a key with multiplicity one.
    pub fn insert(&mut self, key: i64) -> DeltaVector {
        self.update(key, 1.0)
    }

    /// Erase a key with multiplicity one.
    pub fn erase(&mut self, key: i64) -> DeltaVector {
        self.update(key, -1.0)
    }

    /// `‖sketch‖²` over the flat vector.
    pub fn norm_squared(&self) -> f64 {
        crate::linalg::dot_self(&self.v)
    }

    /// Median-of-rows self-join estimate of this sketch.
    pub fn dot_est(&self) -> f64 {
        self.proj.dot_est(&self.v)
    }

    /// Elementwise `self += other`; panics on incompatible projections.
    pub fn add_assign(&mut self, other: &Sketch) {
        assert!(self.compatible(other), "combining sketches of different projections");
        for (a, b) in self.v.iter_mut().zip(&other.v) {
            *a += b;
        }
    }

    /// Elementwise scale.
    pub fn scale(&mut self, c: f64) {
        for a in &mut self.v {
            *a *= c;
        }
    }
}

impl Deref for Sketch {
    type Target = [f64];
    fn deref(&self) -> &[f64] {
        &self.v
    }
}

impl DerefMut for Sketch {
    fn deref_mut(&mut self) -> &mut [f64] {
        &mut self.v
    }
}
