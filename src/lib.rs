//! Crate root: public surface, core aliases, and protocol-wide invariants
//!
//! `geomon` simulates **continuous distributed monitoring** of aggregate
//! queries (self-join size, two-way join size) over horizontally
//! partitioned streams with the Geometric Method protocol family. Remote
//! sites absorb stream updates into AGMS sketches; a central coordinator
//! maintains, at all times, an estimate of the global aggregate whose
//! error is bounded by a user-supplied factor β, while the simulated
//! middleware accounts every byte the protocols would have moved.
//!
//! ## Invariants
//!
//! - **Single-threaded, deterministic.** The ECA engine is the only
//!   scheduler; all "RPC" is synchronous in-process invocation. Given the
//!   same hash-family seed and rebalancing seed, runs reproduce bit for
//!   bit.
//! - **Safe-zone soundness.** Every safe-zone function `ζ` satisfies
//!   `ζ(U) ≥ 0` at all sites ⟹ the global aggregate lies in the
//!   admissible region `[T_low, T_high]` around the last published
//!   estimate.
//! - **Scale invariance.** Sites scale updates by the site count `k` and
//!   coordinators average collected drifts by `k`, so the global estimate
//!   is independent of how the stream is partitioned.
//! - **Traffic is accounting, not I/O.** Channels tally messages, payload
//!   bytes and a TCP-segment cost (`b + 40·⌈b/1024⌉` per transmission);
//!   nothing is serialized.
//!
//! Failure modes are precise: configuration errors surface as `Result`s
//! before a run starts, invariant violations abort loudly.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

/// Stream records, dataset metadata, query descriptors.
pub mod records;

/// Dense vectors, delta vectors, incremental dot/norm primitives.
pub mod linalg;

/// AGMS hash families, projections, sketches and estimators.
pub mod sketch;

/// Quorum composition, hyperbola root finding, bilinear 2-D zones.
pub mod geometry;

/// Composite safe zones for self-join and join queries.
pub mod safezone;

/// Query states, transmissible safe-zone functions, continuous queries.
pub mod query;

/// The Event-Condition-Action engine and its condition combinators.
pub mod eca;

/// Synthetic and buffered data sources.
pub mod data;

/// Simulated RPC codes, channels and traffic accounting.
pub mod netsim;

/// Shared protocol configuration, statistics and result rows.
pub mod proto;

/// The full-vs-radial safe-zone cost model.
pub mod cost;

/// SGM: the set-based Geometric Method.
pub mod sgm;

/// AGM: the bitwise Geometric Method.
pub mod agm;

/// FGM: the functional Geometric Method with cost control.
pub mod fgm;

/// FRGM: the functional Geometric Method with λ-scaling rebalancing.
pub mod frgm;

/// TODS: the per-stream threshold baseline method.
pub mod tods;

/// Exact reference methods and error observation.
pub mod accurate;

/// The simulation world and run-grammar driver.
pub mod sim;

// ============================================================================
// Canonical re-exports
// ============================================================================

pub use crate::data::{make_uniform_dataset, BufferedDataSource, BufferedDataset, DataSource};
pub use crate::linalg::DeltaVector;
pub use crate::proto::{GmResultRow, ProtocolConfig, Rebalancing};
pub use crate::query::ContinuousQuery;
pub use crate::records::{
    Key, QueryKind, SourceId, StreamId, StreamMetadata, StreamQuery, StreamRecord, Timestamp,
};
pub use crate::sim::{make_network, GmVariant, Simulation, World};
pub use crate::sketch::{HashFamilyRegistry, Projection, Sketch};
