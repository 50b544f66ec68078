//! Protocol-level plumbing shared by all Geometric Method variants
//!
//! Configuration knobs (deserialized from the external config loader),
//! the compressed drift-state wire format, per-run protocol statistics,
//! and the aggregate results row emitted at the end of a run.

use serde::{Deserialize, Serialize};

use crate::netsim::{ByteSize, Traffic, TCP_HEADER_BYTES};
use crate::records::UPDATE_BYTES;

/// Rebalancing strategy labels. SGM understands `none`, `random` and
/// `random_limits`; FGM adds the projection family; FRGM uses `bimodal`
/// and `zero_balance`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Rebalancing {
    #[default]
    None,
    Random,
    RandomLimits,
    Projection,
    RandomProjection,
    Bimodal,
    ZeroBalance,
}

/// Query and protocol configuration, as supplied by the config loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Use the cost model to pick full vs. radial safe zones (FGM/FRGM).
    pub use_cost_model: bool,
    /// Select the eikonal safe-zone variants.
    pub eikonal: bool,
    /// Rebalancing strategy.
    pub rebalance_algorithm: Rebalancing,
    /// Dimension of the rebalancing projection (projection strategies).
    pub rbl_proj_dim: usize,
    /// Subround termination slack for FRGM; `None` keeps the default 0.01.
    pub epsilon_psi: Option<f64>,
    /// Enable the SGM naive-mode heuristic (`ζ(E) < k·√L` switches the
    /// round to cheap ball zones).
    pub naive_mode: bool,
    /// Seed of the rebalancing-permutation PRNG.
    pub rebalance_seed: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            use_cost_model: true,
            eikonal: true,
            rebalance_algorithm: Rebalancing::None,
            rbl_proj_dim: 0,
            epsilon_psi: None,
            naive_mode: false,
            rebalance_seed: 20177,
        }
    }
}

/// A drift state in transit: the vector plus the number of raw updates it
/// aggregates. The wire cost is the cheaper of shipping the vector as
/// floats or the raw update pairs.
#[derive(Debug, Clone)]
pub struct CompressedState {
    pub vec: Vec<f64>,
    pub updates: usize,
}

impl ByteSize for CompressedState {
    fn byte_size(&self) -> usize {
        let vec_bytes = 4 * self.vec.len();
        let raw_bytes = UPDATE_BYTES * self.updates;
        vec_bytes.min(raw_bytes)
    }
}

/// Round/subround bookkeeping common to every GM coordinator.
#[derive(Debug, Clone, Copy, Default)]
pub struct GmStats {
    /// Total number of rounds.
    pub num_rounds: usize,
    /// Total number of subrounds.
    pub num_subrounds: usize,
    /// Total safe zones sent.
    pub sz_sent: usize,
    /// Safe zones sent in the current round.
    pub round_sz_sent: usize,
    /// Cumulative size of all rebalance sets.
    pub total_rbl_size: usize,
    /// Total stream updates aggregated into the estimate.
    pub total_updates: usize,
}

/// The aggregate result row of one protocol run.
#[derive(Debug, Clone, Serialize)]
pub struct GmResultRow {
    pub run_id: String,
    pub name: String,
    pub protocol: String,
    pub query: String,
    pub max_error: f64,
    pub statevec_size: usize,
    pub sites: usize,
    pub rounds: usize,
    pub subrounds: usize,
    pub sz_sent: usize,
    pub total_updates: usize,
    pub total_rbl_size: usize,
    pub bytes_get_drift: usize,
    pub tcp_traffic: usize,
    pub tcp_traffic_pct: f64,
}

impl GmResultRow {
    /// Fill the traffic-derived columns from a channel table.
    ///
    /// `drift_resp_endpoint` is the response endpoint of the protocol's
    /// drift-collection method; `stream_count` the number of records the
    /// run consumed. The naive baseline charges one TCP-framed raw update
    /// per record.
    pub fn fill_traffic(
        &mut self,
        traffic: &Traffic,
        drift_resp_endpoint: u32,
        stream_count: usize,
    ) {
        self.bytes_get_drift = traffic.bytes_for_endpoint(drift_resp_endpoint);
        self.tcp_traffic = traffic.total_tcp_bytes();
        let naive = ((TCP_HEADER_BYTES + UPDATE_BYTES) * stream_count) as f64;
        self.tcp_traffic_pct = if naive > 0.0 { self.tcp_traffic as f64 / naive } else { 0.0 };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netsim::HostAddr;

    #[test]
    fn compressed_state_picks_the_cheaper_encoding() {
        // few updates: raw pairs win
        let cs = CompressedState { vec: vec![0.0; 1000], updates: 10 };
        assert_eq!(cs.byte_size(), 80);
        // many updates: the float vector wins
        let cs = CompressedState { vec: vec![0.0; 1000], updates: 10_000 };
        assert_eq!(cs.byte_size(), 4000);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let cfg: ProtocolConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.use_cost_model);
        assert!(cfg.eikonal);
        assert_eq!(cfg.rebalance_algorithm, Rebalancing::None);
        assert!(!cfg.naive_mode);

        let cfg: ProtocolConfig =
            serde_json::from_str(r#"{"rebalance_algorithm":"zero_balance","epsilon_psi":0.05}"#)
                .unwrap();
        assert_eq!(cfg.rebalance_algorithm, Rebalancing::ZeroBalance);
        assert_eq!(cfg.epsilon_psi, Some(0.05));
    }

    #[test]
    fn unknown_rebalancing_name_fails_loudly() {
        let err: Result<ProtocolConfig, _> =
            serde_json::from_str(r#"{"rebalance_algorithm":"magic"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn traffic_pct_uses_the_naive_baseline() {
        let mut t = Traffic::new();
        t.transmit(HostAddr::Site(1), HostAddr::Coordinator, 2, 480);
        let mut row = GmResultRow {
            run_id: String::new(),
            name: "nw".into(),
            protocol: "SGM".into(),
            query: "SELFJOIN(1;eps=0.5)".into(),
            max_error: 0.5,
            statevec_size: 2000,
            sites: 10,
            rounds: 1,
            subrounds: 1,
            sz_sent: 10,
            total_updates: 10,
            total_rbl_size: 0,
            bytes_get_drift: 0,
            tcp_traffic: 0,
            tcp_traffic_pct: 0.0,
        };
        row.fill_traffic(&t, 3, 10);
        assert_eq!(row.tcp_traffic, 480 + 40);
        let naive = ((TCP_HEADER_BYTES + UPDATE_BYTES) * 10) as f64;
        assert!((row.tcp_traffic_pct - 520.0 / naive).abs() < 1e-12);
    }
}
