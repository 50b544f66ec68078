//! FGM: the functional Geometric Method with safe-zone cost control
//!
//! Bitweight subrounds as in AGM, plus two economies:
//!
//! - **Cheap zones by default.** At round start every site receives the
//!   radial zone `ζ(E) − ‖U‖`. A site only pays for the full zone when it
//!   crosses a threshold *and* the cost model predicts the upgrade pays for
//!   itself; the upgrade's bitweight correction rides along with the
//!   triggering delta.
//! - **Drift rebalancing without full vectors.** Besides the random
//!   averaging strategy, sites can exchange `m`-dimensional projections of
//!   their drifts (block averaging, or a random `(a·i+b) mod m` hash),
//!   shipping `m` floats instead of the whole state vector.

use std::collections::HashMap;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::cost::{CostModel, SiteObservation};
use crate::netsim::{declare_method, declare_oneway, ByteSize, HostAddr, MethodCode, RpcProtocol, Traffic};
use crate::proto::{CompressedState, GmResultRow, GmStats, Rebalancing};
use crate::query::{ContinuousQuery, QueryState, SafeZoneFunc, Safezone};
use crate::records::{SourceId, StreamRecord};

/// One monitored site.
#[derive(Debug)]
pub struct Node {
    hid: SourceId,
    szone: Safezone,
    /// Drift vector; rewritten by rebalancing.
    u: Vec<f64>,
    /// Round-local update vector; never rewritten, feeds the cost model.
    ds: Vec<f64>,
    update_count: usize,
    round_local_updates: usize,
    pub zeta: f64,
    minzeta: f64,
    zeta_0: f64,
    zeta_quantum: f64,
    bitweight: i64,
}

impl Node {
    fn new(hid: SourceId, dim: usize) -> Self {
        Self {
            hid,
            szone: Safezone::null(),
            u: vec![0.0; dim],
            ds: vec![0.0; dim],
            update_count: 0,
            round_local_updates: 0,
            zeta: 0.0,
            minzeta: 0.0,
            zeta_0: 0.0,
            zeta_quantum: 0.0,
            bitweight: 0,
        }
    }

    fn reset(&mut self, szone: Safezone) {
        self.szone = szone;
        self.u.iter_mut().for_each(|v| *v = 0.0);
        self.ds.iter_mut().for_each(|v| *v = 0.0);
        self.update_count = 0;
        self.round_local_updates = 0;
        self.zeta = self.szone.zeta(&self.u);
        self.minzeta = self.zeta;
        self.reset_bitweight(self.zeta / 2.0);
    }

    /// Remote: upgrade to the full zone mid-round. Returns the bitweight
    /// correction (never positive: the full zone dominates the radial one).
    fn set_safezone(&mut self, szone: Safezone) -> i64 {
        self.szone = szone;
        let newzeta = self.szone.zeta(&self.u);
        debug_assert!(newzeta >= self.zeta - 1e-9, "full zone must dominate the radial zone");
        self.zeta = newzeta;
        self.minzeta = newzeta;

        let delta = ((self.zeta_0 - self.zeta) / self.zeta_quantum).floor() as i64 - self.bitweight;
        self.bitweight += delta;
        delta
    }

    fn reset_bitweight(&mut self, quantum: f64) {
        self.zeta_0 = self.zeta;
        self.minzeta = self.zeta;
        self.zeta_quantum = quantum;
        self.bitweight = 0;
    }

    fn get_drift(&mut self) -> CompressedState {
        let upd = self.update_count;
        self.update_count = 0;
        CompressedState { vec: self.u.clone(), updates: upd }
    }

    /// Remote: overwrite the drift (rebalancing); returns the zeta change.
    fn set_drift(&mut self, cs: &CompressedState) -> f64 {
        self.u.copy_from_slice(&cs.vec);
        let old = self.zeta;
        self.zeta = self.szone.zeta(&self.u);
        self.zeta - old
    }

    /// Remote: block-averaged `m`-projection of the drift.
    fn get_projection(&self, m: usize) -> Vec<f64> {
        let n = self.u.len();
        let (q, r) = (n / m, n % m);
        let mut pu = vec![0.0; m];
        let mut p = 0;
        for (i, slot) in pu.iter_mut().enumerate() {
            let ni = q + usize::from(i < r);
            *slot = self.u[p..p + ni].iter().sum::<f64>() / ni as f64;
            p += ni;
        }
        debug_assert_eq!(p, n);
        pu
    }

    /// Remote: move the drift so its projection matches `mu`; returns the
    /// zeta change.
    fn set_projection(&mut self, mu: &[f64]) -> f64 {
        let m = mu.len();
        let pu = self.get_projection(m);
        let n = self.u.len();
        let (q, r) = (n / m, n % m);
        let mut p = 0;
        for i in 0..m {
            let ni = q + usize::from(i < r);
            let delta = mu[i] - pu[i];
            for v in &mut self.u[p..p + ni] {
                *v += delta;
            }
            p += ni;
        }
        let old = self.zeta;
        self.zeta = self.szone.zeta(&self.u);
        self.zeta - old
    }

    /// Remote: `m`-projection by the hash `(a·i + b) mod m`.
    fn get_random_projection(&self, m: usize, a: usize, b: usize) -> Vec<f64> {
        let mut pu = vec![0.0; m];
        let mut count = vec![0.0; m];
        for (i, &v) in self.u.iter().enumerate() {
            let h = (a.wrapping_mul(i).wrapping_add(b)) % m;
            pu[h] += v;
            count[h] += 1.0;
        }
        for (s, c) in pu.iter_mut().zip(&count) {
            if *c > 0.0 {
                *s /= c;
            }
        }
        pu
    }

    fn set_random_projection(&mut self, mu: &[f64], a: usize, b: usize) -> f64 {
        let m = mu.len();
        let pu = self.get_random_projection(m, a, b);
        for (i, v) in self.u.iter_mut().enumerate() {
            let h = (a.wrapping_mul(i).wrapping_add(b)) % m;
            *v += mu[h] - pu[h];
        }
        let old = self.zeta;
        self.zeta = self.szone.zeta(&self.u);
        self.zeta - old
    }
}

struct Methods {
    reset: MethodCode,
    set_safezone: MethodCode,
    reset_bitweight: MethodCode,
    get_zeta: MethodCode,
    get_drift: MethodCode,
    set_drift: MethodCode,
    get_projection: MethodCode,
    set_projection: MethodCode,
    get_random_projection: MethodCode,
    set_random_projection: MethodCode,
    threshold_crossed: MethodCode,
}

/// Coordinator state.
pub struct Coordinator {
    pub query: QueryState,
    pub stats: GmStats,
    safe_zone: Rc<SafeZoneFunc>,
    radial_safe_zone: Option<Rc<SafeZoneFunc>>,
    pub has_cheap_safezone: Vec<bool>,
    bitweight: Vec<i64>,
    total_bitweight: Vec<i64>,
    bit_budget: i64,
    bit_level: usize,
    pub cmodel: CostModel,
    rebalance_rng: StdRng,
}

/// The FGM star network.
pub struct Network {
    name: String,
    q: Rc<ContinuousQuery>,
    pub coord: Coordinator,
    pub nodes: Vec<Node>,
    site_index: HashMap<SourceId, usize>,
    pub traffic: Traffic,
    pub rpc: RpcProtocol,
    methods: Methods,
}

impl Network {
    pub fn new(name: &str, q: Rc<ContinuousQuery>, sites: &[SourceId]) -> anyhow::Result<Self> {
        let dim = q.state_vector_size();
        let query = q.make_query_state()?;
        let k = sites.len();

        let mut rpc = RpcProtocol::new("FGM");
        let methods = Methods {
            reset: declare_oneway(&mut rpc, "site", "reset"),
            set_safezone: declare_method(&mut rpc, "site", "set_safezone"),
            reset_bitweight: declare_oneway(&mut rpc, "site", "reset_bitweight"),
            get_zeta: declare_method(&mut rpc, "site", "get_zeta"),
            get_drift: declare_method(&mut rpc, "site", "get_drift"),
            set_drift: declare_method(&mut rpc, "site", "set_drift"),
            get_projection: declare_method(&mut rpc, "site", "get_projection"),
            set_projection: declare_method(&mut rpc, "site", "set_projection"),
            get_random_projection: declare_method(&mut rpc, "site", "get_random_projection"),
            set_random_projection: declare_method(&mut rpc, "site", "set_random_projection"),
            threshold_crossed: declare_oneway(&mut rpc, "coord", "threshold_crossed"),
        };

        let safe_zone = query.safezone();
        let radial_safe_zone = query.radial_safezone();

        let nodes: Vec<Node> = sites.iter().map(|&hid| Node::new(hid, dim)).collect();
        let site_index = sites.iter().enumerate().map(|(i, &hid)| (hid, i)).collect();

        Ok(Self {
            name: name.to_string(),
            coord: Coordinator {
                query,
                stats: GmStats::default(),
                safe_zone,
                radial_safe_zone,
                has_cheap_safezone: vec![false; k],
                bitweight: vec![0; k],
                total_bitweight: vec![0; k],
                bit_budget: 0,
                bit_level: 0,
                cmodel: CostModel::new(k),
                rebalance_rng: StdRng::seed_from_u64(q.config.rebalance_seed),
            },
            q,
            nodes,
            site_index,
            traffic: Traffic::new(),
            rpc,
            methods,
        })
    }

    fn k(&self) -> usize {
        self.nodes.len()
    }

    fn use_cost_model(&self) -> bool {
        self.coord.radial_safe_zone.is_some() && self.q.config.use_cost_model
    }

    pub fn warmup(&mut self, warmup: &[StreamRecord]) {
        let mut de = vec![0.0; self.q.state_vector_size()];
        for rec in warmup {
            self.q.update(&mut de, rec);
        }
        let k = self.k() as f64;
        de.iter_mut().for_each(|v| *v /= k);
        self.coord.query.update_estimate(&de);
        self.coord.safe_zone = self.coord.query.safezone();
        self.coord.radial_safe_zone = self.coord.query.radial_safezone();
    }

    /// Start a round: everyone gets the cheap zone when the cost model is
    /// active, the full zone otherwise.
    pub fn start_round(&mut self) {
        let k = self.k();
        self.coord.bitweight.iter_mut().for_each(|b| *b = 0);
        self.coord.total_bitweight.iter_mut().for_each(|b| *b = 0);
        self.coord.bit_level = 1;
        self.coord.bit_budget = k as i64;
        self.coord.stats.round_sz_sent = 0;
        self.coord.stats.num_rounds += 1;
        self.coord.stats.num_subrounds += 1;

        self.coord.safe_zone = self.coord.query.safezone();
        self.coord.radial_safe_zone = self.coord.query.radial_safezone();

        let cheap = self.use_cost_model();
        for i in 0..k {
            self.coord.has_cheap_safezone[i] = cheap;
            let func = if cheap {
                self.coord.radial_safe_zone.as_ref().expect("radial zone present").clone()
            } else {
                self.coord.stats.sz_sent += 1;
                self.coord.safe_zone.clone()
            };
            let sz = Safezone::new(func);
            self.traffic.call(
                HostAddr::Coordinator,
                HostAddr::Site(self.nodes[i].hid),
                self.methods.reset,
                sz.byte_size(),
                0,
            );
            self.nodes[i].reset(sz);
        }
    }

    pub fn process_record(&mut self, rec: StreamRecord) {
        let Some(&ix) = self.site_index.get(&rec.hid) else { return };
        let node = &mut self.nodes[ix];
        let Some(mut delta) = self.q.delta_update(&mut node.ds, &rec) else { return };

        node.update_count += 1;
        node.round_local_updates += 1;

        // the delta was taken against dS; rebase it onto the (possibly
        // rebalanced) drift vector before the incremental zeta
        delta.rebase_apply(&mut node.u);
        node.zeta = node.szone.zeta_inc(&delta, &node.u);
        if node.zeta < node.minzeta {
            node.minzeta = node.zeta;
        }

        let bwnew = ((node.zeta_0 - node.minzeta) / node.zeta_quantum).floor() as i64;
        let dbw = bwnew - node.bitweight;
        if dbw > 0 {
            node.bitweight = bwnew;
            self.threshold_crossed(ix, dbw);
        }
    }

    /// Remote (one-way): a site's bitweight rose by `dbw`.
    fn threshold_crossed(&mut self, ix: usize, mut dbw: i64) {
        self.traffic.call(
            HostAddr::Site(self.nodes[ix].hid),
            HostAddr::Coordinator,
            self.methods.threshold_crossed,
            8,
            0,
        );

        // upgrade the site to the full zone when the plan says it pays
        if self.coord.has_cheap_safezone[ix] && self.coord.cmodel.plan()[ix] {
            self.coord.stats.sz_sent += 1;
            self.coord.stats.round_sz_sent += 1;
            let sz = Safezone::new(self.coord.safe_zone.clone());
            self.traffic.call(
                HostAddr::Coordinator,
                HostAddr::Site(self.nodes[ix].hid),
                self.methods.set_safezone,
                sz.byte_size(),
                4,
            );
            dbw += self.nodes[ix].set_safezone(sz);
            self.coord.has_cheap_safezone[ix] = false;
        }

        self.coord.bitweight[ix] += dbw;
        self.coord.total_bitweight[ix] += dbw;
        self.coord.bit_budget -= dbw;

        if self.coord.bit_budget < 0 {
            self.finish_subround();
        }
    }

    fn collect_zetas(&mut self) -> f64 {
        let mut total = 0.0;
        for i in 0..self.k() {
            self.traffic.call(
                HostAddr::Coordinator,
                HostAddr::Site(self.nodes[i].hid),
                self.methods.get_zeta,
                0,
                4,
            );
            total += self.nodes[i].zeta;
        }
        total
    }

    fn finish_subround(&mut self) {
        let total_zeta = self.collect_zetas();
        self.coord.bit_level += 1;

        if total_zeta < self.k() as f64 * self.coord.query.zeta_e() * 0.01 {
            self.finish_subrounds(total_zeta);
        } else {
            self.start_subround(total_zeta);
        }
    }

    fn start_subround(&mut self, total_zeta: f64) {
        let k = self.k();
        self.coord.stats.num_subrounds += 1;
        self.coord.bit_budget = k as i64;
        self.coord.bitweight.iter_mut().for_each(|b| *b = 0);
        let quantum = total_zeta / (2.0 * k as f64);
        for i in 0..k {
            self.traffic.call(
                HostAddr::Coordinator,
                HostAddr::Site(self.nodes[i].hid),
                self.methods.reset_bitweight,
                4,
                0,
            );
            self.nodes[i].reset_bitweight(quantum);
        }
    }

    fn finish_subrounds(&mut self, total_zeta: f64) {
        if self.k() > 1 {
            match self.q.config.rebalance_algorithm {
                Rebalancing::Random => self.rebalance_random(),
                Rebalancing::Projection => self.rebalance_projection(total_zeta, None),
                Rebalancing::RandomProjection => {
                    let a = self.coord.rebalance_rng.gen::<usize>() | 1;
                    let b = self.coord.rebalance_rng.gen::<usize>();
                    self.rebalance_projection(total_zeta, Some((a, b)));
                }
                _ => self.finish_round(),
            }
        } else {
            self.finish_round();
        }
    }

    fn fetch_updates(&mut self, ix: usize, acc: &mut [f64], upd: &mut usize) {
        let hid = self.nodes[ix].hid;
        let cs = self.nodes[ix].get_drift();
        self.traffic.call(
            HostAddr::Coordinator,
            HostAddr::Site(hid),
            self.methods.get_drift,
            0,
            cs.byte_size(),
        );
        for (a, b) in acc.iter_mut().zip(&cs.vec) {
            *a += b;
        }
        *upd += cs.updates;
        self.coord.stats.total_updates += cs.updates;
    }

    /// Try to cancel the round with a partial averaging set; fall back to
    /// finishing the round with everything collected.
    fn rebalance_random(&mut self) {
        let k = self.k();
        let mut new_e = vec![0.0; self.q.state_vector_size()];
        let mut new_e_updates = 0usize;
        let mut bset: Vec<usize> = Vec::new();
        let mut zeta_b = 0.0;

        let mut order: Vec<usize> = (0..k).collect();
        order.shuffle(&mut self.coord.rebalance_rng);

        for &i in &order {
            if self.coord.has_cheap_safezone[i] {
                continue;
            }
            self.fetch_updates(i, &mut new_e, &mut new_e_updates);
            bset.push(i);
            zeta_b += self.nodes[i].zeta;

            if bset.len() > 1 {
                let blen = bset.len() as f64;
                let avg: Vec<f64> = new_e.iter().map(|v| v / blen).collect();
                let zeta_bnew = self.coord.safe_zone.compute_zeta(&avg);
                let zgain = blen * zeta_bnew - zeta_b;

                if zgain >= 1.2 * blen * self.coord.query.zeta_e() && bset.len() <= k / 2 {
                    let cs = CompressedState { vec: avg, updates: new_e_updates };
                    for bi in 0..bset.len() {
                        let ix = bset[bi];
                        self.traffic.call(
                            HostAddr::Coordinator,
                            HostAddr::Site(self.nodes[ix].hid),
                            self.methods.set_drift,
                            cs.byte_size(),
                            8,
                        );
                        self.nodes[ix].set_drift(&cs);
                    }
                    self.coord.stats.total_rbl_size += bset.len();
                    return;
                }
            }
        }

        // no profitable set: finish the round with the rest of the drifts
        for &i in &order {
            if self.coord.has_cheap_safezone[i] {
                self.fetch_updates(i, &mut new_e, &mut new_e_updates);
            }
        }
        let kf = k as f64;
        new_e.iter_mut().for_each(|v| *v /= kf);
        self.finish_with_new_e(new_e);
    }

    /// Exchange `m`-dimensional drift projections instead of full vectors;
    /// `hash` selects the random-projection variant.
    fn rebalance_projection(&mut self, mut total_zeta: f64, hash: Option<(usize, usize)>) {
        let m = self.q.config.rbl_proj_dim;
        if m == 0 || m > self.q.state_vector_size() {
            self.finish_round();
            return;
        }

        let mut mu = vec![0.0; m];
        let mut kk = 0usize;
        for i in 0..self.k() {
            if self.coord.has_cheap_safezone[i] {
                continue;
            }
            let (code, req) = match hash {
                None => (self.methods.get_projection, 8),
                Some(_) => (self.methods.get_random_projection, 24),
            };
            self.traffic.call(
                HostAddr::Coordinator,
                HostAddr::Site(self.nodes[i].hid),
                code,
                req,
                4 * m,
            );
            let pu = match hash {
                None => self.nodes[i].get_projection(m),
                Some((a, b)) => self.nodes[i].get_random_projection(m, a, b),
            };
            for (s, v) in mu.iter_mut().zip(&pu) {
                *s += v;
            }
            kk += 1;
        }

        if kk < 2 {
            self.finish_round();
            return;
        }
        mu.iter_mut().for_each(|v| *v /= kk as f64);

        for i in 0..self.k() {
            if self.coord.has_cheap_safezone[i] {
                continue;
            }
            let (code, req) = match hash {
                None => (self.methods.set_projection, 4 * m),
                Some(_) => (self.methods.set_random_projection, 4 * m + 16),
            };
            self.traffic.call(
                HostAddr::Coordinator,
                HostAddr::Site(self.nodes[i].hid),
                code,
                req,
                8,
            );
            total_zeta += match hash {
                None => self.nodes[i].set_projection(&mu),
                Some((a, b)) => self.nodes[i].set_random_projection(&mu, a, b),
            };
        }
        self.coord.stats.total_rbl_size += kk;

        if total_zeta < self.k() as f64 * self.coord.query.zeta_e() * 0.05 {
            self.finish_round();
        } else {
            self.start_subround(total_zeta);
        }
    }

    fn finish_round(&mut self) {
        let mut new_e = vec![0.0; self.q.state_vector_size()];
        let mut upd = 0usize;
        for i in 0..self.k() {
            self.fetch_updates(i, &mut new_e, &mut upd);
        }
        let k = self.k() as f64;
        new_e.iter_mut().for_each(|v| *v /= k);
        self.finish_with_new_e(new_e);
    }

    fn finish_with_new_e(&mut self, new_e: Vec<f64>) {
        if self.use_cost_model() {
            let zeta_e = self.coord.query.zeta_e();
            let full = self.coord.safe_zone.clone();
            let radial = self.coord.radial_safe_zone.clone().expect("radial zone present");
            let obs: Vec<SiteObservation> = self
                .nodes
                .iter()
                .map(|n| SiteObservation {
                    updates: n.round_local_updates as f64,
                    zeta_full_ds: full.compute_zeta(&n.ds),
                    zeta_radial_ds: radial.compute_zeta(&n.ds),
                })
                .collect();
            self.coord.cmodel.update_model(zeta_e, &obs);
            let d_cost = full.zeta_size() - radial.zeta_size();
            self.coord.cmodel.compute_model(d_cost);
        }

        self.coord.query.update_estimate(&new_e);
        tracing::debug!(
            target: "geomon::fgm",
            round = self.coord.stats.num_rounds,
            bit_level = self.coord.bit_level,
            bits = self.coord.total_bitweight.iter().sum::<i64>(),
            qest = self.coord.query.qest(),
            sz_round = self.coord.stats.round_sz_sent,
            "round finished"
        );
        self.start_round();
    }

    /// End of stream: fold outstanding drifts without opening a new round.
    pub fn finish_rounds(&mut self) {
        let mut new_e = vec![0.0; self.q.state_vector_size()];
        let mut upd = 0usize;
        for i in 0..self.k() {
            self.fetch_updates(i, &mut new_e, &mut upd);
        }
        let k = self.k() as f64;
        new_e.iter_mut().for_each(|v| *v /= k);
        self.coord.query.update_estimate(&new_e);
    }

    pub fn qest(&self) -> f64 {
        self.coord.query.qest()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn results(&self, run_id: &str, stream_count: usize) -> GmResultRow {
        let mut row = GmResultRow {
            run_id: run_id.to_string(),
            name: self.name.clone(),
            protocol: self.rpc.name.clone(),
            query: self.q.query().to_string(),
            max_error: self.q.theta(),
            statevec_size: self.q.state_vector_size(),
            sites: self.k(),
            rounds: self.coord.stats.num_rounds,
            subrounds: self.coord.stats.num_subrounds,
            sz_sent: self.coord.stats.sz_sent,
            total_updates: self.coord.stats.total_updates,
            total_rbl_size: self.coord.stats.total_rbl_size,
            bytes_get_drift: 0,
            tcp_traffic: 0,
            tcp_traffic_pct: 0.0,
        };
        row.fill_traffic(
            &self.traffic,
            self.methods.get_drift.resp.expect("get_drift is two-way"),
            stream_count,
        );
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::ProtocolConfig;
    use crate::records::StreamQuery;
    use crate::sketch::{HashFamilyRegistry, Projection};

    const SEED: u64 = 24534623;

    fn make_network(k: SourceId, config: ProtocolConfig) -> Network {
        let reg = HashFamilyRegistry::with_seed(SEED);
        let proj = Projection::from_registry(&reg, 5, 400);
        let q = Rc::new(
            ContinuousQuery::new_r(&StreamQuery::self_join(1, 0.5), proj, k as usize, config)
                .unwrap(),
        );
        let sites: Vec<SourceId> = (1..=k).collect();
        Network::new("fgm-test", q, &sites).unwrap()
    }

    fn drive(nw: &mut Network, records: i32) {
        let mut ts = 0;
        for i in 0..records {
            ts += 1;
            let rec = StreamRecord::new(1, (i % 10 + 1) as SourceId, (i * 13 % 997) + 1, 1, ts);
            nw.process_record(rec);
        }
    }

    #[test]
    fn cost_model_rounds_start_cheap() {
        let mut nw = make_network(10, ProtocolConfig::default());
        nw.start_round();
        assert!(nw.coord.has_cheap_safezone.iter().all(|&c| c));
        // no full zones shipped yet
        assert_eq!(nw.coord.stats.sz_sent, 0);
        for node in &nw.nodes {
            assert_eq!(node.szone.byte_size(), 4, "radial zone is one float");
        }
    }

    #[test]
    fn without_cost_model_everyone_gets_the_full_zone() {
        let cfg = ProtocolConfig { use_cost_model: false, ..Default::default() };
        let mut nw = make_network(10, cfg);
        nw.start_round();
        assert_eq!(nw.coord.stats.sz_sent, 10);
        assert!(nw.coord.has_cheap_safezone.iter().all(|&c| !c));
    }

    #[test]
    fn safe_zones_sent_stay_within_rounds_times_k() {
        let mut nw = make_network(10, ProtocolConfig::default());
        nw.start_round();
        drive(&mut nw, 30_000);
        nw.finish_rounds();
        let rounds = nw.coord.stats.num_rounds;
        assert!(rounds >= 1);
        assert!(
            nw.coord.stats.sz_sent <= rounds * 10,
            "sz_sent {} exceeds rounds·k {}",
            nw.coord.stats.sz_sent,
            rounds * 10
        );
        assert!(nw.qest() > 0.0);
    }

    #[test]
    fn upgrade_corrects_bitweight_downward() {
        let mut nw = make_network(4, ProtocolConfig::default());
        nw.start_round();
        // force the plan to upgrade site 0 on its first crossing
        drive(&mut nw, 6000);
        nw.finish_rounds();
        // after enough updates the model had data to compute a plan
        assert!(nw.coord.cmodel.max_gain() >= 0.0);
    }

    #[test]
    fn projection_rebalancing_preserves_drift_mass() {
        // get/set projection on a single node: setting the mean of its own
        // projection leaves the drift unchanged; setting a shifted mean
        // moves mass by the shift per block
        let mut nw = make_network(2, ProtocolConfig::default());
        nw.start_round();
        let dim = nw.q.state_vector_size();
        nw.nodes[0].u = (0..dim).map(|i| (i % 7) as f64).collect();
        nw.nodes[0].zeta = 1.0;

        let m = 10;
        let pu = nw.nodes[0].get_projection(m);
        let before = nw.nodes[0].u.clone();
        nw.nodes[0].set_projection(&pu);
        for (a, b) in nw.nodes[0].u.iter().zip(&before) {
            assert!((a - b).abs() < 1e-12);
        }

        let shifted: Vec<f64> = pu.iter().map(|v| v + 1.0).collect();
        nw.nodes[0].set_projection(&shifted);
        let sum_before: f64 = before.iter().sum();
        let sum_after: f64 = nw.nodes[0].u.iter().sum();
        assert!((sum_after - sum_before - dim as f64).abs() < 1e-9);
    }

    #[test]
    fn random_projection_roundtrip_is_identity() {
        let mut nw = make_network(2, ProtocolConfig::default());
        nw.start_round();
        let dim = nw.q.state_vector_size();
        nw.nodes[0].u = (0..dim).map(|i| ((i * 31) % 13) as f64).collect();
        nw.nodes[0].zeta = 1.0;

        let (a, b) = (7usize, 3usize);
        let pu = nw.nodes[0].get_random_projection(64, a, b);
        let before = nw.nodes[0].u.clone();
        nw.nodes[0].set_random_projection(&pu, a, b);
        for (x, y) in nw.nodes[0].u.iter().zip(&before) {
            assert!((x - y).abs() < 1e-12);
        }
    }
}
