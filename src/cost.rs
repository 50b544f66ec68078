//! Cost model: which sites get the full safe zone next round
//!
//! Shipping the full safe zone to a site costs `D` floats up front but
//! makes its zeta decay slower (rate α) than under the cheap radial zone
//! (rate β ≥ α); a site's share of the round's updates is γ. The model
//! predicts, for every prefix size `n` of sites ranked by `θ = β − α`, the
//! expected round length `τ` and the total communication, and picks the
//! prefix with the largest predicted gain.
//!
//! Rates are normalized so that `Σγ = 1` holds when the sweep starts; the
//! optimization is skipped entirely (all-cheap plan) when the round carried
//! too few updates to estimate the rates.

/// Per-site input to the model, gathered at the end of a round.
#[derive(Debug, Clone, Copy)]
pub struct SiteObservation {
    /// Number of local stream updates this round.
    pub updates: f64,
    /// `ζ_full(dS_i)`: the full zone evaluated on the site's round delta.
    pub zeta_full_ds: f64,
    /// `ζ_radial(dS_i)`: the radial zone on the same delta.
    pub zeta_radial_ds: f64,
}

/// The plan optimizer. Owns the model arrays across rounds; `plan()[i]`
/// is true when site `i` should receive the full safe zone.
#[derive(Debug, Clone)]
pub struct CostModel {
    k: usize,
    alpha: Vec<f64>,
    beta: Vec<f64>,
    gamma: Vec<f64>,
    proper: Vec<bool>,
    total_alpha: f64,
    total_beta: f64,
    round_updates: f64,
    plan: Vec<bool>,
    max_gain: f64,
    tau_opt: f64,
}

impl CostModel {
    /// A model over `k` sites, starting from the all-cheap plan.
    pub fn new(k: usize) -> Self {
        Self {
            k,
            alpha: vec![0.0; k],
            beta: vec![0.0; k],
            gamma: vec![0.0; k],
            proper: vec![false; k],
            total_alpha: 0.0,
            total_beta: 0.0,
            round_updates: 0.0,
            plan: vec![false; k],
            max_gain: -1.0,
            tau_opt: 0.0,
        }
    }

    /// The current plan: `plan()[i]` selects the full zone for site `i`.
    pub fn plan(&self) -> &[bool] {
        &self.plan
    }

    /// Predicted gain of the current plan.
    pub fn max_gain(&self) -> f64 {
        self.max_gain
    }

    /// Predicted round length of the current plan.
    pub fn tau_opt(&self) -> f64 {
        self.tau_opt
    }

    /// Refresh the model arrays from this round's observations.
    ///
    /// `zeta_e` scales the decays; sites with no updates or no radial
    /// movement are excluded from the optimization.
    pub fn update_model(&mut self, zeta_e: f64, obs: &[SiteObservation]) {
        assert_eq!(obs.len(), self.k);

        self.round_updates = 0.0;
        self.total_alpha = 0.0;
        self.total_beta = 0.0;
        self.proper.iter_mut().for_each(|p| *p = false);

        let mut kk = 0usize;
        for (i, o) in obs.iter().enumerate() {
            self.gamma[i] = o.updates;
            if self.gamma[i] == 0.0 {
                continue;
            }

            self.beta[i] = zeta_e - o.zeta_radial_ds;
            if self.beta[i] == 0.0 {
                continue;
            }
            debug_assert!(self.beta[i] > 0.0, "radial zone grew within a round");

            self.alpha[i] = zeta_e - o.zeta_full_ds;
            if self.alpha[i] < 0.0 {
                self.beta[i] -= self.alpha[i];
                self.alpha[i] = 0.0;
            } else if self.alpha[i] > self.beta[i] {
                self.alpha[i] = self.beta[i];
            }

            self.total_alpha += self.alpha[i];
            self.total_beta += self.beta[i];
            self.round_updates += self.gamma[i];
            self.proper[i] = true;
            kk += 1;
        }

        if kk == 0 {
            return;
        }
        let kzeta = kk as f64 * zeta_e;
        debug_assert!(kzeta > 0.0);

        for i in 0..self.k {
            self.alpha[i] /= kzeta;
            self.beta[i] /= kzeta;
        }
        self.total_alpha /= kzeta;
        self.total_beta /= kzeta;

        // degenerate case: the full zone is no better anywhere
        if self.total_alpha == self.total_beta {
            self.total_beta += 1.0;
        }

        debug_assert!(self.round_updates > 0.0);
        for i in 0..self.k {
            self.alpha[i] /= self.round_updates;
            self.beta[i] /= self.round_updates;
            self.gamma[i] /= self.round_updates;
        }
        self.total_alpha /= self.round_updates;
        self.total_beta /= self.round_updates;
    }

    /// Recompute the plan from the model arrays. `d_cost` is the extra
    /// descriptor cost of the full zone over the radial one, in floats.
    pub fn compute_model(&mut self, d_cost: usize) {
        self.plan.iter_mut().for_each(|p| *p = false);

        let mut order: Vec<usize> = (0..self.k).filter(|&i| self.proper[i]).collect();
        let kk = order.len();
        if kk == 0 {
            // a round with no input or no movement in the cheap zones
            self.max_gain = 0.0;
            self.tau_opt = 0.0;
            return;
        }

        // not enough data to estimate the alphas: keep the all-cheap plan
        if self.round_updates <= 100.0 * self.k as f64 {
            self.tau_opt = 1.0 / self.total_beta;
            self.max_gain = 0.0;
            return;
        }

        let d_cost = d_cost as f64;
        let theta: Vec<f64> =
            (0..self.k).map(|i| self.beta[i] - self.alpha[i]).collect();

        // rank by θ descending; the optimal plan is a prefix of this order
        order.sort_by(|&i, &j| theta[j].partial_cmp(&theta[i]).expect("NaN in cost model"));

        let mut invtau: f64 = order.iter().map(|&i| self.beta[i]).sum();
        debug_assert!(invtau > 0.0);

        // second sweep order: γ descending, for the update-cost term
        let mut by_gamma = order.clone();
        by_gamma
            .sort_by(|&i, &j| self.gamma[j].partial_cmp(&self.gamma[i]).expect("NaN in cost model"));

        // normalize γ to sum to 1 before the sweep; sum_small_gamma tracks
        // the tail below the sweep index
        let gsum: f64 = by_gamma.iter().map(|&j| self.gamma[j]).sum();
        for &j in &by_gamma {
            self.gamma[j] /= gsum;
        }
        let mut sum_small_gamma = 1.0;
        let mut idx_gamma = 0usize;

        let mut argmax_gain = 0usize;
        self.max_gain = f64::NEG_INFINITY;

        for n in 0..=kk {
            if n > 0 {
                invtau -= theta[order[n - 1]];
            }

            while idx_gamma < by_gamma.len() && self.gamma[by_gamma[idx_gamma]] > d_cost * invtau {
                sum_small_gamma -= self.gamma[by_gamma[idx_gamma]];
                idx_gamma += 1;
            }
            debug_assert!(sum_small_gamma >= -1e-6);
            if sum_small_gamma < 0.0 {
                sum_small_gamma = 0.0;
            }

            // cost of shipping updates: small-γ sites stream, the rest cap
            // out at D
            let c_updates = sum_small_gamma / invtau + d_cost * idx_gamma as f64;
            let gain = 1.0 / invtau - c_updates - n as f64 * d_cost;

            if gain > self.max_gain {
                self.tau_opt = 1.0 / invtau;
                self.max_gain = gain;
                argmax_gain = n;
            }
        }

        debug_assert!(self.max_gain >= 0.0);
        for &i in order.iter().take(argmax_gain) {
            self.plan[i] = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(updates: f64, zeta_full: f64, zeta_radial: f64) -> SiteObservation {
        SiteObservation { updates, zeta_full_ds: zeta_full, zeta_radial_ds: zeta_radial }
    }

    #[test]
    fn sparse_round_keeps_the_all_cheap_plan() {
        let mut m = CostModel::new(4);
        let zeta_e = 10.0;
        // 100·k = 400 updates; 300 is below the cutoff
        let observations = vec![
            obs(100.0, 9.0, 5.0),
            obs(100.0, 9.0, 5.0),
            obs(50.0, 9.0, 5.0),
            obs(50.0, 9.0, 5.0),
        ];
        m.update_model(zeta_e, &observations);
        m.compute_model(100);
        assert!(m.plan().iter().all(|&d| !d));
        assert_eq!(m.max_gain(), 0.0);
        assert!(m.tau_opt() > 0.0);
    }

    #[test]
    fn full_zone_goes_to_sites_where_it_pays() {
        let mut m = CostModel::new(4);
        let zeta_e = 10.0;
        // sites 0 and 1 carry the load, and their full zone barely decays
        // (θ large); sites 2 and 3 gain nothing from the full zone
        let observations = vec![
            obs(50_000.0, 9.9, 1.0),
            obs(40_000.0, 9.8, 1.5),
            obs(5_000.0, 2.0, 2.0),
            obs(5_000.0, 2.0, 2.0),
        ];
        m.update_model(zeta_e, &observations);
        m.compute_model(10);
        assert!(m.plan()[0] && m.plan()[1], "high-theta sites get the full zone: {:?}", m.plan());
        assert!(!m.plan()[2] && !m.plan()[3], "flat sites stay cheap: {:?}", m.plan());
        assert!(m.max_gain() >= 0.0);
    }

    #[test]
    fn empty_round_resets_to_a_trivial_plan() {
        let mut m = CostModel::new(3);
        let observations = vec![obs(0.0, 0.0, 0.0); 3];
        m.update_model(5.0, &observations);
        m.compute_model(10);
        assert!(m.plan().iter().all(|&d| !d));
        assert_eq!(m.max_gain(), 0.0);
        assert_eq!(m.tau_opt(), 0.0);
    }

    #[test]
    fn alpha_is_clamped_between_zero_and_beta() {
        let mut m = CostModel::new(2);
        let zeta_e = 10.0;
        // site 0: full zeta grew (alpha < 0); site 1: full decayed more
        // than radial (alpha > beta)
        let observations = vec![obs(100_000.0, 11.0, 6.0), obs(100_000.0, 2.0, 6.0)];
        m.update_model(zeta_e, &observations);
        // model invariants after normalization
        for i in 0..2 {
            assert!(m.alpha[i] >= 0.0);
            assert!(m.alpha[i] <= m.beta[i]);
        }
        m.compute_model(10);
        assert!(m.max_gain() >= 0.0);
    }
}
