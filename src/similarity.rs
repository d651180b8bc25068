use alloc::vec::Vec;

use crate::cache::{FeatureCache, PositionEvaluations};
use crate::forward_backward::ForwardBackward;
use crate::potential::Mi;
use crate::transition::TransitionModel;

/// Expectation-based local-similarity objective for pure Markov models.
///
/// The objective is the expected number of positions whose label matches the
/// training label, `E[m] = sum_i P(y_i = y*_i)`. Alongside the plain alpha
/// and beta vectors of a [`ForwardBackward`] run, this arena carries moment
/// vectors accumulating path weight times match count; they share the plain
/// vectors' scale factors, so the scales cancel wherever a moment is divided
/// by a weight.
#[derive(Debug)]
pub struct LocalSimilarity {
    n_states: usize,
    len: usize,
    alpha_m: Vec<f64>,
    beta_m: Vec<f64>,
    expected_matches: f64,
    mi: Mi,
    evals: PositionEvaluations,
}

impl LocalSimilarity {
    /// Creates an arena for sequences up to `max_len` positions.
    #[must_use]
    pub fn new(tm: &TransitionModel, max_len: usize) -> Self {
        let n = tm.n_states();
        Self {
            n_states: n,
            len: 0,
            alpha_m: vec![0.0; max_len * n],
            beta_m: vec![0.0; max_len * n],
            expected_matches: 0.0,
            mi: Mi::new(tm),
            evals: PositionEvaluations::new(tm),
        }
    }

    /// Runs the moment recursions over one sequence.
    ///
    /// `fb` must hold a completed [`ForwardBackward::run`] for the same
    /// sequence and weights.
    pub fn run(&mut self, fb: &ForwardBackward, cache: &FeatureCache, seq: usize, weights: &[f64]) {
        let tm = cache.transition_model();
        let n = self.n_states;
        let len = fb.len();
        self.len = len;
        if self.alpha_m.len() < len * n {
            self.alpha_m.resize(len * n, 0.0);
            self.beta_m.resize(len * n, 0.0);
        }
        let labels = cache.labels(seq).unwrap();

        // forward moments: alpha_m[i][t] counts matches at positions <= i
        for s in 0..n {
            self.alpha_m[s] = if labels[0] == s { fb.alpha(0, s) } else { 0.0 };
        }
        for i in 1..len {
            cache.evaluate_position(seq, i, &mut self.evals);
            self.mi.calc(tm, &self.evals, weights);
            let divisor = (fb.log_scale_alpha(i) - fb.log_scale_alpha(i - 1)).exp();
            let (prev, cur) = self.alpha_m[(i - 1) * n..(i + 1) * n].split_at_mut(n);
            cur.fill(0.0);
            for (t, &e) in self.mi.edge.iter().enumerate() {
                cur[tm.target(t)] += prev[tm.source(t)] * e.exp();
            }
            for (s, x) in cur.iter_mut().enumerate() {
                *x /= divisor;
                if labels[i] == s {
                    *x += fb.alpha(i, s);
                }
            }
        }
        let mut expected = 0.0;
        for s in 0..n {
            expected += self.alpha_m[(len - 1) * n + s];
        }
        let alpha_total: f64 = (0..n).map(|s| fb.alpha(len - 1, s)).sum();
        self.expected_matches = expected / alpha_total;

        // backward moments: beta_m[i][s] counts matches at positions > i
        self.beta_m[(len - 1) * n..len * n].fill(0.0);
        for i in (0..len - 1).rev() {
            cache.evaluate_position(seq, i + 1, &mut self.evals);
            self.mi.calc(tm, &self.evals, weights);
            let divisor = (fb.log_scale_beta(i) - fb.log_scale_beta(i + 1)).exp();
            let (cur, next) = self.beta_m[i * n..(i + 2) * n].split_at_mut(n);
            cur.fill(0.0);
            for (t, &e) in self.mi.edge.iter().enumerate() {
                let to = tm.target(t);
                let mut tail = next[to];
                if labels[i + 1] == to {
                    tail += fb.beta(i + 1, to);
                }
                cur[tm.source(t)] += tail * e.exp();
            }
            for x in cur.iter_mut() {
                *x /= divisor;
            }
        }
    }

    /// `E[m]` of the last [`Self::run`]: the expected number of positions
    /// decoded to the training label.
    #[inline(always)]
    #[must_use]
    pub const fn expected_matches(&self) -> f64 {
        self.expected_matches
    }

    /// Expected match count restricted to paths occupying `state` at `pos`,
    /// unnormalized by `P(state at pos)`.
    fn moment_node(&self, fb: &ForwardBackward, pos: usize, state: usize) -> f64 {
        let n = self.n_states;
        let scale = (fb.log_scale_alpha(pos) + fb.log_scale_beta(pos) - fb.log_partition()).exp();
        (self.alpha_m[pos * n + state] * fb.beta(pos, state)
            + fb.alpha(pos, state) * self.beta_m[pos * n + state])
            * scale
    }

    /// Adds the gradient of `E[m]` for `seq` to `gradients`.
    ///
    /// Uses the covariance identity: for every (position, potential),
    /// `d E[m] / d w = value * (E[m * 1_pot] - E[m] * P(pot))`.
    pub fn accumulate_gradient(
        &mut self,
        fb: &ForwardBackward,
        cache: &FeatureCache,
        seq: usize,
        weights: &[f64],
        gradients: &mut [f64],
    ) {
        let tm = cache.transition_model();
        let n = self.n_states;
        let labels = cache.labels(seq).unwrap();
        let em = self.expected_matches;
        for pos in 0..self.len {
            cache.evaluate_position(seq, pos, &mut self.evals);
            self.mi.calc(tm, &self.evals, weights);
            for s in 0..n {
                let cov = self.moment_node(fb, pos, s) - em * fb.node_marginal(pos, s);
                if cov != 0.0 {
                    for (fid, value) in self.evals.get(tm.node_potential(s)).pairs() {
                        gradients[fid] += cov * value;
                    }
                }
            }
            if pos > 0 {
                let scale = (fb.log_scale_alpha(pos - 1) + fb.log_scale_beta(pos)
                    - fb.log_partition())
                .exp();
                for t in 0..tm.n_transitions() {
                    let e = self.mi.edge[t];
                    if e == f64::NEG_INFINITY {
                        continue;
                    }
                    let f = tm.source(t);
                    let to = tm.target(t);
                    let a = fb.alpha(pos - 1, f);
                    let mut moment = self.alpha_m[(pos - 1) * n + f] * fb.beta(pos, to)
                        + a * self.beta_m[pos * n + to];
                    if labels[pos] == to {
                        moment += a * fb.beta(pos, to);
                    }
                    let moment = moment * e.exp() * scale;
                    let cov = moment - em * fb.edge_marginal(tm, pos, t, e);
                    if cov != 0.0 {
                        for (fid, value) in self.evals.get(tm.edge_potential(t)).pairs() {
                            gradients[fid] += cov * value;
                        }
                    }
                }
            }
        }
    }
}
