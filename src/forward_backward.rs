use alloc::vec::Vec;

use crate::cache::{FeatureCache, PositionEvaluations};
use crate::potential::Mi;
use crate::transition::TransitionModel;

/// Tolerance for the runtime marginal sanity checks. Violations indicate a
/// cache or model-order bug, never recoverable input.
const MARGINAL_TOL: f64 = 1e-6;

/// Arena and recursions of the plain Markov forward-backward pass.
///
/// Alpha and beta live in the exponentiated potential domain and are
/// rescaled (divided by their sum) at every position; the log of the
/// accumulated scales is tracked per position and added back when a true
/// magnitude is needed. All buffers are sized once for the longest sequence
/// of the batch and reused, so the per-position loops never allocate.
#[derive(Debug)]
pub struct ForwardBackward {
    n_states: usize,
    len: usize,
    alpha: Vec<f64>,
    beta: Vec<f64>,
    scale_a: Vec<f64>,
    scale_b: Vec<f64>,
    log_z: f64,
    mi: Mi,
    evals: PositionEvaluations,
}

impl ForwardBackward {
    /// Creates an arena for sequences up to `max_len` positions.
    #[must_use]
    pub fn new(tm: &TransitionModel, max_len: usize) -> Self {
        let n = tm.n_states();
        Self {
            n_states: n,
            len: 0,
            alpha: vec![0.0; max_len * n],
            beta: vec![0.0; max_len * n],
            scale_a: vec![0.0; max_len],
            scale_b: vec![0.0; max_len],
            log_z: f64::NEG_INFINITY,
            mi: Mi::new(tm),
            evals: PositionEvaluations::new(tm),
        }
    }

    /// Divides the vector by its sum and returns the log of the divisor.
    #[inline(always)]
    fn rescale(v: &mut [f64]) -> f64 {
        let sum: f64 = v.iter().sum();
        if sum > 0.0 {
            for x in v {
                *x /= sum;
            }
        }
        sum.ln()
    }

    /// Runs the alpha and beta recursions over one sequence.
    pub fn run(&mut self, cache: &FeatureCache, seq: usize, weights: &[f64]) {
        let tm = cache.transition_model();
        let n = self.n_states;
        let len = cache.sequence(seq).len();
        self.len = len;
        if self.alpha.len() < len * n {
            self.alpha.resize(len * n, 0.0);
            self.beta.resize(len * n, 0.0);
            self.scale_a.resize(len, 0.0);
            self.scale_b.resize(len, 0.0);
        }

        // alpha
        cache.evaluate_position(seq, 0, &mut self.evals);
        self.mi.calc(tm, &self.evals, weights);
        for s in 0..n {
            self.alpha[s] = self.mi.node[s].exp();
        }
        self.scale_a[0] = Self::rescale(&mut self.alpha[..n]);
        for i in 1..len {
            cache.evaluate_position(seq, i, &mut self.evals);
            self.mi.calc(tm, &self.evals, weights);
            let (prev, cur) = self.alpha[(i - 1) * n..(i + 1) * n].split_at_mut(n);
            cur.fill(0.0);
            for (t, &e) in self.mi.edge.iter().enumerate() {
                cur[tm.target(t)] += prev[tm.source(t)] * e.exp();
            }
            self.scale_a[i] = self.scale_a[i - 1] + Self::rescale(cur);
        }
        self.log_z = self.scale_a[len - 1];

        // beta, seeded with ones at the last position
        self.beta[(len - 1) * n..len * n].fill(1.0);
        self.scale_b[len - 1] = Self::rescale(&mut self.beta[(len - 1) * n..len * n]);
        for i in (0..len - 1).rev() {
            cache.evaluate_position(seq, i + 1, &mut self.evals);
            self.mi.calc(tm, &self.evals, weights);
            let (cur, next) = self.beta[i * n..(i + 2) * n].split_at_mut(n);
            cur.fill(0.0);
            for (t, &e) in self.mi.edge.iter().enumerate() {
                cur[tm.source(t)] += next[tm.target(t)] * e.exp();
            }
            self.scale_b[i] = self.scale_b[i + 1] + Self::rescale(cur);
        }
    }

    /// `log Z` of the last [`Self::run`].
    #[inline(always)]
    #[must_use]
    pub const fn log_partition(&self) -> f64 {
        self.log_z
    }

    /// `log Z` recomputed from alpha and beta at one position.
    ///
    /// Equal (within floating tolerance) at every position; comparing
    /// against [`Self::log_partition`] is the standard consistency check on
    /// the recursions.
    #[must_use]
    pub fn log_partition_at(&self, pos: usize) -> f64 {
        let n = self.n_states;
        let mut sum = 0.0;
        for s in 0..n {
            sum += self.alpha[pos * n + s] * self.beta[pos * n + s];
        }
        sum.ln() + self.scale_a[pos] + self.scale_b[pos]
    }

    /// Posterior probability of being in `state` at `pos`.
    #[inline(always)]
    #[must_use]
    pub fn node_marginal(&self, pos: usize, state: usize) -> f64 {
        let n = self.n_states;
        self.alpha[pos * n + state]
            * self.beta[pos * n + state]
            * (self.scale_a[pos] + self.scale_b[pos] - self.log_z).exp()
    }

    /// Posterior probability of using transition `t` into `pos`.
    ///
    /// `pos` must be at least 1 and `edge_log` the transition's current
    /// edge log-potential.
    #[inline(always)]
    #[must_use]
    pub fn edge_marginal(
        &self,
        tm: &TransitionModel,
        pos: usize,
        t: usize,
        edge_log: f64,
    ) -> f64 {
        let n = self.n_states;
        self.alpha[(pos - 1) * n + tm.source(t)]
            * self.beta[pos * n + tm.target(t)]
            * (edge_log + self.scale_a[pos - 1] + self.scale_b[pos] - self.log_z).exp()
    }

    /// Rescaled alpha mantissa at `(pos, state)`.
    #[inline(always)]
    #[must_use]
    pub fn alpha(&self, pos: usize, state: usize) -> f64 {
        self.alpha[pos * self.n_states + state]
    }

    /// Rescaled beta mantissa at `(pos, state)`.
    #[inline(always)]
    #[must_use]
    pub fn beta(&self, pos: usize, state: usize) -> f64 {
        self.beta[pos * self.n_states + state]
    }

    /// Cumulative log of the alpha scale divisors through `pos`.
    #[inline(always)]
    #[must_use]
    pub fn log_scale_alpha(&self, pos: usize) -> f64 {
        self.scale_a[pos]
    }

    /// Cumulative log of the beta scale divisors through `pos`.
    #[inline(always)]
    #[must_use]
    pub fn log_scale_beta(&self, pos: usize) -> f64 {
        self.scale_b[pos]
    }

    /// Length of the last run sequence.
    #[inline(always)]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` before the first [`Self::run`].
    #[inline(always)]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Log-weight of the training path of `seq`.
    pub fn path_log_score(&mut self, cache: &FeatureCache, seq: usize, weights: &[f64]) -> f64 {
        let tm = cache.transition_model();
        let labels = cache.labels(seq).unwrap();
        let mut score = 0.0;
        for pos in 0..labels.len() {
            cache.evaluate_position(seq, pos, &mut self.evals);
            self.mi.calc(tm, &self.evals, weights);
            if pos == 0 {
                score += self.mi.node[labels[0]];
            } else {
                let t = tm.transition_index(labels[pos - 1], labels[pos]).unwrap();
                score += self.mi.edge[t];
            }
        }
        score
    }

    /// Negative log-likelihood contribution of `seq`; [`Self::run`] must
    /// have been called for the same sequence and weights.
    pub fn loss(&mut self, cache: &FeatureCache, seq: usize, weights: &[f64]) -> f64 {
        self.log_z - self.path_log_score(cache, seq, weights)
    }

    /// Adds the model-expectation term of `seq` to `gradients`.
    ///
    /// The empirical term is the cache's per-feature sums, subtracted once
    /// per batch by the caller.
    ///
    /// # Panics
    ///
    /// Panics when a marginal is NaN or negative or the node marginals of a
    /// position do not sum to 1; these indicate a cache or model-order bug.
    pub fn accumulate_gradient(
        &mut self,
        cache: &FeatureCache,
        seq: usize,
        weights: &[f64],
        gradients: &mut [f64],
    ) {
        let tm = cache.transition_model();
        let n = self.n_states;
        for pos in 0..self.len {
            cache.evaluate_position(seq, pos, &mut self.evals);
            self.mi.calc(tm, &self.evals, weights);
            let mut total = 0.0;
            for s in 0..n {
                let p = self.node_marginal(pos, s);
                assert!(
                    p.is_finite() && p >= -MARGINAL_TOL,
                    "numeric inconsistency: node marginal {p} at position {pos}, state {s}"
                );
                total += p;
                if p > 0.0 {
                    for (fid, value) in self.evals.get(tm.node_potential(s)).pairs() {
                        gradients[fid] += p * value;
                    }
                }
            }
            assert!(
                (total - 1.0).abs() < MARGINAL_TOL,
                "numeric inconsistency: node marginals sum to {total} at position {pos}"
            );
            if pos > 0 {
                for t in 0..tm.n_transitions() {
                    let e = self.mi.edge[t];
                    if e == f64::NEG_INFINITY {
                        continue;
                    }
                    let p = self.edge_marginal(tm, pos, t, e);
                    if p > 0.0 {
                        for (fid, value) in self.evals.get(tm.edge_potential(t)).pairs() {
                            gradients[fid] += p * value;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FeatureCache;
    use crate::feature::{CacheStrategy, FeatureSource};
    use crate::sequence::{Sequence, TrainingSequence};
    use crate::test_utils::{
        brute_force_expectations, brute_force_log_z, three_state_chain_model, two_state_all_paths,
        FnSource,
    };
    use crate::transition::{Legality, State, TransitionModel};

    fn rich_source() -> FnSource {
        let mut src = FnSource::new(CacheStrategy::Sparse, 6);
        src.node = Some(Box::new(|seq, pos, state, sink| {
            sink.push(state as u32, f64::from(seq.get(pos)) * 0.1 + 0.3);
        }));
        src.edge = Some(Box::new(|_, pos, from, to, sink| {
            sink.push(3 + ((from + 2 * to + pos) % 3) as u32, 0.7);
        }));
        src
    }

    fn weights() -> Vec<f64> {
        vec![0.4, -0.2, 0.9, -0.5, 0.3, 0.1]
    }

    #[test]
    fn log_partition_matches_brute_force() {
        let tm = three_state_chain_model();
        let src = rich_source();
        let seqs = vec![TrainingSequence::new(
            Sequence::new(vec![0, 2, 1, 3, 0]),
            vec![0, 0, 1, 2, 2],
        )
        .unwrap()];
        let cache = FeatureCache::for_training(&tm, &[&src as &dyn FeatureSource], &seqs).unwrap();
        let w = weights();
        let mut fb = ForwardBackward::new(&tm, cache.longest());
        fb.run(&cache, 0, &w);
        let expected = brute_force_log_z(&cache, 0, &w);
        assert!((fb.log_partition() - expected).abs() < 1e-9);
    }

    #[test]
    fn log_partition_agrees_at_every_position() {
        let tm = three_state_chain_model();
        let src = rich_source();
        let seqs = vec![TrainingSequence::new(
            Sequence::new(vec![1, 0, 3, 2, 1, 0]),
            vec![0, 1, 2, 2, 2, 2],
        )
        .unwrap()];
        let cache = FeatureCache::for_training(&tm, &[&src as &dyn FeatureSource], &seqs).unwrap();
        let w = weights();
        let mut fb = ForwardBackward::new(&tm, cache.longest());
        fb.run(&cache, 0, &w);
        for pos in 0..6 {
            assert!(
                (fb.log_partition_at(pos) - fb.log_partition()).abs() < 1e-9,
                "position {pos}"
            );
        }
    }

    #[test]
    fn marginals_are_consistent() {
        let tm = three_state_chain_model();
        let src = rich_source();
        let seqs = vec![TrainingSequence::new(
            Sequence::new(vec![0, 1, 2, 3]),
            vec![0, 1, 2, 2],
        )
        .unwrap()];
        let cache = FeatureCache::for_training(&tm, &[&src as &dyn FeatureSource], &seqs).unwrap();
        let w = weights();
        let mut fb = ForwardBackward::new(&tm, cache.longest());
        fb.run(&cache, 0, &w);

        let mut evals = PositionEvaluations::new(&tm);
        let mut mi = Mi::new(&tm);
        for pos in 0..4 {
            let total: f64 = (0..3).map(|s| fb.node_marginal(pos, s)).sum();
            assert!((total - 1.0).abs() < 1e-9, "position {pos}: {total}");
            if pos > 0 {
                cache.evaluate_position(0, pos, &mut evals);
                mi.calc(&tm, &evals, &w);
                for s in 0..3 {
                    let into: f64 = tm
                        .in_edges(s)
                        .map(|t| fb.edge_marginal(&tm, pos, t, mi.edge[t]))
                        .sum();
                    assert!(
                        (into - fb.node_marginal(pos, s)).abs() < 1e-9,
                        "position {pos}, state {s}"
                    );
                }
            }
        }
    }

    #[test]
    fn gradient_matches_brute_force() {
        let tm = three_state_chain_model();
        let src = rich_source();
        let seqs = vec![TrainingSequence::new(
            Sequence::new(vec![2, 0, 1, 3, 1]),
            vec![0, 1, 1, 2, 2],
        )
        .unwrap()];
        let cache = FeatureCache::for_training(&tm, &[&src as &dyn FeatureSource], &seqs).unwrap();
        let w = weights();
        let mut fb = ForwardBackward::new(&tm, cache.longest());
        fb.run(&cache, 0, &w);
        let mut grad = vec![0.0; 6];
        fb.accumulate_gradient(&cache, 0, &w, &mut grad);
        let (_, expected) = brute_force_expectations(&cache, 0, &w, 6);
        for (g, e) in grad.iter().zip(&expected) {
            assert!((g - e).abs() < 1e-5, "{grad:?} vs {expected:?}");
        }
    }

    // Two states, a single edge-only feature on the 0 -> 0 transition, the
    // 1 -> 1 transition illegal, all weights zero, truth "00". Three paths
    // survive, so the log-likelihood is log(1/3) = log(0.5 * 2/3).
    #[test]
    fn two_state_edge_only_reference_values() {
        let legal = vec![vec![true, true], vec![true, false]];
        let tm = TransitionModel::new(
            vec![State::new("0"), State::new("1")],
            &Legality::Matrix(legal),
        )
        .unwrap();
        let mut src = FnSource::new(CacheStrategy::Constant, 1);
        src.edge = Some(Box::new(|_, _, from, to, sink| {
            if from == 0 && to == 0 {
                sink.push(0, 1.0);
            }
        }));
        let seqs =
            vec![TrainingSequence::new(Sequence::new(vec![b'0'; 2]), vec![0, 0]).unwrap()];
        let cache = FeatureCache::for_training(&tm, &[&src as &dyn FeatureSource], &seqs).unwrap();
        let w = [0.0];
        let mut fb = ForwardBackward::new(&tm, cache.longest());
        fb.run(&cache, 0, &w);

        let objective = -fb.loss(&cache, 0, &w);
        assert!((objective - (0.5f64 * 2.0 / 3.0).ln()).abs() < 1e-12);

        let mut grad = vec![0.0; 1];
        fb.accumulate_gradient(&cache, 0, &w, &mut grad);
        grad[0] -= cache.empirical()[0];
        // expectation 1/3 minus one empirical occurrence
        assert!((grad[0] - (1.0 / 3.0 - 1.0)).abs() < 1e-12);

        let (brute_z, brute_exp) = brute_force_expectations(&cache, 0, &w, 1);
        assert!((fb.log_partition() - brute_z).abs() < 1e-12);
        assert!((grad[0] - (brute_exp[0] - 1.0)).abs() < 1e-12);
    }

    #[test]
    fn rescaling_survives_long_sequences_with_large_potentials() {
        let tm = two_state_all_paths();
        let mut src = FnSource::new(CacheStrategy::Sparse, 2);
        src.node = Some(Box::new(|_, _, state, sink| {
            sink.push(state as u32, 1.0);
        }));
        let len = 400;
        let seqs = vec![TrainingSequence::new(
            Sequence::new(vec![0; len]),
            vec![0; len],
        )
        .unwrap()];
        let cache = FeatureCache::for_training(&tm, &[&src as &dyn FeatureSource], &seqs).unwrap();
        // Without rescaling, exp(40) per position overflows after ~18
        // positions.
        let w = [40.0, 39.0];
        let mut fb = ForwardBackward::new(&tm, cache.longest());
        fb.run(&cache, 0, &w);
        assert!(fb.log_partition().is_finite());
        assert!(fb.log_partition() > 40.0 * len as f64 * 0.9);
        let total: f64 = (0..2).map(|s| fb.node_marginal(200, s)).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }
}
