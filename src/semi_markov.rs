use alloc::vec::Vec;

use crate::cache::{FeatureCache, PositionEvaluations, SegmentEvaluations};
use crate::math::{band_ln, band_scale, BAND_LIMIT, NORM_FACTOR};
use crate::potential::Mi;
use crate::ring::LookbackRing;
use crate::transition::TransitionModel;

const MARGINAL_TOL: f64 = 1e-6;

/// Arena and recursions of the semi-Markov (explicit segment duration)
/// forward-backward pass.
///
/// Duration-1 states update exactly as in the plain Markov pass; a
/// duration-bounded state's alpha and beta sum over every feasible segment
/// length ending or starting at the current position. The per-position
/// transition matrices of the lookback window live in a fixed-size ring;
/// the cumulative same-state ("stable") sums and valid-run counters are flat
/// per-position arrays, produced once on the forward sweep and consumed by
/// every later lookback.
///
/// Unlike the fixed-duration pass, a long lookback can jump the magnitude by
/// many rescaling steps at once, so alpha and beta carry an integer
/// normalization band: the true value is `mantissa * exp(NORM_FACTOR *
/// band)`, and a vector is promoted to the larger band before terms from
/// different bands are combined.
#[derive(Debug)]
pub struct SemiMarkovForwardBackward {
    n_states: usize,
    len: usize,
    alpha: Vec<f64>,
    a_band: Vec<i32>,
    beta: Vec<f64>,
    b_band: Vec<i32>,
    cum_stable: Vec<f64>,
    valid_run: Vec<u32>,
    occ_node: Vec<f64>,
    occ_self: Vec<f64>,
    lf_marg: Vec<f64>,
    dur_states: Vec<usize>,
    dur_row: Vec<i32>,
    log_z: f64,
    ring: LookbackRing<Mi>,
    eval_ring: LookbackRing<PositionEvaluations>,
    seg_ring: LookbackRing<SegmentEvaluations>,
    evals: PositionEvaluations,
    seg_evals: SegmentEvaluations,
    mi: Mi,
}

impl SemiMarkovForwardBackward {
    /// Creates an arena for sequences up to `max_len` positions.
    #[must_use]
    pub fn new(tm: &TransitionModel, max_len: usize) -> Self {
        let n = tm.n_states();
        let dur_states = tm.duration_states();
        let mut dur_row = vec![-1i32; n];
        for (row, &s) in dur_states.iter().enumerate() {
            dur_row[s] = i32::try_from(row).unwrap();
        }
        let capacity = tm.max_lookback() + 2;
        Self {
            n_states: n,
            len: 0,
            alpha: vec![0.0; max_len * n],
            a_band: vec![0; max_len],
            beta: vec![0.0; max_len * n],
            b_band: vec![0; max_len],
            cum_stable: vec![0.0; max_len * n],
            valid_run: vec![0; max_len * n],
            occ_node: vec![0.0; (max_len + 1) * n],
            occ_self: vec![0.0; (max_len + 1) * n],
            lf_marg: vec![0.0; dur_states.len() * tm.max_lookback()],
            dur_states,
            dur_row,
            log_z: f64::NEG_INFINITY,
            ring: LookbackRing::new(capacity, || Mi::new(tm)),
            eval_ring: LookbackRing::new(capacity, || PositionEvaluations::new(tm)),
            seg_ring: LookbackRing::new(capacity, || SegmentEvaluations::new(tm)),
            evals: PositionEvaluations::new(tm),
            seg_evals: SegmentEvaluations::new(tm),
            mi: Mi::new(tm),
        }
    }

    /// Adds `exp(lambda)` into `acc[idx]`, promoting the whole accumulator
    /// to a larger band first when the term would overflow the current one.
    #[inline(always)]
    fn add_banded(acc: &mut [f64], band: &mut i32, idx: usize, lambda: f64) {
        if lambda == f64::NEG_INFINITY {
            return;
        }
        let mut e = lambda - NORM_FACTOR * f64::from(*band);
        if e > NORM_FACTOR {
            let target = (lambda / NORM_FACTOR).floor() as i32;
            let shrink = band_scale(*band, target);
            for x in acc.iter_mut() {
                *x *= shrink;
            }
            *band = target;
            e = lambda - NORM_FACTOR * f64::from(target);
        }
        acc[idx] += e.exp();
    }

    /// Brings the finished vector's largest mantissa back inside the band.
    fn settle_band(row: &mut [f64], band: &mut i32) {
        let mut max = 0.0f64;
        for &x in row.iter() {
            if x > max {
                max = x;
            }
        }
        if max == 0.0 {
            return;
        }
        while max >= BAND_LIMIT {
            for x in row.iter_mut() {
                *x /= BAND_LIMIT;
            }
            *band += 1;
            max /= BAND_LIMIT;
        }
        while max < 1.0 / BAND_LIMIT {
            for x in row.iter_mut() {
                *x *= BAND_LIMIT;
            }
            *band -= 1;
            max *= BAND_LIMIT;
        }
    }

    /// Weighted sum of a segment evaluation, or `-inf` if infeasible.
    #[inline(always)]
    fn length_score(
        seg_evals: &SegmentEvaluations,
        s: usize,
        d: usize,
        weights: &[f64],
    ) -> f64 {
        let eval = seg_evals.get(s, d);
        if eval.is_invalid() {
            return f64::NEG_INFINITY;
        }
        let mut w = 0.0;
        for (fid, value) in eval.pairs() {
            w += weights[fid] * value;
        }
        w
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
            self.a_band.resize(len, 0);
            self.b_band.resize(len, 0);
            self.cum_stable.resize(len * n, 0.0);
            self.valid_run.resize(len * n, 0);
            self.occ_node.resize((len + 1) * n, 0.0);
            self.occ_self.resize((len + 1) * n, 0.0);
        }

        // forward
        self.ring.clear();
        for i in 0..len {
            cache.evaluate_position(seq, i, &mut self.evals);
            cache.evaluate_segments_ending_at(seq, i, &mut self.seg_evals);
            let mi = self.ring.advance();
            mi.calc(tm, &self.evals, weights);

            // advance the stable sums and valid-run counters
            for s in 0..n {
                let e = tm
                    .self_edge(s)
                    .map_or(f64::NEG_INFINITY, |t| mi.edge[t]);
                let (prev_sum, prev_run) = if i > 0 {
                    (
                        self.cum_stable[(i - 1) * n + s],
                        self.valid_run[(i - 1) * n + s],
                    )
                } else {
                    (0.0, 0)
                };
                if e == f64::NEG_INFINITY {
                    self.cum_stable[i * n + s] = 0.0;
                    self.valid_run[i * n + s] = 0;
                } else {
                    self.cum_stable[i * n + s] = prev_sum + e;
                    self.valid_run[i * n + s] = prev_run + 1;
                }
            }

            let (past, rest) = self.alpha.split_at_mut(i * n);
            let cur = &mut rest[..n];
            cur.fill(0.0);
            let mut band = if i > 0 { self.a_band[i - 1] } else { 0 };

            for s in 0..n {
                let state = tm.state(s);
                if !state.allows_self_loop() {
                    // duration-1 update, exactly as the fixed-duration pass
                    let lambda = if i == 0 {
                        self.ring.get(0).node[s]
                    } else {
                        let mut inner = 0.0;
                        for t in tm.in_edges(s) {
                            inner += past[(i - 1) * n + tm.source(t)]
                                * self.ring.get(0).edge[t].exp();
                        }
                        if inner > 0.0 {
                            inner.ln() + NORM_FACTOR * f64::from(self.a_band[i - 1])
                        } else {
                            f64::NEG_INFINITY
                        }
                    };
                    Self::add_banded(cur, &mut band, s, lambda);
                    continue;
                }

                let run = self.valid_run[i * n + s] as usize;
                let max_d = state.max_length().min(i + 1);
                for d in state.min_length()..=max_d {
                    if d > run + 1 {
                        break;
                    }
                    let lf = Self::length_score(&self.seg_evals, s, d, weights);
                    if lf == f64::NEG_INFINITY {
                        continue;
                    }
                    let stable =
                        self.cum_stable[i * n + s] - self.cum_stable[(i + 1 - d) * n + s];
                    let lambda = if d == i + 1 {
                        // segment starts at position 0: start potential, no
                        // transition
                        let node0 = self.ring.get(d - 1).node[s];
                        node0 + stable + lf
                    } else {
                        let entry_mi = self.ring.get(d - 1);
                        let p0 = i + 1 - d;
                        let mut inner = 0.0;
                        for t in tm.in_edges(s) {
                            let src = tm.source(t);
                            if src == s {
                                continue;
                            }
                            inner += past[(p0 - 1) * n + src] * entry_mi.edge[t].exp();
                        }
                        if inner > 0.0 {
                            inner.ln()
                                + NORM_FACTOR * f64::from(self.a_band[p0 - 1])
                                + stable
                                + lf
                        } else {
                            f64::NEG_INFINITY
                        }
                    };
                    Self::add_banded(cur, &mut band, s, lambda);
                }
            }
            Self::settle_band(cur, &mut band);
            self.a_band[i] = band;
        }
        let alpha_total: f64 = self.alpha[(len - 1) * n..len * n].iter().sum();
        self.log_z = band_ln(alpha_total, self.a_band[len - 1]);

        // backward
        self.beta[(len - 1) * n..len * n].fill(1.0);
        self.b_band[len - 1] = 0;
        self.seg_ring.clear();
        for i in (0..len - 1).rev() {
            cache.evaluate_position(seq, i + 1, &mut self.evals);
            self.mi.calc(tm, &self.evals, weights);
            let se = self.seg_ring.advance();
            cache.evaluate_segments_ending_at(seq, i + 1, se);

            let (past, rest) = self.beta.split_at_mut((i + 1) * n);
            let cur = &mut past[i * n..];
            cur.fill(0.0);
            let mut band = self.b_band[i + 1];

            for s2 in 0..n {
                let state = tm.state(s2);
                if !state.allows_self_loop() {
                    // duration-1 successor
                    let tail = rest[s2];
                    if tail > 0.0 {
                        let base = tail.ln() + NORM_FACTOR * f64::from(self.b_band[i + 1]);
                        for t in tm.in_edges(s2) {
                            let e = self.mi.edge[t];
                            Self::add_banded(cur, &mut band, tm.source(t), base + e);
                        }
                    }
                    continue;
                }

                let max_d = state.max_length().min(len - 1 - i);
                for d in state.min_length()..=max_d {
                    let j = i + d;
                    if d > self.valid_run[j * n + s2] as usize + 1 {
                        break;
                    }
                    let lf =
                        Self::length_score(self.seg_ring.get(d - 1), s2, d, weights);
                    if lf == f64::NEG_INFINITY {
                        continue;
                    }
                    let tail = rest[(j - i - 1) * n + s2];
                    if tail == 0.0 {
                        continue;
                    }
                    let stable =
                        self.cum_stable[j * n + s2] - self.cum_stable[(i + 1) * n + s2];
                    let base = tail.ln()
                        + NORM_FACTOR * f64::from(self.b_band[j])
                        + stable
                        + lf;
                    for t in tm.in_edges(s2) {
                        let src = tm.source(t);
                        if src == s2 {
                            continue;
                        }
                        Self::add_banded(cur, &mut band, src, base + self.mi.edge[t]);
                    }
                }
            }
            Self::settle_band(cur, &mut band);
            self.b_band[i] = band;
        }
    }

    /// `log Z` of the last [`Self::run`].
    #[inline(always)]
    #[must_use]
    pub const fn log_partition(&self) -> f64 {
        self.log_z
    }

    /// Log-weight of the training path of `seq`, including the explicit
    /// length features of each duration-bounded segment.
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
        let mut run_start = 0;
        for pos in 1..=labels.len() {
            if pos == labels.len() || labels[pos] != labels[run_start] {
                let s = labels[run_start];
                if tm.state(s).allows_self_loop() {
                    if let Some(pairs) = cache.length_pairs(s, pos - run_start) {
                        for &(fid, value) in pairs {
                            score += weights[fid as usize] * value;
                        }
                    }
                }
                run_start = pos;
            }
        }
        score
    }

    /// Negative log-likelihood contribution of `seq`; [`Self::run`] must
    /// have been called for the same sequence and weights.
    pub fn loss(&mut self, cache: &FeatureCache, seq: usize, weights: &[f64]) -> f64 {
        self.log_z - self.path_log_score(cache, seq, weights)
    }

    #[inline(always)]
    fn banded(&self, mantissa: f64, band: i32, extra: f64) -> f64 {
        (band_ln(mantissa, band) + extra - self.log_z).exp()
    }

    /// Adds the model-expectation term of `seq` to `gradients`.
    ///
    /// Segment probabilities are distributed three ways: to the entry edge's
    /// own features at the segment start, to the explicit length features of
    /// the (state, length) pair, and to per-position node and self-edge
    /// occupancy accumulated through difference arrays and swept once at the
    /// end.
    ///
    /// # Panics
    ///
    /// Panics when the per-position state occupancies fail to sum to 1;
    /// that indicates a cache or model-order bug.
    pub fn accumulate_gradient(
        &mut self,
        cache: &FeatureCache,
        seq: usize,
        weights: &[f64],
        gradients: &mut [f64],
    ) {
        let tm = cache.transition_model();
        let n = self.n_states;
        let len = self.len;
        self.occ_node[..(len + 1) * n].fill(0.0);
        self.occ_self[..(len + 1) * n].fill(0.0);
        self.lf_marg.fill(0.0);
        self.ring.clear();
        self.eval_ring.clear();

        for i in 0..len {
            {
                let ev = self.eval_ring.advance();
                cache.evaluate_position(seq, i, ev);
            }
            {
                let mi = self.ring.advance();
                mi.calc(tm, self.eval_ring.get(0), weights);
            }
            cache.evaluate_segments_ending_at(seq, i, &mut self.seg_evals);

            for s in 0..n {
                let state = tm.state(s);
                if !state.allows_self_loop() {
                    // occupancy of a duration-1 state is its boundary
                    // marginal
                    let p = self.banded(
                        self.alpha[i * n + s] * self.beta[i * n + s],
                        self.a_band[i] + self.b_band[i],
                        0.0,
                    );
                    self.occ_node[i * n + s] += p;
                    self.occ_node[(i + 1) * n + s] -= p;
                    if i > 0 {
                        for t in tm.in_edges(s) {
                            let e = self.ring.get(0).edge[t];
                            if e == f64::NEG_INFINITY {
                                continue;
                            }
                            let pe = self.banded(
                                self.alpha[(i - 1) * n + tm.source(t)]
                                    * self.beta[i * n + s],
                                self.a_band[i - 1] + self.b_band[i],
                                e,
                            );
                            if pe > 0.0 {
                                for (fid, value) in
                                    self.eval_ring.get(0).get(tm.edge_potential(t)).pairs()
                                {
                                    gradients[fid] += pe * value;
                                }
                            }
                        }
                    }
                    continue;
                }

                let run = self.valid_run[i * n + s] as usize;
                let row = usize::try_from(self.dur_row[s]).unwrap();
                let beta_here = self.beta[i * n + s];
                if beta_here == 0.0 {
                    continue;
                }
                let max_d = state.max_length().min(i + 1);
                for d in state.min_length()..=max_d {
                    if d > run + 1 {
                        break;
                    }
                    let lf = Self::length_score(&self.seg_evals, s, d, weights);
                    if lf == f64::NEG_INFINITY {
                        continue;
                    }
                    let stable =
                        self.cum_stable[i * n + s] - self.cum_stable[(i + 1 - d) * n + s];
                    let tail = band_ln(beta_here, self.b_band[i]) + stable + lf - self.log_z;
                    let mut p_seg = 0.0;
                    if d == i + 1 {
                        let node0 = self.ring.get(d - 1).node[s];
                        if node0 != f64::NEG_INFINITY {
                            p_seg = (node0 + tail).exp();
                        }
                    } else {
                        let p0 = i + 1 - d;
                        for t in tm.in_edges(s) {
                            let src = tm.source(t);
                            if src == s {
                                continue;
                            }
                            let e = self.ring.get(d - 1).edge[t];
                            if e == f64::NEG_INFINITY {
                                continue;
                            }
                            let pq = (band_ln(
                                self.alpha[(p0 - 1) * n + src],
                                self.a_band[p0 - 1],
                            ) + e
                                + tail)
                                .exp();
                            if pq > 0.0 {
                                for (fid, value) in self
                                    .eval_ring
                                    .get(d - 1)
                                    .get(tm.edge_potential(t))
                                    .pairs()
                                {
                                    gradients[fid] += pq * value;
                                }
                                p_seg += pq;
                            }
                        }
                    }
                    if p_seg > 0.0 {
                        let p0 = i + 1 - d;
                        self.occ_node[p0 * n + s] += p_seg;
                        self.occ_node[(i + 1) * n + s] -= p_seg;
                        self.occ_self[(p0 + 1) * n + s] += p_seg;
                        self.occ_self[(i + 1) * n + s] -= p_seg;
                        self.lf_marg[row * tm.max_lookback() + (d - 1)] += p_seg;
                    }
                }
            }
        }

        // prefix-sum the difference arrays, then sweep node and self-edge
        // features once per position
        for i in 0..len {
            let mut total = 0.0;
            cache.evaluate_position(seq, i, &mut self.evals);
            for s in 0..n {
                if i > 0 {
                    let carry = self.occ_node[(i - 1) * n + s];
                    self.occ_node[i * n + s] += carry;
                    let carry = self.occ_self[(i - 1) * n + s];
                    self.occ_self[i * n + s] += carry;
                }
                let p = self.occ_node[i * n + s];
                assert!(
                    p.is_finite() && p >= -MARGINAL_TOL,
                    "numeric inconsistency: occupancy {p} at position {i}, state {s}"
                );
                total += p;
                if p > 0.0 {
                    for (fid, value) in self.evals.get(tm.node_potential(s)).pairs() {
                        gradients[fid] += p * value;
                    }
                }
                let ps = self.occ_self[i * n + s];
                if ps > 0.0 {
                    let t = tm.self_edge(s).unwrap();
                    for (fid, value) in self.evals.get(tm.edge_potential(t)).pairs() {
                        gradients[fid] += ps * value;
                    }
                }
            }
            assert!(
                (total - 1.0).abs() < MARGINAL_TOL,
                "numeric inconsistency: occupancies sum to {total} at position {i}"
            );
        }

        // explicit length features
        for (row, &s) in self.dur_states.iter().enumerate() {
            let state = tm.state(s);
            for d in state.min_length()..=state.max_length() {
                let m = self.lf_marg[row * tm.max_lookback() + (d - 1)];
                if m > 0.0 {
                    if let Some(pairs) = cache.length_pairs(s, d) {
                        for &(fid, value) in pairs {
                            gradients[fid as usize] += m * value;
                        }
                    }
                }
            }
        }
    }
}
