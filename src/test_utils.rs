use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::cache::{FeatureCache, PositionEvaluations, SegmentEvaluations};
use crate::feature::{CacheStrategy, FeatureSink, FeatureSource};
use crate::math::logsumexp;
use crate::sequence::Sequence;
use crate::transition::{Legality, State, TransitionModel};

/// A table-free feature group driven by closures; whatever a test needs.
pub struct FnSource {
    pub strategy: CacheStrategy,
    pub n_features: usize,
    pub node: Option<Box<dyn Fn(&Sequence, usize, usize, &mut FeatureSink)>>,
    pub edge: Option<Box<dyn Fn(&Sequence, usize, usize, usize, &mut FeatureSink)>>,
    pub lens: Option<Box<dyn Fn(usize, usize, &mut FeatureSink)>>,
}

impl FnSource {
    pub fn new(strategy: CacheStrategy, n_features: usize) -> Self {
        Self {
            strategy,
            n_features,
            node: None,
            edge: None,
            lens: None,
        }
    }
}

impl FeatureSource for FnSource {
    fn strategy(&self) -> CacheStrategy {
        self.strategy
    }

    fn n_features(&self) -> usize {
        self.n_features
    }

    fn node_features(&self, seq: &Sequence, pos: usize, state: usize, sink: &mut FeatureSink) {
        if let Some(f) = &self.node {
            f(seq, pos, state, sink);
        }
    }

    fn edge_features(
        &self,
        seq: &Sequence,
        pos: usize,
        source: usize,
        target: usize,
        sink: &mut FeatureSink,
    ) {
        if let Some(f) = &self.edge {
            f(seq, pos, source, target, sink);
        }
    }

    fn length_features(&self, state: usize, length: usize, sink: &mut FeatureSink) {
        if let Some(f) = &self.lens {
            f(state, length, sink);
        }
    }
}

pub fn two_state_all_paths() -> TransitionModel {
    TransitionModel::new(
        vec![State::new("a"), State::new("b")],
        &Legality::AllPaths,
    )
    .unwrap()
}

/// Three plain states: 0 -> {0, 1}, 1 -> {1, 2}, 2 -> {2}.
pub fn three_state_chain_model() -> TransitionModel {
    let legal = vec![
        vec![true, true, false],
        vec![false, true, true],
        vec![false, false, true],
    ];
    TransitionModel::new(
        vec![State::new("head"), State::new("body"), State::new("tail")],
        &Legality::Matrix(legal),
    )
    .unwrap()
}

/// A duration-bounded state (segments of 1 to 3 positions) next to a plain
/// background state, everything legal.
pub fn duration_model() -> TransitionModel {
    TransitionModel::new(
        vec![
            State::with_duration("seg", 1, 3).unwrap(),
            State::new("bg"),
        ],
        &Legality::AllPaths,
    )
    .unwrap()
}

/// Log-weight and per-feature counts of one per-position labeling, or `None`
/// if the labeling is illegal under the model, the cache's invalidity
/// bitmap, or the duration bounds.
pub fn path_features(
    cache: &FeatureCache,
    seq: usize,
    weights: &[f64],
    path: &[usize],
    n_features: usize,
) -> Option<(f64, Vec<f64>)> {
    let tm = cache.transition_model();
    let mut evals = PositionEvaluations::new(tm);
    let mut seg_evals = SegmentEvaluations::new(tm);
    let mut logw = 0.0;
    let mut feats = vec![0.0; n_features];

    for (pos, &s) in path.iter().enumerate() {
        cache.evaluate_position(seq, pos, &mut evals);
        let node = evals.get(tm.node_potential(s));
        if node.is_invalid() {
            return None;
        }
        for (fid, value) in node.pairs() {
            logw += weights[fid] * value;
            if fid < feats.len() {
                feats[fid] += value;
            }
        }
        if pos > 0 {
            let t = tm.transition_index(path[pos - 1], s)?;
            let edge = evals.get(tm.edge_potential(t));
            if edge.is_invalid() {
                return None;
            }
            for (fid, value) in edge.pairs() {
                logw += weights[fid] * value;
                if fid < feats.len() {
                    feats[fid] += value;
                }
            }
        }
    }

    // segment runs of duration-bounded states
    let mut run_start = 0;
    for pos in 1..=path.len() {
        if pos == path.len() || path[pos] != path[run_start] {
            let s = path[run_start];
            let state = tm.state(s);
            if state.allows_self_loop() {
                let d = pos - run_start;
                if d < state.min_length() || d > state.max_length() {
                    return None;
                }
                cache.evaluate_segments_ending_at(seq, pos - 1, &mut seg_evals);
                let eval = seg_evals.get(s, d);
                if eval.is_invalid() {
                    return None;
                }
                for (fid, value) in eval.pairs() {
                    logw += weights[fid] * value;
                    if fid < feats.len() {
                        feats[fid] += value;
                    }
                }
            }
            run_start = pos;
        }
    }
    Some((logw, feats))
}

fn for_each_path<F>(n_states: usize, len: usize, mut f: F)
where
    F: FnMut(&[usize]),
{
    let mut path = vec![0usize; len];
    loop {
        f(&path);
        let mut pos = len;
        loop {
            if pos == 0 {
                return;
            }
            pos -= 1;
            path[pos] += 1;
            if path[pos] < n_states {
                break;
            }
            path[pos] = 0;
        }
    }
}

/// `log Z` by full path enumeration.
pub fn brute_force_log_z(cache: &FeatureCache, seq: usize, weights: &[f64]) -> f64 {
    let tm = cache.transition_model();
    let len = cache.sequence(seq).len();
    let mut log_z = f64::NEG_INFINITY;
    for_each_path(tm.n_states(), len, |path| {
        if let Some((logw, _)) = path_features(cache, seq, weights, path, 0) {
            log_z = logsumexp(log_z, logw);
        }
    });
    log_z
}

/// `(log Z, per-feature model expectations)` by full path enumeration.
pub fn brute_force_expectations(
    cache: &FeatureCache,
    seq: usize,
    weights: &[f64],
    n_features: usize,
) -> (f64, Vec<f64>) {
    let log_z = brute_force_log_z(cache, seq, weights);
    let tm = cache.transition_model();
    let len = cache.sequence(seq).len();
    let mut expectations = vec![0.0; n_features];
    for_each_path(tm.n_states(), len, |path| {
        if let Some((logw, feats)) = path_features(cache, seq, weights, path, n_features) {
            let p = (logw - log_z).exp();
            for (e, f) in expectations.iter_mut().zip(&feats) {
                *e += p * f;
            }
        }
    });
    (log_z, expectations)
}

/// Expected number of positions matching the training labels, by full path
/// enumeration.
pub fn brute_force_expected_matches(cache: &FeatureCache, seq: usize, weights: &[f64]) -> f64 {
    let log_z = brute_force_log_z(cache, seq, weights);
    let tm = cache.transition_model();
    let labels = cache.labels(seq).unwrap();
    let len = cache.sequence(seq).len();
    let mut expected = 0.0;
    for_each_path(tm.n_states(), len, |path| {
        if let Some((logw, _)) = path_features(cache, seq, weights, path, 0) {
            let matches = path
                .iter()
                .zip(labels)
                .filter(|(a, b)| a == b)
                .count();
            expected += (logw - log_z).exp() * matches as f64;
        }
    });
    expected
}

/// Highest-scoring labeling and its score, by full path enumeration.
pub fn brute_force_best_path(
    cache: &FeatureCache,
    seq: usize,
    weights: &[f64],
) -> (Vec<usize>, f64) {
    let tm = cache.transition_model();
    let len = cache.sequence(seq).len();
    let mut best = f64::NEG_INFINITY;
    let mut best_path = vec![0; len];
    for_each_path(tm.n_states(), len, |path| {
        if let Some((logw, _)) = path_features(cache, seq, weights, path, 0) {
            if logw > best {
                best = logw;
                best_path.copy_from_slice(path);
            }
        }
    });
    (best_path, best)
}
