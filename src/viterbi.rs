use alloc::vec::Vec;

use crate::cache::{FeatureCache, PositionEvaluations, SegmentEvaluations};
use crate::errors::{Result, SemiCrfError};
use crate::potential::Mi;
use crate::ring::LookbackRing;

/// A decoded labeling: the best hidden-state path and the final best score
/// per state. Owned by the caller.
#[derive(Clone, Debug, PartialEq)]
pub struct InferenceResult {
    /// Best state per position.
    pub path: Vec<usize>,

    /// Best score per state at the last position (`-inf` for unreachable
    /// states).
    pub final_scores: Vec<f64>,
}

/// Sentinel for "no predecessor" back pointers.
const NO_PREV: i32 = -1;

/// Best-path decode of a plain Markov model.
///
/// Ties are broken by enumeration order: the first maximum encountered in
/// model order wins. The specific winner is not a semantic guarantee.
pub(crate) fn decode_markov(
    cache: &FeatureCache,
    seq: usize,
    weights: &[f64],
) -> Result<InferenceResult> {
    let tm = cache.transition_model();
    let n = tm.n_states();
    let len = cache.sequence(seq).len();
    let mut score = vec![f64::NEG_INFINITY; len * n];
    let mut bp = vec![NO_PREV; len * n];
    let mut evals = PositionEvaluations::new(tm);
    let mut mi = Mi::new(tm);

    cache.evaluate_position(seq, 0, &mut evals);
    mi.calc(tm, &evals, weights);
    score[..n].copy_from_slice(&mi.node);
    for i in 1..len {
        cache.evaluate_position(seq, i, &mut evals);
        mi.calc(tm, &evals, weights);
        for s in 0..n {
            let mut best = f64::NEG_INFINITY;
            let mut best_prev = NO_PREV;
            for t in tm.in_edges(s) {
                let prev = score[(i - 1) * n + tm.source(t)];
                if prev == f64::NEG_INFINITY {
                    continue;
                }
                let cand = prev + mi.edge[t];
                if cand > best {
                    best = cand;
                    best_prev = i32::try_from(tm.source(t)).unwrap();
                }
            }
            score[i * n + s] = best;
            bp[i * n + s] = best_prev;
        }
    }

    let last = &score[(len - 1) * n..];
    let mut best_state = 0;
    for s in 1..n {
        if last[s] > last[best_state] {
            best_state = s;
        }
    }
    if last[best_state] == f64::NEG_INFINITY {
        return Err(SemiCrfError::no_valid_paths(len - 1));
    }

    let mut path = vec![0; len];
    let mut s = best_state;
    for i in (0..len).rev() {
        path[i] = s;
        if i > 0 {
            s = usize::try_from(bp[i * n + s])
                .map_err(|_| SemiCrfError::no_valid_paths(i))?;
        }
    }
    Ok(InferenceResult {
        path,
        final_scores: last.to_vec(),
    })
}

/// Best-path decode with explicit segment durations.
///
/// A duration-bounded state's score at a position maximizes over every
/// feasible segment length ending there; back pointers additionally record
/// the chosen length so backtracking fills whole segments. A segment
/// occupying the sequence start has no predecessor and scores from the
/// start-potential vector instead of a transition.
pub(crate) fn decode_semi_markov(
    cache: &FeatureCache,
    seq: usize,
    weights: &[f64],
) -> Result<InferenceResult> {
    let tm = cache.transition_model();
    let n = tm.n_states();
    let len = cache.sequence(seq).len();
    let mut score = vec![f64::NEG_INFINITY; len * n];
    let mut bp_state = vec![NO_PREV; len * n];
    let mut bp_len = vec![1u32; len * n];
    let mut cum_stable = vec![0.0; len * n];
    let mut valid_run = vec![0u32; len * n];
    let mut evals = PositionEvaluations::new(tm);
    let mut seg_evals = SegmentEvaluations::new(tm);
    let mut ring = LookbackRing::new(tm.max_lookback() + 2, || Mi::new(tm));

    for i in 0..len {
        cache.evaluate_position(seq, i, &mut evals);
        cache.evaluate_segments_ending_at(seq, i, &mut seg_evals);
        let mi = ring.advance();
        mi.calc(tm, &evals, weights);
        for s in 0..n {
            let e = tm.self_edge(s).map_or(f64::NEG_INFINITY, |t| mi.edge[t]);
            let (prev_sum, prev_run) = if i > 0 {
                (cum_stable[(i - 1) * n + s], valid_run[(i - 1) * n + s])
            } else {
                (0.0, 0)
            };
            if e == f64::NEG_INFINITY {
                cum_stable[i * n + s] = 0.0;
                valid_run[i * n + s] = 0;
            } else {
                cum_stable[i * n + s] = prev_sum + e;
                valid_run[i * n + s] = prev_run + 1;
            }
        }

        for s in 0..n {
            let state = tm.state(s);
            if !state.allows_self_loop() {
                if i == 0 {
                    score[s] = ring.get(0).node[s];
                    continue;
                }
                let mut best = f64::NEG_INFINITY;
                let mut best_prev = NO_PREV;
                for t in tm.in_edges(s) {
                    let prev = score[(i - 1) * n + tm.source(t)];
                    if prev == f64::NEG_INFINITY {
                        continue;
                    }
                    let cand = prev + ring.get(0).edge[t];
                    if cand > best {
                        best = cand;
                        best_prev = i32::try_from(tm.source(t)).unwrap();
                    }
                }
                score[i * n + s] = best;
                bp_state[i * n + s] = best_prev;
                continue;
            }

            let run = valid_run[i * n + s] as usize;
            let mut best = f64::NEG_INFINITY;
            let mut best_prev = NO_PREV;
            let mut best_len = 1u32;
            let max_d = state.max_length().min(i + 1);
            for d in state.min_length()..=max_d {
                if d > run + 1 {
                    break;
                }
                let lf_eval = seg_evals.get(s, d);
                if lf_eval.is_invalid() {
                    continue;
                }
                let mut lf = 0.0;
                for (fid, value) in lf_eval.pairs() {
                    lf += weights[fid] * value;
                }
                let stable = cum_stable[i * n + s] - cum_stable[(i + 1 - d) * n + s];
                if d == i + 1 {
                    let cand = ring.get(d - 1).node[s] + stable + lf;
                    if cand > best {
                        best = cand;
                        best_prev = NO_PREV;
                        best_len = d as u32;
                    }
                } else {
                    let p0 = i + 1 - d;
                    let entry = ring.get(d - 1);
                    for t in tm.in_edges(s) {
                        let src = tm.source(t);
                        if src == s {
                            continue;
                        }
                        let prev = score[(p0 - 1) * n + src];
                        if prev == f64::NEG_INFINITY {
                            continue;
                        }
                        let cand = prev + entry.edge[t] + stable + lf;
                        if cand > best {
                            best = cand;
                            best_prev = i32::try_from(src).unwrap();
                            best_len = d as u32;
                        }
                    }
                }
            }
            score[i * n + s] = best;
            bp_state[i * n + s] = best_prev;
            bp_len[i * n + s] = best_len;
        }
    }

    let last = &score[(len - 1) * n..];
    let mut best_state = 0;
    for s in 1..n {
        if last[s] > last[best_state] {
            best_state = s;
        }
    }
    if last[best_state] == f64::NEG_INFINITY {
        return Err(SemiCrfError::no_valid_paths(len - 1));
    }

    let mut path = vec![0; len];
    let mut i = len - 1;
    let mut s = best_state;
    loop {
        let d = bp_len[i * n + s] as usize;
        for p in (i + 1 - d)..=i {
            path[p] = s;
        }
        let prev = bp_state[i * n + s];
        if prev < 0 {
            // either a whole-prefix segment or the first position
            break;
        }
        i -= d;
        s = usize::try_from(prev).unwrap();
    }
    Ok(InferenceResult {
        path,
        final_scores: last.to_vec(),
    })
}
