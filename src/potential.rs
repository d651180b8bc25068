use alloc::vec::Vec;

use crate::cache::PositionEvaluations;
use crate::transition::{Potential, TransitionModel};

/// The weighted log-potentials of one position: one value per state (node)
/// and one per transition (edge, already including its destination's node
/// value).
///
/// Scratch sized once per arena and overwritten each position.
#[derive(Clone, Debug)]
pub struct Mi {
    /// Node log-potential per state.
    pub node: Vec<f64>,

    /// Edge log-potential per transition id.
    pub edge: Vec<f64>,
}

impl Mi {
    /// Creates a scratch sized for the model.
    #[must_use]
    pub fn new(tm: &TransitionModel) -> Self {
        Self {
            node: vec![0.0; tm.n_states()],
            edge: vec![0.0; tm.n_transitions()],
        }
    }

    /// Converts the cached feature values of one position into weighted
    /// log-potentials, in a single pass over model-ordered potentials.
    ///
    /// The model order guarantees each node is visited immediately before
    /// the edges entering it, so one running node value suffices; an edge's
    /// value is that running value plus its own weighted features. Invalid
    /// potentials become `-inf`.
    pub fn calc(&mut self, tm: &TransitionModel, evals: &PositionEvaluations, weights: &[f64]) {
        let mut node_value = 0.0;
        for &p in tm.model_order() {
            match p {
                Potential::Node(s) => {
                    let eval = evals.get(tm.node_potential(s));
                    node_value = if eval.is_invalid() {
                        f64::NEG_INFINITY
                    } else {
                        let mut w = 0.0;
                        for (fid, value) in eval.pairs() {
                            w += weights[fid] * value;
                        }
                        w
                    };
                    self.node[s] = node_value;
                }
                Potential::Edge(t) => {
                    let eval = evals.get(tm.edge_potential(t));
                    self.edge[t] = if eval.is_invalid() {
                        f64::NEG_INFINITY
                    } else {
                        let mut w = node_value;
                        for (fid, value) in eval.pairs() {
                            w += weights[fid] * value;
                        }
                        w
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{FeatureCache, PositionEvaluations};
    use crate::feature::{CacheStrategy, FeatureSource};
    use crate::sequence::{Sequence, TrainingSequence};
    use crate::test_utils::{two_state_all_paths, FnSource};

    #[test]
    fn edges_carry_their_destination_node_value() {
        let tm = two_state_all_paths();
        let seqs =
            vec![TrainingSequence::new(Sequence::new(vec![0, 0]), vec![0, 1]).unwrap()];
        let mut src = FnSource::new(CacheStrategy::Sparse, 4);
        src.node = Some(Box::new(|_, _, state, sink| {
            sink.push(state as u32, 1.0);
        }));
        src.edge = Some(Box::new(|_, _, from, to, sink| {
            sink.push(2 + ((from * 2 + to) % 2) as u32, 2.0);
        }));
        let cache = FeatureCache::for_training(&tm, &[&src as &dyn FeatureSource], &seqs).unwrap();

        let weights = [0.5, -1.0, 0.25, 0.75];
        let mut evals = PositionEvaluations::new(&tm);
        cache.evaluate_position(0, 1, &mut evals);
        let mut mi = Mi::new(&tm);
        mi.calc(&tm, &evals, &weights);

        assert!((mi.node[0] - 0.5).abs() < 1e-12);
        assert!((mi.node[1] - -1.0).abs() < 1e-12);
        for t in 0..tm.n_transitions() {
            let own = 2.0 * weights[2 + (tm.source(t) * 2 + tm.target(t)) % 2];
            let expected = mi.node[tm.target(t)] + own;
            assert!((mi.edge[t] - expected).abs() < 1e-12, "transition {t}");
        }
    }

    #[test]
    fn invalid_potentials_become_neg_infinity() {
        let tm = two_state_all_paths();
        let seqs =
            vec![TrainingSequence::new(Sequence::new(vec![0, 0]), vec![0, 0]).unwrap()];
        let mut src = FnSource::new(CacheStrategy::Sparse, 1);
        src.node = Some(Box::new(|_, pos, state, sink| {
            if pos == 1 && state == 1 {
                sink.invalidate();
            }
        }));
        let cache = FeatureCache::for_training(&tm, &[&src as &dyn FeatureSource], &seqs).unwrap();

        let mut evals = PositionEvaluations::new(&tm);
        let mut mi = Mi::new(&tm);
        cache.evaluate_position(0, 1, &mut evals);
        mi.calc(&tm, &evals, &[0.0]);

        assert_eq!(mi.node[1], f64::NEG_INFINITY);
        assert_eq!(mi.node[0], 0.0);
        for t in 0..tm.n_transitions() {
            if tm.target(t) == 1 {
                assert_eq!(mi.edge[t], f64::NEG_INFINITY);
            } else {
                assert_eq!(mi.edge[t], 0.0);
            }
        }
    }
}
