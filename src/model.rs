use alloc::vec::Vec;

use bincode::{Decode, Encode};

use crate::cache::FeatureCache;
use crate::errors::Result;
use crate::viterbi::{decode_markov, decode_semi_markov, InferenceResult};

/// A trained model: the per-feature weight vector.
///
/// Decoding borrows a [`FeatureCache`] built for the batch of sequences to
/// label; the model itself owns nothing but weights, so it serializes
/// compactly and works on the decode-only (`no_std`) path.
#[derive(Clone, Debug, Decode, Encode)]
pub struct Model {
    /// Weight per feature id.
    pub weights: Vec<f64>,
}

impl Model {
    /// Wraps a weight vector.
    #[inline(always)]
    #[must_use]
    pub fn new(weights: Vec<f64>) -> Self {
        Self { weights }
    }

    /// Decodes the best label path of one cached sequence.
    ///
    /// Dispatches to the explicit-duration decoder when the model has any
    /// duration-bounded state, and to the plain Markov decoder otherwise.
    ///
    /// # Errors
    ///
    /// Returns a `NoValidPaths` error when no legal labeling exists.
    pub fn predict(&self, cache: &FeatureCache, seq: usize) -> Result<InferenceResult> {
        if cache.transition_model().has_durations() {
            decode_semi_markov(cache, seq, &self.weights)
        } else {
            decode_markov(cache, seq, &self.weights)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FeatureCache;
    use crate::feature::{CacheStrategy, FeatureSource};
    use crate::sequence::Sequence;
    use crate::test_utils::{duration_model, two_state_all_paths, FnSource};

    #[test]
    fn serialization_round_trip() {
        let model = Model::new(vec![0.25, -1.5, 3.0]);
        let config = bincode::config::standard();
        let bytes = bincode::encode_to_vec(&model, config).unwrap();
        let (back, _): (Model, usize) = bincode::decode_from_slice(&bytes, config).unwrap();
        assert_eq!(back.weights, model.weights);
    }

    #[test]
    fn predict_uses_the_markov_decoder_without_durations() {
        let tm = two_state_all_paths();
        let mut src = FnSource::new(CacheStrategy::Sparse, 2);
        src.node = Some(Box::new(|seq, pos, state, sink| {
            if usize::from(seq.get(pos)) == state {
                sink.push(state as u32, 1.0);
            }
        }));
        let seqs = vec![Sequence::new(vec![0, 1, 1, 0])];
        let cache = FeatureCache::for_decoding(&tm, &[&src as &dyn FeatureSource], &seqs).unwrap();
        let model = Model::new(vec![2.0, 2.0]);
        let result = model.predict(&cache, 0).unwrap();
        assert_eq!(result.path, vec![0, 1, 1, 0]);
        assert_eq!(result.final_scores.len(), 2);
    }

    #[test]
    fn predict_uses_the_segment_decoder_with_durations() {
        let tm = duration_model();
        let mut src = FnSource::new(CacheStrategy::Sparse, 2);
        src.node = Some(Box::new(|seq, pos, state, sink| {
            if usize::from(seq.get(pos)) == state {
                sink.push(state as u32, 1.0);
            }
        }));
        let seqs = vec![Sequence::new(vec![0, 0, 1, 0, 0])];
        let cache = FeatureCache::for_decoding(&tm, &[&src as &dyn FeatureSource], &seqs).unwrap();
        let model = Model::new(vec![3.0, 3.0]);
        let result = model.predict(&cache, 0).unwrap();
        assert_eq!(result.path, vec![0, 0, 1, 0, 0]);
    }
}
