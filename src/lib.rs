//! # semicrf
//!
//! Linear-chain and semi-Markov Conditional Random Fields implemented in
//! pure Rust.
//!
//! The crate is the inference and training kernel of a label-sequence
//! annotator: a [`TransitionModel`] fixes the states, legal transitions, and
//! the model-ordered potential space; a [`FeatureCache`] precomputes the
//! sparse feature evaluations of a batch under selectable caching
//! strategies; the forward-backward engines turn cached values into
//! objectives and gradients for the quasi-Newton trainer; and the Viterbi
//! decoders (fixed- and explicit-duration) produce the best label path.
#![cfg_attr(
    all(feature = "std", feature = "train"),
    doc = "
## Examples

```rust
use semicrf::{
    CacheStrategy, FeatureCache, FeatureSink, FeatureSource, Legality, Sequence, State,
    Trainer, TrainingSequence, TransitionModel,
};

// Two states labeling a binary signal; one indicator feature per
// (state, observation) pair.
struct Emission;

impl FeatureSource for Emission {
    fn strategy(&self) -> CacheStrategy {
        CacheStrategy::Sparse
    }

    fn n_features(&self) -> usize {
        4
    }

    fn node_features(&self, seq: &Sequence, pos: usize, state: usize, sink: &mut FeatureSink) {
        let fid = state * 2 + usize::from(seq.get(pos));
        sink.push(fid as u32, 1.0);
    }
}

let tm = TransitionModel::new(
    vec![State::new(\"low\"), State::new(\"high\")],
    &Legality::AllPaths,
)?;

let train: Vec<TrainingSequence> = [
    vec![0u8, 0, 1, 1, 0],
    vec![1, 1, 0, 0, 1],
    vec![0, 1, 1, 0, 0],
]
.into_iter()
.map(|data| {
    let labels = data.iter().map(|&b| usize::from(b)).collect();
    TrainingSequence::new(Sequence::new(data), labels)
})
.collect::<Result<_, _>>()?;

let sources: &[&dyn FeatureSource] = &[&Emission];
let model = Trainer::new().max_iter(50)?.train(&tm, sources, &train)?;

// label a fresh sequence
let test = vec![Sequence::new(vec![1, 0, 1, 1, 0])];
let cache = FeatureCache::for_decoding(&tm, sources, &test)?;
let decoded = model.predict(&cache, 0)?;
assert_eq!(decoded.path, vec![1, 0, 1, 1, 0]);
# Ok::<(), semicrf::SemiCrfError>(())
```
"
)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "alloc"))]
compile_error!("`alloc` feature is currently required to build this crate");

#[macro_use]
extern crate alloc;

mod cache;
mod errors;
mod feature;
pub mod labels;
mod model;
mod potential;
mod ring;
mod sequence;
mod transition;
mod viterbi;

#[cfg(feature = "train")]
mod forward_backward;
#[cfg(feature = "train")]
mod math;
#[cfg(feature = "train")]
mod semi_markov;
#[cfg(feature = "train")]
mod similarity;
#[cfg(feature = "train")]
mod trainer;

#[cfg(test)]
mod test_utils;

pub use cache::{FeatureCache, PositionEvaluations, SegmentEvaluations};
pub use errors::{ConfigError, InvalidArgumentError, NoValidPathsError, Result, SemiCrfError};
pub use feature::{CacheStrategy, FeatureEvaluation, FeatureSink, FeatureSource};
pub use model::Model;
pub use potential::Mi;
pub use ring::LookbackRing;
pub use sequence::{Sequence, TrainingSequence};
pub use transition::{Legality, Potential, State, TransitionModel};
pub use viterbi::InferenceResult;

#[cfg(feature = "train")]
#[cfg_attr(docsrs, doc(cfg(feature = "train")))]
pub use forward_backward::ForwardBackward;
#[cfg(feature = "train")]
#[cfg_attr(docsrs, doc(cfg(feature = "train")))]
pub use semi_markov::SemiMarkovForwardBackward;
#[cfg(feature = "train")]
#[cfg_attr(docsrs, doc(cfg(feature = "train")))]
pub use similarity::LocalSimilarity;
#[cfg(feature = "train")]
#[cfg_attr(docsrs, doc(cfg(feature = "train")))]
pub use trainer::{Objective, Regularization, Trainer};
