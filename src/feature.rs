use alloc::vec::Vec;

use crate::sequence::Sequence;

/// Terminator id closing an evaluation's pair list.
const TERMINATOR: i32 = -1;

/// Sentinel id marking a potential structurally invalid at a position.
const INVALID: i32 = -2;

/// The feature contributions of one (position, potential) pair.
///
/// An ordered list of `(feature id, value)` pairs closed by a `-1`
/// terminator, or a single invalid sentinel when the potential is
/// structurally disallowed there. Instances are scratch slots owned by a
/// [`PositionEvaluations`](crate::cache::PositionEvaluations) arena and are
/// only valid until the next evaluation call refills them.
#[derive(Clone, Debug, Default)]
pub struct FeatureEvaluation {
    entries: Vec<(i32, f64)>,
}

impl FeatureEvaluation {
    /// Empties the pair list.
    #[inline(always)]
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Appends a contribution.
    ///
    /// # Panics
    ///
    /// The evaluation must not be invalid or already terminated.
    #[inline(always)]
    pub fn push(&mut self, feature_id: u32, value: f64) {
        debug_assert!(self.entries.last().is_none_or(|&(id, _)| id >= 0));
        self.entries.push((feature_id as i32, value));
    }

    /// Closes the pair list.
    #[inline(always)]
    pub fn terminate(&mut self) {
        self.entries.push((TERMINATOR, 0.0));
    }

    /// Discards any contributions and marks the potential invalid.
    #[inline(always)]
    pub fn mark_invalid(&mut self) {
        self.entries.clear();
        self.entries.push((INVALID, 0.0));
    }

    /// Returns `true` if the potential is structurally invalid here.
    #[inline(always)]
    #[must_use]
    pub fn is_invalid(&self) -> bool {
        self.entries.first().is_some_and(|&(id, _)| id == INVALID)
    }

    /// Iterates the `(feature id, value)` pairs up to the terminator.
    #[inline(always)]
    pub fn pairs(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.entries
            .iter()
            .take_while(|&&(id, _)| id >= 0)
            .map(|&(id, value)| (id as usize, value))
    }
}

/// Collects the contributions a [`FeatureSource`] produces for one query.
#[derive(Debug, Default)]
pub struct FeatureSink {
    entries: Vec<(u32, f64)>,
    invalid: bool,
}

impl FeatureSink {
    /// Adds a `(feature id, value)` contribution.
    #[inline(always)]
    pub fn push(&mut self, feature_id: u32, value: f64) {
        self.entries.push((feature_id, value));
    }

    /// Marks the queried potential structurally invalid.
    #[inline(always)]
    pub fn invalidate(&mut self) {
        self.invalid = true;
    }

    #[inline(always)]
    pub(crate) fn reset(&mut self) {
        self.entries.clear();
        self.invalid = false;
    }

    #[inline(always)]
    pub(crate) fn entries(&self) -> &[(u32, f64)] {
        &self.entries
    }

    #[inline(always)]
    pub(crate) fn is_invalid(&self) -> bool {
        self.invalid
    }
}

/// How a feature group's values are stored by the cache.
///
/// Strategies trade memory for recomputation; every one presents the same
/// read contract to the DP layer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CacheStrategy {
    /// Values independent of position, stored once per potential.
    Constant,

    /// One value per cumulative position for every (feature, potential) pair
    /// the group produces. Intended for groups that fire at every position.
    Dense,

    /// Contributions keyed by cumulative position, in arbitrary order within
    /// a position.
    Sparse,

    /// Values keyed by `(state, segment length)`, consumed only by segments
    /// ending at the current position.
    ExplicitLength,
}

/// A feature group: the engine-facing contract of a feature manager.
///
/// Given a sequence, position, and state (or state pair, or explicit
/// length), a source pushes zero or more `(feature id, value)` contributions
/// into the sink, or marks the potential invalid. Feature ids live in one
/// id space shared by every group of a cache; weight vectors are indexed by
/// them directly.
pub trait FeatureSource {
    /// The caching strategy this group is stored under.
    fn strategy(&self) -> CacheStrategy;

    /// Upper bound of the feature-id space this group draws from.
    fn n_features(&self) -> usize;

    /// Contributions to a node potential.
    fn node_features(&self, seq: &Sequence, pos: usize, state: usize, sink: &mut FeatureSink) {
        let _ = (seq, pos, state, sink);
    }

    /// Contributions to an edge potential. `pos` is the position being
    /// entered by the transition.
    fn edge_features(
        &self,
        seq: &Sequence,
        pos: usize,
        source: usize,
        target: usize,
        sink: &mut FeatureSink,
    ) {
        let _ = (seq, pos, source, target, sink);
    }

    /// Length-dependent contributions of a whole segment. Only called for
    /// [`CacheStrategy::ExplicitLength`] groups; must not depend on the
    /// segment's location.
    fn length_features(&self, state: usize, length: usize, sink: &mut FeatureSink) {
        let _ = (state, length, sink);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_stop_at_terminator() {
        let mut eval = FeatureEvaluation::default();
        eval.push(3, 1.5);
        eval.push(7, -0.25);
        eval.terminate();
        let pairs: Vec<_> = eval.pairs().collect();
        assert_eq!(pairs, vec![(3, 1.5), (7, -0.25)]);
        assert!(!eval.is_invalid());
    }

    #[test]
    fn invalid_discards_contributions() {
        let mut eval = FeatureEvaluation::default();
        eval.push(1, 2.0);
        eval.mark_invalid();
        assert!(eval.is_invalid());
        assert_eq!(eval.pairs().count(), 0);
    }

    #[test]
    fn clear_reuses_the_slot() {
        let mut eval = FeatureEvaluation::default();
        eval.mark_invalid();
        eval.clear();
        eval.push(0, 1.0);
        eval.terminate();
        assert!(!eval.is_invalid());
        assert_eq!(eval.pairs().count(), 1);
    }

    #[test]
    fn sink_reset() {
        let mut sink = FeatureSink::default();
        sink.push(5, 1.0);
        sink.invalidate();
        assert!(sink.is_invalid());
        sink.reset();
        assert!(!sink.is_invalid());
        assert!(sink.entries().is_empty());
    }
}
