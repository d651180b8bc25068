use alloc::vec::Vec;

use hashbrown::{HashMap, HashSet};

use crate::errors::{Result, SemiCrfError};
use crate::feature::{CacheStrategy, FeatureEvaluation, FeatureSink, FeatureSource};
use crate::sequence::{Sequence, TrainingSequence};
use crate::transition::{Potential, TransitionModel};

/// Row-major bitmap of structurally invalid (cumulative position, potential)
/// pairs.
#[derive(Debug)]
struct BitGrid {
    bits: Vec<u64>,
    cols: usize,
}

impl BitGrid {
    fn new(rows: usize, cols: usize) -> Self {
        Self {
            bits: vec![0; (rows * cols).div_ceil(64)],
            cols,
        }
    }

    #[inline(always)]
    fn set(&mut self, row: usize, col: usize) {
        let idx = row * self.cols + col;
        self.bits[idx / 64] |= 1 << (idx % 64);
    }

    #[inline(always)]
    fn get(&self, row: usize, col: usize) -> bool {
        let idx = row * self.cols + col;
        self.bits[idx / 64] >> (idx % 64) & 1 == 1
    }
}

/// Scratch arena holding one [`FeatureEvaluation`] per potential.
///
/// Refilled by [`FeatureCache::evaluate_position`]; the contents are only
/// valid until the next call that borrows the arena mutably.
#[derive(Debug)]
pub struct PositionEvaluations {
    evals: Vec<FeatureEvaluation>,
}

impl PositionEvaluations {
    /// Creates an arena sized for the model's potential space.
    #[must_use]
    pub fn new(tm: &TransitionModel) -> Self {
        Self {
            evals: vec![FeatureEvaluation::default(); tm.n_potentials()],
        }
    }

    /// The evaluation of a potential at the last evaluated position.
    #[inline(always)]
    #[must_use]
    pub fn get(&self, potential: usize) -> &FeatureEvaluation {
        &self.evals[potential]
    }
}

/// Scratch arena holding one [`FeatureEvaluation`] per (duration-bounded
/// state, lookback length).
#[derive(Debug)]
pub struct SegmentEvaluations {
    evals: Vec<FeatureEvaluation>,
    row_of: Vec<i32>,
    max_lookback: usize,
}

impl SegmentEvaluations {
    /// Creates an arena sized for the model's duration-bounded states.
    #[must_use]
    pub fn new(tm: &TransitionModel) -> Self {
        let mut row_of = vec![-1i32; tm.n_states()];
        let dur = tm.duration_states();
        for (row, &s) in dur.iter().enumerate() {
            row_of[s] = i32::try_from(row).unwrap();
        }
        Self {
            evals: vec![FeatureEvaluation::default(); dur.len() * tm.max_lookback()],
            row_of,
            max_lookback: tm.max_lookback(),
        }
    }

    /// The evaluation of a segment of `state` spanning `length` positions
    /// and ending at the last evaluated position.
    ///
    /// # Panics
    ///
    /// `state` must be duration-bounded and `length` within
    /// `1..=max_lookback`.
    #[inline(always)]
    #[must_use]
    pub fn get(&self, state: usize, length: usize) -> &FeatureEvaluation {
        let row = usize::try_from(self.row_of[state]).expect("not a duration-bounded state");
        &self.evals[row * self.max_lookback + (length - 1)]
    }

    #[inline(always)]
    fn get_mut(&mut self, state: usize, length: usize) -> &mut FeatureEvaluation {
        let row = usize::try_from(self.row_of[state]).expect("not a duration-bounded state");
        &mut self.evals[row * self.max_lookback + (length - 1)]
    }
}

/// Precomputed feature values for one batch of sequences.
///
/// Built once from a list of sequences and a set of feature groups;
/// immutable afterwards, so concurrent readers need no locking. The DP
/// layers re-read the same position many times; every read reconstructs the
/// evaluations from compact per-strategy backing stores instead of calling
/// the feature groups again.
#[derive(Debug)]
pub struct FeatureCache<'a> {
    tm: &'a TransitionModel,
    seqs: Vec<&'a Sequence>,
    labels: Vec<Option<&'a [usize]>>,
    offsets: Vec<usize>,
    total_positions: usize,
    n_features: usize,
    invalid: BitGrid,
    invalid_const: Vec<bool>,
    constant: Vec<Vec<(u32, f64)>>,
    dense_pairs: Vec<(u32, usize)>,
    dense_by_pot: Vec<Vec<usize>>,
    dense_values: Vec<f64>,
    sparse: HashMap<usize, Vec<(usize, u32, f64)>>,
    explicit: HashMap<(usize, usize), Vec<(u32, f64)>>,
    explicit_invalid: HashSet<(usize, usize)>,
    empirical: Vec<f64>,
}

impl<'a> FeatureCache<'a> {
    /// Builds a cache for a training batch, validating every label against
    /// the transition model.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error naming the sequence, position, and state if
    /// any training label uses an illegal state, an illegal transition, a
    /// structurally invalidated potential, or a segment length outside a
    /// duration-bounded state's bounds.
    pub fn for_training(
        tm: &'a TransitionModel,
        sources: &[&dyn FeatureSource],
        seqs: &'a [TrainingSequence],
    ) -> Result<Self> {
        let keep: Vec<usize> = (0..seqs.len()).collect();
        Self::build(
            tm,
            sources,
            keep.iter().map(|&i| seqs[i].sequence()).collect(),
            keep.iter().map(|&i| Some(seqs[i].labels())).collect(),
            &keep,
        )
    }

    /// Builds a cache for a training batch, dropping sequences whose labels
    /// fail validation and rebuilding with the remainder.
    ///
    /// Returns the cache and the indices of the kept sequences.
    ///
    /// # Errors
    ///
    /// Fails only when no sequence survives.
    pub fn for_training_discarding(
        tm: &'a TransitionModel,
        sources: &[&dyn FeatureSource],
        seqs: &'a [TrainingSequence],
    ) -> Result<(Self, Vec<usize>)> {
        let mut keep: Vec<usize> = (0..seqs.len()).collect();
        loop {
            if keep.is_empty() {
                return Err(SemiCrfError::config(format!(
                    "all {} training sequences were discarded as invalid",
                    seqs.len()
                )));
            }
            let attempt = Self::build(
                tm,
                sources,
                keep.iter().map(|&i| seqs[i].sequence()).collect(),
                keep.iter().map(|&i| Some(seqs[i].labels())).collect(),
                &keep,
            );
            match attempt {
                Ok(cache) => return Ok((cache, keep)),
                Err(SemiCrfError::Config(e)) => {
                    if let Some(bad) = e.sequence() {
                        keep.retain(|&i| i != bad);
                    } else {
                        return Err(SemiCrfError::Config(e));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Builds a cache for decoding; no labels, no validation, no empirical
    /// sums.
    pub fn for_decoding(
        tm: &'a TransitionModel,
        sources: &[&dyn FeatureSource],
        seqs: &'a [Sequence],
    ) -> Result<Self> {
        let index_map: Vec<usize> = (0..seqs.len()).collect();
        Self::build(
            tm,
            sources,
            seqs.iter().collect(),
            vec![None; seqs.len()],
            &index_map,
        )
    }

    fn build(
        tm: &'a TransitionModel,
        sources: &[&dyn FeatureSource],
        seqs: Vec<&'a Sequence>,
        labels: Vec<Option<&'a [usize]>>,
        index_map: &[usize],
    ) -> Result<Self> {
        if seqs.is_empty() {
            return Err(SemiCrfError::invalid_argument("batch must not be empty"));
        }
        if seqs.iter().any(|s| s.is_empty()) {
            return Err(SemiCrfError::invalid_argument(
                "sequences must not be empty",
            ));
        }

        let mut offsets = Vec::with_capacity(seqs.len());
        let mut total_positions = 0;
        for seq in &seqs {
            offsets.push(total_positions);
            total_positions += seq.len();
        }

        let n_potentials = tm.n_potentials();
        let n_features = sources.iter().map(|s| s.n_features()).max().unwrap_or(0);

        let mut cache = Self {
            tm,
            seqs,
            labels,
            offsets,
            total_positions,
            n_features,
            invalid: BitGrid::new(total_positions, n_potentials),
            invalid_const: vec![false; n_potentials],
            constant: vec![Vec::new(); n_potentials],
            dense_pairs: Vec::new(),
            dense_by_pot: vec![Vec::new(); n_potentials],
            dense_values: Vec::new(),
            sparse: HashMap::new(),
            explicit: HashMap::new(),
            explicit_invalid: HashSet::new(),
            empirical: vec![0.0; n_features],
        };

        cache.discover(sources)?;
        cache.validate_labels(index_map)?;
        cache.fill(sources);
        cache.accumulate_empirical();
        Ok(cache)
    }

    /// Pass 1: evaluate every group at every (sequence, position, potential)
    /// to record structural invalidity and to size the backing stores.
    fn discover(&mut self, sources: &[&dyn FeatureSource]) -> Result<()> {
        let tm = self.tm;
        let mut sink = FeatureSink::default();
        let mut dense_seen: HashMap<(u32, usize), usize> = HashMap::new();

        for source in sources {
            match source.strategy() {
                CacheStrategy::Constant => {
                    // Position-independent by contract: one query per
                    // potential decides both values and validity everywhere.
                    let seq = self.seqs[0];
                    for &p in tm.model_order() {
                        sink.reset();
                        let pot = self.query(source, seq, 0, p, &mut sink);
                        if sink.is_invalid() {
                            self.invalid_const[pot] = true;
                        } else {
                            self.constant[pot].extend_from_slice(sink.entries());
                        }
                    }
                }
                CacheStrategy::Dense | CacheStrategy::Sparse => {
                    let dense = source.strategy() == CacheStrategy::Dense;
                    for (i, seq) in self.seqs.iter().enumerate() {
                        for pos in 0..seq.len() {
                            let cum = self.offsets[i] + pos;
                            for &p in tm.model_order() {
                                sink.reset();
                                let pot = self.query(source, seq, pos, p, &mut sink);
                                if sink.is_invalid() {
                                    self.invalid.set(cum, pot);
                                } else if dense {
                                    for &(fid, _) in sink.entries() {
                                        let next = dense_seen.len();
                                        dense_seen.entry((fid, pot)).or_insert(next);
                                    }
                                }
                            }
                        }
                    }
                }
                CacheStrategy::ExplicitLength => {
                    for s in tm.duration_states() {
                        let state = tm.state(s);
                        for length in state.min_length()..=state.max_length() {
                            sink.reset();
                            source.length_features(s, length, &mut sink);
                            if sink.is_invalid() {
                                self.explicit_invalid.insert((s, length));
                            }
                        }
                    }
                }
            }
        }

        let mut pairs = vec![(0u32, 0usize); dense_seen.len()];
        for (&(fid, pot), &idx) in &dense_seen {
            pairs[idx] = (fid, pot);
        }
        for (idx, &(_, pot)) in pairs.iter().enumerate() {
            self.dense_by_pot[pot].push(idx);
        }
        self.dense_pairs = pairs;
        self.dense_values = vec![0.0; self.dense_pairs.len() * self.total_positions];
        Ok(())
    }

    #[inline(always)]
    fn query(
        &self,
        source: &&dyn FeatureSource,
        seq: &Sequence,
        pos: usize,
        p: Potential,
        sink: &mut FeatureSink,
    ) -> usize {
        match p {
            Potential::Node(s) => {
                source.node_features(seq, pos, s, sink);
                self.tm.node_potential(s)
            }
            Potential::Edge(t) => {
                source.edge_features(seq, pos, self.tm.source(t), self.tm.target(t), sink);
                self.tm.edge_potential(t)
            }
        }
    }

    /// Training labels must never touch an invalid potential; that is a
    /// fatal configuration error, not a modeling choice.
    fn validate_labels(&self, index_map: &[usize]) -> Result<()> {
        let tm = self.tm;
        for (i, labels) in self.labels.iter().enumerate() {
            let Some(labels) = labels else { continue };
            let reported = index_map[i];
            let mut run_start = 0;
            for (pos, &s) in labels.iter().enumerate() {
                if s >= tm.n_states() {
                    return Err(SemiCrfError::config_in_sequence(
                        format!("sequence {reported} position {pos}: unknown state {s}"),
                        reported,
                    ));
                }
                let cum = self.offsets[i] + pos;
                if self.invalid_at(cum, tm.node_potential(s)) {
                    return Err(SemiCrfError::config_in_sequence(
                        format!(
                            "sequence {reported} position {pos}: state {s} ({}) is invalid here",
                            tm.state(s).name()
                        ),
                        reported,
                    ));
                }
                if pos > 0 {
                    let prev = labels[pos - 1];
                    let Some(t) = tm.transition_index(prev, s) else {
                        return Err(SemiCrfError::config_in_sequence(
                            format!(
                                "sequence {reported} position {pos}: transition {prev} -> {s} is illegal"
                            ),
                            reported,
                        ));
                    };
                    if self.invalid_at(cum, tm.edge_potential(t)) {
                        return Err(SemiCrfError::config_in_sequence(
                            format!(
                                "sequence {reported} position {pos}: transition {prev} -> {s} is invalid here"
                            ),
                            reported,
                        ));
                    }
                    if prev != s {
                        Self::check_run(tm, labels, run_start, pos, reported)?;
                        run_start = pos;
                    }
                }
            }
            Self::check_run(tm, labels, run_start, labels.len(), reported)?;
        }
        Ok(())
    }

    fn check_run(
        tm: &TransitionModel,
        labels: &[usize],
        start: usize,
        end: usize,
        reported: usize,
    ) -> Result<()> {
        let s = labels[start];
        let state = tm.state(s);
        let run = end - start;
        if state.allows_self_loop() && (run < state.min_length() || run > state.max_length()) {
            return Err(SemiCrfError::config_in_sequence(
                format!(
                    "sequence {reported} position {start}: segment of state {s} ({}) has length {run}, outside {}..={}",
                    state.name(),
                    state.min_length(),
                    state.max_length()
                ),
                reported,
            ));
        }
        Ok(())
    }

    /// Pass 2: fill the exactly-sized backing stores.
    fn fill(&mut self, sources: &[&dyn FeatureSource]) {
        let tm = self.tm;
        let mut sink = FeatureSink::default();
        let mut dense_index: HashMap<(u32, usize), usize> = HashMap::new();
        for (idx, &pair) in self.dense_pairs.iter().enumerate() {
            dense_index.insert(pair, idx);
        }

        for source in sources {
            match source.strategy() {
                CacheStrategy::Constant => {}
                CacheStrategy::Dense | CacheStrategy::Sparse => {
                    let dense = source.strategy() == CacheStrategy::Dense;
                    for i in 0..self.seqs.len() {
                        let seq = self.seqs[i];
                        for pos in 0..seq.len() {
                            let cum = self.offsets[i] + pos;
                            for &p in tm.model_order() {
                                sink.reset();
                                let pot = self.query(source, seq, pos, p, &mut sink);
                                if sink.is_invalid() {
                                    continue;
                                }
                                for &(fid, value) in sink.entries() {
                                    if dense {
                                        let idx = dense_index[&(fid, pot)];
                                        self.dense_values[idx * self.total_positions + cum] +=
                                            value;
                                    } else {
                                        self.sparse
                                            .entry(cum)
                                            .or_insert_with(Vec::new)
                                            .push((pot, fid, value));
                                    }
                                }
                            }
                        }
                    }
                }
                CacheStrategy::ExplicitLength => {
                    for s in tm.duration_states() {
                        let state = tm.state(s);
                        for length in state.min_length()..=state.max_length() {
                            if self.explicit_invalid.contains(&(s, length)) {
                                continue;
                            }
                            sink.reset();
                            source.length_features(s, length, &mut sink);
                            if !sink.entries().is_empty() {
                                self.explicit
                                    .entry((s, length))
                                    .or_insert_with(Vec::new)
                                    .extend_from_slice(sink.entries());
                            }
                        }
                    }
                }
            }
        }
    }

    /// Accumulates the empirical per-feature sums over the training labels,
    /// read back through the same stores the DP layer reads.
    fn accumulate_empirical(&mut self) {
        let tm = self.tm;
        let mut evals = PositionEvaluations::new(tm);
        let mut empirical = core::mem::take(&mut self.empirical);
        for i in 0..self.seqs.len() {
            let Some(labels) = self.labels[i] else { continue };
            for pos in 0..labels.len() {
                self.evaluate_position(i, pos, &mut evals);
                let s = labels[pos];
                for (fid, value) in evals.get(tm.node_potential(s)).pairs() {
                    empirical[fid] += value;
                }
                if pos > 0 {
                    let t = tm.transition_index(labels[pos - 1], s).unwrap();
                    for (fid, value) in evals.get(tm.edge_potential(t)).pairs() {
                        empirical[fid] += value;
                    }
                }
            }
            let mut run_start = 0;
            for pos in 1..=labels.len() {
                if pos == labels.len() || labels[pos] != labels[run_start] {
                    let s = labels[run_start];
                    if tm.state(s).allows_self_loop() {
                        if let Some(pairs) = self.explicit.get(&(s, pos - run_start)) {
                            for &(fid, value) in pairs {
                                empirical[fid as usize] += value;
                            }
                        }
                    }
                    run_start = pos;
                }
            }
        }
        self.empirical = empirical;
    }

    #[inline(always)]
    fn invalid_at(&self, cum: usize, pot: usize) -> bool {
        self.invalid_const[pot] || self.invalid.get(cum, pot)
    }

    /// Reconstructs the evaluation of every potential at one position.
    ///
    /// After the call `out.get(potential)` holds the union of constant and
    /// positional contributions, terminated, or is flagged invalid.
    pub fn evaluate_position(&self, seq: usize, pos: usize, out: &mut PositionEvaluations) {
        let cum = self.offsets[seq] + pos;
        let n_potentials = self.tm.n_potentials();
        for pot in 0..n_potentials {
            let eval = &mut out.evals[pot];
            eval.clear();
            if self.invalid_at(cum, pot) {
                eval.mark_invalid();
                continue;
            }
            for &(fid, value) in &self.constant[pot] {
                eval.push(fid, value);
            }
            for &idx in &self.dense_by_pot[pot] {
                let (fid, _) = self.dense_pairs[idx];
                eval.push(fid, self.dense_values[idx * self.total_positions + cum]);
            }
        }
        if let Some(entries) = self.sparse.get(&cum) {
            for &(pot, fid, value) in entries {
                let eval = &mut out.evals[pot];
                if !eval.is_invalid() {
                    eval.push(fid, value);
                }
            }
        }
        for eval in &mut out.evals {
            if !eval.is_invalid() {
                eval.terminate();
            }
        }
    }

    /// Fills one evaluation per feasible lookback for every duration-bounded
    /// state whose segment ends at `pos`.
    ///
    /// A lookback is feasible when the segment stays inside the sequence,
    /// satisfies the state's length bounds, and crosses no invalidated node
    /// or self-transition; infeasible lookbacks are flagged invalid.
    pub fn evaluate_segments_ending_at(
        &self,
        seq: usize,
        pos: usize,
        out: &mut SegmentEvaluations,
    ) {
        let tm = self.tm;
        for s in tm.duration_states() {
            let state = tm.state(s);
            let node_pot = tm.node_potential(s);
            let self_pot = tm.edge_potential(tm.self_edge(s).unwrap());
            let mut feasible = true;
            for length in 1..=tm.max_lookback() {
                let eval = out.get_mut(s, length);
                eval.clear();
                if length > pos + 1 {
                    feasible = false;
                }
                if feasible {
                    let cum = self.offsets[seq] + pos + 1 - length;
                    // New position covered by growing the segment one step.
                    if self.invalid_at(cum, node_pot) {
                        feasible = false;
                    } else if length > 1 && self.invalid_at(cum + 1, self_pot) {
                        feasible = false;
                    }
                }
                if !feasible
                    || length < state.min_length()
                    || length > state.max_length()
                    || self.explicit_invalid.contains(&(s, length))
                {
                    eval.mark_invalid();
                    continue;
                }
                if let Some(pairs) = self.explicit.get(&(s, length)) {
                    for &(fid, value) in pairs {
                        eval.push(fid, value);
                    }
                }
                eval.terminate();
            }
        }
    }

    /// The transition model the cache was built against.
    #[inline(always)]
    #[must_use]
    pub fn transition_model(&self) -> &'a TransitionModel {
        self.tm
    }

    /// Number of sequences in the batch.
    #[inline(always)]
    #[must_use]
    pub fn n_sequences(&self) -> usize {
        self.seqs.len()
    }

    /// One sequence of the batch.
    #[inline(always)]
    #[must_use]
    pub fn sequence(&self, seq: usize) -> &'a Sequence {
        self.seqs[seq]
    }

    /// The labels of a training sequence, if present.
    #[inline(always)]
    #[must_use]
    pub fn labels(&self, seq: usize) -> Option<&'a [usize]> {
        self.labels[seq]
    }

    /// Total positions across the batch.
    #[inline(always)]
    #[must_use]
    pub const fn total_positions(&self) -> usize {
        self.total_positions
    }

    /// Length of the longest sequence, for arena sizing.
    #[must_use]
    pub fn longest(&self) -> usize {
        self.seqs.iter().map(|s| s.len()).max().unwrap_or(0)
    }

    /// Size of the feature-id space.
    #[inline(always)]
    #[must_use]
    pub const fn n_features(&self) -> usize {
        self.n_features
    }

    /// Per-feature sums over the training labels.
    #[inline(always)]
    #[must_use]
    pub fn empirical(&self) -> &[f64] {
        &self.empirical
    }

    /// Explicit length features of a `(state, length)` segment, if any.
    #[inline(always)]
    #[must_use]
    pub fn length_pairs(&self, state: usize, length: usize) -> Option<&[(u32, f64)]> {
        self.explicit.get(&(state, length)).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::CacheStrategy;
    use crate::test_utils::{two_state_all_paths, FnSource};
    use crate::transition::{Legality, State, TransitionModel};

    fn batch(labels: &[Vec<usize>]) -> Vec<TrainingSequence> {
        labels
            .iter()
            .map(|l| {
                TrainingSequence::new(Sequence::new(vec![b'a'; l.len()]), l.clone()).unwrap()
            })
            .collect()
    }

    fn positional_source(strategy: CacheStrategy) -> FnSource {
        let mut src = FnSource::new(strategy, 4);
        src.node = Some(Box::new(|_, pos, state, sink| {
            sink.push(state as u32, (pos + 1) as f64);
        }));
        src.edge = Some(Box::new(|_, _, from, to, sink| {
            sink.push(2 + ((from + to) % 2) as u32, 1.0);
        }));
        src
    }

    #[test]
    fn dense_and_sparse_agree_everywhere() {
        let tm = two_state_all_paths();
        let seqs = batch(&[vec![0, 1, 0], vec![1, 1]]);

        let dense_src = positional_source(CacheStrategy::Dense);
        let sparse_src = positional_source(CacheStrategy::Sparse);
        let dense =
            FeatureCache::for_training(&tm, &[&dense_src as &dyn FeatureSource], &seqs).unwrap();
        let sparse =
            FeatureCache::for_training(&tm, &[&sparse_src as &dyn FeatureSource], &seqs).unwrap();

        let mut out_d = PositionEvaluations::new(&tm);
        let mut out_s = PositionEvaluations::new(&tm);
        for seq in 0..2 {
            for pos in 0..dense.sequence(seq).len() {
                dense.evaluate_position(seq, pos, &mut out_d);
                sparse.evaluate_position(seq, pos, &mut out_s);
                for pot in 0..tm.n_potentials() {
                    let mut d: Vec<_> = out_d.get(pot).pairs().collect();
                    let mut s: Vec<_> = out_s.get(pot).pairs().collect();
                    d.sort_by(|a, b| a.partial_cmp(b).unwrap());
                    s.sort_by(|a, b| a.partial_cmp(b).unwrap());
                    assert_eq!(d, s, "seq {seq} pos {pos} potential {pot}");
                }
            }
        }
        assert_eq!(dense.empirical(), sparse.empirical());
    }

    #[test]
    fn constant_store_fires_at_every_position() {
        let tm = two_state_all_paths();
        let seqs = batch(&[vec![0, 1, 0]]);
        let mut src = FnSource::new(CacheStrategy::Constant, 2);
        src.node = Some(Box::new(|_, _, state, sink| {
            sink.push(state as u32, 2.0);
        }));
        let cache = FeatureCache::for_training(&tm, &[&src as &dyn FeatureSource], &seqs).unwrap();
        let mut out = PositionEvaluations::new(&tm);
        for pos in 0..3 {
            cache.evaluate_position(0, pos, &mut out);
            assert_eq!(out.get(0).pairs().collect::<Vec<_>>(), vec![(0, 2.0)]);
            assert_eq!(out.get(1).pairs().collect::<Vec<_>>(), vec![(1, 2.0)]);
        }
        // empirical: state 0 twice, state 1 once
        assert_eq!(cache.empirical(), &[4.0, 2.0]);
    }

    #[test]
    fn invalid_potential_in_labels_is_a_config_error() {
        let tm = two_state_all_paths();
        let seqs = batch(&[vec![0, 1], vec![0, 0]]);
        let mut src = FnSource::new(CacheStrategy::Sparse, 2);
        // state 1 is forbidden at position 1 of every sequence
        src.node = Some(Box::new(|_, pos, state, sink| {
            if pos == 1 && state == 1 {
                sink.invalidate();
            }
        }));
        let err = FeatureCache::for_training(&tm, &[&src as &dyn FeatureSource], &seqs);
        match err {
            Err(SemiCrfError::Config(e)) => assert_eq!(e.sequence(), Some(0)),
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn discarding_keeps_the_valid_remainder() {
        let tm = two_state_all_paths();
        let seqs = batch(&[vec![0, 1], vec![0, 0], vec![1, 1]]);
        let mut src = FnSource::new(CacheStrategy::Sparse, 2);
        src.node = Some(Box::new(|_, pos, state, sink| {
            if pos == 1 && state == 1 {
                sink.invalidate();
            } else {
                sink.push(state as u32, 1.0);
            }
        }));
        let (cache, kept) =
            FeatureCache::for_training_discarding(&tm, &[&src as &dyn FeatureSource], &seqs)
                .unwrap();
        assert_eq!(kept, vec![1]);
        assert_eq!(cache.n_sequences(), 1);
        // the surviving sequence still evaluates cleanly
        let mut out = PositionEvaluations::new(&tm);
        cache.evaluate_position(0, 1, &mut out);
        assert!(!out.get(0).is_invalid());
        assert!(out.get(1).is_invalid());
    }

    #[test]
    fn discarding_everything_fails() {
        let tm = two_state_all_paths();
        let seqs = batch(&[vec![1, 1]]);
        let mut src = FnSource::new(CacheStrategy::Sparse, 2);
        src.node = Some(Box::new(|_, _, state, sink| {
            if state == 1 {
                sink.invalidate();
            }
        }));
        assert!(matches!(
            FeatureCache::for_training_discarding(&tm, &[&src as &dyn FeatureSource], &seqs),
            Err(SemiCrfError::Config(_))
        ));
    }

    #[test]
    fn illegal_transition_in_labels_is_rejected() {
        let legal = vec![vec![true, true], vec![false, true]];
        let tm = TransitionModel::new(
            vec![State::new("a"), State::new("b")],
            &Legality::Matrix(legal),
        )
        .unwrap();
        let seqs = batch(&[vec![1, 0]]);
        let src = FnSource::new(CacheStrategy::Sparse, 1);
        assert!(matches!(
            FeatureCache::for_training(&tm, &[&src as &dyn FeatureSource], &seqs),
            Err(SemiCrfError::Config(_))
        ));
    }

    #[test]
    fn segment_evaluations_respect_bounds_and_invalidity() {
        let states = vec![
            State::with_duration("seg", 2, 3).unwrap(),
            State::new("bg"),
        ];
        let tm = TransitionModel::new(states, &Legality::AllPaths).unwrap();
        let seqs = batch(&[vec![1, 0, 0, 1, 1]]);
        let mut src = FnSource::new(CacheStrategy::ExplicitLength, 8);
        src.lens = Some(Box::new(|state, length, sink| {
            if state == 0 {
                sink.push(length as u32, 0.5);
            }
        }));
        let cache = FeatureCache::for_training(&tm, &[&src as &dyn FeatureSource], &seqs).unwrap();
        let mut out = SegmentEvaluations::new(&tm);

        cache.evaluate_segments_ending_at(0, 2, &mut out);
        assert!(out.get(0, 1).is_invalid()); // below min_length
        assert_eq!(out.get(0, 2).pairs().collect::<Vec<_>>(), vec![(2, 0.5)]);
        assert_eq!(out.get(0, 3).pairs().collect::<Vec<_>>(), vec![(3, 0.5)]);

        // a segment may not reach past the sequence start
        cache.evaluate_segments_ending_at(0, 1, &mut out);
        assert!(out.get(0, 3).is_invalid());
        assert_eq!(out.get(0, 2).pairs().collect::<Vec<_>>(), vec![(2, 0.5)]);
    }

    #[test]
    fn segment_feasibility_is_cut_by_invalid_positions() {
        let states = vec![
            State::with_duration("seg", 1, 4).unwrap(),
            State::new("bg"),
        ];
        let tm = TransitionModel::new(states, &Legality::AllPaths).unwrap();
        let seqs = batch(&[vec![1, 1, 1, 1, 1]]);
        let mut src = FnSource::new(CacheStrategy::Sparse, 2);
        // state 0 cannot occupy position 1
        src.node = Some(Box::new(|_, pos, state, sink| {
            if pos == 1 && state == 0 {
                sink.invalidate();
            }
        }));
        let cache = FeatureCache::for_training(&tm, &[&src as &dyn FeatureSource], &seqs).unwrap();
        let mut out = SegmentEvaluations::new(&tm);
        cache.evaluate_segments_ending_at(0, 3, &mut out);
        assert!(!out.get(0, 1).is_invalid());
        assert!(!out.get(0, 2).is_invalid());
        // length 3 would cover the invalidated position 1
        assert!(out.get(0, 3).is_invalid());
        assert!(out.get(0, 4).is_invalid());
    }

    #[test]
    fn empirical_sums_include_segment_length_features() {
        let states = vec![
            State::with_duration("seg", 1, 4).unwrap(),
            State::new("bg"),
        ];
        let tm = TransitionModel::new(states, &Legality::AllPaths).unwrap();
        let seqs = batch(&[vec![0, 0, 1, 0]]);
        let mut src = FnSource::new(CacheStrategy::ExplicitLength, 8);
        src.lens = Some(Box::new(|state, length, sink| {
            if state == 0 {
                sink.push(length as u32, 1.0);
            }
        }));
        let cache = FeatureCache::for_training(&tm, &[&src as &dyn FeatureSource], &seqs).unwrap();
        // runs of state 0: lengths 2 and 1
        let mut expected = vec![0.0; 8];
        expected[2] = 1.0;
        expected[1] = 1.0;
        assert_eq!(cache.empirical(), expected.as_slice());
    }
}
