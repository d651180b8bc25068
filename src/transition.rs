use alloc::string::String;
use alloc::vec::Vec;

use crate::errors::{Result, SemiCrfError};

/// A hidden state of the label chain.
#[derive(Clone, Debug)]
pub struct State {
    name: String,
    min_length: usize,
    max_length: usize,
}

impl State {
    /// Creates a plain Markov state occupying exactly one position at a time.
    #[inline(always)]
    pub fn new<S>(name: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            name: name.into(),
            min_length: 1,
            max_length: 1,
        }
    }

    /// Creates a duration-bounded state whose segments span between
    /// `min_length` and `max_length` positions.
    ///
    /// # Errors
    ///
    /// `1 <= min_length <= max_length` must hold.
    pub fn with_duration<S>(name: S, min_length: usize, max_length: usize) -> Result<Self>
    where
        S: Into<String>,
    {
        if min_length == 0 {
            return Err(SemiCrfError::invalid_argument("min_length must not be 0"));
        }
        if min_length > max_length {
            return Err(SemiCrfError::invalid_argument(
                "min_length must not exceed max_length",
            ));
        }
        Ok(Self {
            name: name.into(),
            min_length,
            max_length,
        })
    }

    /// Gets the state name.
    #[inline(always)]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Minimum segment length.
    #[inline(always)]
    #[must_use]
    pub const fn min_length(&self) -> usize {
        self.min_length
    }

    /// Maximum segment length.
    #[inline(always)]
    #[must_use]
    pub const fn max_length(&self) -> usize {
        self.max_length
    }

    /// A duration-bounded state structurally requires a self-loop slot for
    /// its within-segment positions.
    #[inline(always)]
    #[must_use]
    pub const fn allows_self_loop(&self) -> bool {
        self.max_length > 1
    }
}

/// Which ordered state pairs are legal transitions.
#[derive(Clone, Debug)]
pub enum Legality {
    /// Every transition is legal.
    AllPaths,

    /// `matrix[from][to]` is `true` iff the transition is legal.
    Matrix(Vec<Vec<bool>>),
}

/// One entry of the canonical potential enumeration.
///
/// States occupy potential indices `[0, n_states)` and transitions occupy
/// `[n_states, n_states + n_transitions)`. The *model order* visits each node
/// potential immediately before every edge potential entering that node, so
/// a single sweep can carry a running node value onto its incoming edges.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Potential {
    /// Node potential of a state.
    Node(usize),

    /// Edge potential of a transition, by transition id.
    Edge(usize),
}

/// Enumerates legal transitions and fixes the unified potential index space.
#[derive(Debug)]
pub struct TransitionModel {
    states: Vec<State>,
    from: Vec<usize>,
    to: Vec<usize>,
    pair_index: Vec<i32>,
    order: Vec<Potential>,
    in_edges: Vec<(usize, usize)>,
    self_edge: Vec<i32>,
    max_lookback: usize,
}

impl TransitionModel {
    /// Builds a model from states and a legality description.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if a duration-bounded state's self-loop is
    /// marked illegal (use [`Self::with_forced_self_loops`] to override), or
    /// if the legality matrix dimensions disagree with the state count.
    pub fn new(states: Vec<State>, legality: &Legality) -> Result<Self> {
        Self::with_forced_self_loops(states, legality, false)
    }

    /// Like [`Self::new`], but with `force` set, a duration-bounded state's
    /// self-loop is treated as legal even when the matrix forbids it.
    pub fn with_forced_self_loops(
        states: Vec<State>,
        legality: &Legality,
        force: bool,
    ) -> Result<Self> {
        if states.is_empty() {
            return Err(SemiCrfError::invalid_argument("states must not be empty"));
        }
        let n = states.len();
        if let Legality::Matrix(m) = legality {
            if m.len() != n || m.iter().any(|row| row.len() != n) {
                return Err(SemiCrfError::config(format!(
                    "legality matrix must be {n}x{n}"
                )));
            }
        }

        for (s, state) in states.iter().enumerate() {
            if state.allows_self_loop() && !Self::pair_legal(legality, s, s) && !force {
                return Err(SemiCrfError::config(format!(
                    "state {s} ({}) is duration-bounded but its self-loop is illegal",
                    state.name()
                )));
            }
        }

        // Transitions are assigned ids in model order: grouped by destination,
        // ascending by source within a group. Edges into a state are therefore
        // a contiguous id range.
        let mut from = Vec::new();
        let mut to = Vec::new();
        let mut pair_index = vec![-1i32; n * n];
        let mut in_edges = Vec::with_capacity(n);
        let mut self_edge = vec![-1i32; n];
        let mut order = Vec::new();
        for t in 0..n {
            order.push(Potential::Node(t));
            let begin = from.len();
            for f in 0..n {
                let forced = force && f == t && states[t].allows_self_loop();
                if !Self::pair_legal(legality, f, t) && !forced {
                    continue;
                }
                let id = from.len();
                pair_index[f * n + t] = i32::try_from(id)
                    .map_err(|_| SemiCrfError::invalid_argument("too many transitions"))?;
                if f == t {
                    self_edge[t] = pair_index[f * n + t];
                }
                from.push(f);
                to.push(t);
                order.push(Potential::Edge(id));
            }
            in_edges.push((begin, from.len()));
        }

        let max_lookback = states.iter().map(State::max_length).max().unwrap();
        Ok(Self {
            states,
            from,
            to,
            pair_index,
            order,
            in_edges,
            self_edge,
            max_lookback,
        })
    }

    #[inline(always)]
    fn pair_legal(legality: &Legality, f: usize, t: usize) -> bool {
        match legality {
            Legality::AllPaths => true,
            Legality::Matrix(m) => m[f][t],
        }
    }

    /// Number of states.
    #[inline(always)]
    #[must_use]
    pub fn n_states(&self) -> usize {
        self.states.len()
    }

    /// Number of legal transitions.
    #[inline(always)]
    #[must_use]
    pub fn n_transitions(&self) -> usize {
        self.from.len()
    }

    /// Size of the unified potential index space.
    #[inline(always)]
    #[must_use]
    pub fn n_potentials(&self) -> usize {
        self.states.len() + self.from.len()
    }

    /// All states.
    #[inline(always)]
    #[must_use]
    pub fn states(&self) -> &[State] {
        &self.states
    }

    /// The state with the given id.
    #[inline(always)]
    #[must_use]
    pub fn state(&self, s: usize) -> &State {
        &self.states[s]
    }

    /// O(1) lookup of the transition id for `(from, to)`, or `None` if the
    /// pair is illegal.
    #[inline(always)]
    #[must_use]
    pub fn transition_index(&self, f: usize, t: usize) -> Option<usize> {
        let id = self.pair_index[f * self.states.len() + t];
        usize::try_from(id).ok()
    }

    /// Source state of a transition.
    #[inline(always)]
    #[must_use]
    pub fn source(&self, t: usize) -> usize {
        self.from[t]
    }

    /// Destination state of a transition.
    #[inline(always)]
    #[must_use]
    pub fn target(&self, t: usize) -> usize {
        self.to[t]
    }

    /// The canonical model-ordered potential enumeration.
    #[inline(always)]
    #[must_use]
    pub fn model_order(&self) -> &[Potential] {
        &self.order
    }

    /// Ids of the transitions entering a state, as a contiguous range.
    #[inline(always)]
    #[must_use]
    pub fn in_edges(&self, s: usize) -> core::ops::Range<usize> {
        let (begin, end) = self.in_edges[s];
        begin..end
    }

    /// Id of the self-loop transition of a state, if legal.
    #[inline(always)]
    #[must_use]
    pub fn self_edge(&self, s: usize) -> Option<usize> {
        usize::try_from(self.self_edge[s]).ok()
    }

    /// Potential index of a state's node potential.
    #[inline(always)]
    #[must_use]
    pub fn node_potential(&self, s: usize) -> usize {
        debug_assert!(s < self.states.len());
        s
    }

    /// Potential index of a transition's edge potential.
    #[inline(always)]
    #[must_use]
    pub fn edge_potential(&self, t: usize) -> usize {
        self.states.len() + t
    }

    /// Longest segment any state may span.
    #[inline(always)]
    #[must_use]
    pub const fn max_lookback(&self) -> usize {
        self.max_lookback
    }

    /// Returns `true` if any state is duration-bounded.
    #[inline(always)]
    #[must_use]
    pub const fn has_durations(&self) -> bool {
        self.max_lookback > 1
    }

    /// Ids of duration-bounded states.
    #[must_use]
    pub fn duration_states(&self) -> Vec<usize> {
        (0..self.states.len())
            .filter(|&s| self.states[s].allows_self_loop())
            .collect()
    }
}
