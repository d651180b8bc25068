use std::sync::Mutex;
use std::thread;

use alloc::vec::Vec;

use argmin::core::observers::ObserverMode;
use argmin::core::{CostFunction, Executor, Gradient};
use argmin::solver::linesearch::condition::ArmijoCondition;
use argmin::solver::linesearch::BacktrackingLineSearch;
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use argmin_observer_slog::SlogLogger;

use crate::cache::FeatureCache;
use crate::errors::SemiCrfError;
use crate::feature::FeatureSource;
use crate::forward_backward::ForwardBackward;
use crate::model::Model;
use crate::semi_markov::SemiMarkovForwardBackward;
use crate::sequence::TrainingSequence;
use crate::similarity::LocalSimilarity;
use crate::transition::TransitionModel;
use crate::Result;

/// L1- or L2- regularization settings
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Regularization {
    /// Performs L1-regularization.
    L1,

    /// Performs L2-regularization.
    L2,
}

/// Training objective driven through the optimizer contract.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Objective {
    /// Maximize the log-likelihood of the training labels.
    LogLikelihood,

    /// Maximize the expected number of positions labeled like the training
    /// labels. Pure Markov models only.
    LocalSimilarity,
}

/// Per-worker DP state; each worker owns its own arenas, the cache is
/// shared read-only.
enum Arena {
    Markov(ForwardBackward, LocalSimilarity),
    Semi(SemiMarkovForwardBackward),
}

impl Arena {
    fn new(tm: &TransitionModel, max_len: usize) -> Self {
        if tm.has_durations() {
            Self::Semi(SemiMarkovForwardBackward::new(tm, max_len))
        } else {
            Self::Markov(
                ForwardBackward::new(tm, max_len),
                LocalSimilarity::new(tm, max_len),
            )
        }
    }
}

struct SequencesLoss<'a> {
    cache: &'a FeatureCache<'a>,
    objective: Objective,
    n_threads: usize,
    l2_lambda: Option<f64>,
}

impl<'a> SequencesLoss<'a> {
    fn new(
        cache: &'a FeatureCache<'a>,
        objective: Objective,
        n_threads: usize,
        l2_lambda: Option<f64>,
    ) -> Self {
        Self {
            cache,
            objective,
            n_threads,
            l2_lambda,
        }
    }
}

impl CostFunction for SequencesLoss<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        let tm = self.cache.transition_model();
        let (s, r) = crossbeam_channel::unbounded();
        for seq in 0..self.cache.n_sequences() {
            s.send(seq).unwrap();
        }
        let mut loss_total = thread::scope(|scope| {
            let mut threads = vec![];
            for _ in 0..self.n_threads {
                let t = scope.spawn(|| {
                    let mut arena = Arena::new(tm, self.cache.longest());
                    let mut loss_total = 0.0;
                    while let Ok(seq) = r.try_recv() {
                        match &mut arena {
                            Arena::Markov(fb, sim) => {
                                fb.run(self.cache, seq, param);
                                match self.objective {
                                    Objective::LogLikelihood => {
                                        loss_total += fb.loss(self.cache, seq, param);
                                    }
                                    Objective::LocalSimilarity => {
                                        sim.run(fb, self.cache, seq, param);
                                        loss_total -= sim.expected_matches();
                                    }
                                }
                            }
                            Arena::Semi(fb) => {
                                fb.run(self.cache, seq, param);
                                loss_total += fb.loss(self.cache, seq, param);
                            }
                        }
                    }
                    loss_total
                });
                threads.push(t);
            }
            let mut loss_total = 0.0;
            for t in threads {
                loss_total += t.join().unwrap();
            }
            loss_total
        });

        loss_total /= self.cache.total_positions() as f64;

        if let Some(lambda) = self.l2_lambda {
            let mut norm2 = 0.0;
            for &p in param {
                norm2 += p * p;
            }
            loss_total += lambda * norm2 * 0.5;
        }

        Ok(loss_total)
    }
}

impl Gradient for SequencesLoss<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, param: &Self::Param) -> Result<Self::Gradient, argmin::core::Error> {
        let tm = self.cache.transition_model();
        let (s, r) = crossbeam_channel::unbounded();
        for seq in 0..self.cache.n_sequences() {
            s.send(seq).unwrap();
        }
        let gradients = Mutex::new(vec![0.0; param.len()]);
        thread::scope(|scope| {
            for _ in 0..self.n_threads {
                scope.spawn(|| {
                    let mut arena = Arena::new(tm, self.cache.longest());
                    let mut local_gradients = vec![0.0; param.len()];
                    while let Ok(seq) = r.try_recv() {
                        match &mut arena {
                            Arena::Markov(fb, sim) => {
                                fb.run(self.cache, seq, param);
                                match self.objective {
                                    Objective::LogLikelihood => {
                                        fb.accumulate_gradient(
                                            self.cache,
                                            seq,
                                            param,
                                            &mut local_gradients,
                                        );
                                    }
                                    Objective::LocalSimilarity => {
                                        sim.run(fb, self.cache, seq, param);
                                        // maximize: negate the ascent direction
                                        let mut up = vec![0.0; param.len()];
                                        sim.accumulate_gradient(
                                            fb,
                                            self.cache,
                                            seq,
                                            param,
                                            &mut up,
                                        );
                                        for (g, u) in local_gradients.iter_mut().zip(&up) {
                                            *g -= u;
                                        }
                                    }
                                }
                            }
                            Arena::Semi(fb) => {
                                fb.run(self.cache, seq, param);
                                fb.accumulate_gradient(
                                    self.cache,
                                    seq,
                                    param,
                                    &mut local_gradients,
                                );
                            }
                        }
                    }
                    #[allow(clippy::significant_drop_in_scrutinee)]
                    for (y, x) in gradients.lock().unwrap().iter_mut().zip(local_gradients) {
                        *y += x;
                    }
                });
            }
        });
        let mut gradients = gradients.into_inner().unwrap();

        if self.objective == Objective::LogLikelihood {
            for (g, e) in gradients.iter_mut().zip(self.cache.empirical()) {
                *g -= e;
            }
        }
        let norm = self.cache.total_positions() as f64;
        for g in &mut gradients {
            *g /= norm;
        }

        if let Some(lambda) = self.l2_lambda {
            for (g, p) in gradients.iter_mut().zip(param) {
                *g += lambda * *p;
            }
        }

        Ok(gradients)
    }
}

/// Trainer driving the quasi-Newton optimizer over a cached batch.
pub struct Trainer {
    max_iter: u64,
    n_threads: usize,
    regularization: Regularization,
    lambda: f64,
    objective: Objective,
    discard_invalid: bool,
}

impl Trainer {
    /// Creates a new trainer
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_iter: 100,
            n_threads: 1,
            regularization: Regularization::L2,
            lambda: 0.1,
            objective: Objective::LogLikelihood,
            discard_invalid: false,
        }
    }

    /// Sets the maximum number of iterations
    pub fn max_iter(mut self, max_iter: u64) -> Result<Self> {
        if max_iter == 0 {
            return Err(SemiCrfError::invalid_argument("max_iter must not be 0"));
        }
        self.max_iter = max_iter;
        Ok(self)
    }

    /// Sets regularization settings.
    pub fn regularization(mut self, regularization: Regularization, lambda: f64) -> Result<Self> {
        if lambda < 0.0 {
            return Err(SemiCrfError::invalid_argument(
                "lambda must be greater than or equal to 0.0",
            ));
        }
        self.regularization = regularization;
        self.lambda = lambda;
        Ok(self)
    }

    /// Sets the number of threads
    pub fn n_threads(mut self, n_threads: usize) -> Result<Self> {
        if n_threads == 0 {
            return Err(SemiCrfError::invalid_argument("n_threads must not be 0"));
        }
        self.n_threads = n_threads;
        Ok(self)
    }

    /// Sets the training objective.
    #[must_use]
    pub fn objective(mut self, objective: Objective) -> Self {
        self.objective = objective;
        self
    }

    /// Drops training sequences whose labels fail validation instead of
    /// failing the whole batch.
    #[must_use]
    pub fn discard_invalid(mut self, discard: bool) -> Self {
        self.discard_invalid = discard;
        self
    }

    /// Builds the feature cache, runs the optimizer to convergence, and
    /// returns the trained model.
    ///
    /// # Errors
    ///
    /// Propagates cache-construction `Config` errors (all of them in strict
    /// mode, only total loss of the batch in discard mode), and rejects the
    /// local-similarity objective on duration-bounded models.
    pub fn train(
        &self,
        tm: &TransitionModel,
        sources: &[&dyn FeatureSource],
        seqs: &[TrainingSequence],
    ) -> Result<Model> {
        if self.objective == Objective::LocalSimilarity && tm.has_durations() {
            return Err(SemiCrfError::config(
                "the local-similarity objective requires a pure Markov model".into(),
            ));
        }
        let cache;
        if self.discard_invalid {
            let (c, _kept) = FeatureCache::for_training_discarding(tm, sources, seqs)?;
            cache = c;
        } else {
            cache = FeatureCache::for_training(tm, sources, seqs)?;
        }

        let weights_init = vec![0.0; cache.n_features()];
        let weights = match self.regularization {
            Regularization::L1 => {
                let linesearch = BacktrackingLineSearch::new(ArmijoCondition::new(1e-4).unwrap())
                    .rho(0.5)
                    .unwrap();
                let loss_function =
                    SequencesLoss::new(&cache, self.objective, self.n_threads, None);
                let solver = LBFGS::new(linesearch, 7)
                    .with_l1_regularization(self.lambda)
                    .unwrap();
                let res = Executor::new(loss_function, solver)
                    .configure(|state| state.param(weights_init).max_iters(self.max_iter))
                    .add_observer(SlogLogger::term(), ObserverMode::Always)
                    .run()
                    .unwrap();
                res.state.param.unwrap()
            }
            Regularization::L2 => {
                let linesearch = MoreThuenteLineSearch::new().with_c(1e-4, 0.9).unwrap();
                let loss_function = SequencesLoss::new(
                    &cache,
                    self.objective,
                    self.n_threads,
                    Some(self.lambda),
                );
                let solver = LBFGS::new(linesearch, 7);
                let res = Executor::new(loss_function, solver)
                    .configure(|state| state.param(weights_init).max_iters(self.max_iter))
                    .add_observer(SlogLogger::term(), ObserverMode::Always)
                    .run()
                    .unwrap();
                res.state.param.unwrap()
            }
        };

        Ok(Model::new(weights))
    }
}

impl Default for Trainer {
    fn default() -> Self {
        Self::new()
    }
}
