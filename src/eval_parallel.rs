/*!
# Evaluation-parallel sampler with dynamic early stopping

A persistent pool of workers pulls raw simulate/accept work items from a shared
ledger until the ledger reports that `n` acceptances have been recorded. The
ledger is a mutex-guarded accumulator with a condition variable:

- `claim` hands out a ticket only while the number of in-flight items stays
  within the speculation budget for the current deficit, and blocks otherwise;
- `complete` records the outcome, keeps the particle only while fewer than `n`
  have been accepted, and wakes every waiting worker.

Once `n` is reached (or a failure is recorded) every further `claim` returns
`None`. Items already running finish, count toward `n_evaluated` and are
discarded if they come in late. The call returns only after every worker has
left the ledger, so nothing from one generation leaks into the next.
*/

use std::sync::{Condvar, Mutex, PoisonError};

use indicatif::ProgressBar;
use rayon::ThreadPool;

use crate::config::PoolConfig;
use crate::core::{acceptance_progress, check_population_size, report_rate, worker_pool, Sampler};
use crate::error::SamplerError;
use crate::estimate::AcceptanceEstimate;
use crate::model::{Evaluation, Model};
use crate::population::{AcceptedPopulation, WorkerState, WorkerStatus};

struct LedgerState<P> {
    n: usize,
    issued: u64,
    in_flight: usize,
    evaluated: usize,
    estimate: AcceptanceEstimate,
    particles: Vec<(u64, P)>,
    failure: Option<SamplerError>,
}

impl<P> LedgerState<P> {
    fn finished(&self) -> bool {
        self.failure.is_some() || self.particles.len() >= self.n
    }
}

/// Shared accumulator for one generation.
struct Ledger<P> {
    state: Mutex<LedgerState<P>>,
    wake: Condvar,
}

impl<P> Ledger<P> {
    fn new(n: usize) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                n,
                issued: 0,
                in_flight: 0,
                evaluated: 0,
                estimate: AcceptanceEstimate::new(),
                particles: Vec::with_capacity(n),
                failure: None,
            }),
            wake: Condvar::new(),
        }
    }

    /// Blocks until a work item may be started; `None` once the generation is over.
    fn claim(&self) -> Option<u64> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if state.finished() {
                return None;
            }
            let deficit = state.n - state.particles.len();
            let budget = state.estimate.budget(deficit).max(1);
            if state.in_flight < budget {
                state.in_flight += 1;
                let ticket = state.issued;
                state.issued += 1;
                return Some(ticket);
            }
            state = self
                .wake
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Records one finished work item. Returns `true` if it added a particle.
    fn complete(&self, ticket: u64, outcome: Result<Evaluation<P>, SamplerError>) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.in_flight -= 1;
        let mut kept = false;
        match outcome {
            Ok(evaluation) => {
                state.evaluated += 1;
                let accepted = evaluation.is_accepted();
                state.estimate.observe(usize::from(accepted), 1);
                if let Evaluation::Accepted(particle) = evaluation {
                    if state.particles.len() < state.n {
                        state.particles.push((ticket, particle));
                        kept = true;
                    }
                }
            }
            Err(err) => {
                if state.failure.is_none() {
                    log::debug!("work item {ticket} failed, stopping the generation: {err}");
                    state.failure = Some(err);
                }
            }
        }
        drop(state);
        self.wake.notify_all();
        kept
    }

    fn snapshot(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        (state.particles.len(), state.evaluated)
    }

    fn into_result(self) -> Result<AcceptedPopulation<P>, SamplerError> {
        let state = self
            .state
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        debug_assert_eq!(state.in_flight, 0);
        if let Some(err) = state.failure {
            return Err(err);
        }
        let mut particles = state.particles;
        particles.sort_by_key(|(ticket, _)| *ticket);
        Ok(AcceptedPopulation::new(
            particles.into_iter().map(|(_, particle)| particle).collect(),
            state.evaluated,
        ))
    }
}

fn work<P>(ledger: &Ledger<P>, model: &Model<P>, slot: &Mutex<WorkerState>, pb: &ProgressBar) {
    while let Some(ticket) = ledger.claim() {
        let outcome = model.evaluate();
        let accepted = matches!(outcome, Ok(Evaluation::Accepted(_)));
        let failed = outcome.is_err();
        if ledger.complete(ticket, outcome) {
            pb.inc(1);
            let (accepted_total, evaluated) = ledger.snapshot();
            report_rate(pb, accepted_total, evaluated);
        }
        if !failed {
            slot.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record(accepted);
        }
    }
}

/// Dynamic early-stopping sampler over a persistent local pool.
pub struct MulticoreEvalParallelSampler {
    config: PoolConfig,
    pool: Option<ThreadPool>,
    workers: Vec<WorkerState>,
    show_progress: bool,
}

impl MulticoreEvalParallelSampler {
    pub fn new(n_workers: usize) -> Result<Self, SamplerError> {
        Self::from_config(PoolConfig::with_workers(n_workers))
    }

    pub fn from_config(config: PoolConfig) -> Result<Self, SamplerError> {
        config.validate()?;
        let pool = worker_pool(config.n_workers, "abc-eval")?;
        let workers = (0..config.n_workers).map(WorkerState::new).collect();
        Ok(Self {
            config,
            pool: Some(pool),
            workers,
            show_progress: false,
        })
    }

    pub fn show_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn n_workers(&self) -> usize {
        self.config.n_workers
    }

    pub fn worker_states(&self) -> &[WorkerState] {
        &self.workers
    }
}

impl<P: Send> Sampler<P> for MulticoreEvalParallelSampler {
    fn sample_until_n_accepted(
        &mut self,
        n: usize,
        model: &Model<P>,
    ) -> Result<AcceptedPopulation<P>, SamplerError> {
        check_population_size(n)?;
        if self.pool.is_none() {
            self.pool = Some(worker_pool(self.config.n_workers, "abc-eval")?);
        }
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| SamplerError::config("worker pool unavailable"))?;

        let ledger = Ledger::new(n);
        let pb = acceptance_progress(n, "eval", self.show_progress);
        let slots: Vec<Mutex<WorkerState>> = self
            .workers
            .drain(..)
            .map(|mut state| {
                state.status = WorkerStatus::Running;
                Mutex::new(state)
            })
            .collect();

        pool.scope(|scope| {
            for slot in &slots {
                let (ledger, pb) = (&ledger, &pb);
                scope.spawn(move |_| work(ledger, model, slot, pb));
            }
        });

        self.workers = slots
            .into_iter()
            .map(|slot| {
                let mut state = slot.into_inner().unwrap_or_else(PoisonError::into_inner);
                state.status = WorkerStatus::Idle;
                state
            })
            .collect();
        pb.finish_and_clear();

        let population = ledger.into_result()?;
        log::debug!(
            "eval-parallel generation: {n} accepted of {} evaluated",
            population.n_evaluated()
        );
        Ok(population)
    }

    fn cleanup(&mut self) {
        if self.pool.take().is_some() {
            log::info!("stopped abc-eval pool");
        }
        for state in &mut self.workers {
            state.status = WorkerStatus::Stopped;
        }
    }
}
