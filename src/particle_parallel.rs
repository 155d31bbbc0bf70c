/*!
# Particle-parallel sampler

One generation is one synchronized parallel batch of `n` tasks on a rayon pool.
Each task loops simulate/accept until it produces its own acceptance, so the
parallelism is across accepted particles rather than raw simulations and no
cross-task coordination is needed. `n_evaluated` sums every task's private
loop count.

Overshoot is not bounded: every task keeps running until it succeeds even when
other tasks were luckier. The first failing task raises an abort flag that the
remaining tasks check between attempts.
*/

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use rayon::prelude::*;
use rayon::ThreadPool;

use crate::config::PoolConfig;
use crate::core::{acceptance_progress, check_population_size, worker_pool, Sampler};
use crate::error::{SamplerError, TransportError};
use crate::model::{Evaluation, Model};
use crate::population::{AcceptedPopulation, WorkerState, WorkerStatus};

/// Fixed-batch sampler, one task per accepted particle.
pub struct MulticoreParticleParallelSampler {
    config: PoolConfig,
    pool: Option<ThreadPool>,
    workers: Vec<WorkerState>,
    show_progress: bool,
}

impl MulticoreParticleParallelSampler {
    /// Creates the sampler and its pool of `n_workers` threads.
    pub fn new(n_workers: usize) -> Result<Self, SamplerError> {
        Self::from_config(PoolConfig::with_workers(n_workers))
    }

    pub fn from_config(config: PoolConfig) -> Result<Self, SamplerError> {
        config.validate()?;
        let pool = worker_pool(config.n_workers, "abc-particle")?;
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

    /// Per-thread totals accumulated over every generation so far.
    pub fn worker_states(&self) -> &[WorkerState] {
        &self.workers
    }

    /// Rebuilds the pool if `cleanup` released it.
    fn ensure_pool(&mut self) -> Result<(), SamplerError> {
        if self.pool.is_none() {
            self.pool = Some(worker_pool(self.config.n_workers, "abc-particle")?);
        }
        Ok(())
    }
}

/// Loops until one acceptance; returns the particle and the attempts it took,
/// or `None` if another task aborted the generation first.
fn until_accepted<P>(
    model: &Model<P>,
    aborted: &AtomicBool,
) -> Result<Option<(P, usize)>, SamplerError> {
    let mut attempts = 0;
    while !aborted.load(Ordering::Relaxed) {
        attempts += 1;
        if let Evaluation::Accepted(particle) = model.evaluate()? {
            return Ok(Some((particle, attempts)));
        }
    }
    Ok(None)
}

/// The first recorded failure wins over whatever the tasks returned.
fn settle<T>(results: Option<Vec<T>>, failure: Option<SamplerError>) -> Result<Vec<T>, SamplerError> {
    match (results, failure) {
        (_, Some(err)) => Err(err),
        (Some(results), None) => Ok(results),
        (None, None) => Err(TransportError::Disconnected(
            "a particle task stopped without a result or a failure".into(),
        )
        .into()),
    }
}

impl<P: Send> Sampler<P> for MulticoreParticleParallelSampler {
    fn sample_until_n_accepted(
        &mut self,
        n: usize,
        model: &Model<P>,
    ) -> Result<AcceptedPopulation<P>, SamplerError> {
        check_population_size(n)?;
        self.ensure_pool()?;
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| SamplerError::config("worker pool unavailable"))?;
        let pb = acceptance_progress(n, "particle", self.show_progress);
        let slots: Vec<Mutex<WorkerState>> = self
            .workers
            .drain(..)
            .map(|mut state| {
                state.status = WorkerStatus::Running;
                Mutex::new(state)
            })
            .collect();

        let aborted = AtomicBool::new(false);
        let failure: Mutex<Option<SamplerError>> = Mutex::new(None);
        let results: Option<Vec<(P, usize)>> = pool.install(|| {
            (0..n)
                .into_par_iter()
                .map(|_| {
                    let (particle, attempts) = match until_accepted(model, &aborted) {
                        Ok(found) => found?,
                        Err(err) => {
                            aborted.store(true, Ordering::Relaxed);
                            failure
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .get_or_insert(err);
                            return None;
                        }
                    };
                    if let Some(slot) = rayon::current_thread_index().and_then(|i| slots.get(i)) {
                        let mut state = slot.lock().unwrap_or_else(PoisonError::into_inner);
                        state.accepted += 1;
                        state.rejected += attempts as u64 - 1;
                    }
                    pb.inc(1);
                    Some((particle, attempts))
                })
                .collect()
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

        let failure = failure.into_inner().unwrap_or_else(PoisonError::into_inner);
        let results = settle(results, failure)?;
        let n_evaluated = results.iter().map(|(_, attempts)| attempts).sum();
        let particles = results.into_iter().map(|(particle, _)| particle).collect();
        log::debug!("particle-parallel generation: {n} accepted of {n_evaluated}");
        Ok(AcceptedPopulation::new(particles, n_evaluated))
    }

    fn cleanup(&mut self) {
        if self.pool.take().is_some() {
            log::info!("stopped abc-particle pool");
        }
        for state in &mut self.workers {
            state.status = WorkerStatus::Stopped;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn halves() -> Model<usize> {
        let counter = Arc::new(AtomicUsize::new(0));
        Model::infallible(
            move || counter.fetch_add(1, Ordering::SeqCst),
            |x: &usize| x % 2 == 1,
        )
    }

    #[test]
    fn every_task_contributes_one_particle() {
        let mut sampler = MulticoreParticleParallelSampler::new(4).unwrap();
        let population = sampler.sample_until_n_accepted(50, &halves()).unwrap();
        assert_eq!(population.len(), 50);
        assert!(population.particles().iter().all(|x| x % 2 == 1));
        assert!(population.n_evaluated() >= 100);

        let states = sampler.worker_states();
        assert_eq!(states.len(), 4);
        let accepted: u64 = states.iter().map(|s| s.accepted).sum();
        let evaluated: u64 = states.iter().map(WorkerState::evaluated).sum();
        assert_eq!(accepted, 50);
        assert_eq!(evaluated as usize, population.n_evaluated());
        assert!(states.iter().all(|s| s.status == WorkerStatus::Idle));
    }

    #[test]
    fn all_accepted_wastes_nothing() {
        let mut sampler = MulticoreParticleParallelSampler::new(3).unwrap();
        let population = sampler
            .sample_until_n_accepted(17, &Model::infallible(|| (), |_| true))
            .unwrap();
        assert_eq!(population.n_evaluated(), 17);
    }

    #[test]
    fn pool_is_reused_and_rebuilt_after_cleanup() {
        let mut sampler = MulticoreParticleParallelSampler::new(2).unwrap();
        for _ in 0..3 {
            let population = sampler.sample_until_n_accepted(5, &halves()).unwrap();
            assert_eq!(population.len(), 5);
        }
        Sampler::<usize>::cleanup(&mut sampler);
        Sampler::<usize>::cleanup(&mut sampler);
        assert!(sampler
            .worker_states()
            .iter()
            .all(|s| s.status == WorkerStatus::Stopped));
        let population = sampler.sample_until_n_accepted(5, &halves()).unwrap();
        assert_eq!(population.len(), 5);
    }

    #[test]
    fn zero_workers_is_rejected() {
        assert!(matches!(
            MulticoreParticleParallelSampler::new(0),
            Err(SamplerError::Configuration(_))
        ));
    }

    #[test]
    fn failure_is_propagated() {
        let model: Model<u8> = Model::new(|| Ok(1), |_| Err("distance undefined".into()));
        let err = MulticoreParticleParallelSampler::new(2)
            .unwrap()
            .sample_until_n_accepted(4, &model)
            .unwrap_err();
        assert!(err.is_simulation());
    }

    /// A single failing draw must stop tasks that would otherwise never accept.
    #[test]
    fn failure_aborts_tasks_that_never_accept() {
        let counter = Arc::new(AtomicUsize::new(0));
        let model = Model::new(
            move || {
                let i = counter.fetch_add(1, Ordering::SeqCst);
                if i == 20 {
                    Err("diverged".into())
                } else {
                    Ok(i)
                }
            },
            |_: &usize| Ok(false),
        );
        let err = MulticoreParticleParallelSampler::new(3)
            .unwrap()
            .sample_until_n_accepted(6, &model)
            .unwrap_err();
        assert!(err.to_string().contains("diverged"));
    }

    #[test]
    fn settling_prefers_the_recorded_failure() {
        let failure = SamplerError::simulation("simulate_one", "diverged");
        assert!(settle(Some(vec![1, 2]), Some(failure)).unwrap_err().is_simulation());
        assert_eq!(settle::<u8>(Some(vec![3]), None).unwrap(), vec![3]);
        // an abort nobody reported is a backend fault, not a configuration one
        let err = settle::<u8>(None, None).unwrap_err();
        assert!(err.is_transport());
    }
}
