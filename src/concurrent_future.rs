/*!
# Future-based sampler

Sliding-window dispatch (see [`crate::window`]) over any [`Executor`]. The
thread-pool and thread-per-job variants differ only in the executor they are
given.

```rust
use abc_samplers::concurrent_future::ConcurrentFutureSampler;
use abc_samplers::config::WindowConfig;
use abc_samplers::core::Sampler;
use abc_samplers::executor::ThreadPoolExecutor;
use abc_samplers::model::Model;

let executor = ThreadPoolExecutor::new(2).unwrap();
let mut sampler = ConcurrentFutureSampler::new(executor, WindowConfig::new(8, 15)).unwrap();
let population = sampler
    .sample_until_n_accepted(40, &Model::infallible(|| 1_u8, |_| true))
    .unwrap();
assert_eq!(population.n_evaluated(), 40);
assert_eq!(sampler.last_stats().submissions, 3);
```
*/

use crossbeam_channel::Select;

use crate::config::WindowConfig;
use crate::core::{acceptance_progress, check_population_size, Sampler};
use crate::error::{SamplerError, TransportError};
use crate::executor::{Executor, JobHandle, SpawnExecutor, ThreadPoolExecutor};
use crate::model::Model;
use crate::population::AcceptedPopulation;
use crate::window::{run_unit, run_window, Resolution, UnitBackend, UnitOutcome, UnitRequest, WindowStats};

type UnitResult<P> = Result<UnitOutcome<P>, SamplerError>;

/// Units in flight on an executor for the current generation.
struct FutureUnits<'a, P, E> {
    executor: &'a E,
    model: &'a Model<P>,
    pending: Vec<(u64, JobHandle<UnitResult<P>>)>,
}

impl<P, E> UnitBackend<P> for FutureUnits<'_, P, E>
where
    P: Send + 'static,
    E: Executor,
{
    fn submit(&mut self, unit: UnitRequest) -> Result<(), TransportError> {
        let model = self.model.clone();
        let handle = self.executor.submit(move || run_unit(&model, &unit))?;
        self.pending.push((unit.id, handle));
        Ok(())
    }

    fn next_resolved(&mut self) -> Result<(u64, Resolution<P>), TransportError> {
        if self.pending.is_empty() {
            return Err(TransportError::Disconnected(
                "no outstanding jobs to wait for".into(),
            ));
        }
        let (index, received) = {
            let mut select = Select::new();
            for (_, handle) in &self.pending {
                select.recv(handle.receiver());
            }
            let operation = select.select();
            let index = operation.index();
            (index, operation.recv(self.pending[index].1.receiver()))
        };
        let (id, _) = self.pending.swap_remove(index);
        let resolution = match received {
            Ok(Ok(outcome)) => Resolution::Done(outcome),
            Ok(Err(err)) => Resolution::Failed(err),
            Err(_) => Resolution::Lost(TransportError::Lost(format!(
                "job for unit {id} ended without a result"
            ))),
        };
        Ok((id, resolution))
    }
}

/// Bounded-window sampler over an injectable executor.
pub struct ConcurrentFutureSampler<E> {
    executor: E,
    config: WindowConfig,
    last_stats: WindowStats,
    total_submissions: usize,
    show_progress: bool,
}

impl<E: Executor> ConcurrentFutureSampler<E> {
    pub fn new(executor: E, config: WindowConfig) -> Result<Self, SamplerError> {
        config.validate()?;
        Ok(Self {
            executor,
            config,
            last_stats: WindowStats::default(),
            total_submissions: 0,
            show_progress: false,
        })
    }

    pub fn show_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Dispatch counters of the most recent generation.
    pub fn last_stats(&self) -> WindowStats {
        self.last_stats
    }

    /// Submissions over the sampler's lifetime.
    pub fn total_submissions(&self) -> usize {
        self.total_submissions
    }
}

impl ConcurrentFutureSampler<ThreadPoolExecutor> {
    /// Thread-pool variant: `n_workers` pool threads, at most 8 jobs in flight.
    pub fn thread_pool(n_workers: usize, batchsize: usize) -> Result<Self, SamplerError> {
        Self::new(ThreadPoolExecutor::new(n_workers)?, WindowConfig::new(8, batchsize))
    }
}

impl ConcurrentFutureSampler<SpawnExecutor> {
    /// Thread-per-job variant with at most `client_max_jobs` jobs in flight.
    pub fn spawning(client_max_jobs: usize, batchsize: usize) -> Result<Self, SamplerError> {
        Self::new(SpawnExecutor, WindowConfig::new(client_max_jobs, batchsize))
    }
}

impl<P, E> Sampler<P> for ConcurrentFutureSampler<E>
where
    P: Send + 'static,
    E: Executor,
{
    fn sample_until_n_accepted(
        &mut self,
        n: usize,
        model: &Model<P>,
    ) -> Result<AcceptedPopulation<P>, SamplerError> {
        check_population_size(n)?;
        self.config.validate()?;
        let pb = acceptance_progress(n, "future", self.show_progress);
        let mut backend = FutureUnits {
            executor: &self.executor,
            model,
            pending: Vec::new(),
        };
        let (population, stats) = run_window(&mut backend, n, &self.config, &pb)?;
        pb.finish_and_clear();

        self.last_stats = stats;
        self.total_submissions += stats.submissions;
        log::debug!(
            "future generation: {n} accepted of {} evaluated in {} submissions",
            population.n_evaluated(),
            stats.submissions
        );
        Ok(population)
    }

    fn cleanup(&mut self) {
        self.executor.shutdown();
    }
}
