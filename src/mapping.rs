/*!
# Mapping sampler

Dispatches whole batches of work items through an injectable order-preserving
map primitive. Each round sizes its batch from the running acceptance
estimate (see [`crate::estimate`]), maps `Model::evaluate` over it, keeps the
acceptances in input order and, if still short of `n`, goes again with a batch
sized from the rate observed so far.

Any type implementing [`ParallelMap`] can be injected. Two are shipped:

- [`SerialMap`] maps in the calling thread (the default);
- [`RayonMap`] maps on a dedicated rayon pool.
*/

use rayon::prelude::*;
use rayon::ThreadPool;

use crate::config::PoolConfig;
use crate::core::{acceptance_progress, check_population_size, report_rate, worker_pool, Sampler};
use crate::error::SamplerError;
use crate::estimate::AcceptanceEstimate;
use crate::model::{Evaluation, Model};
use crate::population::AcceptedPopulation;

/// "Map a callable over inputs, preserving order."
pub trait ParallelMap {
    /// Applies `f` to every input and returns the outputs in input order.
    fn map<T, R, F>(&self, f: F, inputs: Vec<T>) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Send + Sync;
}

/// Plain iterator map in the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialMap;

impl ParallelMap for SerialMap {
    fn map<T, R, F>(&self, f: F, inputs: Vec<T>) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Send + Sync,
    {
        inputs.into_iter().map(f).collect()
    }
}

/// Order-preserving map on a fixed-size rayon pool.
pub struct RayonMap {
    pool: ThreadPool,
}

impl RayonMap {
    pub fn new(n_workers: usize) -> Result<Self, SamplerError> {
        PoolConfig::with_workers(n_workers).validate()?;
        Ok(Self {
            pool: worker_pool(n_workers, "abc-map")?,
        })
    }

    pub fn n_workers(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl ParallelMap for RayonMap {
    fn map<T, R, F>(&self, f: F, inputs: Vec<T>) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Send + Sync,
    {
        self.pool
            .install(|| inputs.into_par_iter().map(f).collect())
    }
}

/// Batch sampler over an injectable [`ParallelMap`].
pub struct MappingSampler<M = SerialMap> {
    map: M,
    initial_rate: Option<f64>,
    max_batch_size: Option<usize>,
    show_progress: bool,
}

impl Default for MappingSampler<SerialMap> {
    fn default() -> Self {
        Self::new(SerialMap)
    }
}

impl<M: ParallelMap> MappingSampler<M> {
    pub fn new(map: M) -> Self {
        Self {
            map,
            initial_rate: None,
            max_batch_size: None,
            show_progress: false,
        }
    }

    /// Acceptance-rate hint used to size the first batch of every generation.
    pub fn initial_rate(mut self, rate: f64) -> Self {
        self.initial_rate = Some(rate);
        self
    }

    /// Upper bound on the number of work items handed to one map call.
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = Some(size);
        self
    }

    pub fn show_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn map_primitive(&self) -> &M {
        &self.map
    }
}

impl<P: Send, M: ParallelMap> Sampler<P> for MappingSampler<M> {
    fn sample_until_n_accepted(
        &mut self,
        n: usize,
        model: &Model<P>,
    ) -> Result<AcceptedPopulation<P>, SamplerError> {
        check_population_size(n)?;
        if self.max_batch_size == Some(0) {
            return Err(SamplerError::config("max_batch_size must be at least 1"));
        }
        let mut estimate = match self.initial_rate {
            Some(rate) => AcceptanceEstimate::with_prior(rate),
            None => AcceptanceEstimate::new(),
        };
        let pb = acceptance_progress(n, "mapping", self.show_progress);

        let mut particles = Vec::with_capacity(n);
        let mut n_evaluated = 0;
        let mut previous = 0;
        let mut round = 0;
        while particles.len() < n {
            let deficit = n - particles.len();
            let mut batch = estimate.next_batch(deficit, previous);
            if let Some(cap) = self.max_batch_size {
                batch = batch.min(cap);
            }
            log::debug!(
                "mapping round {round}: {batch} items for a deficit of {deficit} (rate {:.3})",
                estimate.rate()
            );

            let outcomes = self
                .map
                .map(|_| model.evaluate(), (0..batch).collect::<Vec<usize>>());

            let mut accepted_here = 0;
            for outcome in outcomes {
                n_evaluated += 1;
                if let Evaluation::Accepted(particle) = outcome? {
                    accepted_here += 1;
                    if particles.len() < n {
                        particles.push(particle);
                        pb.inc(1);
                    }
                }
            }
            estimate.observe(accepted_here, batch);
            report_rate(&pb, particles.len(), n_evaluated);
            previous = batch;
            round += 1;
        }
        pb.finish_and_clear();

        Ok(AcceptedPopulation::new(particles, n_evaluated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Serial map that records the size of every batch it is asked to run.
    #[derive(Default)]
    struct RecordingMap {
        batches: Mutex<Vec<usize>>,
    }

    impl ParallelMap for RecordingMap {
        fn map<T, R, F>(&self, f: F, inputs: Vec<T>) -> Vec<R>
        where
            T: Send,
            R: Send,
            F: Fn(T) -> R + Send + Sync,
        {
            self.batches.lock().unwrap().push(inputs.len());
            inputs.into_iter().map(f).collect()
        }
    }

    fn one_in(k: usize) -> Model<usize> {
        let counter = Arc::new(AtomicUsize::new(0));
        Model::infallible(
            move || counter.fetch_add(1, Ordering::SeqCst),
            move |x: &usize| x % k == 0,
        )
    }

    #[test]
    fn all_accepted_needs_a_single_exact_batch() {
        let mut sampler = MappingSampler::new(RecordingMap::default());
        let population = sampler
            .sample_until_n_accepted(30, &Model::infallible(|| 1_u8, |_| true))
            .unwrap();
        assert_eq!(population.len(), 30);
        assert_eq!(population.n_evaluated(), 30);
        assert_eq!(*sampler.map_primitive().batches.lock().unwrap(), vec![30]);
    }

    #[test]
    fn batches_grow_from_the_observed_rate() {
        let mut sampler = MappingSampler::new(RecordingMap::default());
        let population = sampler.sample_until_n_accepted(20, &one_in(4)).unwrap();
        assert_eq!(population.len(), 20);
        assert!(population.particles().iter().all(|x| x % 4 == 0));

        let batches = sampler.map_primitive().batches.lock().unwrap().clone();
        assert_eq!(batches[0], 20);
        for pair in batches.windows(2) {
            assert!(pair[1] <= 2 * pair[0] || pair[1] <= 20);
        }
        assert_eq!(batches.iter().sum::<usize>(), population.n_evaluated());
    }

    #[test]
    fn initial_rate_hint_sizes_the_first_batch() {
        let mut sampler = MappingSampler::new(RecordingMap::default()).initial_rate(0.25);
        sampler.sample_until_n_accepted(10, &one_in(4)).unwrap();
        assert_eq!(sampler.map_primitive().batches.lock().unwrap()[0], 40);
    }

    #[test]
    fn max_batch_size_caps_every_round() {
        let mut sampler = MappingSampler::new(RecordingMap::default()).max_batch_size(7);
        let population = sampler.sample_until_n_accepted(20, &one_in(2)).unwrap();
        assert_eq!(population.len(), 20);
        let batches = sampler.map_primitive().batches.lock().unwrap().clone();
        assert!(batches.iter().all(|&b| b <= 7));

        let mut bad = MappingSampler::default().max_batch_size(0);
        assert!(matches!(
            bad.sample_until_n_accepted(1, &one_in(1)),
            Err(SamplerError::Configuration(_))
        ));
    }

    #[test]
    fn rayon_map_preserves_order() {
        let map = RayonMap::new(4).unwrap();
        assert_eq!(map.n_workers(), 4);
        let out = map.map(|x: usize| x * 10, (0..100).collect());
        assert_eq!(out, (0..100).map(|x| x * 10).collect::<Vec<_>>());
        assert!(RayonMap::new(0).is_err());
    }

    #[test]
    fn rayon_mapping_sampler_contract() {
        let mut sampler = MappingSampler::new(RayonMap::new(3).unwrap());
        let population = sampler.sample_until_n_accepted(25, &one_in(3)).unwrap();
        assert_eq!(population.len(), 25);
        assert!(population.n_evaluated() >= 25);
    }

    #[test]
    fn failure_in_a_batch_aborts_the_call() {
        let model: Model<u8> = Model::new(|| Err("no convergence".into()), |_| Ok(true));
        let err = MappingSampler::default()
            .sample_until_n_accepted(5, &model)
            .unwrap_err();
        assert!(err.is_simulation());
    }
}
