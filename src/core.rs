use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::SamplerError;
use crate::model::Model;
use crate::population::AcceptedPopulation;

/// The contract every sampling backend implements.
///
/// One call corresponds to one generation of the outer inference algorithm:
/// it keeps dispatching work items until exactly `n` particles have been
/// accepted, then returns them with the total number of simulations run.
pub trait Sampler<P> {
    /// Produces exactly `n` accepted particles.
    ///
    /// Fails with [`SamplerError::Configuration`] when `n == 0`, with
    /// [`SamplerError::Simulation`] when a simulate/accept call fails, and with
    /// [`SamplerError::Transport`] when the backend cannot move work. A caller
    /// never receives a partially filled population.
    fn sample_until_n_accepted(
        &mut self,
        n: usize,
        model: &Model<P>,
    ) -> Result<AcceptedPopulation<P>, SamplerError>;

    /// Releases pools, processes and connections created by the backend.
    ///
    /// Safe to call any number of times, including never.
    fn cleanup(&mut self) {}
}

impl<P, S: Sampler<P> + ?Sized> Sampler<P> for Box<S> {
    fn sample_until_n_accepted(
        &mut self,
        n: usize,
        model: &Model<P>,
    ) -> Result<AcceptedPopulation<P>, SamplerError> {
        (**self).sample_until_n_accepted(n, model)
    }

    fn cleanup(&mut self) {
        (**self).cleanup()
    }
}

/// Rejects an empty generation up front.
pub fn check_population_size(n: usize) -> Result<(), SamplerError> {
    if n == 0 {
        return Err(SamplerError::config(
            "population size n must be at least 1",
        ));
    }
    Ok(())
}

/// Builds a dedicated rayon pool whose threads are named `{label}-{index}`.
pub(crate) fn worker_pool(n_workers: usize, label: &'static str) -> Result<ThreadPool, SamplerError> {
    let pool = ThreadPoolBuilder::new()
        .num_threads(n_workers)
        .thread_name(move |i| format!("{label}-{i}"))
        .build()
        .map_err(|e| SamplerError::config(format!("cannot build {label} pool: {e}")))?;
    log::info!("started {label} pool with {n_workers} workers");
    Ok(pool)
}

/// Progress bar counting accepted particles toward `n`; hidden unless `visible`.
pub(crate) fn acceptance_progress(n: usize, prefix: &'static str, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(n as u64);
    let style = ProgressStyle::default_bar()
        .template("{prefix:12} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .map(|style| style.progress_chars("##-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_prefix(prefix);
    pb
}

/// Jittered exponential delay before retry `attempt`, between 25 ms and 3.2 s.
pub(crate) fn backoff(attempt: usize) -> Duration {
    let ceiling = 50_u64 * (1_u64 << attempt.min(6));
    Duration::from_millis(rand::thread_rng().gen_range(ceiling / 2..=ceiling))
}

/// Updates the bar message with the running acceptance rate.
pub(crate) fn report_rate(pb: &ProgressBar, accepted: usize, evaluated: usize) {
    if pb.is_hidden() || evaluated == 0 {
        return;
    }
    pb.set_message(format!(
        "acc. rate {:.3} ({evaluated} sims)",
        accepted as f64 / evaluated as f64
    ));
}
