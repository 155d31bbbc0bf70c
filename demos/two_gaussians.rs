//! Rejection ABC model selection between two Gaussian models, run on every local backend.
//!
//! Run with `cargo run --release --example two_gaussians`; set `RUST_LOG=debug`
//! to watch the samplers size their batches.

use std::error::Error;
use std::time::Instant;

use abc_samplers::concurrent_future::ConcurrentFutureSampler;
use abc_samplers::core::Sampler;
use abc_samplers::distributed::{DaskDistributedSampler, LocalCluster};
use abc_samplers::eval_parallel::MulticoreEvalParallelSampler;
use abc_samplers::mapping::{MappingSampler, RayonMap};
use abc_samplers::model::Model;
use abc_samplers::particle_parallel::MulticoreParticleParallelSampler;
use abc_samplers::single_core::SingleCoreSampler;
use rand::Rng;
use rand_distr::{Distribution, Normal};

const OBSERVED: f64 = 1.0;
const POPULATION: usize = 500;
const EPSILONS: [f64; 4] = [0.5, 0.2, 0.1, 0.05];

fn competing_gaussians(epsilon: f64) -> Model<(usize, f64)> {
    Model::new(
        || {
            let mut rng = rand::thread_rng();
            let index = rng.gen_range(0..2_usize);
            Ok((index, Normal::new(index as f64, 0.5)?.sample(&mut rng)))
        },
        move |(_, y): &(usize, f64)| Ok((y - OBSERVED).abs() < epsilon),
    )
}

fn run(name: &str, mut sampler: Box<dyn Sampler<(usize, f64)>>) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    let mut share = 0.0;
    let mut evaluated = 0;
    for epsilon in EPSILONS {
        let population = sampler.sample_until_n_accepted(POPULATION, &competing_gaussians(epsilon))?;
        evaluated += population.n_evaluated();
        share = population.particles().iter().filter(|(m, _)| *m == 1).count() as f64
            / POPULATION as f64;
    }
    sampler.cleanup();
    println!(
        "{name:<18} p(model 1 | y) = {share:.3}  {evaluated:>7} simulations  {:>8.1?}",
        start.elapsed()
    );
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let n_workers = std::thread::available_parallelism().map_or(4, |n| n.get());

    println!("exact posterior of model 1: {:.3}", 1.0 / (1.0 + (-2.0_f64).exp()));
    run("single-core", Box::new(SingleCoreSampler::new().show_progress(true)))?;
    run(
        "mapping",
        Box::new(MappingSampler::new(RayonMap::new(n_workers)?).show_progress(true)),
    )?;
    run(
        "particle-parallel",
        Box::new(MulticoreParticleParallelSampler::new(n_workers)?.show_progress(true)),
    )?;
    run(
        "eval-parallel",
        Box::new(MulticoreEvalParallelSampler::new(n_workers)?.show_progress(true)),
    )?;
    run(
        "concurrent-future",
        Box::new(ConcurrentFutureSampler::thread_pool(n_workers, 20)?.show_progress(true)),
    )?;
    run(
        "distributed",
        Box::new(
            DaskDistributedSampler::<LocalCluster<(usize, f64)>>::local(n_workers, 20)?
                .show_progress(true),
        ),
    )?;
    Ok(())
}
