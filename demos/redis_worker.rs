//! A standalone fleet worker plus a coordinator, for running the Redis backend
//! across processes.
//!
//! Start a broker, then one or more workers and finally the coordinator:
//!
//! ```text
//! redis-server --port 6379
//! cargo run --release --example redis_worker -- worker
//! cargo run --release --example redis_worker -- coordinate
//! ```
//!
//! Workers keep serving generations until interrupted. `ABC_REDIS_PORT`
//! overrides the broker port.

use std::error::Error;

use abc_samplers::config::RedisConfig;
use abc_samplers::core::Sampler;
use abc_samplers::model::{Model, ModelRegistry};
use abc_samplers::redis::{RedisEvalParallelSampler, RedisWorker};
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Model index plus simulated observation.
type Particle = (usize, f64);

fn competing_gaussians(epsilon: f64) -> Model<Particle> {
    Model::new(
        || {
            let mut rng = rand::thread_rng();
            let index = rng.gen_range(0..2_usize);
            Ok((index, Normal::new(index as f64, 0.5)?.sample(&mut rng)))
        },
        move |(_, y): &Particle| Ok((y - 1.0).abs() < epsilon),
    )
    .with_name(format!("two-gaussians-{epsilon}"))
}

const EPSILONS: [f64; 3] = [0.5, 0.2, 0.05];

fn config() -> Result<RedisConfig, Box<dyn Error>> {
    let mut config = RedisConfig::default();
    if let Ok(port) = std::env::var("ABC_REDIS_PORT") {
        config.port = port.parse()?;
    }
    Ok(config)
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let config = config()?;

    match std::env::args().nth(1).as_deref() {
        Some("worker") => {
            let registry = ModelRegistry::new();
            for epsilon in EPSILONS {
                registry.register_named(competing_gaussians(epsilon));
            }
            let state = RedisWorker::new(0, config, registry).run()?;
            println!("worker done: {} accepted, {} rejected", state.accepted, state.rejected);
        }
        Some("coordinate") => {
            let mut sampler = RedisEvalParallelSampler::connect(config)?.show_progress(true);
            for epsilon in EPSILONS {
                let population = sampler.sample_until_n_accepted(200, &competing_gaussians(epsilon))?;
                let share = population.particles().iter().filter(|(m, _)| *m == 1).count() as f64
                    / population.len() as f64;
                println!(
                    "epsilon {epsilon}: p(model 1 | y) = {share:.3} from {} simulations",
                    population.n_evaluated()
                );
            }
            sampler.cleanup();
        }
        _ => eprintln!("usage: redis_worker (worker | coordinate)"),
    }
    Ok(())
}
