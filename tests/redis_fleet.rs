//! End-to-end tests of the Redis fleet. Each test launches its own private
//! broker and is skipped when no `redis-server` executable is installed.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use abc_samplers::config::RedisConfig;
use abc_samplers::core::Sampler;
use abc_samplers::error::SamplerError;
use abc_samplers::model::{Model, ModelRegistry};
use abc_samplers::redis::protocol::{Claim, FleetScripts, Keys};
use abc_samplers::redis::{
    redis_server_available, BrokerConnection, BrokerProcess, RedisEvalParallelSampler,
    RedisEvalParallelSamplerServerStarter, RedisWorker,
};

fn redis_missing() -> bool {
    let _ = env_logger::builder().is_test(true).try_init();
    if redis_server_available("redis-server") {
        return false;
    }
    eprintln!("redis-server not installed, skipping");
    true
}

fn multiples_of(modulus: u64, offset: u64) -> Model<u64> {
    let counter = Arc::new(AtomicU64::new(0));
    Model::infallible(
        move || offset + counter.fetch_add(1, Ordering::SeqCst),
        move |x: &u64| x % modulus == 0,
    )
}

fn quick_config() -> RedisConfig {
    RedisConfig {
        n_workers: 3,
        drain_timeout_ms: 5_000,
        ..RedisConfig::self_managed()
    }
}

#[test]
fn server_starter_fulfils_the_contract() {
    if redis_missing() {
        return;
    }
    let mut sampler = RedisEvalParallelSamplerServerStarter::with_config(quick_config())
        .unwrap()
        .show_progress(false);
    assert_eq!(sampler.n_workers(), 3);
    assert!(sampler.port().is_some_and(|port| port != 0));

    for n in [1, 10, 30] {
        let population = sampler.sample_until_n_accepted(n, &multiples_of(3, 0)).unwrap();
        assert_eq!(population.len(), n);
        assert!(population.n_evaluated() >= n);
        assert!(population.particles().iter().all(|x| x % 3 == 0));
    }

    let all_accepted = Model::infallible(|| 7_u64, |_| true);
    let population = sampler.sample_until_n_accepted(20, &all_accepted).unwrap();
    assert_eq!(population.n_evaluated(), 20);

    let err = sampler
        .sample_until_n_accepted(0, &all_accepted)
        .unwrap_err();
    assert!(matches!(err, SamplerError::Configuration(_)));

    sampler.cleanup();
    sampler.cleanup();
    assert_eq!(sampler.worker_states().len(), 3);
    let evaluated: u64 = sampler.worker_states().iter().map(|s| s.evaluated()).sum();
    assert!(evaluated >= 61);
}

#[test]
fn consecutive_generations_are_isolated() {
    if redis_missing() {
        return;
    }
    let mut sampler = RedisEvalParallelSamplerServerStarter::with_config(quick_config()).unwrap();
    assert_eq!(sampler.last_generation(), None);

    let first = sampler
        .sample_until_n_accepted(15, &multiples_of(2, 0))
        .unwrap();
    let first_generation = sampler.last_generation().unwrap();
    let second = sampler
        .sample_until_n_accepted(15, &multiples_of(2, 1_000_000))
        .unwrap();
    assert_eq!(sampler.last_generation(), Some(first_generation + 1));

    assert!(first.particles().iter().all(|x| *x < 1_000_000));
    // stragglers of the first generation never show up in the second
    assert!(second.particles().iter().all(|x| *x >= 1_000_000));
    sampler.cleanup();
}

#[test]
fn failures_close_the_generation_but_not_the_fleet() {
    if redis_missing() {
        return;
    }
    let mut sampler = RedisEvalParallelSamplerServerStarter::with_config(quick_config()).unwrap();
    let counter = Arc::new(AtomicU64::new(0));
    let failing = Model::new(
        move || {
            let i = counter.fetch_add(1, Ordering::SeqCst);
            if i == 4 {
                Err("simulation diverged".into())
            } else {
                Ok(i)
            }
        },
        |_: &u64| Ok(false),
    );
    let err = sampler.sample_until_n_accepted(5, &failing).unwrap_err();
    assert!(err.is_simulation());
    assert!(err.to_string().contains("simulation diverged"));

    let population = sampler
        .sample_until_n_accepted(5, &multiples_of(2, 0))
        .unwrap();
    assert_eq!(population.len(), 5);
}

#[test]
fn connected_coordinator_drives_out_of_band_workers() {
    if redis_missing() {
        return;
    }
    let broker = BrokerProcess::start(&RedisConfig::self_managed()).unwrap();
    let config = RedisConfig {
        port: broker.port(),
        prefix: "oob".into(),
        ..RedisConfig::default()
    };

    let registry = ModelRegistry::new();
    let model = multiples_of(4, 0).with_name("fours");
    registry.register_named(model.clone());
    let workers: Vec<_> = (0..2)
        .map(|id| {
            RedisWorker::new(id, config.clone(), registry.clone())
                .spawn()
                .unwrap()
        })
        .collect();

    let mut sampler = RedisEvalParallelSampler::connect(config).unwrap();
    let population = sampler.sample_until_n_accepted(12, &model).unwrap();
    assert_eq!(population.len(), 12);
    assert!(population.particles().iter().all(|x| x % 4 == 0));

    let unnamed = Model::infallible(|| 0_u64, |_| true);
    let err = sampler.sample_until_n_accepted(3, &unnamed).unwrap_err();
    assert!(matches!(err, SamplerError::Configuration(_)));

    sampler.cleanup();
    let evaluated: u64 = workers
        .into_iter()
        .map(|worker| worker.join().unwrap().evaluated())
        .sum();
    assert!(evaluated >= 12);
}

#[test]
fn non_finite_particles_reach_the_coordinator() {
    if redis_missing() {
        return;
    }
    let mut sampler = RedisEvalParallelSamplerServerStarter::with_config(quick_config()).unwrap();
    let counter = Arc::new(AtomicU64::new(0));
    let model = Model::infallible(
        move || match counter.fetch_add(1, Ordering::SeqCst) % 3 {
            0 => f64::NAN,
            1 => f64::INFINITY,
            _ => 2.0,
        },
        |_: &f64| true,
    );
    let population = sampler.sample_until_n_accepted(9, &model).unwrap();
    assert_eq!(population.n_evaluated(), 9);
    let particles = population.particles();
    assert_eq!(particles.iter().filter(|x| x.is_nan()).count(), 3);
    assert_eq!(particles.iter().filter(|x| **x == f64::INFINITY).count(), 3);
    sampler.cleanup();
}

/// Same stream as the eval-parallel bound: draws 0, 1, 2, ..., the even ones
/// are slow and accepted. The sequential loop needs `2n - 1` draws.
#[test]
fn fleet_overshoot_is_bounded_by_worker_count() {
    if redis_missing() {
        return;
    }
    let (n_workers, n) = (4, 30);
    let config = RedisConfig {
        n_workers,
        ..quick_config()
    };
    let mut sampler = RedisEvalParallelSamplerServerStarter::with_config(config).unwrap();
    let counter = Arc::new(AtomicU64::new(0));
    let accepted = Arc::new(AtomicUsize::new(0));
    let tally = Arc::clone(&accepted);
    let model = Model::infallible(
        move || {
            let i = counter.fetch_add(1, Ordering::SeqCst);
            if i % 2 == 0 {
                thread::sleep(Duration::from_millis(5));
            }
            i
        },
        move |x: &u64| {
            let keep = x % 2 == 0;
            if keep {
                tally.fetch_add(1, Ordering::SeqCst);
            }
            keep
        },
    );
    let population = sampler.sample_until_n_accepted(n, &model).unwrap();
    assert_eq!(population.len(), n);

    let overshoot = population.n_evaluated().saturating_sub(2 * n - 1);
    assert!(overshoot <= 2 * n_workers, "overshoot {overshoot}");
    assert!(accepted.load(Ordering::SeqCst) - n < n_workers);
    sampler.cleanup();
}

/// A claim whose worker never reports back holds its slot only until the
/// lease runs out; after that another worker takes the item over.
#[test]
fn abandoned_claims_are_reclaimed_after_their_lease() {
    if redis_missing() {
        return;
    }
    let broker = BrokerProcess::start(&RedisConfig::self_managed()).unwrap();
    let config = RedisConfig {
        port: broker.port(),
        prefix: "lease".into(),
        lease_secs: 1,
        stall_timeout_secs: 30,
        ..RedisConfig::default()
    };

    let registry = ModelRegistry::new();
    let model = Model::infallible(|| 5_u64, |_| true).with_name("fives");
    registry.register_named(model.clone());

    let abandon = {
        let config = config.clone();
        thread::spawn(move || {
            let keys = Keys::new(config.prefix.clone());
            let scripts = FleetScripts::new(keys.clone(), config.lease_ms(), config.key_ttl_secs);
            let mut con = BrokerConnection::connect(&config).unwrap();
            let deadline = Instant::now() + Duration::from_secs(10);
            let generation = loop {
                let current: Option<u64> = con
                    .run(|c| redis::cmd("GET").arg(keys.current()).query(c))
                    .unwrap();
                if let Some(g) = current {
                    break g;
                }
                assert!(Instant::now() < deadline, "no generation was opened");
                thread::sleep(Duration::from_millis(10));
            };
            // take the only slot of the budget and never report it
            let claim = con.run_once(|c| scripts.claim(c, generation)).unwrap();
            assert_eq!(claim, Claim::Ticket(1));
            RedisWorker::new(0, config, registry).spawn().unwrap()
        })
    };

    let started = Instant::now();
    let mut sampler = RedisEvalParallelSampler::connect(config).unwrap();
    let population = sampler.sample_until_n_accepted(1, &model).unwrap();
    assert_eq!(population.particles(), &[5]);
    assert_eq!(population.n_evaluated(), 1);
    assert!(started.elapsed() >= Duration::from_millis(900));

    sampler.cleanup();
    let worker = abandon.join().unwrap();
    assert_eq!(worker.join().unwrap().evaluated(), 1);
}

#[test]
fn connecting_without_a_broker_is_a_transport_error() {
    let config = RedisConfig {
        port: 1,
        ..RedisConfig::default()
    };
    let err = RedisEvalParallelSampler::<u64>::connect(config).err().unwrap();
    assert!(err.is_transport());
}
