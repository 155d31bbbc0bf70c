//! Parallel and distributed samplers for population-based simulation inference.
//!
//! Every backend implements [`core::Sampler`]: given a [`model::Model`] (the
//! `simulate_one`/`accept_one` pair) it returns exactly `n` accepted particles
//! together with the number of simulations it ran to get them.
//!
//! | backend | module |
//! |---|---|
//! | sequential loop | [`single_core`] |
//! | injectable parallel map | [`mapping`] |
//! | one task per accepted particle | [`particle_parallel`] |
//! | dynamic early stopping on a local pool | [`eval_parallel`] |
//! | sliding window over an executor | [`concurrent_future`] |
//! | sliding window over a cluster scheduler | [`distributed`] |
//! | Redis-coordinated worker fleet | [`redis`] |

pub mod concurrent_future;
pub mod config;
pub mod core;
pub mod distributed;
pub mod error;
pub mod estimate;
pub mod eval_parallel;
pub mod executor;
pub mod mapping;
pub mod model;
pub mod particle_parallel;
pub mod population;
pub mod redis;
pub mod single_core;
pub mod wire;
mod window;

pub use crate::concurrent_future::ConcurrentFutureSampler;
pub use crate::core::Sampler;
pub use crate::distributed::{DaskDistributedSampler, LocalCluster};
pub use crate::error::{SamplerError, TransportError};
pub use crate::eval_parallel::MulticoreEvalParallelSampler;
pub use crate::mapping::MappingSampler;
pub use crate::model::{Evaluation, Model, ModelRegistry};
pub use crate::particle_parallel::MulticoreParticleParallelSampler;
pub use crate::population::AcceptedPopulation;
pub use crate::redis::{RedisEvalParallelSampler, RedisEvalParallelSamplerServerStarter};
pub use crate::single_core::SingleCoreSampler;
pub use crate::window::WindowStats;
