//! Coordinator side of the fleet protocol and the self-managed server starter.

use std::thread;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::broker::{BrokerConnection, BrokerProcess};
use super::protocol::{Control, Keys, ResultMessage};
use super::worker::{RedisWorker, WorkerHandle};
use crate::config::RedisConfig;
use crate::core::{acceptance_progress, check_population_size, report_rate, Sampler};
use crate::error::{SamplerError, TransportError};
use crate::model::{Model, ModelRegistry};
use crate::population::{AcceptedPopulation, WorkerState};
use crate::wire::from_bytes;

/// Seconds a coordinator blocks on the result list before re-checking the generation.
const RESULT_WAIT_SECS: u64 = 1;

/// Coordinator for a fleet of workers attached to an existing broker.
///
/// Workers are started out of band (see [`RedisWorker`]) and resolve the
/// generation's model by name, so every model passed to this sampler needs a
/// name that the workers have registered.
pub struct RedisEvalParallelSampler<P> {
    config: RedisConfig,
    keys: Keys,
    con: Option<BrokerConnection>,
    inline: Option<ModelRegistry<P>>,
    last_generation: Option<u64>,
    show_progress: bool,
}

impl<P> RedisEvalParallelSampler<P>
where
    P: Serialize + DeserializeOwned + Send + 'static,
{
    /// Connects to the broker described by `config`.
    pub fn connect(config: RedisConfig) -> Result<Self, SamplerError> {
        config.validate()?;
        if config.port == 0 {
            return Err(SamplerError::config("a broker port is required to connect"));
        }
        let mut con = BrokerConnection::connect(&config)?;
        con.ping()?;
        log::info!("coordinator connected to {}", config.url());
        Ok(Self {
            keys: Keys::new(config.prefix.clone()),
            config,
            con: Some(con),
            inline: None,
            last_generation: None,
            show_progress: false,
        })
    }

    /// Registers every generation's model in `registry` under a private key
    /// instead of requiring a named model. Used with in-process workers.
    fn with_inline_registry(mut self, registry: ModelRegistry<P>) -> Self {
        self.inline = Some(registry);
        self
    }

    pub fn show_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Id of the most recent generation started by this coordinator.
    pub fn last_generation(&self) -> Option<u64> {
        self.last_generation
    }

    fn connection(&mut self) -> Result<&mut BrokerConnection, SamplerError> {
        self.con.as_mut().ok_or_else(|| {
            SamplerError::from(TransportError::Disconnected(
                "coordinator has been cleaned up".into(),
            ))
        })
    }

    fn model_key(&self, generation: u64, model: &Model<P>) -> Result<String, SamplerError> {
        match (&self.inline, model.name()) {
            (Some(registry), _) => {
                let key = format!("inline:{}:{generation}", std::process::id());
                registry.register(key.clone(), model.clone());
                Ok(key)
            }
            (None, Some(name)) => Ok(name.to_string()),
            (None, None) => Err(SamplerError::config(
                "fleet workers resolve models by name; name the model with Model::with_name",
            )),
        }
    }

    /// Allocates a generation id and publishes its keys and the start signal.
    fn open_generation(&mut self, n: usize, model: &Model<P>) -> Result<(u64, String), SamplerError> {
        let counter = self.keys.generation_counter();
        let generation: u64 = self
            .connection()?
            .run(|c| redis::cmd("INCR").arg(&counter).query(c))?;
        let model_key = self.model_key(generation, model)?;

        let (meta, results) = (self.keys.meta(generation), self.keys.results(generation));
        let leases = self.keys.leases(generation);
        let (current, control) = (self.keys.current(), self.keys.control());
        let ttl = self.config.key_ttl_secs;
        let start = Control::Start(generation).encode();
        self.connection()?.run(|c| {
            redis::pipe()
                .atomic()
                .cmd("DEL")
                .arg(&results)
                .arg(&leases)
                .ignore()
                .cmd("HSET")
                .arg(&meta)
                .arg("n")
                .arg(n)
                .arg("model")
                .arg(&model_key)
                .arg("closed")
                .arg("0")
                .arg("acc")
                .arg(0)
                .arg("eval")
                .arg(0)
                .arg("inflight")
                .arg(0)
                .arg("started")
                .arg(0)
                .arg("reclaimed")
                .arg(0)
                .ignore()
                .cmd("EXPIRE")
                .arg(&meta)
                .arg(ttl)
                .ignore()
                .cmd("SET")
                .arg(&current)
                .arg(generation)
                .arg("EX")
                .arg(ttl)
                .ignore()
                .cmd("PUBLISH")
                .arg(&control)
                .arg(&start)
                .ignore()
                .query::<()>(c)
        })?;
        log::debug!("opened generation {generation} for n = {n} with model {model_key}");
        Ok((generation, model_key))
    }

    /// Blocks until `n` results are in or a worker reports a failure.
    ///
    /// Fails once nothing is claimed or reported for the stall timeout, which
    /// happens only when no live worker serves the generation: a lost claim
    /// comes back to the fleet after one lease.
    fn collect(
        &mut self,
        generation: u64,
        n: usize,
    ) -> Result<Result<Vec<(u64, P)>, SamplerError>, SamplerError> {
        let (meta, results) = (self.keys.meta(generation), self.keys.results(generation));
        let pb = acceptance_progress(n, "redis", self.show_progress);
        let mut particles = Vec::with_capacity(n);
        let stall_timeout = self.config.stall_timeout();
        let mut counters: Option<(u64, u64)> = None;
        let mut last_progress = Instant::now();

        while particles.len() < n {
            let popped: Option<(String, Vec<u8>)> = self
                .connection()?
                .run(|c| redis::cmd("BLPOP").arg(&results).arg(RESULT_WAIT_SECS).query(c))?;
            let Some((_, raw)) = popped else {
                let (started, evaluated): (Option<u64>, Option<u64>) = self
                    .connection()?
                    .run(|c| redis::cmd("HMGET").arg(&meta).arg("started").arg("eval").query(c))?;
                let seen = match started.zip(evaluated) {
                    Some(seen) => seen,
                    None => {
                        return Err(TransportError::Disconnected(format!(
                            "keys of generation {generation} expired before it completed"
                        ))
                        .into())
                    }
                };
                if counters != Some(seen) {
                    counters = Some(seen);
                    last_progress = Instant::now();
                } else if last_progress.elapsed() >= stall_timeout {
                    return Err(TransportError::Disconnected(format!(
                        "generation {generation} stalled: nothing claimed or reported for {}s",
                        stall_timeout.as_secs()
                    ))
                    .into());
                }
                continue;
            };
            last_progress = Instant::now();
            match from_bytes::<ResultMessage<P>>(&raw)? {
                ResultMessage::Accepted {
                    generation: tagged,
                    ticket,
                    particle,
                } => {
                    if tagged != generation {
                        log::warn!("discarding result of generation {tagged} found in generation {generation}");
                        continue;
                    }
                    particles.push((ticket, particle));
                    pb.inc(1);
                    if !pb.is_hidden() && (particles.len() % 16 == 0 || particles.len() == n) {
                        let evaluated: usize = self
                            .connection()?
                            .run(|c| redis::cmd("HGET").arg(&meta).arg("eval").query(c))?;
                        report_rate(&pb, particles.len(), evaluated);
                    }
                }
                ResultMessage::Failed { worker, message } => {
                    pb.abandon();
                    return Ok(Err(SamplerError::simulation(
                        "fleet worker",
                        format!("{worker}: {message}"),
                    )));
                }
            }
        }
        pb.finish_and_clear();
        Ok(Ok(particles))
    }

    /// Tickets of `generation` whose lease has not run out yet.
    fn live_leases(&mut self, generation: u64) -> Result<u64, SamplerError> {
        let leases = self.keys.leases(generation);
        let live = self.connection()?.run(|c| {
            let (secs, micros): (u64, u64) = redis::cmd("TIME").query(c)?;
            let now = secs * 1000 + micros / 1000;
            redis::cmd("ZCOUNT")
                .arg(&leases)
                .arg(format!("({now}"))
                .arg("+inf")
                .query(c)
        })?;
        Ok(live)
    }

    /// Closes the generation, waits for stragglers and reads the evaluation count.
    ///
    /// Only tickets under a live lease are waited for; a claim whose worker
    /// vanished would otherwise hold the drain until its timeout.
    fn close_generation(&mut self, generation: u64) -> Result<usize, SamplerError> {
        let (meta, control) = (self.keys.meta(generation), self.keys.control());
        let stop = Control::Stop(generation).encode();
        self.connection()?.run(|c| {
            redis::pipe()
                .cmd("HSET")
                .arg(&meta)
                .arg("closed")
                .arg("1")
                .ignore()
                .cmd("PUBLISH")
                .arg(&control)
                .arg(&stop)
                .ignore()
                .query::<()>(c)
        })?;

        let deadline = Instant::now() + self.config.drain_timeout();
        let poll = self.config.poll_interval();
        loop {
            match self.live_leases(generation)? {
                0 => break,
                k if Instant::now() < deadline => {
                    log::trace!("generation {generation}: waiting for {k} stragglers");
                    thread::sleep(poll);
                }
                k => {
                    log::warn!("generation {generation}: {k} work items still running after the drain timeout");
                    break;
                }
            }
        }

        let evaluated: Option<usize> = self
            .connection()?
            .run(|c| redis::cmd("HGET").arg(&meta).arg("eval").query(c))?;
        Ok(evaluated.unwrap_or(0))
    }

    /// Deletes the generation's keys. If that fails the TTL lease still removes them.
    fn discard_generation(&mut self, generation: u64, model_key: &str) {
        if let Some(registry) = &self.inline {
            registry.remove(model_key);
        }
        let (meta, results) = (self.keys.meta(generation), self.keys.results(generation));
        let leases = self.keys.leases(generation);
        if let Some(con) = self.con.as_mut() {
            let deleted = con.run(|c| {
                redis::cmd("DEL")
                    .arg(&meta)
                    .arg(&results)
                    .arg(&leases)
                    .query::<()>(c)
            });
            if let Err(e) = deleted {
                log::warn!("cannot delete keys of generation {generation}: {e}");
            }
        }
    }
}

impl<P> Sampler<P> for RedisEvalParallelSampler<P>
where
    P: Serialize + DeserializeOwned + Send + 'static,
{
    fn sample_until_n_accepted(
        &mut self,
        n: usize,
        model: &Model<P>,
    ) -> Result<AcceptedPopulation<P>, SamplerError> {
        check_population_size(n)?;
        let (generation, model_key) = self.open_generation(n, model)?;
        self.last_generation = Some(generation);

        let collected = self.collect(generation, n);
        let closed = self.close_generation(generation);
        self.discard_generation(generation, &model_key);

        let mut particles = collected??;
        let n_evaluated = closed?.max(particles.len());
        particles.sort_by_key(|(ticket, _)| *ticket);
        log::debug!("generation {generation}: {n} accepted of {n_evaluated} evaluated");
        Ok(AcceptedPopulation::new(
            particles.into_iter().map(|(_, particle)| particle).collect(),
            n_evaluated,
        ))
    }

    fn cleanup(&mut self) {
        if self.con.take().is_some() {
            log::info!("coordinator disconnected from {}", self.config.url());
        }
    }
}

/// Fleet sampler that owns its broker and its workers.
///
/// Construction launches a private `redis-server` on a free local port and
/// `n_workers` worker threads; [`cleanup`](Sampler::cleanup) (also run on drop)
/// stops both. Models need no name: each generation's model is handed to the
/// in-process workers through a private registry.
pub struct RedisEvalParallelSamplerServerStarter<P>
where
    P: Serialize + DeserializeOwned + Send + 'static,
{
    sampler: RedisEvalParallelSampler<P>,
    workers: Vec<WorkerHandle>,
    broker: Option<BrokerProcess>,
    worker_states: Vec<WorkerState>,
}

impl<P> RedisEvalParallelSamplerServerStarter<P>
where
    P: Serialize + DeserializeOwned + Send + 'static,
{
    /// Starts a broker on any free port with one worker per CPU.
    pub fn new() -> Result<Self, SamplerError> {
        Self::with_config(RedisConfig::self_managed())
    }

    pub fn with_workers(n_workers: usize) -> Result<Self, SamplerError> {
        Self::with_config(RedisConfig {
            n_workers,
            ..RedisConfig::self_managed()
        })
    }

    pub fn with_config(mut config: RedisConfig) -> Result<Self, SamplerError> {
        config.validate()?;
        if config.n_workers == 0 {
            return Err(SamplerError::config("n_workers must be at least 1"));
        }
        let broker = BrokerProcess::start(&config)?;
        config.host = "127.0.0.1".to_string();
        config.port = broker.port();

        let registry = ModelRegistry::new();
        let sampler = RedisEvalParallelSampler::connect(config.clone())?
            .with_inline_registry(registry.clone());
        let mut starter = Self {
            sampler,
            workers: Vec::with_capacity(config.n_workers),
            broker: Some(broker),
            worker_states: Vec::new(),
        };
        for id in 0..config.n_workers {
            let worker = RedisWorker::new(id, config.clone(), registry.clone());
            starter.workers.push(worker.spawn()?);
        }
        log::info!(
            "fleet of {} workers attached to {}",
            config.n_workers,
            config.url()
        );
        Ok(starter)
    }

    pub fn show_progress(mut self, show: bool) -> Self {
        self.sampler.show_progress = show;
        self
    }

    pub fn port(&self) -> Option<u16> {
        self.broker.as_ref().map(BrokerProcess::port)
    }

    pub fn config(&self) -> &RedisConfig {
        self.sampler.config()
    }

    pub fn n_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn last_generation(&self) -> Option<u64> {
        self.sampler.last_generation()
    }

    /// Final states of the workers stopped by the last cleanup.
    pub fn worker_states(&self) -> &[WorkerState] {
        &self.worker_states
    }

    fn shutdown(&mut self) {
        if self.workers.is_empty() && self.broker.is_none() {
            return;
        }
        for worker in &self.workers {
            worker.request_stop();
        }
        if let Some(con) = self.sampler.con.as_mut() {
            let (control, shutdown) = (self.sampler.keys.control(), Control::Shutdown.encode());
            if let Err(e) = con.run(|c| redis::cmd("PUBLISH").arg(&control).arg(&shutdown).query::<()>(c)) {
                log::warn!("cannot broadcast shutdown: {e}");
            }
        }
        for worker in self.workers.drain(..) {
            let name = worker.name().to_string();
            match worker.join() {
                Ok(state) => self.worker_states.push(state),
                Err(e) => log::warn!("{name} ended with an error: {e}"),
            }
        }
        Sampler::<P>::cleanup(&mut self.sampler);
        if let Some(mut broker) = self.broker.take() {
            broker.stop();
        }
    }
}

impl<P> Sampler<P> for RedisEvalParallelSamplerServerStarter<P>
where
    P: Serialize + DeserializeOwned + Send + 'static,
{
    fn sample_until_n_accepted(
        &mut self,
        n: usize,
        model: &Model<P>,
    ) -> Result<AcceptedPopulation<P>, SamplerError> {
        if self.workers.iter().all(WorkerHandle::is_finished) {
            return Err(TransportError::Disconnected("no fleet worker is running".into()).into());
        }
        self.sampler.sample_until_n_accepted(n, model)
    }

    fn cleanup(&mut self) {
        self.shutdown();
    }
}

impl<P> Drop for RedisEvalParallelSamplerServerStarter<P>
where
    P: Serialize + DeserializeOwned + Send + 'static,
{
    fn drop(&mut self) {
        self.shutdown();
    }
}
