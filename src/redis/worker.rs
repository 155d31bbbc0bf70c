//! The fleet worker loop.
//!
//! A worker follows `{prefix}:current`, resolves the generation's model by name
//! in its [`ModelRegistry`], and then repeatedly claims a ticket, evaluates one
//! work item and reports it through the `complete` (or `fail`) script. A
//! particle that cannot be encoded is reported as a failure. If the report is
//! lost with the connection, the ticket's lease runs out and the slot goes back
//! to the fleet. When a
//! claim is refused because the speculation budget is exhausted it waits on the
//! control channel for at most one poll interval before asking again; once the
//! generation is over it idles on the channel until the next `start`.
//!
//! Workers can run as threads of the coordinating process (the server starter
//! spawns them) or in separate processes on any machine that reaches the broker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use redis::PubSub;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::broker::BrokerConnection;
use super::protocol::{Claim, Control, FleetScripts, Keys, ResultMessage};
use crate::config::RedisConfig;
use crate::core::backoff;
use crate::error::TransportError;
use crate::model::{Evaluation, Model, ModelRegistry};
use crate::population::{WorkerState, WorkerStatus};
use crate::wire::to_bytes;

/// One fleet worker.
pub struct RedisWorker<P> {
    name: String,
    config: RedisConfig,
    keys: Keys,
    registry: ModelRegistry<P>,
    stop: Arc<AtomicBool>,
    state: WorkerState,
}

/// Waits at most one read timeout for a control message; `true` on shutdown.
fn wait_signal(pubsub: &mut PubSub<'_>) -> Result<bool, TransportError> {
    match pubsub.get_message() {
        Ok(msg) => {
            let payload: String = msg.get_payload()?;
            Ok(Control::decode(&payload) == Some(Control::Shutdown))
        }
        Err(err) if err.is_timeout() => Ok(false),
        Err(err) => Err(err.into()),
    }
}

impl<P> RedisWorker<P>
where
    P: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new(id: usize, config: RedisConfig, registry: ModelRegistry<P>) -> Self {
        let keys = Keys::new(config.prefix.clone());
        Self {
            name: format!("worker-{}-{id}", std::process::id()),
            config,
            keys,
            registry,
            stop: Arc::new(AtomicBool::new(false)),
            state: WorkerState::new(id),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Flag that makes [`run`](Self::run) return after its current work item.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Serves generations until stopped or told to shut down.
    ///
    /// Transient broker failures restart the session up to `max_retries`
    /// times in a row; anything else ends the worker with an error.
    pub fn run(mut self) -> Result<WorkerState, TransportError> {
        self.state.status = WorkerStatus::Running;
        log::info!("{} serving {}", self.name, self.config.url());
        let mut failures = 0;
        let result = loop {
            match self.session() {
                Ok(()) => break Ok(()),
                Err(err) if err.is_transient() && failures < self.config.max_retries => {
                    failures += 1;
                    log::warn!("{} lost the broker ({err}), reconnecting", self.name);
                    thread::sleep(backoff(failures));
                }
                Err(err) => break Err(err),
            }
        };
        self.state.status = WorkerStatus::Stopped;
        log::info!(
            "{} stopped after {} evaluations",
            self.name,
            self.state.evaluated()
        );
        result.map(|()| self.state)
    }

    /// Runs the worker on its own thread.
    pub fn spawn(self) -> Result<WorkerHandle, TransportError> {
        let stop = self.stop_flag();
        let name = self.name.clone();
        let thread = thread::Builder::new()
            .name(format!("abc-redis-{}", self.state.id))
            .spawn(move || self.run())?;
        Ok(WorkerHandle {
            name,
            stop,
            thread: Some(thread),
        })
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn session(&mut self) -> Result<(), TransportError> {
        let mut con = BrokerConnection::connect(&self.config)?;
        let mut sub_con = con.client().get_connection()?;
        let mut pubsub = sub_con.as_pubsub();
        pubsub.subscribe(self.keys.control())?;
        pubsub.set_read_timeout(Some(self.config.poll_interval()))?;

        let scripts = FleetScripts::new(
            self.keys.clone(),
            self.config.lease_ms(),
            self.config.key_ttl_secs,
        );
        let current_key = self.keys.current();
        let mut finished: Option<u64> = None;

        while !self.stopped() {
            let current: Option<u64> =
                con.run(|c| redis::cmd("GET").arg(&current_key).query(c))?;
            let generation = match current {
                Some(g) if finished != Some(g) => g,
                _ => {
                    if wait_signal(&mut pubsub)? {
                        return Ok(());
                    }
                    continue;
                }
            };

            let meta = self.keys.meta(generation);
            let model_key: Option<String> =
                con.run(|c| redis::cmd("HGET").arg(&meta).arg("model").query(c))?;
            let model = match model_key.as_deref().map(|key| (key, self.registry.get(key))) {
                Some((_, Some(model))) => model,
                Some((key, None)) => {
                    log::warn!("{}: no model named {key} registered, sitting out generation {generation}", self.name);
                    finished = Some(generation);
                    continue;
                }
                None => {
                    finished = Some(generation);
                    continue;
                }
            };

            log::debug!("{} joined generation {generation}", self.name);
            if self.serve_generation(&mut con, &mut pubsub, &scripts, generation, &model)? {
                return Ok(());
            }
            finished = Some(generation);
        }
        Ok(())
    }

    /// Works on one generation until it stops; `true` if a shutdown arrived.
    fn serve_generation(
        &mut self,
        con: &mut BrokerConnection,
        pubsub: &mut PubSub<'_>,
        scripts: &FleetScripts,
        generation: u64,
        model: &Model<P>,
    ) -> Result<bool, TransportError> {
        while !self.stopped() {
            let ticket = match con.run_once(|c| scripts.claim(c, generation))? {
                Claim::Stop => return Ok(false),
                Claim::Wait => {
                    if wait_signal(pubsub)? {
                        return Ok(true);
                    }
                    continue;
                }
                Claim::Ticket(ticket) => ticket,
            };

            let failure = match model.evaluate() {
                Ok(Evaluation::Rejected) => {
                    self.state.record(false);
                    con.run_once(|c| scripts.complete(c, generation, ticket, None))?;
                    continue;
                }
                Ok(Evaluation::Accepted(particle)) => {
                    let message = ResultMessage::Accepted {
                        generation,
                        ticket,
                        particle,
                    };
                    match to_bytes(&message) {
                        Ok(payload) => {
                            self.state.record(true);
                            con.run_once(|c| scripts.complete(c, generation, ticket, Some(&payload)))?;
                            continue;
                        }
                        Err(err) => format!("cannot encode accepted particle: {err}"),
                    }
                }
                Err(err) => err.to_string(),
            };

            log::warn!("{}: work item {ticket} of generation {generation} failed: {failure}", self.name);
            let payload = to_bytes(&ResultMessage::<P>::Failed {
                worker: self.name.clone(),
                message: failure,
            })?;
            con.run_once(|c| scripts.fail(c, generation, ticket, &payload))?;
        }
        Ok(false)
    }
}

/// A worker running on its own thread.
pub struct WorkerHandle {
    name: String,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<WorkerState, TransportError>>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Asks the worker to finish its current item and exit.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stops the worker and waits for it; returns its final state.
    pub fn join(mut self) -> Result<WorkerState, TransportError> {
        self.request_stop();
        match self.thread.take() {
            Some(thread) => thread.join().unwrap_or_else(|_| {
                Err(TransportError::Disconnected(format!("{} panicked", self.name)))
            }),
            None => Err(TransportError::Disconnected(format!("{} already joined", self.name))),
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.request_stop();
    }
}
