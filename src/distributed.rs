/*!
# Distributed-cluster sampler

The same sliding window as the future-based sampler, but units travel to a
scheduler through a [`ClusterClient`]: the model is published once per
generation under a key, each unit is sent as a serialized [`TaskRequest`], and
results come back as serialized [`TaskReply`] values. Submission and resolution
are decoupled, so a reply can come from any worker at any time.

Every reply echoes the key of the generation it was computed for. Keys are
unique within the process, and a sampler discards replies carrying any key
but its current one, so a task left running by an earlier, failed call can
never leak particles into a later generation.

A reply is one of three things: the unit's outcome, a simulation failure
(fatal for the generation), or a loss report (the unit is resubmitted up to
`max_retries` times). Transport failures of the client itself never turn into
simulation failures.

[`LocalCluster`] is the bundled scheduler: a set of worker threads that only
ever see [`wire`](crate::wire)-encoded requests and resolve the model through
a registry of published models.
*/

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::{PoolConfig, WindowConfig};
use crate::core::{acceptance_progress, check_population_size, Sampler};
use crate::error::{SamplerError, TransportError};
use crate::model::{Model, ModelRegistry};
use crate::population::AcceptedPopulation;
use crate::wire::{from_bytes, to_bytes};
use crate::window::{run_unit, run_window, Resolution, UnitBackend, UnitOutcome, UnitRequest, WindowStats};

/// A unit of work as sent to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: u64,
    /// Key under which the model was published for this generation.
    pub model_key: String,
    pub items: usize,
    pub quota: usize,
}

/// What the scheduler reports back for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskResult<P> {
    Done { accepted: Vec<P>, evaluated: usize },
    Failed { message: String },
    Lost { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReply<P> {
    pub task_id: u64,
    /// The `model_key` of the request this answers.
    pub model_key: String,
    pub result: TaskResult<P>,
}

/// Connection to a scheduler that runs tasks on remote workers.
pub trait ClusterClient<P> {
    /// Makes `model` resolvable by workers under `key`.
    fn publish(&mut self, key: &str, model: &Model<P>) -> Result<(), TransportError>;

    /// Withdraws a published model.
    fn retract(&mut self, key: &str);

    fn submit(&mut self, request: TaskRequest) -> Result<(), TransportError>;

    /// Blocks until some submitted task completes.
    fn next_completed(&mut self) -> Result<TaskReply<P>, TransportError>;

    /// Closes the connection and releases scheduler resources.
    fn shutdown(&mut self) {}
}

/// In-process scheduler with a fixed set of worker threads.
pub struct LocalCluster<P> {
    requests: Option<Sender<Vec<u8>>>,
    replies: Receiver<Vec<u8>>,
    registry: ModelRegistry<P>,
    workers: Vec<JoinHandle<()>>,
}

impl<P> LocalCluster<P>
where
    P: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new(n_workers: usize) -> Result<Self, SamplerError> {
        PoolConfig::with_workers(n_workers).validate()?;
        let (request_tx, request_rx) = unbounded::<Vec<u8>>();
        let (reply_tx, reply_rx) = unbounded::<Vec<u8>>();
        let registry = ModelRegistry::new();

        let mut workers = Vec::with_capacity(n_workers);
        for i in 0..n_workers {
            let (requests, replies, registry) =
                (request_rx.clone(), reply_tx.clone(), registry.clone());
            let handle = std::thread::Builder::new()
                .name(format!("abc-cluster-{i}"))
                .spawn(move || cluster_worker(requests, replies, registry))
                .map_err(TransportError::from)?;
            workers.push(handle);
        }
        log::info!("started local cluster with {n_workers} workers");

        Ok(Self {
            requests: Some(request_tx),
            replies: reply_rx,
            registry,
            workers,
        })
    }

    pub fn n_workers(&self) -> usize {
        self.workers.len()
    }
}

fn execute<P>(request: &TaskRequest, registry: &ModelRegistry<P>) -> TaskResult<P> {
    let Some(model) = registry.get(&request.model_key) else {
        return TaskResult::Lost {
            reason: format!("model {} is not published", request.model_key),
        };
    };
    let unit = UnitRequest {
        id: request.task_id,
        items: request.items,
        quota: request.quota,
    };
    match run_unit(&model, &unit) {
        Ok(outcome) => TaskResult::Done {
            accepted: outcome.accepted,
            evaluated: outcome.evaluated,
        },
        Err(err) => TaskResult::Failed {
            message: err.to_string(),
        },
    }
}

fn cluster_worker<P>(requests: Receiver<Vec<u8>>, replies: Sender<Vec<u8>>, registry: ModelRegistry<P>)
where
    P: Serialize + DeserializeOwned,
{
    for raw in requests.iter() {
        let request: TaskRequest = match from_bytes(&raw) {
            Ok(request) => request,
            Err(err) => {
                log::warn!("dropping undecodable task request: {err}");
                continue;
            }
        };
        let task_id = request.task_id;
        let result = execute(&request, &registry);
        let reply = TaskReply {
            task_id,
            model_key: request.model_key,
            result,
        };
        let encoded = to_bytes(&reply).or_else(|err| {
            to_bytes(&TaskReply::<P> {
                task_id,
                model_key: reply.model_key.clone(),
                result: TaskResult::Lost {
                    reason: format!("cannot encode result: {err}"),
                },
            })
        });
        match encoded {
            Ok(encoded) => {
                if replies.send(encoded).is_err() {
                    break;
                }
            }
            Err(err) => log::warn!("dropping reply for task {task_id}: {err}"),
        }
    }
}

impl<P> ClusterClient<P> for LocalCluster<P>
where
    P: Serialize + DeserializeOwned + Send + 'static,
{
    fn publish(&mut self, key: &str, model: &Model<P>) -> Result<(), TransportError> {
        if self.requests.is_none() {
            return Err(TransportError::Disconnected("cluster has been shut down".into()));
        }
        self.registry.register(key, model.clone());
        Ok(())
    }

    fn retract(&mut self, key: &str) {
        self.registry.remove(key);
    }

    fn submit(&mut self, request: TaskRequest) -> Result<(), TransportError> {
        let requests = self
            .requests
            .as_ref()
            .ok_or_else(|| TransportError::Disconnected("cluster has been shut down".into()))?;
        requests
            .send(to_bytes(&request)?)
            .map_err(|_| TransportError::Disconnected("every cluster worker has exited".into()))
    }

    fn next_completed(&mut self) -> Result<TaskReply<P>, TransportError> {
        let raw = self
            .replies
            .recv()
            .map_err(|_| TransportError::Disconnected("scheduler closed the reply stream".into()))?;
        from_bytes(&raw)
    }

    fn shutdown(&mut self) {
        if self.requests.take().is_none() {
            return;
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::warn!("a cluster worker panicked during shutdown");
            }
        }
        log::info!("stopped local cluster");
    }
}

impl<P> Drop for LocalCluster<P> {
    fn drop(&mut self) {
        // closing the request channel lets every worker loop end
        self.requests.take();
    }
}

/// Units routed through a cluster client for one generation.
struct ClusterUnits<'a, C> {
    client: &'a mut C,
    model_key: &'a str,
}

impl<P, C: ClusterClient<P>> UnitBackend<P> for ClusterUnits<'_, C> {
    fn submit(&mut self, unit: UnitRequest) -> Result<(), TransportError> {
        self.client.submit(TaskRequest {
            task_id: unit.id,
            model_key: self.model_key.to_string(),
            items: unit.items,
            quota: unit.quota,
        })
    }

    fn next_resolved(&mut self) -> Result<(u64, Resolution<P>), TransportError> {
        let reply = loop {
            let reply = self.client.next_completed()?;
            if reply.model_key == self.model_key {
                break reply;
            }
            log::debug!(
                "discarding task {} of {} while running {}",
                reply.task_id,
                reply.model_key,
                self.model_key
            );
        };
        let resolution = match reply.result {
            TaskResult::Done {
                accepted,
                evaluated,
            } => Resolution::Done(UnitOutcome {
                accepted,
                evaluated,
            }),
            TaskResult::Failed { message } => {
                Resolution::Failed(SamplerError::simulation("remote task", message))
            }
            TaskResult::Lost { reason } => Resolution::Lost(TransportError::Lost(reason)),
        };
        Ok((reply.task_id, resolution))
    }
}

/// Source of process-wide unique generation keys.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(0);

/// Sliding-window sampler over a distributed scheduler.
pub struct DaskDistributedSampler<C> {
    client: C,
    config: WindowConfig,
    last_stats: WindowStats,
    show_progress: bool,
}

impl<C> DaskDistributedSampler<C> {
    pub fn new(client: C, config: WindowConfig) -> Result<Self, SamplerError> {
        config.validate()?;
        Ok(Self {
            client,
            config,
            last_stats: WindowStats::default(),
            show_progress: false,
        })
    }

    pub fn show_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn last_stats(&self) -> WindowStats {
        self.last_stats
    }
}

impl<P> DaskDistributedSampler<LocalCluster<P>>
where
    P: Serialize + DeserializeOwned + Send + 'static,
{
    /// Sampler on a private local cluster of `n_workers` threads.
    pub fn local(n_workers: usize, batchsize: usize) -> Result<Self, SamplerError> {
        let config = WindowConfig {
            batchsize,
            ..WindowConfig::default()
        };
        Self::new(LocalCluster::new(n_workers)?, config)
    }
}

impl<P, C: ClusterClient<P>> Sampler<P> for DaskDistributedSampler<C> {
    fn sample_until_n_accepted(
        &mut self,
        n: usize,
        model: &Model<P>,
    ) -> Result<AcceptedPopulation<P>, SamplerError> {
        check_population_size(n)?;
        self.config.validate()?;
        let model_key = format!(
            "generation-{}",
            NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
        );
        self.client.publish(&model_key, model)?;

        let pb = acceptance_progress(n, "distributed", self.show_progress);
        let mut backend = ClusterUnits {
            client: &mut self.client,
            model_key: &model_key,
        };
        let result = run_window::<P, _>(&mut backend, n, &self.config, &pb);
        pb.finish_and_clear();
        self.client.retract(&model_key);

        let (population, stats) = result?;
        self.last_stats = stats;
        log::debug!(
            "{model_key}: {n} accepted of {} evaluated in {} tasks ({} retried)",
            population.n_evaluated(),
            stats.submissions,
            stats.retries
        );
        Ok(population)
    }

    fn cleanup(&mut self) {
        self.client.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    fn quarters() -> Model<u32> {
        let counter = Arc::new(AtomicUsize::new(0));
        Model::infallible(
            move || counter.fetch_add(1, Ordering::SeqCst) as u32,
            |x: &u32| x % 4 == 0,
        )
    }

    #[test]
    fn replies_keep_their_generation_key() {
        let reply = TaskReply {
            task_id: 7,
            model_key: "generation-3".to_string(),
            result: TaskResult::Done {
                accepted: vec![1.5_f64, -2.0],
                evaluated: 3,
            },
        };
        let back: TaskReply<f64> = from_bytes(&to_bytes(&reply).unwrap()).unwrap();
        assert_eq!(back, reply);
    }

    #[test]
    fn unpublished_models_are_reported_lost() {
        let registry: ModelRegistry<u8> = ModelRegistry::new();
        let request = TaskRequest {
            task_id: 1,
            model_key: "missing".into(),
            items: 1,
            quota: 1,
        };
        assert!(matches!(execute(&request, &registry), TaskResult::Lost { .. }));
    }

    #[test]
    fn local_cluster_contract() {
        let mut sampler = DaskDistributedSampler::local(3, 1).unwrap();
        for n in [1, 12, 40] {
            let population = sampler.sample_until_n_accepted(n, &quarters()).unwrap();
            assert_eq!(population.len(), n);
            assert!(population.particles().iter().all(|x| x % 4 == 0));
        }
        Sampler::<u32>::cleanup(&mut sampler);
        Sampler::<u32>::cleanup(&mut sampler);
    }

    #[test]
    fn batched_submissions_and_no_waste() {
        let mut sampler = DaskDistributedSampler::local(4, 20).unwrap();
        let population = sampler
            .sample_until_n_accepted(50, &Model::infallible(|| 1_u32, |_| true))
            .unwrap();
        assert_eq!(population.n_evaluated(), 50);
        let stats = sampler.last_stats();
        assert_eq!(stats.submissions, 3);
        assert_eq!(stats.submissions, stats.items_issued.div_ceil(20));
    }

    #[test]
    fn remote_failures_are_simulation_failures() {
        let model: Model<u32> = Model::new(|| Ok(1), |_| Err("bad summary statistic".into()));
        let mut sampler = DaskDistributedSampler::local(2, 1).unwrap();
        let err = sampler.sample_until_n_accepted(5, &model).unwrap_err();
        assert!(matches!(err, SamplerError::Simulation { stage: "remote task", .. }));
        assert!(err.to_string().contains("bad summary statistic"));
    }

    #[test]
    fn non_finite_particles_cross_the_cluster() {
        let counter = Arc::new(AtomicUsize::new(0));
        let model = Model::infallible(
            move || match counter.fetch_add(1, Ordering::SeqCst) % 3 {
                0 => f64::NAN,
                1 => f64::INFINITY,
                _ => 2.0,
            },
            |_| true,
        );
        let mut sampler = DaskDistributedSampler::local(2, 3).unwrap();
        let population = sampler.sample_until_n_accepted(9, &model).unwrap();
        assert_eq!(population.n_evaluated(), 9);
        let particles = population.particles();
        assert_eq!(particles.iter().filter(|x| x.is_nan()).count(), 3);
        assert_eq!(particles.iter().filter(|x| x.is_infinite()).count(), 3);
        Sampler::<f64>::cleanup(&mut sampler);
    }

    /// Tasks of an abandoned generation reuse unit ids 0..3 but must not count.
    #[test]
    fn replies_of_other_generations_are_discarded() {
        let mut cluster = LocalCluster::<f64>::new(2).unwrap();
        let abandoned = Model::infallible(
            || {
                std::thread::sleep(Duration::from_millis(20));
                100.0
            },
            |_| true,
        );
        cluster.publish("abandoned", &abandoned).unwrap();
        for task_id in 0..3 {
            cluster
                .submit(TaskRequest {
                    task_id,
                    model_key: "abandoned".into(),
                    items: 1,
                    quota: 1,
                })
                .unwrap();
        }

        let mut sampler = DaskDistributedSampler::new(cluster, WindowConfig::new(4, 1)).unwrap();
        let population = sampler
            .sample_until_n_accepted(5, &Model::infallible(|| 1.0_f64, |_| true))
            .unwrap();
        assert_eq!(population.particles(), &[1.0; 5]);
        assert_eq!(population.n_evaluated(), 5);
        Sampler::<f64>::cleanup(&mut sampler);
    }

    #[test]
    fn closed_cluster_is_a_transport_failure() {
        let mut sampler = DaskDistributedSampler::local(1, 1).unwrap();
        Sampler::<u32>::cleanup(&mut sampler);
        let err = sampler.sample_until_n_accepted(2, &quarters()).unwrap_err();
        assert!(err.is_transport());
    }
}
