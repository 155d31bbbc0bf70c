//! The distributed sampler against a scheduler that loses tasks.

use std::collections::{HashMap, HashSet, VecDeque};

use abc_samplers::config::WindowConfig;
use abc_samplers::core::Sampler;
use abc_samplers::distributed::{ClusterClient, DaskDistributedSampler, TaskReply, TaskRequest, TaskResult};
use abc_samplers::error::{SamplerError, TransportError};
use abc_samplers::model::{Evaluation, Model};

/// Runs tasks inline at submission and reports the first attempt of every
/// `lose_every`-th task as lost.
struct FlakyCluster {
    models: HashMap<String, Model<u32>>,
    replies: VecDeque<TaskReply<u32>>,
    seen: HashSet<u64>,
    lose_every: u64,
    always_lose: bool,
    submitted: usize,
    shut_down: bool,
}

impl FlakyCluster {
    fn new(lose_every: u64) -> Self {
        Self {
            models: HashMap::new(),
            replies: VecDeque::new(),
            seen: HashSet::new(),
            lose_every,
            always_lose: false,
            submitted: 0,
            shut_down: false,
        }
    }

    fn run(&self, request: &TaskRequest) -> TaskResult<u32> {
        let Some(model) = self.models.get(&request.model_key) else {
            return TaskResult::Lost {
                reason: "model not published".into(),
            };
        };
        let mut accepted = Vec::new();
        let mut evaluated = 0;
        while evaluated < request.items && accepted.len() < request.quota {
            evaluated += 1;
            match model.evaluate() {
                Ok(Evaluation::Accepted(p)) => accepted.push(p),
                Ok(Evaluation::Rejected) => {}
                Err(err) => {
                    return TaskResult::Failed {
                        message: err.to_string(),
                    }
                }
            }
        }
        TaskResult::Done {
            accepted,
            evaluated,
        }
    }
}

impl ClusterClient<u32> for FlakyCluster {
    fn publish(&mut self, key: &str, model: &Model<u32>) -> Result<(), TransportError> {
        self.models.insert(key.to_string(), model.clone());
        Ok(())
    }

    fn retract(&mut self, key: &str) {
        self.models.remove(key);
    }

    fn submit(&mut self, request: TaskRequest) -> Result<(), TransportError> {
        self.submitted += 1;
        let first_attempt = self.seen.insert(request.task_id);
        let lose = self.always_lose || (first_attempt && request.task_id % self.lose_every == 0);
        let result = if lose {
            TaskResult::Lost {
                reason: format!("worker holding task {} died", request.task_id),
            }
        } else {
            self.run(&request)
        };
        self.replies.push_back(TaskReply {
            task_id: request.task_id,
            model_key: request.model_key,
            result,
        });
        Ok(())
    }

    fn next_completed(&mut self) -> Result<TaskReply<u32>, TransportError> {
        self.replies
            .pop_front()
            .ok_or_else(|| TransportError::Disconnected("no task outstanding".into()))
    }

    fn shutdown(&mut self) {
        self.shut_down = true;
    }
}

fn counting() -> Model<u32> {
    let next = std::sync::atomic::AtomicU32::new(0);
    Model::infallible(
        move || next.fetch_add(1, std::sync::atomic::Ordering::SeqCst),
        |x: &u32| x % 2 == 0,
    )
}

#[test]
fn lost_tasks_are_resubmitted() {
    let mut sampler = DaskDistributedSampler::new(FlakyCluster::new(2), WindowConfig::new(4, 3)).unwrap();
    let population = sampler.sample_until_n_accepted(12, &counting()).unwrap();
    assert_eq!(population.len(), 12);
    assert!(population.particles().iter().all(|x| x % 2 == 0));

    let stats = sampler.last_stats();
    assert!(stats.retries > 0);
    assert_eq!(stats.submissions, sampler.client().submitted);
    // retract runs after every generation
    assert!(sampler.client().models.is_empty());

    sampler.cleanup();
    assert!(sampler.client().shut_down);
}

#[test]
fn persistent_loss_exhausts_retries() {
    let mut cluster = FlakyCluster::new(1);
    cluster.always_lose = true;
    let config = WindowConfig {
        max_retries: 2,
        ..WindowConfig::new(1, 5)
    };
    let mut sampler = DaskDistributedSampler::new(cluster, config).unwrap();
    let err = sampler.sample_until_n_accepted(3, &counting()).unwrap_err();
    assert!(matches!(
        err,
        SamplerError::Transport(TransportError::RetriesExhausted { attempts: 3, .. })
    ));
    assert!(sampler.client().models.is_empty());
}

#[test]
fn remote_failures_are_simulation_errors() {
    let model: Model<u32> = Model::new(|| Err("remote solver crashed".into()), |_| Ok(true));
    let mut sampler = DaskDistributedSampler::new(FlakyCluster::new(u64::MAX), WindowConfig::new(4, 2)).unwrap();
    let err = sampler.sample_until_n_accepted(5, &model).unwrap_err();
    assert!(err.is_simulation());
    assert!(err.to_string().contains("remote solver crashed"));
}
