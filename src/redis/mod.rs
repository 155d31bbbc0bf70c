/*!
# Redis-coordinated fleet

A broker-coordinated pool of independent workers, each possibly a separate
process on a separate machine. The only state shared between them lives in the
broker: a per-generation hash holding the accept counter, the evaluation
counter and the in-flight count, a per-generation result list, and a control
channel carrying start, stop and shutdown broadcasts. See [`protocol`] for the
key layout and the scripts that keep the accounting atomic.

- [`RedisEvalParallelSampler`] is the coordinator for an existing broker and
  out-of-band workers.
- [`RedisEvalParallelSamplerServerStarter`] launches its own `redis-server` and
  in-process workers, and tears both down on cleanup.
- [`RedisWorker`] is the worker loop, public so other processes can join a fleet.

Running a standalone worker against a broker:

```rust,no_run
use abc_samplers::config::RedisConfig;
use abc_samplers::model::{Model, ModelRegistry};
use abc_samplers::redis::RedisWorker;

let registry = ModelRegistry::new();
registry.register_named(Model::infallible(|| 0.5_f64, |x: &f64| *x < 1.0).with_name("toy"));
let worker = RedisWorker::new(0, RedisConfig::default(), registry);
let state = worker.run().unwrap();
println!("evaluated {}", state.evaluated());
```
*/

pub mod broker;
pub mod protocol;
mod sampler;
mod worker;

pub use broker::{redis_server_available, BrokerConnection, BrokerProcess};
pub use sampler::{RedisEvalParallelSampler, RedisEvalParallelSamplerServerStarter};
pub use worker::{RedisWorker, WorkerHandle};
