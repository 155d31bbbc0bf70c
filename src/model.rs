/*!
The simulate/accept pair every sampler drives.

A [`Model`] bundles the two callables supplied by the inference engine:

- `simulate_one() -> P` draws one particle by running the stochastic simulation;
- `accept_one(&P) -> bool` applies the acceptance test to that particle.

Samplers never look inside a particle. Both callables are stored behind [`Arc`]s
so a model is cheap to clone into worker threads, and they must be safe to run
concurrently from any thread.

```rust
use abc_samplers::model::{Evaluation, Model};

let model = Model::infallible(|| 4_u32, |x: &u32| x % 2 == 0);
match model.evaluate().unwrap() {
    Evaluation::Accepted(x) => assert_eq!(x, 4),
    Evaluation::Rejected => unreachable!(),
}
```
*/

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{BoxError, SamplerError};

/// Signature of the simulation callable.
pub type SimulateFn<P> = dyn Fn() -> Result<P, BoxError> + Send + Sync;

/// Signature of the acceptance callable.
pub type AcceptFn<P> = dyn Fn(&P) -> Result<bool, BoxError> + Send + Sync;

/// One simulate/accept pair, optionally named so remote workers can resolve it by reference.
pub struct Model<P> {
    simulate: Arc<SimulateFn<P>>,
    accept: Arc<AcceptFn<P>>,
    name: Option<String>,
}

impl<P> Clone for Model<P> {
    fn clone(&self) -> Self {
        Self {
            simulate: Arc::clone(&self.simulate),
            accept: Arc::clone(&self.accept),
            name: self.name.clone(),
        }
    }
}

impl<P> fmt::Debug for Model<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Outcome of one work item: simulate once, then test the result.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation<P> {
    Accepted(P),
    Rejected,
}

impl<P> Evaluation<P> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Evaluation::Accepted(_))
    }

    /// Returns the particle if it was accepted.
    pub fn into_accepted(self) -> Option<P> {
        match self {
            Evaluation::Accepted(particle) => Some(particle),
            Evaluation::Rejected => None,
        }
    }
}

impl<P> Model<P> {
    /// Creates a model from fallible callables.
    pub fn new<S, A>(simulate_one: S, accept_one: A) -> Self
    where
        S: Fn() -> Result<P, BoxError> + Send + Sync + 'static,
        A: Fn(&P) -> Result<bool, BoxError> + Send + Sync + 'static,
    {
        Self {
            simulate: Arc::new(simulate_one),
            accept: Arc::new(accept_one),
            name: None,
        }
    }

    /// Creates a model from callables that cannot fail.
    pub fn infallible<S, A>(simulate_one: S, accept_one: A) -> Self
    where
        S: Fn() -> P + Send + Sync + 'static,
        A: Fn(&P) -> bool + Send + Sync + 'static,
    {
        Self::new(move || Ok(simulate_one()), move |p: &P| Ok(accept_one(p)))
    }

    /// Names the model. Out-of-band fleet workers look models up by this name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Runs one work item. Panics inside either callable are reported as
    /// [`SamplerError::Simulation`] instead of unwinding through the worker.
    pub fn evaluate(&self) -> Result<Evaluation<P>, SamplerError> {
        let particle = guarded("simulate_one", || (self.simulate)())?;
        if guarded("accept_one", || (self.accept)(&particle))? {
            Ok(Evaluation::Accepted(particle))
        } else {
            Ok(Evaluation::Rejected)
        }
    }
}

fn guarded<T>(
    stage: &'static str,
    call: impl FnOnce() -> Result<T, BoxError>,
) -> Result<T, SamplerError> {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(SamplerError::Simulation { stage, source }),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Err(SamplerError::simulation(stage, format!("panicked: {message}")))
        }
    }
}

/// Shared table of models keyed by name, used by workers that receive only a
/// reference to the model they should run.
pub struct ModelRegistry<P> {
    models: Arc<RwLock<HashMap<String, Model<P>>>>,
}

impl<P> Clone for ModelRegistry<P> {
    fn clone(&self) -> Self {
        Self {
            models: Arc::clone(&self.models),
        }
    }
}

impl<P> Default for ModelRegistry<P> {
    fn default() -> Self {
        Self {
            models: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<P> ModelRegistry<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `model` under `key`, replacing any previous entry.
    pub fn register(&self, key: impl Into<String>, model: Model<P>) {
        self.models
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), model);
    }

    /// Registers a named model under its own name. Unnamed models are ignored.
    pub fn register_named(&self, model: Model<P>) -> Option<String> {
        let name = model.name()?.to_string();
        self.register(name.clone(), model);
        Some(name)
    }

    pub fn get(&self, key: &str) -> Option<Model<P>> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn remove(&self, key: &str) -> Option<Model<P>> {
        self.models
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn len(&self) -> usize {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluate_accepts_and_rejects() {
        let model = Model::infallible(|| 3_i32, |x: &i32| *x > 2);
        assert_eq!(model.evaluate().unwrap(), Evaluation::Accepted(3));

        let model = Model::infallible(|| 1_i32, |x: &i32| *x > 2);
        assert_eq!(model.evaluate().unwrap(), Evaluation::Rejected);
    }

    #[test]
    fn simulation_errors_name_their_stage() {
        let model: Model<f64> = Model::new(|| Err("boom".into()), |_| Ok(true));
        let err = model.evaluate().unwrap_err();
        assert!(matches!(
            err,
            SamplerError::Simulation {
                stage: "simulate_one",
                ..
            }
        ));

        let model = Model::new(|| Ok(1.0_f64), |_| Err("bad distance".into()));
        let err = model.evaluate().unwrap_err();
        assert!(err.to_string().starts_with("accept_one failed"));
    }

    #[test]
    fn panics_become_simulation_failures() {
        let model = Model::infallible(|| -> u8 { panic!("solver blew up") }, |_| true);
        let err = model.evaluate().unwrap_err();
        assert!(err.is_simulation());
        assert!(err.to_string().contains("solver blew up"));
    }

    #[test]
    fn registry_resolves_named_models() {
        let registry = ModelRegistry::new();
        let model = Model::infallible(|| 7_u8, |_| true).with_name("seven");
        assert_eq!(registry.register_named(model), Some("seven".to_string()));
        assert!(registry
            .register_named(Model::infallible(|| 0_u8, |_| true))
            .is_none());

        let shared = registry.clone();
        let resolved = shared.get("seven").unwrap();
        assert_eq!(resolved.name(), Some("seven"));
        assert_eq!(resolved.evaluate().unwrap(), Evaluation::Accepted(7));

        assert!(registry.remove("seven").is_some());
        assert!(shared.is_empty());
    }
}
