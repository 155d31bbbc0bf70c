/*!
# Single-core sampler

The sequential reference backend: simulate, test, repeat, all in the calling
thread, until `n` particles are accepted. There is no speculation, so
`n_evaluated` is exactly the number of loop iterations and equals `n` whenever
nothing is rejected. Every other backend is checked against this one.

```rust
use abc_samplers::core::Sampler;
use abc_samplers::model::Model;
use abc_samplers::single_core::SingleCoreSampler;

let mut sampler = SingleCoreSampler::new();
let model = Model::infallible(|| 1.0_f64, |_| true);
let population = sampler.sample_until_n_accepted(5, &model).unwrap();
assert_eq!(population.len(), 5);
assert_eq!(population.n_evaluated(), 5);
```
*/

use crate::core::{acceptance_progress, check_population_size, report_rate, Sampler};
use crate::error::SamplerError;
use crate::model::{Evaluation, Model};
use crate::population::AcceptedPopulation;

/// Sequential sampler running in the calling thread.
#[derive(Debug, Clone, Default)]
pub struct SingleCoreSampler {
    show_progress: bool,
}

impl SingleCoreSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Displays a progress bar while sampling.
    pub fn show_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }
}

impl<P> Sampler<P> for SingleCoreSampler {
    fn sample_until_n_accepted(
        &mut self,
        n: usize,
        model: &Model<P>,
    ) -> Result<AcceptedPopulation<P>, SamplerError> {
        check_population_size(n)?;
        let pb = acceptance_progress(n, "single-core", self.show_progress);

        let mut particles = Vec::with_capacity(n);
        let mut n_evaluated = 0;
        while particles.len() < n {
            let evaluation = model.evaluate()?;
            n_evaluated += 1;
            if let Evaluation::Accepted(particle) = evaluation {
                particles.push(particle);
                pb.inc(1);
                report_rate(&pb, particles.len(), n_evaluated);
            }
        }
        pb.finish_and_clear();

        Ok(AcceptedPopulation::new(particles, n_evaluated))
    }
}
