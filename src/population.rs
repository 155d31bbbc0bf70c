//! Output envelope of one generation and per-worker bookkeeping.

use serde::{Deserialize, Serialize};

/// Exactly `n` accepted particles plus the number of simulations it took to get them.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedPopulation<P> {
    particles: Vec<P>,
    n_evaluated: usize,
}

impl<P> AcceptedPopulation<P> {
    /// Wraps the accepted particles. `n_evaluated` counts every simulation
    /// attempt, accepted or not, across all workers.
    pub fn new(particles: Vec<P>, n_evaluated: usize) -> Self {
        debug_assert!(
            n_evaluated >= particles.len(),
            "n_evaluated ({n_evaluated}) below the number of accepted particles ({})",
            particles.len()
        );
        Self {
            particles,
            n_evaluated,
        }
    }

    pub fn particles(&self) -> &[P] {
        &self.particles
    }

    pub fn n_evaluated(&self) -> usize {
        self.n_evaluated
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    /// Fraction of simulations that were accepted.
    pub fn acceptance_rate(&self) -> f64 {
        if self.n_evaluated == 0 {
            0.0
        } else {
            self.particles.len() as f64 / self.n_evaluated as f64
        }
    }

    /// Splits into `(particles, n_evaluated)`.
    pub fn into_parts(self) -> (Vec<P>, usize) {
        (self.particles, self.n_evaluated)
    }
}

/// Lifecycle status of a pool or fleet worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerStatus {
    #[default]
    Idle,
    Running,
    Stopped,
}

/// Identity and running totals of one worker, owned by the backend that manages it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WorkerState {
    pub id: usize,
    pub status: WorkerStatus,
    pub accepted: u64,
    pub rejected: u64,
}

impl WorkerState {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Records one finished work item.
    pub fn record(&mut self, accepted: bool) {
        if accepted {
            self.accepted += 1;
        } else {
            self.rejected += 1;
        }
    }

    pub fn evaluated(&self) -> u64 {
        self.accepted + self.rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acceptance_rate_uses_all_evaluations() {
        let population = AcceptedPopulation::new(vec![1, 2, 3, 4], 16);
        assert_eq!(population.len(), 4);
        assert!((population.acceptance_rate() - 0.25).abs() < f64::EPSILON);
        let (particles, n_evaluated) = population.into_parts();
        assert_eq!(particles, vec![1, 2, 3, 4]);
        assert_eq!(n_evaluated, 16);
    }

    #[test]
    fn worker_state_counts_outcomes() {
        let mut state = WorkerState::new(3);
        state.record(true);
        state.record(false);
        state.record(false);
        assert_eq!(state.id, 3);
        assert_eq!(state.status, WorkerStatus::Idle);
        assert_eq!((state.accepted, state.rejected), (1, 2));
        assert_eq!(state.evaluated(), 3);
    }

    #[test]
    fn worker_state_serializes_status_in_kebab_case() {
        let mut state = WorkerState::new(0);
        state.status = WorkerStatus::Running;
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"running\""));
    }
}
