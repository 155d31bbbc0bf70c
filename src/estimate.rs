//! Acceptance-rate estimation and the speculation budget derived from it.
//!
//! Parallel backends speculate: they issue more work items than the number of
//! acceptances still missing, because some of them will be rejected. The budget
//! is `ceil(deficit / rate)` where the rate starts at an optimistic prior (1.0
//! unless told otherwise) and afterwards is the observed acceptance fraction,
//! floored at `1 / (evaluated + 1)` so a streak of rejections keeps widening the
//! budget instead of collapsing it. With every item accepted the estimate never
//! leaves 1.0, so no work is wasted.

/// Running acceptance statistics for one generation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcceptanceEstimate {
    accepted: usize,
    evaluated: usize,
    prior_rate: f64,
}

impl Default for AcceptanceEstimate {
    fn default() -> Self {
        Self::new()
    }
}

impl AcceptanceEstimate {
    /// Estimator with the optimistic prior rate of 1.0.
    pub fn new() -> Self {
        Self::with_prior(1.0)
    }

    /// Estimator with a caller supplied prior, clamped into `(0, 1]`.
    pub fn with_prior(prior_rate: f64) -> Self {
        let prior_rate = if prior_rate.is_finite() && prior_rate > 0.0 {
            prior_rate.min(1.0)
        } else {
            1.0
        };
        Self {
            accepted: 0,
            evaluated: 0,
            prior_rate,
        }
    }

    /// Folds in a batch of finished work items.
    pub fn observe(&mut self, accepted: usize, evaluated: usize) {
        debug_assert!(accepted <= evaluated);
        self.accepted += accepted;
        self.evaluated += evaluated;
    }

    pub fn accepted(&self) -> usize {
        self.accepted
    }

    pub fn evaluated(&self) -> usize {
        self.evaluated
    }

    /// Current acceptance-rate estimate, always in `(0, 1]`.
    pub fn rate(&self) -> f64 {
        if self.evaluated == 0 {
            return self.prior_rate;
        }
        let observed = self.accepted as f64 / self.evaluated as f64;
        observed.max(1.0 / (self.evaluated as f64 + 1.0))
    }

    /// Number of work items expected to yield `deficit` acceptances.
    pub fn budget(&self, deficit: usize) -> usize {
        if deficit == 0 {
            return 0;
        }
        (deficit as f64 / self.rate()).ceil() as usize
    }

    /// Size of the next batch for backends that dispatch whole batches.
    ///
    /// Never below `deficit`, and never more than double the previous batch
    /// unless the deficit alone requires it.
    pub fn next_batch(&self, deficit: usize, previous: usize) -> usize {
        let budget = self.budget(deficit).max(deficit);
        if previous == 0 {
            return budget;
        }
        budget.min(previous.saturating_mul(2)).max(deficit)
    }

    /// Expected number of acceptances from `items` work items.
    pub fn expected_yield(&self, items: usize) -> f64 {
        items as f64 * self.rate()
    }
}
