//! Bounded sliding-window dispatch of work units.
//!
//! Shared by the future-based and the cluster-based samplers. A unit bundles
//! `batchsize` work items and carries a `quota`: it runs items until it has
//! evaluated all of them or collected `quota` acceptances. The window keeps at
//! most `client_max_jobs` units outstanding and only submits a new one while
//! the acceptances expected from the outstanding units fall short of the
//! deficit. Once `n` particles are in, nothing new is submitted, but every
//! outstanding unit is still waited for before returning: the backends offer
//! no cancellation. The same holds after a failure, including a reply that
//! cannot be decoded: it still accounts for one outstanding unit.

use std::collections::HashMap;
use std::thread;

use indicatif::ProgressBar;

use crate::config::WindowConfig;
use crate::core::{backoff, report_rate};
use crate::error::{SamplerError, TransportError};
use crate::estimate::AcceptanceEstimate;
use crate::model::{Evaluation, Model};
use crate::population::AcceptedPopulation;

/// One submitted unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UnitRequest {
    pub id: u64,
    pub items: usize,
    pub quota: usize,
}

/// What a finished unit produced.
#[derive(Debug)]
pub(crate) struct UnitOutcome<P> {
    pub accepted: Vec<P>,
    pub evaluated: usize,
}

#[derive(Debug)]
pub(crate) enum Resolution<P> {
    Done(UnitOutcome<P>),
    /// A simulate/accept call inside the unit failed.
    Failed(SamplerError),
    /// The unit never came back; it may be resubmitted.
    Lost(TransportError),
}

/// Where units go and how they come back.
pub(crate) trait UnitBackend<P> {
    fn submit(&mut self, unit: UnitRequest) -> Result<(), TransportError>;

    /// Blocks until any outstanding unit resolves.
    fn next_resolved(&mut self) -> Result<(u64, Resolution<P>), TransportError>;
}

/// Runs one unit in the current thread.
pub(crate) fn run_unit<P>(model: &Model<P>, unit: &UnitRequest) -> Result<UnitOutcome<P>, SamplerError> {
    let mut accepted = Vec::new();
    let mut evaluated = 0;
    for _ in 0..unit.items {
        if accepted.len() >= unit.quota {
            break;
        }
        evaluated += 1;
        if let Evaluation::Accepted(particle) = model.evaluate()? {
            accepted.push(particle);
        }
    }
    Ok(UnitOutcome {
        accepted,
        evaluated,
    })
}

/// Dispatch counters for one generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowStats {
    /// Units handed to the backend, resubmissions included.
    pub submissions: usize,
    /// Work items carried by those units, evaluated or skipped.
    pub items_issued: usize,
    /// Units resubmitted after being lost.
    pub retries: usize,
}

struct Outstanding {
    unit: UnitRequest,
    attempts: usize,
}

fn submit_with_retry<P, B: UnitBackend<P>>(
    backend: &mut B,
    unit: UnitRequest,
    max_retries: usize,
) -> Result<(), TransportError> {
    let mut attempt = 0;
    loop {
        match backend.submit(unit) {
            Ok(()) => return Ok(()),
            Err(err) if err.is_transient() && attempt < max_retries => {
                attempt += 1;
                log::warn!("submitting unit {} failed ({err}), retry {attempt}", unit.id);
                thread::sleep(backoff(attempt));
            }
            Err(err) if attempt > 0 => {
                return Err(TransportError::RetriesExhausted {
                    attempts: attempt + 1,
                    last: Box::new(err),
                })
            }
            Err(err) => return Err(err),
        }
    }
}

/// Drives `backend` until `n` particles are accepted and the window is empty.
pub(crate) fn run_window<P, B: UnitBackend<P>>(
    backend: &mut B,
    n: usize,
    config: &WindowConfig,
    pb: &ProgressBar,
) -> Result<(AcceptedPopulation<P>, WindowStats), SamplerError> {
    let mut estimate = AcceptanceEstimate::new();
    let mut stats = WindowStats::default();
    let mut outstanding: HashMap<u64, Outstanding> = HashMap::new();
    let mut particles: Vec<(u64, usize, P)> = Vec::with_capacity(n);
    let mut n_evaluated = 0;
    let mut next_id = 0;
    let mut failure: Option<SamplerError> = None;
    // replies that arrived but named no unit we could decode
    let mut unreadable = 0;

    loop {
        while failure.is_none() && particles.len() < n && outstanding.len() < config.client_max_jobs {
            let deficit = n - particles.len();
            let reserved: f64 = outstanding
                .values()
                .map(|o| estimate.expected_yield(o.unit.items).min(o.unit.quota as f64))
                .sum();
            if reserved >= deficit as f64 {
                break;
            }
            let quota = ((deficit as f64 - reserved).ceil() as usize).clamp(1, config.batchsize);
            let unit = UnitRequest {
                id: next_id,
                items: config.batchsize,
                quota,
            };
            next_id += 1;
            if let Err(err) = submit_with_retry(backend, unit, config.max_retries) {
                failure = Some(err.into());
                break;
            }
            stats.submissions += 1;
            stats.items_issued += unit.items;
            outstanding.insert(unit.id, Outstanding { unit, attempts: 0 });
        }

        if outstanding.len() <= unreadable {
            break;
        }

        let (id, resolution) = match backend.next_resolved() {
            Ok(resolved) => resolved,
            Err(err) if err.is_codec() => {
                log::warn!("undecodable reply, draining the window: {err}");
                failure.get_or_insert(err.into());
                unreadable += 1;
                continue;
            }
            // nothing more will come back from a broken backend
            Err(err) => return Err(failure.unwrap_or_else(|| err.into())),
        };
        let Some(entry) = outstanding.remove(&id) else {
            log::warn!("ignoring resolution of unknown unit {id}");
            continue;
        };

        match resolution {
            Resolution::Done(outcome) => {
                n_evaluated += outcome.evaluated;
                estimate.observe(outcome.accepted.len(), outcome.evaluated);
                for (index, particle) in outcome.accepted.into_iter().enumerate() {
                    if particles.len() < n {
                        particles.push((id, index, particle));
                        pb.inc(1);
                    }
                }
                report_rate(pb, particles.len(), n_evaluated);
            }
            Resolution::Failed(err) => {
                if failure.is_none() {
                    log::debug!("unit {id} failed, draining the window: {err}");
                    failure = Some(err);
                }
            }
            Resolution::Lost(err) => {
                if failure.is_some() {
                    continue;
                }
                if !err.is_transient() {
                    failure = Some(err.into());
                } else if entry.attempts >= config.max_retries {
                    failure = Some(
                        TransportError::RetriesExhausted {
                            attempts: entry.attempts + 1,
                            last: Box::new(err),
                        }
                        .into(),
                    );
                } else {
                    log::warn!(
                        "unit {id} lost ({err}), resubmitting (attempt {})",
                        entry.attempts + 2
                    );
                    match submit_with_retry(backend, entry.unit, config.max_retries) {
                        Ok(()) => {
                            stats.submissions += 1;
                            stats.items_issued += entry.unit.items;
                            stats.retries += 1;
                            outstanding.insert(
                                id,
                                Outstanding {
                                    unit: entry.unit,
                                    attempts: entry.attempts + 1,
                                },
                            );
                        }
                        Err(err) => failure = Some(err.into()),
                    }
                }
            }
        }
    }

    if let Some(err) = failure {
        return Err(err);
    }
    particles.sort_by_key(|(id, index, _)| (*id, *index));
    let particles = particles.into_iter().map(|(_, _, p)| p).collect();
    Ok((AcceptedPopulation::new(particles, n_evaluated), stats))
}
