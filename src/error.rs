//! Error types for every sampling backend.
//!
//! Failures fall into three families that are never conflated:
//! a user simulation (or acceptance test) failing, the execution backend
//! itself failing to move work around, and invalid configuration.

use thiserror::Error;

/// Boxed error returned by user supplied `simulate_one`/`accept_one` callables.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Unified error type returned by [`Sampler::sample_until_n_accepted`](crate::core::Sampler).
#[derive(Error, Debug)]
pub enum SamplerError {
    /// `simulate_one` or `accept_one` failed (returned an error or panicked).
    #[error("{stage} failed: {source}")]
    Simulation {
        /// Where the failure was raised: `"simulate_one"` or `"accept_one"` for
        /// in-process calls, `"remote task"` for a cluster task and
        /// `"fleet worker"` for a Redis worker.
        stage: &'static str,
        #[source]
        source: BoxError,
    },

    /// The executor, cluster or broker could not dispatch or return work.
    #[error("backend transport error: {0}")]
    Transport(#[from] TransportError),

    /// Invalid construction or call parameters.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl SamplerError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        SamplerError::Configuration(message.into())
    }

    /// Creates a simulation error for the given stage.
    pub fn simulation(stage: &'static str, source: impl Into<BoxError>) -> Self {
        SamplerError::Simulation {
            stage,
            source: source.into(),
        }
    }

    /// Returns `true` for failures raised by the user callables.
    pub fn is_simulation(&self) -> bool {
        matches!(self, SamplerError::Simulation { .. })
    }

    /// Returns `true` for failures of the execution backend.
    pub fn is_transport(&self) -> bool {
        matches!(self, SamplerError::Transport(_))
    }
}

/// Failures of the machinery that carries work to workers and results back.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The backend could not be reached at all (e.g. broker down at startup).
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The backend went away while work was outstanding.
    #[error("backend disconnected: {0}")]
    Disconnected(String),

    /// A single submitted unit was lost; the unit may be resubmitted.
    #[error("unit lost in transit: {0}")]
    Lost(String),

    /// A transient failure persisted across every allowed attempt.
    #[error("gave up after {attempts} attempts")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        last: Box<TransportError>,
    },

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("wire codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("particle codec error: {0}")]
    Payload(#[from] bincode::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether a message arrived but could not be decoded.
    pub fn is_codec(&self) -> bool {
        matches!(self, TransportError::Codec(_) | TransportError::Payload(_))
    }

    /// Whether retrying the affected unit can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Lost(_) => true,
            TransportError::Redis(err) => {
                err.is_io_error() || err.is_connection_dropped() || err.is_timeout()
            }
            TransportError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn simulation_error_keeps_its_source() {
        let err = SamplerError::simulation("simulate_one", "model diverged");
        assert!(err.is_simulation());
        assert!(!err.is_transport());
        assert_eq!(err.to_string(), "simulate_one failed: model diverged");
        assert_eq!(err.source().unwrap().to_string(), "model diverged");
    }

    #[test]
    fn transport_errors_convert_into_sampler_errors() {
        let err: SamplerError = TransportError::Disconnected("scheduler closed".into()).into();
        assert!(err.is_transport());
        assert!(err.to_string().contains("scheduler closed"));
    }

    #[test]
    fn only_lost_units_and_flaky_io_are_transient() {
        assert!(TransportError::Lost("worker restarted".into()).is_transient());
        assert!(!TransportError::Unreachable("no broker".into()).is_transient());
        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(TransportError::Io(timeout).is_transient());
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(!TransportError::Io(denied).is_transient());
    }

    #[test]
    fn undecodable_messages_are_codec_errors() {
        let garbled = TransportError::Payload(Box::new(bincode::ErrorKind::Custom("truncated".into())));
        assert!(garbled.is_codec());
        assert!(!garbled.is_transient());
        assert!(!TransportError::Lost("dropped".into()).is_codec());
    }

    #[test]
    fn exhausted_retries_expose_the_last_failure() {
        let err = TransportError::RetriesExhausted {
            attempts: 3,
            last: Box::new(TransportError::Lost("dropped".into())),
        };
        assert_eq!(err.to_string(), "gave up after 3 attempts");
        assert!(err.source().unwrap().to_string().contains("dropped"));
    }
}
