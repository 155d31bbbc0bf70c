//! "Submit a callable, get back a handle that eventually resolves."
//!
//! [`Executor`] is the narrow capability the future-based sampler is generic
//! over. A [`JobHandle`] wraps the receiving end of a one-shot channel so the
//! dispatcher can wait on many handles at once with
//! [`crossbeam_channel::Select`]. A job that dies without producing a value
//! (its thread panicked, its pool was torn down) drops the sender, and the
//! handle resolves to [`TransportError::Lost`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use crossbeam_channel::{bounded, Receiver, Sender};
use rayon::ThreadPool;

use crate::core::worker_pool;
use crate::error::{SamplerError, TransportError};

/// Handle to one submitted job.
#[derive(Debug)]
pub struct JobHandle<T> {
    receiver: Receiver<T>,
}

impl<T> JobHandle<T> {
    /// Creates a connected sender/handle pair. Executors send the job's value
    /// exactly once; dropping the sender marks the job as lost.
    pub fn channel() -> (Sender<T>, JobHandle<T>) {
        let (sender, receiver) = bounded(1);
        (sender, JobHandle { receiver })
    }

    /// Blocks until the job resolves.
    pub fn wait(self) -> Result<T, TransportError> {
        self.receiver
            .recv()
            .map_err(|_| TransportError::Lost("job ended without a result".to_string()))
    }

    pub(crate) fn receiver(&self) -> &Receiver<T> {
        &self.receiver
    }
}

/// Anything that can run a job somewhere else and hand back a [`JobHandle`].
pub trait Executor: Send + Sync {
    fn submit<T, F>(&self, job: F) -> Result<JobHandle<T>, TransportError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static;

    /// Releases the executor's resources. Later submissions fail.
    fn shutdown(&self) {}
}

fn run_and_send<T, F>(sender: Sender<T>, job: F)
where
    F: FnOnce() -> T,
{
    match catch_unwind(AssertUnwindSafe(job)) {
        Ok(value) => {
            // the dispatcher may have gone away; nothing to deliver to then
            let _ = sender.send(value);
        }
        Err(_) => log::warn!("job panicked; its handle resolves as lost"),
    }
}

/// Jobs run on a shared rayon pool.
pub struct ThreadPoolExecutor {
    pool: RwLock<Option<Arc<ThreadPool>>>,
}

impl ThreadPoolExecutor {
    pub fn new(n_workers: usize) -> Result<Self, SamplerError> {
        if n_workers == 0 {
            return Err(SamplerError::config("n_workers must be at least 1"));
        }
        Ok(Self {
            pool: RwLock::new(Some(Arc::new(worker_pool(n_workers, "abc-future")?))),
        })
    }

    pub fn is_shut_down(&self) -> bool {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl Executor for ThreadPoolExecutor {
    fn submit<T, F>(&self, job: F) -> Result<JobHandle<T>, TransportError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let pool = self
            .pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| TransportError::Disconnected("thread pool has been shut down".into()))?;
        let (sender, handle) = JobHandle::channel();
        pool.spawn(move || run_and_send(sender, job));
        Ok(handle)
    }

    fn shutdown(&self) {
        if self
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            log::info!("stopped abc-future pool");
        }
    }
}

/// One fresh OS thread per job; no pool is shared between jobs.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpawnExecutor;

impl Executor for SpawnExecutor {
    fn submit<T, F>(&self, job: F) -> Result<JobHandle<T>, TransportError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (sender, handle) = JobHandle::channel();
        std::thread::Builder::new()
            .name("abc-job".to_string())
            .spawn(move || run_and_send(sender, job))?;
        Ok(handle)
    }
}
