// WorkerPool - bounded pool for blocking plugin code
//
// Plain and sequence entry points run on tokio's blocking threads. A semaphore
// caps how many run at once so a burst of slow calls cannot starve the host.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::DispatchError;

/// Bounded pool for running blocking plugin code off the scheduler
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Create a pool running at most `size` jobs at once (minimum 1)
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Create a pool sized to the machine's available parallelism
    pub fn with_default_size() -> Self {
        Self::new(default_size())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of idle workers
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run a blocking job on the pool and wait for its result.
    ///
    /// A job that has started cannot be interrupted; dropping the returned
    /// future only discards its result.
    pub async fn run<F, T>(&self, job: F) -> Result<T, DispatchError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| DispatchError::WorkerLost("worker pool closed".into()))?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|e| match e.try_into_panic() {
            Ok(payload) => DispatchError::panicked(payload),
            Err(e) => DispatchError::WorkerLost(e.to_string()),
        })
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::with_default_size()
    }
}

fn default_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
