use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::{Result, SagaError};

/// Bounds how many sagas execute at once.
///
/// A saga waiting on a slow downstream call holds one permit; unrelated sagas
/// proceed on the remaining ones.
#[derive(Debug, Clone)]
pub struct SagaWorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl SagaWorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of idle workers.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Runs `task` once a worker is free.
    pub async fn run<F, T>(&self, task: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| SagaError::PoolClosed)?;
        metrics::gauge!("saga_workers_busy").increment(1.0);
        let result = task.await;
        metrics::gauge!("saga_workers_busy").decrement(1.0);
        result
    }

    /// Spawns `task` onto the runtime; it starts once a worker is free.
    pub fn spawn<F, T>(&self, task: F) -> JoinHandle<Result<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.clone();
        tokio::spawn(async move { pool.run(task).await })
    }

    /// Stops handing out workers. Queued and future tasks fail with `PoolClosed`.
    pub fn close(&self) {
        self.permits.close();
    }
}
