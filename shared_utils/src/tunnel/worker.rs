//! Bounded pool for collaborator I/O.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::error;

use crate::tunnel::error::{TunnelError, TunnelResult};

/// Default number of collaborator calls allowed in flight.
pub const DEFAULT_WORKERS: usize = 4;

/// Runs collaborator calls on their own tasks, at most `workers` at a time.
///
/// A spawned call runs to completion even if the caller stops waiting.
#[derive(Debug, Clone)]
pub struct AsyncWorker {
    permits: Arc<Semaphore>,
}

impl AsyncWorker {
    pub fn new(workers: usize) -> Self {
        AsyncWorker {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Run `fut` on the pool and wait for its output.
    pub async fn run<F, T>(&self, fut: F) -> TunnelResult<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            // The semaphore is never closed, so acquire only fails if it were.
            let _permit = permits.acquire_owned().await.ok();
            fut.await
        })
        .await
        .map_err(|e| {
            error!(error = %e, "Worker task failed");
            TunnelError::Worker(e.to_string())
        })
    }

    /// Run a fallible call and flatten its error into the tunnel error space.
    pub async fn try_run<F, T, E>(&self, fut: F, map_err: impl FnOnce(E) -> TunnelError) -> TunnelResult<T>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.run(fut).await?.map_err(map_err)
    }
}

impl Default for AsyncWorker {
    fn default() -> Self {
        AsyncWorker::new(DEFAULT_WORKERS)
    }
}

/// Run an orchestration step detached from the caller, so dropping the
/// caller's future does not cancel it half way.
pub(crate) async fn detach<F, T>(fut: F) -> TunnelResult<T>
where
    F: Future<Output = TunnelResult<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(fut)
        .await
        .map_err(|e| TunnelError::Worker(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_pool_limits_concurrency() {
        let worker = AsyncWorker::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let runs = (0..6).map(|_| {
            let active = active.clone();
            let peak = peak.clone();
            worker.run(async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            })
        });
        for result in futures::future::join_all(runs).await {
            assert!(result.is_ok());
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_panicking_call_becomes_worker_error() {
        let worker = AsyncWorker::default();
        let result: TunnelResult<()> = worker.run(async { panic!("boom") }).await;
        assert!(matches!(result, Err(TunnelError::Worker(_))));
    }

    #[tokio::test]
    async fn test_try_run_maps_errors() {
        let worker = AsyncWorker::default();
        let result: TunnelResult<u8> = worker
            .try_run(async { Err::<u8, _>("nope") }, |e| TunnelError::NotFound(e.to_string()))
            .await;
        assert!(matches!(result, Err(TunnelError::NotFound(n)) if n == "nope"));
    }
}
