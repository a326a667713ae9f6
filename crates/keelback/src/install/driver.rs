//! Concurrency control for the IO heavy phases of a transaction.

use std::sync::Arc;

use tokio::sync::Semaphore;

/// Bounds the number of concurrent IO operations during the fetch and
/// extract phases. Downloads and extractions are embarrassingly parallel,
/// but an unbounded fan-out starves the system of file handles and
/// bandwidth; the driver hands out permits instead.
#[derive(Debug, Clone)]
pub struct InstallDriver {
    io_permits: Arc<Semaphore>,
    io_limit: usize,
}

impl Default for InstallDriver {
    fn default() -> Self {
        Self::with_io_concurrency_limit(10)
    }
}

impl InstallDriver {
    /// A driver handing out at most `limit` concurrent IO permits.
    pub fn with_io_concurrency_limit(limit: usize) -> Self {
        let limit = limit.max(1);
        InstallDriver {
            io_permits: Arc::new(Semaphore::new(limit)),
            io_limit: limit,
        }
    }

    /// The configured concurrency limit.
    pub fn io_limit(&self) -> usize {
        self.io_limit
    }

    /// Runs the given future once an IO permit is available.
    pub async fn with_io_permit<T, F: std::future::Future<Output = T>>(&self, future: F) -> T {
        let _permit = self
            .io_permits
            .acquire()
            .await
            .expect("the semaphore is never closed");
        future.await
    }

    /// Runs blocking filesystem work on the blocking thread pool, guarded
    /// by an IO permit. Returns `None` when the task was cancelled.
    pub async fn run_blocking_io<T: Send + 'static>(
        &self,
        task: impl FnOnce() -> T + Send + 'static,
    ) -> Option<T> {
        let _permit = self
            .io_permits
            .acquire()
            .await
            .expect("the semaphore is never closed");
        tokio::task::spawn_blocking(task).await.ok()
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::InstallDriver;

    #[tokio::test]
    async fn permits_bound_concurrency() {
        let driver = InstallDriver::with_io_concurrency_limit(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let driver = driver.clone();
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    driver
                        .with_io_permit(async {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::task::yield_now().await;
                            running.fetch_sub(1, Ordering::SeqCst);
                        })
                        .await;
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
