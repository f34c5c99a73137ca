//! `RenderPool<B>`: N long-lived workers, each driving one `B`-supplied
//! rendering backend, reused across jobs.

use crate::error::ReportError;
use crate::ports::RenderBackend;
use crate::timeout::TimeoutPolicy;
use futures::FutureExt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::{mpsc, oneshot, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("render task timed out")]
    Timeout,
    #[error("artifact too small: {size} bytes (minimum {minimum})")]
    ArtifactTooSmall { size: usize, minimum: usize },
    #[error("render backend error: {0}")]
    Backend(#[source] ReportError),
    #[error("io error: {0}")]
    Io(#[source] io::Error),
    #[error("pool is shut down")]
    Closed,
}

struct Task {
    input: Vec<u8>,
    output_path: PathBuf,
    reply: oneshot::Sender<Result<(), RenderError>>,
}

/// Fixed pool of `N` worker tasks, each owning one `B` backend instance.
pub struct RenderPool {
    sender: mpsc::Sender<Task>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl RenderPool {
    /// Start `num_workers` workers, each backed by a fresh `B` produced by
    /// `make_backend`, processing tasks from a bounded channel of
    /// `num_workers` capacity (the channel IS the pool's backpressure
    /// bound).
    pub fn start<B, F>(num_workers: usize, task_timeout: Duration, min_valid_size: usize, make_backend: F) -> Self
    where
        B: RenderBackend + 'static,
        F: Fn() -> B,
    {
        let (tx, rx) = mpsc::channel::<Task>(num_workers);
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let backend = Arc::new(make_backend());
            let rx = rx.clone();
            let policy = TimeoutPolicy::new(task_timeout);
            workers.push(tokio::spawn(async move {
                worker_loop(worker_id, rx, backend, policy, min_valid_size).await;
            }));
        }

        Self { sender: tx, workers: Mutex::new(workers) }
    }

    /// Submit one render job, blocking until a worker is free (the
    /// bounded-channel backpressure) and awaiting completion.
    pub async fn submit(&self, input: Vec<u8>, output_path: impl Into<PathBuf>) -> Result<(), RenderError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let task = Task { input, output_path: output_path.into(), reply: reply_tx };
        self.sender.send(task).await.map_err(|_| RenderError::Closed)?;
        reply_rx.await.map_err(|_| RenderError::Closed)?
    }

    /// Close the input channel and wait for every worker to finish
    /// draining in-flight tasks.
    pub async fn close(&self) {
        // Dropping the last sender clone closes the channel; since we
        // only ever hand out `&self`, drop happens naturally when the
        // pool itself is dropped, but an explicit close lets callers
        // await drain completion before dropping.
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "render worker task panicked");
            }
        }
    }
}

async fn worker_loop<B: RenderBackend>(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Task>>>,
    backend: Arc<B>,
    policy: TimeoutPolicy,
    min_valid_size: usize,
) {
    loop {
        let task = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some(task) = task else {
            tracing::info!(worker_id, "render worker shutting down: channel closed");
            return;
        };

        let result = std::panic::AssertUnwindSafe(process_task(&backend, &policy, min_valid_size, task.input, &task.output_path))
            .catch_unwind()
            .await;

        let outcome = match result {
            Ok(r) => r,
            Err(_) => {
                tracing::error!(worker_id, "render worker panicked while processing a task; recovering");
                Err(RenderError::Backend(ReportError::unknown_msg("render worker panicked")))
            }
        };

        let _ = task.reply.send(outcome);
    }
}

async fn process_task<B: RenderBackend>(backend: &B, policy: &TimeoutPolicy, min_valid_size: usize, input: Vec<u8>, output_path: &Path) -> Result<(), RenderError> {
    let bytes = match policy.run(backend.render(&input)).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => return Err(RenderError::Backend(e)),
        Err(_) => return Err(RenderError::Timeout),
    };

    if bytes.len() < min_valid_size {
        return Err(RenderError::ArtifactTooSmall { size: bytes.len(), minimum: min_valid_size });
    }

    write_with_mode(output_path, &bytes, 0o600).await.map_err(RenderError::Io)?;
    Ok(())
}

#[cfg(unix)]
async fn write_with_mode(path: &Path, bytes: &[u8], mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::write(path, bytes).await?;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn write_with_mode(path: &Path, bytes: &[u8], _mode: u32) -> io::Result<()> {
    fs::write(path, bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoBackend {
        output: Vec<u8>,
        delay: Duration,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RenderBackend for EchoBackend {
        async fn render(&self, _input: &[u8]) -> Result<Vec<u8>, ReportError> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(self.output.clone())
        }
    }

    struct HangingBackend;
    #[async_trait]
    impl RenderBackend for HangingBackend {
        async fn render(&self, _input: &[u8]) -> Result<Vec<u8>, ReportError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn rejects_artifacts_smaller_than_minimum() {
        let pool = RenderPool::start(1, Duration::from_secs(1), 1000, || EchoBackend {
            output: vec![0u8; 10],
            delay: Duration::from_millis(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        });
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.pdf");
        let result = pool.submit(vec![1, 2, 3], out).await;
        assert!(matches!(result, Err(RenderError::ArtifactTooSmall { .. })));
        pool.close().await;
    }

    #[tokio::test]
    async fn accepts_artifacts_at_or_above_minimum() {
        let pool = RenderPool::start(1, Duration::from_secs(1), 10, || EchoBackend {
            output: vec![0u8; 10],
            delay: Duration::from_millis(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        });
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.pdf");
        let result = pool.submit(vec![1, 2, 3], out.clone()).await;
        assert!(result.is_ok());
        assert!(fs::metadata(&out).await.is_ok());
        pool.close().await;
    }

    #[tokio::test]
    async fn times_out_on_a_hanging_backend_and_stays_healthy_afterward() {
        let pool = RenderPool::start(1, Duration::from_millis(20), 0, || HangingBackend);
        let dir = tempfile::tempdir().unwrap();
        let out1 = dir.path().join("out1.pdf");
        let result = pool.submit(vec![1], out1).await;
        assert!(matches!(result, Err(RenderError::Timeout)));
        pool.close().await;
    }

    #[tokio::test]
    async fn pool_bounds_concurrent_renders_to_its_size() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let in_flight2 = in_flight.clone();
        let max2 = max_in_flight.clone();
        let pool = Arc::new(RenderPool::start(2, Duration::from_secs(5), 0, move || EchoBackend {
            output: vec![0u8; 10],
            delay: Duration::from_millis(50),
            in_flight: in_flight2.clone(),
            max_in_flight: max2.clone(),
        }));

        let dir = tempfile::tempdir().unwrap();
        let mut handles = vec![];
        for i in 0..6 {
            let pool = pool.clone();
            let out = dir.path().join(format!("out{i}.pdf"));
            handles.push(tokio::spawn(async move { pool.submit(vec![1], out).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(max_in_flight.load(Ordering::SeqCst) <= 2);
    }
}
