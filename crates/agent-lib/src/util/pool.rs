//! Bounded worker pool
//!
//! A fixed-capacity job queue drained by a fixed number of worker tasks.
//! Jobs past capacity either wait (`submit`) or are rejected (`try_submit`).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Submission failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool queue is full")]
    Full,
    #[error("worker pool is shut down")]
    Closed,
}

/// Fixed-size pool of cooperating workers
pub struct WorkerPool {
    sender: mpsc::Sender<Job>,
    workers: usize,
}

impl WorkerPool {
    /// Spawn `workers` consumers on `tracker`; they stop when `token` is cancelled
    pub fn new(
        workers: usize,
        queue_capacity: usize,
        token: CancellationToken,
        tracker: &TaskTracker,
    ) -> Self {
        let workers = workers.max(1);
        let (sender, receiver) = mpsc::channel::<Job>(queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        for worker_id in 0..workers {
            let receiver = Arc::clone(&receiver);
            let token = token.clone();
            tracker.spawn(async move {
                loop {
                    let job = {
                        let mut rx = receiver.lock().await;
                        tokio::select! {
                            job = rx.recv() => job,
                            _ = token.cancelled() => None,
                        }
                    };
                    let Some(job) = job else { break };
                    tokio::select! {
                        _ = job => {}
                        _ = token.cancelled() => break,
                    }
                }
                debug!(worker_id, "Worker stopped");
            });
        }

        Self { sender, workers }
    }

    /// Queue a job, waiting for space when the queue is full
    pub async fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.sender
            .send(Box::pin(job))
            .await
            .map_err(|_| PoolError::Closed)
    }

    /// Queue a job without waiting
    pub fn try_submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.sender.try_send(Box::pin(job)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PoolError::Full,
            mpsc::error::TrySendError::Closed(_) => PoolError::Closed,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}
