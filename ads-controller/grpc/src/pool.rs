use crate::metrics::XdsMetrics;
use futures::future::BoxFuture;
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    time,
};
use tracing::Instrument;

/// A fixed set of workers that execute response jobs from a bounded queue.
///
/// Submitting a job waits while the queue is full, so slow responses throttle every stream that
/// submits work.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
}

/// Resolves when a submitted job has finished.
#[derive(Debug)]
pub struct Done(oneshot::Receiver<()>);

#[derive(Copy, Clone, Debug, thiserror::Error)]
#[error("worker pool has shut down")]
pub struct PoolClosed(());

struct Job {
    work: BoxFuture<'static, ()>,
    done: oneshot::Sender<()>,
}

// === impl WorkerPool ===

impl WorkerPool {
    /// Spawns `workers` workers onto the current runtime.
    pub fn spawn(workers: usize, capacity: usize, metrics: XdsMetrics) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        for id in 0..workers.max(1) {
            tokio::spawn(
                Self::work(rx.clone(), metrics.clone())
                    .instrument(tracing::debug_span!("worker", id)),
            );
        }
        Self { tx }
    }

    /// Enqueues a job, waiting for queue capacity.
    pub async fn add_job<F>(&self, work: F) -> Result<Done, PoolClosed>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (done, rx) = oneshot::channel();
        let job = Job {
            work: Box::pin(work),
            done,
        };
        self.tx.send(job).await.map_err(|_| PoolClosed(()))?;
        Ok(Done(rx))
    }

    async fn work(rx: Arc<Mutex<mpsc::Receiver<Job>>>, metrics: XdsMetrics) {
        loop {
            let next = rx.lock().await.recv().await;
            let Some(Job { work, done }) = next else {
                tracing::debug!("Job queue closed");
                return;
            };

            let start = time::Instant::now();
            // Jobs run on their own task so that a panicking job does not take down the worker.
            if let Err(error) = tokio::spawn(work).await {
                tracing::error!(%error, "Job failed");
            }
            metrics.jobs.inc();
            metrics
                .job_duration
                .observe(start.elapsed().as_secs_f64());
            let _ = done.send(());
        }
    }
}

// === impl Done ===

impl Future for Done {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // A dropped sender also means the job is no longer running.
        Pin::new(&mut self.0).poll(cx).map(|_| ())
    }
}
