use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::QueueConfig;

/// A job the queue can carry: a stage label for logs plus a per-call key so
/// operators can trace one call's pipeline across redeliveries.
pub trait QueueJob: Clone + Send + std::fmt::Debug + 'static {
    fn stage(&self) -> &'static str;
    fn job_key(&self) -> String;
}

#[async_trait]
pub trait JobHandler<J: QueueJob>: Send + Sync {
    /// Handles one delivery. An `Err` triggers redelivery until the per-stage
    /// attempt budget is spent, after which the job is abandoned (visible at
    /// error level for operator follow-up).
    async fn handle(&self, job: J, queue: &QueueHandle<J>) -> Result<()>;

    /// Called exactly once when a job is abandoned, with its final payload.
    /// Stages that hold resources use it to schedule terminal cleanup.
    async fn on_exhausted(&self, _job: J, _queue: &QueueHandle<J>) {}
}

struct Envelope<J> {
    id: Uuid,
    attempt: u32,
    job: J,
}

/// Cloneable producer side; handlers use it to schedule follow-up stages.
pub struct QueueHandle<J> {
    sender: mpsc::UnboundedSender<Envelope<J>>,
}

impl<J> Clone for QueueHandle<J> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<J: QueueJob> QueueHandle<J> {
    pub fn enqueue(&self, job: J) -> Result<Uuid> {
        let id = Uuid::new_v4();
        debug!(job_id = %id, stage = job.stage(), key = %job.job_key(), "job enqueued");
        self.sender
            .send(Envelope {
                id,
                attempt: 1,
                job,
            })
            .map_err(|_| anyhow::anyhow!("job queue is closed"))?;
        Ok(id)
    }

    fn requeue(&self, envelope: Envelope<J>) {
        if self.sender.send(envelope).is_err() {
            warn!("job queue closed while requeueing");
        }
    }
}

/// At-least-once in-process job queue. A fixed worker pool drains a shared
/// channel; a failed delivery is redelivered after a backoff with jitter.
/// Different calls run concurrently; one call's stages stay causally chained
/// because each stage enqueues its successor from inside its handler.
pub struct JobQueue<J: QueueJob> {
    handle: QueueHandle<J>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Envelope<J>>>>,
    config: QueueConfig,
}

impl<J: QueueJob> JobQueue<J> {
    pub fn new(config: QueueConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            handle: QueueHandle { sender },
            receiver: Arc::new(Mutex::new(receiver)),
            config,
        }
    }

    pub fn handle(&self) -> QueueHandle<J> {
        self.handle.clone()
    }

    pub async fn serve(&self, handler: Arc<dyn JobHandler<J>>, cancel_token: CancellationToken) {
        let mut workers = Vec::new();
        for worker_id in 0..self.config.workers.max(1) {
            let receiver = self.receiver.clone();
            let handle = self.handle.clone();
            let handler = handler.clone();
            let token = cancel_token.clone();
            let config = self.config.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let envelope = {
                        let mut receiver = receiver.lock().await;
                        select! {
                            _ = token.cancelled() => break,
                            envelope = receiver.recv() => match envelope {
                                Some(envelope) => envelope,
                                None => break,
                            },
                        }
                    };
                    Self::deliver(&handler, &handle, &config, envelope).await;
                }
                debug!(worker_id, "queue worker stopped");
            }));
        }
        for worker in workers {
            worker.await.ok();
        }
    }

    async fn deliver(
        handler: &Arc<dyn JobHandler<J>>,
        handle: &QueueHandle<J>,
        config: &QueueConfig,
        envelope: Envelope<J>,
    ) {
        let stage = envelope.job.stage();
        let key = envelope.job.job_key();
        match handler.handle(envelope.job.clone(), handle).await {
            Ok(_) => {
                debug!(job_id = %envelope.id, stage, key = %key, "job completed");
            }
            Err(e) if envelope.attempt < config.retry_attempts => {
                warn!(
                    job_id = %envelope.id,
                    stage,
                    key = %key,
                    attempt = envelope.attempt,
                    "job failed, will retry: {}", e
                );
                let delay = retry_delay(config.retry_backoff_secs);
                let handle = handle.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    handle.requeue(Envelope {
                        id: envelope.id,
                        attempt: envelope.attempt + 1,
                        job: envelope.job,
                    });
                });
            }
            Err(e) => {
                error!(
                    job_id = %envelope.id,
                    stage,
                    key = %key,
                    attempts = envelope.attempt,
                    "job abandoned after exhausting retries: {}", e
                );
                handler.on_exhausted(envelope.job, handle).await;
            }
        }
    }
}

fn retry_delay(backoff_secs: u64) -> Duration {
    let jitter_ms = rand::rng().random_range(0..1000);
    Duration::from_secs(backoff_secs) + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Clone, Debug, PartialEq)]
    enum TestJob {
        First(String),
        Second(String),
    }

    impl QueueJob for TestJob {
        fn stage(&self) -> &'static str {
            match self {
                TestJob::First(_) => "first",
                TestJob::Second(_) => "second",
            }
        }

        fn job_key(&self) -> String {
            match self {
                TestJob::First(k) | TestJob::Second(k) => k.clone(),
            }
        }
    }

    struct ChainHandler {
        seconds: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl JobHandler<TestJob> for ChainHandler {
        async fn handle(&self, job: TestJob, queue: &QueueHandle<TestJob>) -> Result<()> {
            match job {
                TestJob::First(key) => {
                    queue.enqueue(TestJob::Second(key))?;
                }
                TestJob::Second(key) => {
                    self.seconds.send(key).ok();
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_handler_chains_follow_up_stage() {
        let queue = JobQueue::new(QueueConfig {
            workers: 2,
            retry_attempts: 1,
            retry_backoff_secs: 0,
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let handle = queue.handle();

        let serve_token = token.clone();
        let serve = tokio::spawn(async move {
            queue
                .serve(Arc::new(ChainHandler { seconds: tx }), serve_token)
                .await;
        });

        handle.enqueue(TestJob::First("call-9".to_string())).unwrap();
        let delivered = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(delivered, Some("call-9".to_string()));

        token.cancel();
        serve.await.unwrap();
    }

    struct FlakyHandler {
        calls: Arc<AtomicU32>,
        done: mpsc::UnboundedSender<u32>,
    }

    #[async_trait]
    impl JobHandler<TestJob> for FlakyHandler {
        async fn handle(&self, _job: TestJob, _queue: &QueueHandle<TestJob>) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                anyhow::bail!("transient");
            }
            self.done.send(n).ok();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_job_is_redelivered() {
        let queue = JobQueue::new(QueueConfig {
            workers: 1,
            retry_attempts: 5,
            retry_backoff_secs: 0,
        });
        let calls = Arc::new(AtomicU32::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let handle = queue.handle();

        let handler = Arc::new(FlakyHandler {
            calls: calls.clone(),
            done: tx,
        });
        let serve_token = token.clone();
        let serve = tokio::spawn(async move {
            queue.serve(handler, serve_token).await;
        });

        handle.enqueue(TestJob::First("call-1".to_string())).unwrap();
        let n = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(n, Some(3));

        token.cancel();
        serve.await.unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_job_is_abandoned() {
        let queue = JobQueue::new(QueueConfig {
            workers: 1,
            retry_attempts: 2,
            retry_backoff_secs: 0,
        });
        let calls = Arc::new(AtomicU32::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let handle = queue.handle();

        struct AlwaysFail {
            calls: Arc<AtomicU32>,
            _done: mpsc::UnboundedSender<u32>,
        }

        #[async_trait]
        impl JobHandler<TestJob> for AlwaysFail {
            async fn handle(&self, _job: TestJob, _queue: &QueueHandle<TestJob>) -> Result<()> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("permanent")
            }
        }

        let handler = Arc::new(AlwaysFail {
            calls: calls.clone(),
            _done: tx,
        });
        let serve_token = token.clone();
        let serve = tokio::spawn(async move {
            queue.serve(handler, serve_token).await;
        });

        handle.enqueue(TestJob::First("call-2".to_string())).unwrap();
        // nothing to wait on besides the attempts settling
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(rx.try_recv().is_err());

        token.cancel();
        serve.await.unwrap();
    }

    struct FailWithCleanup {
        exhausted: mpsc::UnboundedSender<TestJob>,
    }

    #[async_trait]
    impl JobHandler<TestJob> for FailWithCleanup {
        async fn handle(&self, _job: TestJob, _queue: &QueueHandle<TestJob>) -> Result<()> {
            anyhow::bail!("permanent")
        }

        async fn on_exhausted(&self, job: TestJob, _queue: &QueueHandle<TestJob>) {
            self.exhausted.send(job).ok();
        }
    }

    #[tokio::test]
    async fn test_exhausted_job_invokes_terminal_hook() {
        let queue = JobQueue::new(QueueConfig {
            workers: 1,
            retry_attempts: 2,
            retry_backoff_secs: 0,
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let handle = queue.handle();

        let serve_token = token.clone();
        let serve = tokio::spawn(async move {
            queue
                .serve(Arc::new(FailWithCleanup { exhausted: tx }), serve_token)
                .await;
        });

        handle.enqueue(TestJob::First("call-3".to_string())).unwrap();
        let job = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(job, Some(TestJob::First("call-3".to_string())));
        // the hook fires once, on the final failure only
        assert!(rx.try_recv().is_err());

        token.cancel();
        serve.await.unwrap();
    }
}
