//! At-least-once step queue.
//!
//! `LocalQueue` is the in-process implementation: messages go through a tokio
//! channel, a consumer pool processes up to `workers` of them at once, and a
//! handler error redelivers the message after a short delay. A message that
//! fails `max_deliveries` times is dead-lettered.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, error, info, warn};

use crate::pipeline::models::PipelineMessage;

/// Producer side of the queue.
#[async_trait]
pub trait StepQueue: Send + Sync {
    async fn enqueue(&self, message: PipelineMessage) -> anyhow::Result<()>;
}

/// Consumer side. `Ok` acknowledges the message; `Err` asks for redelivery.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn handle(&self, message: PipelineMessage) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    pub workers: usize,
    pub max_deliveries: u32,
    pub redelivery_delay: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            max_deliveries: 3,
            redelivery_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
struct Delivery {
    message: PipelineMessage,
    attempt: u32,
}

/// A message that exhausted its delivery budget.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    pub message: PipelineMessage,
    pub attempts: u32,
    pub last_error: String,
    pub dead_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct LocalQueue {
    tx: mpsc::UnboundedSender<Delivery>,
    dead_letters: Arc<Mutex<Vec<DeadLetter>>>,
}

/// Receiving half, consumed by [`QueueConsumer::run`].
pub struct QueueConsumer {
    rx: mpsc::UnboundedReceiver<Delivery>,
    tx: mpsc::UnboundedSender<Delivery>,
    dead_letters: Arc<Mutex<Vec<DeadLetter>>>,
    settings: QueueSettings,
}

impl LocalQueue {
    pub fn new(settings: QueueSettings) -> (Self, QueueConsumer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dead_letters = Arc::new(Mutex::new(Vec::new()));
        let queue = Self {
            tx: tx.clone(),
            dead_letters: dead_letters.clone(),
        };
        let consumer = QueueConsumer {
            rx,
            tx,
            dead_letters,
            settings,
        };
        (queue, consumer)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StepQueue for LocalQueue {
    async fn enqueue(&self, message: PipelineMessage) -> anyhow::Result<()> {
        debug!(job_id = %message.job_id, step = %message.kind, "enqueue");
        self.tx
            .send(Delivery {
                message,
                attempt: 1,
            })
            .map_err(|_| anyhow!("step queue is closed"))
    }
}

impl QueueConsumer {
    /// Process deliveries until `shutdown` resolves, then wait for in-flight
    /// messages to finish.
    pub async fn run<S>(mut self, handler: Arc<dyn StepHandler>, shutdown: S)
    where
        S: Future<Output = ()> + Send,
    {
        let workers = self.settings.workers.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        tokio::pin!(shutdown);
        info!(workers, "queue consumer started");

        loop {
            let delivery = tokio::select! {
                _ = &mut shutdown => break,
                delivery = self.rx.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let handler = handler.clone();
            let tx = self.tx.clone();
            let dead_letters = self.dead_letters.clone();
            let settings = self.settings;

            tokio::spawn(async move {
                let _permit = permit;
                process(delivery, handler, tx, dead_letters, settings).await;
            });
        }

        // Wait for in-flight work by taking every permit back.
        let _ = semaphore.acquire_many(workers as u32).await;
        info!("queue consumer stopped");
    }
}

async fn process(
    delivery: Delivery,
    handler: Arc<dyn StepHandler>,
    tx: mpsc::UnboundedSender<Delivery>,
    dead_letters: Arc<Mutex<Vec<DeadLetter>>>,
    settings: QueueSettings,
) {
    let Delivery { message, attempt } = delivery;
    let result = handler.handle(message.clone()).await;
    let Err(err) = result else {
        return;
    };

    if attempt < settings.max_deliveries {
        warn!(
            job_id = %message.job_id,
            step = %message.kind,
            attempt,
            error = %err,
            "step handler failed, redelivering"
        );
        let redelivery = Delivery {
            message,
            attempt: attempt + 1,
        };
        tokio::spawn(async move {
            tokio::time::sleep(settings.redelivery_delay).await;
            if tx.send(redelivery).is_err() {
                warn!("queue closed before redelivery");
            }
        });
        return;
    }

    error!(
        job_id = %message.job_id,
        step = %message.kind,
        attempts = attempt,
        error = %err,
        "step dead-lettered"
    );
    if let Ok(mut letters) = dead_letters.lock() {
        letters.push(DeadLetter {
            message,
            attempts: attempt,
            last_error: format!("{err:#}"),
            dead_at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::oneshot;

    use super::*;
    use crate::pipeline::models::StepKind;

    fn message(job: &str) -> PipelineMessage {
        PipelineMessage {
            kind: StepKind::GenerateSpec,
            job_id: job.to_string(),
            owner_id: "o1".to_string(),
            title: None,
        }
    }

    fn fast() -> QueueSettings {
        QueueSettings {
            workers: 2,
            max_deliveries: 3,
            redelivery_delay: Duration::from_millis(5),
        }
    }

    /// Fails the first `failures` calls, then succeeds.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
        done: Mutex<Option<oneshot::Sender<()>>>,
        finish_after: usize,
    }

    #[async_trait]
    impl StepHandler for Flaky {
        async fn handle(&self, _message: PipelineMessage) -> anyhow::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.finish_after {
                if let Some(tx) = self.done.lock().unwrap().take() {
                    let _ = tx.send(());
                }
            }
            if call <= self.failures {
                anyhow::bail!("transient failure {call}");
            }
            Ok(())
        }
    }

    async fn run_until(
        settings: QueueSettings,
        handler: Arc<Flaky>,
        done: oneshot::Receiver<()>,
        messages: Vec<PipelineMessage>,
    ) -> LocalQueue {
        let (queue, consumer) = LocalQueue::new(settings);
        for m in messages {
            queue.enqueue(m).await.unwrap();
        }
        let shutdown = async move {
            let _ = tokio::time::timeout(Duration::from_secs(5), done).await;
            // Give the last redelivery or dead-letter write a moment to land.
            tokio::time::sleep(Duration::from_millis(50)).await;
        };
        consumer.run(handler, shutdown).await;
        queue
    }

    #[tokio::test]
    async fn test_redelivers_until_handler_succeeds() {
        let (tx, rx) = oneshot::channel();
        let handler = Arc::new(Flaky {
            failures: 2,
            calls: AtomicUsize::new(0),
            done: Mutex::new(Some(tx)),
            finish_after: 3,
        });
        let queue = run_until(fast(), handler.clone(), rx, vec![message("j1")]).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(queue.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_dead_letters_after_max_deliveries() {
        let (tx, rx) = oneshot::channel();
        let handler = Arc::new(Flaky {
            failures: usize::MAX,
            calls: AtomicUsize::new(0),
            done: Mutex::new(Some(tx)),
            finish_after: 3,
        });
        let queue = run_until(fast(), handler.clone(), rx, vec![message("j1")]).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        let letters = queue.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 3);
        assert_eq!(letters[0].message.job_id, "j1");
        assert!(letters[0].last_error.contains("transient failure 3"));
    }

    #[tokio::test]
    async fn test_processes_every_message() {
        let (tx, rx) = oneshot::channel();
        let handler = Arc::new(Flaky {
            failures: 0,
            calls: AtomicUsize::new(0),
            done: Mutex::new(Some(tx)),
            finish_after: 5,
        });
        let messages = (0..5).map(|i| message(&format!("j{i}"))).collect();
        let queue = run_until(fast(), handler.clone(), rx, messages).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 5);
        assert!(queue.dead_letters().is_empty());
    }
}
