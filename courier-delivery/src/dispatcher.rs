//! Long-lived intake loop fanning batches out to concurrent pipelines

use std::sync::Arc;

use courier_common::{Signal, internal, tracing};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::{
    chunker::run_batch,
    config::DispatcherConfig,
    error::DispatchError,
    transport::{Batch, BatchReport},
};

struct Submission {
    batch: Batch,
    done: oneshot::Sender<BatchReport>,
}

/// Cloneable handle for handing batches to a running [`Dispatcher`].
#[derive(Clone)]
pub struct DispatchQueue {
    sender: mpsc::Sender<Submission>,
}

impl DispatchQueue {
    /// Queue `batch` for delivery.
    ///
    /// Waits while the intake queue is full. Every task in the batch is
    /// assumed to share one destination.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Closed`] if the dispatcher has stopped.
    pub async fn enqueue(&self, batch: Batch) -> Result<BatchHandle, DispatchError> {
        let (done, receiver) = oneshot::channel();
        self.sender
            .send(Submission { batch, done })
            .await
            .map_err(|_| DispatchError::Closed)?;

        Ok(BatchHandle { receiver })
    }

    /// Returns `true` once the dispatcher no longer accepts batches.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Completion handle for one enqueued batch.
///
/// Dropping it has no effect on delivery.
#[derive(Debug)]
pub struct BatchHandle {
    receiver: oneshot::Receiver<BatchReport>,
}

impl BatchHandle {
    /// Wait for the batch pipeline to finish.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Dropped`] if the pipeline ended without
    /// reporting, e.g. because a task panicked.
    pub async fn wait(self) -> Result<BatchReport, DispatchError> {
        self.receiver.await.map_err(|_| DispatchError::Dropped)
    }
}

/// Accepts batches and delivers each one on its own task.
pub struct Dispatcher {
    config: Arc<DispatcherConfig>,
    intake: mpsc::Receiver<Submission>,
    cancel: CancellationToken,
}

impl Dispatcher {
    /// Create a dispatcher and the queue that feeds it.
    #[must_use]
    pub fn new(config: DispatcherConfig) -> (Self, DispatchQueue) {
        let (sender, intake) = mpsc::channel(config.queue_capacity.max(1));

        (
            Self {
                config: Arc::new(config),
                intake,
                cancel: CancellationToken::new(),
            },
            DispatchQueue { sender },
        )
    }

    /// A token that is cancelled when the dispatcher shuts down.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the dispatcher
    ///
    /// Runs until a shutdown signal is received, the signal channel closes,
    /// or every [`DispatchQueue`] has been dropped and the queue is drained.
    ///
    /// ## Graceful Shutdown
    ///
    /// On a shutdown signal:
    /// 1. Stop accepting new batches
    /// 2. Cancel in-flight pipelines, which stop before their next message
    /// 3. Wait for them to wind down (up to `shutdown_timeout_secs`)
    /// 4. Detach whatever is still running so it finishes on its own
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn serve(mut self, mut shutdown: broadcast::Receiver<Signal>) {
        internal!("Dispatcher starting");

        let mut pipelines = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!("Dispatcher received shutdown signal");
                        }
                        Err(e) => {
                            tracing::error!("Dispatcher shutdown channel error: {e}");
                        }
                    }
                    self.cancel.cancel();
                    break;
                }

                submission = self.intake.recv() => {
                    let Some(Submission { batch, done }) = submission else {
                        internal!("Every dispatch queue dropped, draining in-flight batches");
                        break;
                    };

                    tracing::info!(messages = batch.len(), "Dispatcher got batch to send");
                    let config = Arc::clone(&self.config);
                    let cancel = self.cancel.child_token();

                    pipelines.spawn(async move {
                        let report = run_batch(batch, &config, &cancel).await;
                        // The caller may have dropped its handle.
                        let _ = done.send(report);
                    });
                }

                Some(result) = pipelines.join_next(), if !pipelines.is_empty() => {
                    if let Err(e) = result {
                        tracing::error!("Batch pipeline failed: {e}");
                    }
                }
            }
        }

        self.intake.close();
        self.abandon_queued();
        self.wind_down(pipelines).await;

        internal!("Dispatcher shutdown complete");
    }

    /// Answer batches that were accepted but never picked up, leaving their
    /// tasks untouched.
    fn abandon_queued(&mut self) {
        while let Ok(Submission { batch, done }) = self.intake.try_recv() {
            tracing::info!(messages = batch.len(), "Abandoning queued batch on shutdown");
            let _ = done.send(BatchReport {
                abandoned: batch.len(),
                ..BatchReport::default()
            });
        }
    }

    async fn wind_down(&self, mut pipelines: JoinSet<()>) {
        let drain = async {
            while let Some(result) = pipelines.join_next().await {
                if let Err(e) = result {
                    tracing::error!("Batch pipeline failed: {e}");
                }
            }
        };

        // A closed queue without a shutdown signal is a normal exit: let
        // pipelines run to completion, cooldowns included.
        if !self.cancel.is_cancelled() {
            drain.await;
            return;
        }

        if tokio::time::timeout(self.config.shutdown_timeout(), drain)
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = pipelines.len(),
                "Shutdown timeout exceeded, detaching in-flight batches"
            );
            pipelines.detach_all();
        } else {
            internal!("All in-flight batches completed");
        }
    }
}
