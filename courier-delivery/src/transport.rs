//! Capabilities supplied by the embedding application
//!
//! The dispatcher never speaks a wire protocol itself: it asks each
//! [`MessageTask`] for an [`Opener`], dials a [`Connection`] through it, and
//! reports the result back to the task.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    error::{DeliveryError, TransportError},
    message::Message,
};

/// A live, stateful session with a submission endpoint.
///
/// A connection is owned by a single delivery loop and used serially.
/// Implementations should also release the session on drop, since a
/// pipeline aborted mid-send never reaches its `close` call.
#[async_trait]
pub trait Connection: Send {
    /// Submit `content` for `recipients` on behalf of `sender`.
    async fn send(
        &mut self,
        sender: &str,
        recipients: &[String],
        content: &[u8],
    ) -> Result<(), TransportError>;

    /// Clear protocol state after a failure without dropping the session
    /// (SMTP `RSET`).
    async fn reset(&mut self) -> Result<(), TransportError>;

    /// End the session. Called exactly once per opened connection.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Dials connections to one destination.
#[async_trait]
pub trait Opener: Send + Sync {
    async fn open(&self) -> Result<Box<dyn Connection>, TransportError>;
}

/// One addressed message awaiting delivery.
///
/// Exactly one of [`success`](Self::success), [`error`](Self::error) or
/// [`backoff`](Self::backoff) is called per task, at most once, unless the
/// dispatcher is cancelled before the task is reached, in which case none is.
/// Errors returned from those callbacks are logged and otherwise ignored.
#[async_trait]
pub trait MessageTask: Send + Sync {
    /// Fill `message` with this task's content. The buffer is always empty
    /// when handed over.
    async fn generate(&self, message: &mut Message) -> anyhow::Result<()>;

    /// The opener for this task's destination. Only consulted on the first
    /// task of each chunk.
    fn opener(&self) -> anyhow::Result<Arc<dyn Opener>>;

    /// The message was accepted by the endpoint.
    async fn success(&self) -> anyhow::Result<()>;

    /// The message can not be delivered; retrying will not help.
    async fn error(&self, reason: &DeliveryError) -> anyhow::Result<()>;

    /// The endpoint rejected the message transiently; retry it later.
    async fn backoff(&self, reason: &DeliveryError) -> anyhow::Result<()>;
}

/// An ordered group of tasks sharing one destination.
pub type Batch = Vec<Box<dyn MessageTask>>;

/// The terminal result reported to a [`MessageTask`].
#[derive(Debug, Clone, Copy)]
pub enum Outcome<'a> {
    Success,
    PermanentError(&'a DeliveryError),
    Backoff(&'a DeliveryError),
}

impl<'a> Outcome<'a> {
    /// Map a failed send onto the outcome its error calls for.
    #[must_use]
    pub const fn for_failure(error: &'a DeliveryError) -> Self {
        if error.is_temporary() {
            Self::Backoff(error)
        } else {
            Self::PermanentError(error)
        }
    }

    /// Deliver this outcome to `task`.
    pub async fn apply(self, task: &dyn MessageTask) {
        let result = match self {
            Self::Success => task.success().await,
            Self::PermanentError(reason) => task.error(reason).await,
            Self::Backoff(reason) => task.backoff(reason).await,
        };

        if let Err(e) = result {
            tracing::warn!(outcome = ?self, error = %e, "Task failed to record its outcome");
        }
    }
}

/// Per-batch tally of what happened to each task.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub delivered: usize,
    pub failed: usize,
    pub deferred: usize,
    /// Tasks left untouched because the dispatcher was cancelled.
    pub abandoned: usize,
}

impl BatchReport {
    pub(crate) const fn record(&mut self, outcome: &Outcome<'_>) {
        match outcome {
            Outcome::Success => self.delivered += 1,
            Outcome::PermanentError(_) => self.failed += 1,
            Outcome::Backoff(_) => self.deferred += 1,
        }
    }

    pub(crate) const fn merge(&mut self, other: Self) {
        self.delivered += other.delivered;
        self.failed += other.failed;
        self.deferred += other.deferred;
        self.abandoned += other.abandoned;
    }

    /// Number of tasks accounted for.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.delivered + self.failed + self.deferred + self.abandoned
    }
}
