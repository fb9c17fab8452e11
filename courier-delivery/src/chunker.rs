//! Splitting batches into throttled chunks

use std::vec;

use courier_common::tracing;
use tokio_util::sync::CancellationToken;

use crate::{
    config::DispatcherConfig,
    delivery::{fail_all, send_chunk},
    error::DeliveryError,
    transport::{BatchReport, MessageTask},
};

/// Consecutive, order-preserving groups of at most `size` items.
#[derive(Debug)]
pub struct Chunks<T> {
    inner: vec::IntoIter<T>,
    size: usize,
}

impl<T> Chunks<T> {
    /// Number of items not yet handed out.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.inner.len()
    }
}

impl<T> Iterator for Chunks<T> {
    type Item = Vec<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk: Vec<T> = self.inner.by_ref().take(self.size).collect();
        (!chunk.is_empty()).then_some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let chunks = self.inner.len().div_ceil(self.size);
        (chunks, Some(chunks))
    }
}

/// Split `batch` into chunks of at most `size`. A size of zero behaves as one.
#[must_use]
pub fn chunks<T>(batch: Vec<T>, size: usize) -> Chunks<T> {
    Chunks {
        inner: batch.into_iter(),
        size: size.max(1),
    }
}

/// Deliver a whole batch, one chunk at a time.
///
/// Each chunk gets a fresh connection from the opener of its first task, and
/// consecutive chunks are separated by the configured cooldown. Cancellation
/// during the cooldown leaves the rest of the batch untouched.
#[tracing::instrument(level = "info", skip_all, fields(messages = batch.len()))]
pub async fn run_batch(
    batch: Vec<Box<dyn MessageTask>>,
    config: &DispatcherConfig,
    cancel: &CancellationToken,
) -> BatchReport {
    let mut report = BatchReport::default();
    let mut pending = chunks(batch, config.chunk_size);
    let mut first = true;

    while let Some(chunk) = pending.next() {
        if !first {
            tracing::debug!(
                delay_secs = config.chunk_delay_secs,
                "Cooling down before next chunk"
            );
            tokio::select! {
                () = cancel.cancelled() => {
                    report.abandoned += chunk.len() + pending.remaining();
                    tracing::debug!(abandoned = report.abandoned, "Cancelled during cooldown");
                    break;
                }
                () = tokio::time::sleep(config.chunk_delay()) => {}
            }
        }
        first = false;

        // Only the first task of the chunk decides where it goes.
        let chunk_report = match chunk[0].opener() {
            Ok(opener) => send_chunk(opener.as_ref(), &chunk, config, cancel).await,
            Err(e) => {
                let error = DeliveryError::Opener(e);
                tracing::warn!(error = %error, messages = chunk.len(), "No opener for chunk");
                fail_all(&chunk, &error).await
            }
        };
        report.merge(chunk_report);
    }

    tracing::info!(
        delivered = report.delivered,
        failed = report.failed,
        deferred = report.deferred,
        abandoned = report.abandoned,
        "Batch finished"
    );

    report
}
