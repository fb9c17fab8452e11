//! Sequential delivery of one chunk over one connection

use courier_common::{outgoing, tracing};
use tokio_util::sync::CancellationToken;

use crate::{
    config::DispatcherConfig,
    connection::open_with_retry,
    error::DeliveryError,
    message::Message,
    transport::{BatchReport, Connection, MessageTask, Opener, Outcome},
};

/// Send every task in `chunk` over `connection`, in order.
///
/// Each task receives exactly one outcome. A failed send resets the
/// connection before the next task; a failed content generation does not,
/// since nothing reached the wire. If `cancel` fires, the remaining tasks
/// are left untouched and counted as abandoned.
///
/// The connection is closed exactly once when the loop ends, whether it ran
/// to completion or was cancelled.
#[tracing::instrument(level = "debug", skip_all, fields(chunk_len = chunk.len()))]
pub async fn deliver(
    mut connection: Box<dyn Connection>,
    chunk: &[Box<dyn MessageTask>],
    cancel: &CancellationToken,
) -> BatchReport {
    let report = deliver_each(connection.as_mut(), chunk, cancel).await;

    if let Err(e) = connection.close().await {
        tracing::warn!(error = %e, "Failed to close connection");
    } else {
        outgoing!("Connection closed");
    }

    report
}

async fn deliver_each(
    connection: &mut dyn Connection,
    chunk: &[Box<dyn MessageTask>],
    cancel: &CancellationToken,
) -> BatchReport {
    let mut report = BatchReport::default();
    let mut message = Message::new();
    let mut content = Vec::new();

    for (index, task) in chunk.iter().enumerate() {
        if cancel.is_cancelled() {
            report.abandoned += chunk.len() - index;
            tracing::debug!(
                remaining = chunk.len() - index,
                "Cancelled mid-chunk, leaving remaining messages untouched"
            );
            break;
        }

        message.reset();
        if let Err(e) = task.generate(&mut message).await {
            let error = DeliveryError::Generate(e);
            tracing::debug!(index, error = %error, "Message generation failed");
            settle(task.as_ref(), Outcome::PermanentError(&error), &mut report).await;
            continue;
        }

        match transmit(connection, &message, &mut content).await {
            Ok(()) => {
                tracing::debug!(index, "Message delivered");
                settle(task.as_ref(), Outcome::Success, &mut report).await;
            }
            Err(error) => {
                let outcome = Outcome::for_failure(&error);
                tracing::debug!(index, error = %error, outcome = ?outcome, "Message not delivered");
                settle(task.as_ref(), outcome, &mut report).await;

                // A rejected command may leave the transaction half-open.
                if let Err(e) = connection.reset().await {
                    tracing::warn!(error = %e, "Failed to reset connection");
                }
            }
        }
    }

    report
}

async fn transmit(
    connection: &mut dyn Connection,
    message: &Message,
    content: &mut Vec<u8>,
) -> Result<(), DeliveryError> {
    let envelope = message.envelope()?;

    content.clear();
    message.write_to(content);

    outgoing!(
        "Sending {} bytes from {} to {} recipients",
        content.len(),
        envelope.sender,
        envelope.recipients.len()
    );
    connection
        .send(&envelope.sender, &envelope.recipients, content)
        .await?;

    Ok(())
}

async fn settle(task: &dyn MessageTask, outcome: Outcome<'_>, report: &mut BatchReport) {
    report.record(&outcome);
    outcome.apply(task).await;
}

/// Report the same permanent failure to every task, without sending anything.
pub(crate) async fn fail_all(chunk: &[Box<dyn MessageTask>], error: &DeliveryError) -> BatchReport {
    let mut report = BatchReport::default();
    for task in chunk {
        settle(task.as_ref(), Outcome::PermanentError(error), &mut report).await;
    }
    report
}

/// Dial through `opener` and deliver `chunk` over the resulting connection.
///
/// If every dial fails, every task in the chunk is failed with the
/// exhaustion error. If the dial is abandoned because of cancellation, the
/// chunk is left untouched.
pub async fn send_chunk(
    opener: &dyn Opener,
    chunk: &[Box<dyn MessageTask>],
    config: &DispatcherConfig,
    cancel: &CancellationToken,
) -> BatchReport {
    match open_with_retry(opener, &config.reconnect, cancel).await {
        Ok(Some(connection)) => deliver(connection, chunk, cancel).await,
        Ok(None) => BatchReport {
            abandoned: chunk.len(),
            ..BatchReport::default()
        },
        Err(error) => {
            tracing::warn!(error = %error, messages = chunk.len(), "Unable to connect, failing chunk");
            fail_all(chunk, &error).await
        }
    }
}
