//! Typed error handling for delivery operations.
//!
//! Failures are split by how far their effect reaches:
//! - Content generation errors only concern one message
//! - Transport errors concern the connection (which is reset) and are either
//!   temporary (4xx status codes) or permanent (5xx codes and anything else)
//! - Connection establishment errors concern the whole pending chunk

use std::io;

use thiserror::Error;

/// Errors reported by a [`Connection`](crate::Connection) or an
/// [`Opener`](crate::Opener).
#[derive(Debug, Error)]
pub enum TransportError {
    /// The endpoint answered with a protocol status code.
    #[error("SMTP error: {code} - {message}")]
    Protocol { code: u16, message: String },

    /// IO error occurred during network operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Connection was closed unexpectedly.
    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    /// Any other transport failure.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// The protocol status code, if the endpoint produced one.
    #[must_use]
    pub const fn code(&self) -> Option<u16> {
        match self {
            Self::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns `true` for 4xx replies: the endpoint is rejecting transiently
    /// and the same message may be accepted later.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Protocol { code: 400..=499, .. })
    }

    /// Returns `true` for every error that is not temporary.
    ///
    /// Non-protocol failures and status codes outside 4xx/5xx are treated
    /// as permanent.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        !self.is_temporary()
    }
}

/// Errors raised while turning a [`Message`](crate::Message) into an envelope.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("Message has no \"From\" or \"Sender\" header")]
    MissingSender,

    #[error("Message has no recipients")]
    NoRecipients,

    #[error("Invalid address in \"{header}\" header: {reason}")]
    InvalidAddress { header: String, reason: String },
}

/// The reason handed to a task's `error` or `backoff` outcome.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The task could not produce its content.
    #[error("Message generation failed: {0:#}")]
    Generate(#[source] anyhow::Error),

    /// The generated content does not describe a deliverable message.
    #[error("Invalid message: {0}")]
    Message(#[from] MessageError),

    /// Sending over an open connection failed.
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The task could not tell us how to reach its destination.
    #[error("Unable to obtain connection opener: {0:#}")]
    Opener(#[source] anyhow::Error),

    /// Every dial attempt failed.
    #[error("Max connection attempts reached ({attempts}): {last}")]
    MaxReconnectAttempts {
        attempts: u32,
        #[source]
        last: TransportError,
    },
}

impl DeliveryError {
    /// Returns `true` if the caller should retry this message later.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_temporary())
    }
}

/// Errors surfaced to callers of the intake queue.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The dispatcher is no longer accepting batches.
    #[error("Dispatcher is not accepting batches")]
    Closed,

    /// The batch pipeline ended without reporting (it panicked or was aborted).
    #[error("Batch pipeline ended without reporting")]
    Dropped,
}
