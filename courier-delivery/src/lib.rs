//! Batched delivery of outbound mail
//!
//! This crate provides functionality to:
//! - Accept batches of message tasks sharing one destination
//! - Split batches into chunks separated by a cooldown, throttling each endpoint
//! - Dial connections with bounded, backed-off retries
//! - Classify transport failures into success, permanent errors and backoffs,
//!   resetting the connection after every failed send

mod chunker;
mod config;
mod connection;
mod delivery;
mod dispatcher;
mod error;
mod message;
mod transport;

pub use chunker::{Chunks, chunks, run_batch};
pub use config::DispatcherConfig;
pub use connection::{ReconnectPolicy, open_with_retry};
pub use delivery::{deliver, send_chunk};
pub use dispatcher::{BatchHandle, DispatchQueue, Dispatcher};
pub use error::{DeliveryError, DispatchError, MessageError, TransportError};
pub use message::{Envelope, Message};
pub use transport::{Batch, BatchReport, Connection, MessageTask, Opener, Outcome};
// Cancellation is part of the public signatures.
pub use tokio_util::sync::CancellationToken;
