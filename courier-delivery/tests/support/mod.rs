//! In-memory fakes for the delivery capabilities
//!
//! Every fake writes what happens to it into a shared [`Journal`] so tests can
//! assert on the exact sequence of dials, sends, resets, closes and outcomes.

#![allow(dead_code, clippy::unwrap_used)]

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use courier_delivery::{
    CancellationToken, Connection, DeliveryError, Message, MessageTask, Opener, TransportError,
};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Success,
    Error,
    Backoff,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Dial { at: Instant, ok: bool },
    Send { connection: usize, recipients: Vec<String> },
    Reset { connection: usize },
    Close { connection: usize },
    Outcome { task: usize, kind: Kind, reason: String },
}

#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Event>>>);

impl Journal {
    pub fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn outcomes(&self, task: usize) -> Vec<(Kind, String)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Outcome {
                    task: t,
                    kind,
                    reason,
                } if t == task => Some((kind, reason)),
                _ => None,
            })
            .collect()
    }

    /// The single outcome of `task`, failing the test if it has none or several.
    pub fn outcome(&self, task: usize) -> (Kind, String) {
        let mut outcomes = self.outcomes(task);
        assert_eq!(
            outcomes.len(),
            1,
            "task {task} should have exactly one outcome, got {outcomes:?}"
        );
        outcomes.remove(0)
    }

    pub fn sends(&self) -> Vec<(usize, Vec<String>)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Send {
                    connection,
                    recipients,
                } => Some((connection, recipients)),
                _ => None,
            })
            .collect()
    }

    pub fn resets(&self) -> usize {
        self.count(|e| matches!(e, Event::Reset { .. }))
    }

    pub fn closes(&self) -> usize {
        self.count(|e| matches!(e, Event::Close { .. }))
    }

    pub fn dial_times(&self) -> Vec<Instant> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Dial { at, ok: true } => Some(at),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.0.lock().unwrap().iter().filter(|e| predicate(*e)).count()
    }
}

/// How the fake endpoint answers a send.
#[derive(Debug, Clone, Copy)]
pub enum Reply {
    Accept,
    Status(u16),
    Drop,
}

type Replies = Arc<Mutex<VecDeque<Reply>>>;

pub struct FakeConnection {
    id: usize,
    journal: Journal,
    replies: Replies,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn send(
        &mut self,
        _sender: &str,
        recipients: &[String],
        _content: &[u8],
    ) -> Result<(), TransportError> {
        self.journal.push(Event::Send {
            connection: self.id,
            recipients: recipients.to_vec(),
        });

        match self.replies.lock().unwrap().pop_front().unwrap_or(Reply::Accept) {
            Reply::Accept => Ok(()),
            Reply::Status(code) => Err(TransportError::Protocol {
                code,
                message: "scripted reply".to_string(),
            }),
            Reply::Drop => Err(TransportError::ConnectionClosed),
        }
    }

    async fn reset(&mut self) -> Result<(), TransportError> {
        self.journal.push(Event::Reset { connection: self.id });
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.journal.push(Event::Close { connection: self.id });
        Ok(())
    }
}

/// Dials [`FakeConnection`]s that answer sends from a shared script.
#[derive(Clone)]
pub struct FakeOpener {
    journal: Journal,
    replies: Replies,
    connections: Arc<AtomicUsize>,
    failing: bool,
}

impl FakeOpener {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            replies: Arc::default(),
            connections: Arc::default(),
            failing: false,
        }
    }

    /// An opener whose every dial is refused.
    pub fn refusing(journal: &Journal) -> Self {
        Self {
            failing: true,
            ..Self::new(journal)
        }
    }

    /// Queue replies for upcoming sends; once exhausted every send is accepted.
    pub fn script(&self, replies: impl IntoIterator<Item = Reply>) {
        self.replies.lock().unwrap().extend(replies);
    }

    pub fn connection(&self) -> Box<dyn Connection> {
        let id = self.connections.fetch_add(1, Ordering::SeqCst);
        Box::new(FakeConnection {
            id,
            journal: self.journal.clone(),
            replies: Arc::clone(&self.replies),
        })
    }
}

#[async_trait]
impl Opener for FakeOpener {
    async fn open(&self) -> Result<Box<dyn Connection>, TransportError> {
        self.journal.push(Event::Dial {
            at: Instant::now(),
            ok: !self.failing,
        });

        if self.failing {
            Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )))
        } else {
            Ok(self.connection())
        }
    }
}

pub struct FakeTask {
    pub id: usize,
    journal: Journal,
    opener: Option<Arc<dyn Opener>>,
    lookups: Arc<AtomicUsize>,
    fail_generate: bool,
    omit_recipients: bool,
    cancel_on_outcome: Option<CancellationToken>,
}

impl FakeTask {
    pub fn new(id: usize, journal: &Journal, opener: &FakeOpener) -> Self {
        Self {
            id,
            journal: journal.clone(),
            opener: Some(Arc::new(opener.clone())),
            lookups: Arc::default(),
            fail_generate: false,
            omit_recipients: false,
            cancel_on_outcome: None,
        }
    }

    /// Share an opener lookup counter between tasks.
    #[must_use]
    pub fn counting(mut self, lookups: &Arc<AtomicUsize>) -> Self {
        self.lookups = Arc::clone(lookups);
        self
    }

    #[must_use]
    pub fn without_opener(mut self) -> Self {
        self.opener = None;
        self
    }

    #[must_use]
    pub fn failing_generation(mut self) -> Self {
        self.fail_generate = true;
        self
    }

    #[must_use]
    pub fn without_recipients(mut self) -> Self {
        self.omit_recipients = true;
        self
    }

    #[must_use]
    pub fn cancelling(mut self, cancel: &CancellationToken) -> Self {
        self.cancel_on_outcome = Some(cancel.clone());
        self
    }

    pub fn boxed(self) -> Box<dyn MessageTask> {
        Box::new(self)
    }

    pub fn recipient(id: usize) -> String {
        format!("rcpt{id}@example.com")
    }

    fn record(&self, kind: Kind, reason: String) {
        self.journal.push(Event::Outcome {
            task: self.id,
            kind,
            reason,
        });
        if let Some(cancel) = &self.cancel_on_outcome {
            cancel.cancel();
        }
    }
}

#[async_trait]
impl MessageTask for FakeTask {
    async fn generate(&self, message: &mut Message) -> anyhow::Result<()> {
        assert!(message.header("From").is_none(), "buffer was not reset");

        if self.fail_generate {
            anyhow::bail!("template for task {} is broken", self.id);
        }

        message.set_header("From", "Campaigns <campaigns@example.org>");
        if !self.omit_recipients {
            message.set_header("To", Self::recipient(self.id));
        }
        message.set_header("Subject", format!("Message {}", self.id));
        message.set_body(format!("Hello from task {}\n", self.id));
        Ok(())
    }

    fn opener(&self) -> anyhow::Result<Arc<dyn Opener>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.opener
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no SMTP profile for task {}", self.id))
    }

    async fn success(&self) -> anyhow::Result<()> {
        self.record(Kind::Success, String::new());
        Ok(())
    }

    async fn error(&self, reason: &DeliveryError) -> anyhow::Result<()> {
        self.record(Kind::Error, reason.to_string());
        Ok(())
    }

    async fn backoff(&self, reason: &DeliveryError) -> anyhow::Result<()> {
        self.record(Kind::Backoff, reason.to_string());
        Ok(())
    }
}

/// `count` ordinary tasks numbered from zero, all dialing through `opener`.
pub fn tasks(count: usize, journal: &Journal, opener: &FakeOpener) -> Vec<FakeTask> {
    (0..count)
        .map(|id| FakeTask::new(id, journal, opener))
        .collect()
}

pub fn boxed(tasks: Vec<FakeTask>) -> Vec<Box<dyn MessageTask>> {
    tasks.into_iter().map(FakeTask::boxed).collect()
}
