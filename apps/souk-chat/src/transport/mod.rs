//! Pluggable delivery channels between the client and the chat server.
//!
//! A transport is opened with a [`TransportSink`] and reports everything it
//! observes through it: open, inbound frames, failure and close. The sink
//! stamps each event with the transport kind and the generation it was
//! opened under, so the connection manager can discard events from a
//! transport it has already replaced.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chat_core::{ClientFrame, Generation, ServerFrame};
use tokio::sync::mpsc;

use crate::error::ChatResult;

pub mod mock;
pub mod poll;
pub mod websocket;

pub use poll::PollTransport;
pub use websocket::{WebSocketConnector, WebSocketTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Stream,
    Poll,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Stream => "stream",
            TransportKind::Poll => "poll",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Frame(ServerFrame),
    /// The transport could not be established, or (poll only) one request failed.
    Failed(String),
    /// `code` is `None` when the peer vanished without a close frame.
    Closed { code: Option<u16>, reason: String },
}

/// An event tagged with its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub kind: TransportKind,
    pub generation: Generation,
    pub event: TransportEvent,
}

/// Where a transport delivers its events.
///
/// Cloning shares the attachment flag: once [`TransportSink::detach`] is
/// called every clone stops delivering.
#[derive(Debug, Clone)]
pub struct TransportSink {
    kind: TransportKind,
    generation: Generation,
    tx: mpsc::UnboundedSender<Inbound>,
    attached: Arc<AtomicBool>,
}

impl TransportSink {
    pub fn new(
        kind: TransportKind,
        generation: Generation,
        tx: mpsc::UnboundedSender<Inbound>,
    ) -> Self {
        Self {
            kind,
            generation,
            tx,
            attached: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Returns false once detached or when the manager is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        if !self.is_attached() {
            return false;
        }
        self.tx
            .send(Inbound {
                kind: self.kind,
                generation: self.generation,
                event,
            })
            .is_ok()
    }

    pub fn detach(&self) {
        self.attached.store(false, Ordering::Release);
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire) && !self.tx.is_closed()
    }
}

pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Starts the transport; progress is reported through `sink`.
    fn open(&mut self, sink: TransportSink);

    /// Queues one outbound frame.
    fn send(&mut self, frame: ClientFrame) -> ChatResult<()>;

    /// Tears the transport down and detaches its sink. Idempotent.
    fn close(&mut self);
}

/// Builds a fresh stream transport for every connect attempt.
pub trait StreamConnector: Send + Sync {
    fn connect(&self) -> Box<dyn Transport>;
}

impl<F> StreamConnector for F
where
    F: Fn() -> Box<dyn Transport> + Send + Sync,
{
    fn connect(&self) -> Box<dyn Transport> {
        (self)()
    }
}
