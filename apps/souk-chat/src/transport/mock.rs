//! In-memory stand-ins for the stream and the HTTP API, used by the
//! connection manager tests.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chat_core::{ClientFrame, Generation, Message, MessageId, MessagePage, ServerFrame, UserId};
use parking_lot::Mutex;
use time::OffsetDateTime;

use super::{StreamConnector, Transport, TransportEvent, TransportKind, TransportSink};
use crate::error::{ChatError, ChatResult};
use crate::http::{ChatApi, ListQuery};

/// What a freshly opened mock stream does on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehavior {
    /// Nothing until the test drives it.
    Manual,
    OpenImmediately,
    FailImmediately(String),
    /// Closes before ever opening, e.g. a proxy rejecting the upgrade.
    CloseImmediately(Option<u16>),
}

#[derive(Debug, Default)]
struct StreamState {
    sink: Option<TransportSink>,
    sent: Vec<ClientFrame>,
    closed: bool,
}

/// Test-side view of one stream the manager opened.
#[derive(Debug, Clone)]
pub struct MockStream {
    state: Arc<Mutex<StreamState>>,
}

impl MockStream {
    fn emit(&self, event: TransportEvent) -> bool {
        let sink = self.state.lock().sink.clone();
        sink.is_some_and(|sink| sink.emit(event))
    }

    pub fn generation(&self) -> Option<Generation> {
        self.state.lock().sink.as_ref().map(TransportSink::generation)
    }

    pub fn open(&self) -> bool {
        self.emit(TransportEvent::Opened)
    }

    pub fn fail(&self, reason: &str) -> bool {
        self.emit(TransportEvent::Failed(reason.to_string()))
    }

    pub fn close_with(&self, code: Option<u16>) -> bool {
        self.emit(TransportEvent::Closed {
            code,
            reason: String::new(),
        })
    }

    pub fn push(&self, frame: ServerFrame) -> bool {
        self.emit(TransportEvent::Frame(frame))
    }

    pub fn sent(&self) -> Vec<ClientFrame> {
        self.state.lock().sent.clone()
    }

    /// True once the manager has closed this stream.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

struct MockTransport {
    behavior: MockBehavior,
    state: Arc<Mutex<StreamState>>,
}

impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn open(&mut self, sink: TransportSink) {
        self.state.lock().sink = Some(sink.clone());
        match &self.behavior {
            MockBehavior::Manual => {}
            MockBehavior::OpenImmediately => {
                sink.emit(TransportEvent::Opened);
            }
            MockBehavior::FailImmediately(reason) => {
                sink.emit(TransportEvent::Failed(reason.clone()));
            }
            MockBehavior::CloseImmediately(code) => {
                sink.emit(TransportEvent::Closed {
                    code: *code,
                    reason: String::new(),
                });
            }
        }
    }

    fn send(&mut self, frame: ClientFrame) -> ChatResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ChatError::WebSocket("mock stream closed".into()));
        }
        state.sent.push(frame);
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        state.closed = true;
        if let Some(sink) = state.sink.as_ref() {
            sink.detach();
        }
    }
}

#[derive(Debug, Default)]
struct ConnectorState {
    script: VecDeque<MockBehavior>,
    fallback: Option<MockBehavior>,
    streams: Vec<MockStream>,
}

/// Hands out [`MockStream`]s, following a script of behaviors.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl MockConnector {
    /// Every stream uses `behavior` unless a scripted one is queued.
    pub fn new(behavior: MockBehavior) -> Self {
        let connector = Self::default();
        connector.state.lock().fallback = Some(behavior);
        connector
    }

    /// Queues the behavior of the next opened stream.
    pub fn then(&self, behavior: MockBehavior) -> &Self {
        self.state.lock().script.push_back(behavior);
        self
    }

    pub fn streams(&self) -> Vec<MockStream> {
        self.state.lock().streams.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().streams.len()
    }

    pub fn last(&self) -> Option<MockStream> {
        self.state.lock().streams.last().cloned()
    }
}

impl StreamConnector for MockConnector {
    fn connect(&self) -> Box<dyn Transport> {
        let mut state = self.state.lock();
        let behavior = state
            .script
            .pop_front()
            .or_else(|| state.fallback.clone())
            .unwrap_or(MockBehavior::Manual);
        let stream = MockStream {
            state: Arc::new(Mutex::new(StreamState::default())),
        };
        state.streams.push(stream.clone());
        Box::new(MockTransport {
            behavior,
            state: stream.state,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    List(ListQuery),
    Send(String),
    MarkRead,
}

#[derive(Debug, Default)]
struct ApiState {
    calls: Vec<ApiCall>,
    latest: Vec<Message>,
    latest_has_more: bool,
    older: VecDeque<MessagePage>,
    next_id: MessageId,
    reject_sends: Option<String>,
}

/// Scriptable [`ChatApi`].
///
/// Unpaged lists return the current "latest" messages; each `before` query
/// pops the next queued older page, or an empty final page once the queue
/// runs dry. Sent messages join the latest set, so later pulls see them.
#[derive(Debug)]
pub struct MockApi {
    user_id: UserId,
    state: Mutex<ApiState>,
}

impl MockApi {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            state: Mutex::new(ApiState {
                next_id: 1000,
                ..ApiState::default()
            }),
        }
    }

    pub fn set_latest(&self, messages: Vec<Message>, has_more: bool) {
        let mut state = self.state.lock();
        state.latest = messages;
        state.latest_has_more = has_more;
    }

    /// Adds one message to what the next unpaged list returns.
    pub fn deliver(&self, message: Message) {
        self.state.lock().latest.push(message);
    }

    pub fn push_older(&self, page: MessagePage) {
        self.state.lock().older.push_back(page);
    }

    pub fn reject_sends(&self, reason: Option<&str>) {
        self.state.lock().reject_sends = reason.map(str::to_string);
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.state.lock().calls.clone()
    }

    pub fn sent(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ApiCall::Send(content) => Some(content),
                _ => None,
            })
            .collect()
    }

    /// `before` cursors of every history request, in order.
    pub fn history_requests(&self) -> Vec<MessageId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ApiCall::List(ListQuery {
                    before: Some(before),
                    ..
                }) => Some(before),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ChatApi for MockApi {
    async fn list_messages(&self, query: ListQuery) -> ChatResult<MessagePage> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::List(query));
        if query.before.is_some() {
            return Ok(state.older.pop_front().unwrap_or_default());
        }
        let mut messages = state.latest.clone();
        messages.sort_by_key(|message| std::cmp::Reverse(message.id));
        messages.truncate(query.limit as usize);
        Ok(MessagePage {
            messages,
            has_more: state.latest_has_more,
        })
    }

    async fn send_message(&self, content: &str) -> ChatResult<Message> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::Send(content.to_string()));
        if let Some(reason) = &state.reject_sends {
            return Err(ChatError::Rejected(reason.clone()));
        }
        state.next_id += 1;
        let message = Message::new(state.next_id, self.user_id, content, OffsetDateTime::UNIX_EPOCH);
        state.latest.push(message.clone());
        Ok(message)
    }

    async fn mark_read(&self) -> ChatResult<()> {
        self.state.lock().calls.push(ApiCall::MarkRead);
        Ok(())
    }
}
