//! The connection manager: one actor task per chat session.
//!
//! Transport events, timer fires, HTTP completions and application commands
//! all land on channels drained by a single `select!` loop, so the state
//! machine, the ledger and the typing/paging state are only ever touched
//! from one place. The pure decisions live in `chat_core`; this module turns
//! their effects into sockets, requests and timers.

use std::sync::Arc;
use std::time::Duration;

use chat_core::{
    ClientFrame, ConnectionState, Effect, FallbackReason, Generation, LoadDecision, Machine,
    MachineConfig, MachineEvent, Message, MessageId, MessageLedger, MessagePage,
    PaginationController, RemoteTyping, ServerFrame, TypingSignaler, UserId,
};
use metrics::counter;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::endpoints::ApiEndpoints;
use crate::environment::{EnvironmentProbe, HostSuffixProbe, StaticProbe};
use crate::error::{ChatError, ChatResult};
use crate::http::{ChatApi, HttpClient, ListQuery};
use crate::transport::{
    Inbound, PollTransport, StreamConnector, Transport, TransportEvent, TransportKind,
    TransportSink, WebSocketConnector,
};

mod timers;

use timers::{TimerKind, Timers};

/// Longest message the server accepts; longer input is truncated.
pub const MAX_MESSAGE_CHARS: usize = 2000;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub machine: MachineConfig,
    pub typing_quiet_period: Duration,
    pub page_limit: u32,
    pub current_user_id: UserId,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            machine: MachineConfig::default(),
            typing_quiet_period: Duration::from_millis(3000),
            page_limit: crate::config::DEFAULT_PAGE_LIMIT,
            current_user_id: 0,
        }
    }
}

/// Notifications delivered to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// A message seen for the first time, from either transport.
    Message(Message),
    /// History merged into the ledger; only messages that were new.
    HistoryLoaded {
        messages: Vec<Message>,
        has_more: bool,
    },
    TypingChanged {
        username: String,
        is_typing: bool,
    },
    ReadReceipt {
        message_id: MessageId,
    },
    ConnectionStateChanged {
        state: ConnectionState,
        text: String,
    },
    Presence {
        username: String,
        joined: bool,
    },
    Error {
        message: String,
    },
}

/// Result of one "load older" request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    pub has_more: bool,
    pub oldest_id: Option<MessageId>,
}

/// Trims and bounds outgoing text.
pub fn prepare_content(raw: &str) -> ChatResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ChatError::EmptyMessage);
    }
    Ok(trimmed.chars().take(MAX_MESSAGE_CHARS).collect())
}

enum Command {
    Send {
        content: String,
        reply: oneshot::Sender<ChatResult<()>>,
    },
    InputActivity,
    MarkRead {
        message_id: MessageId,
        reply: oneshot::Sender<ChatResult<()>>,
    },
    LoadOlder {
        before: Option<MessageId>,
        reply: oneshot::Sender<ChatResult<HistoryPage>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<Message>>,
    },
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Send { .. } => "Send",
            Command::InputActivity => "InputActivity",
            Command::MarkRead { .. } => "MarkRead",
            Command::LoadOlder { .. } => "LoadOlder",
            Command::Snapshot { .. } => "Snapshot",
        };
        f.write_str(name)
    }
}

/// What travels on the session's command channel. `Close` ends the loop and
/// never reaches the command handler.
enum Request {
    Command(Command),
    Close(oneshot::Sender<()>),
}

#[derive(Debug, Clone)]
enum Tick {
    ConnectTimeout(Generation),
    Backoff(Generation),
    KeepAlive,
    Poll,
    TypingQuiet(u64),
}

enum Completion {
    InitialPage(ChatResult<MessagePage>),
    OlderPage {
        result: ChatResult<MessagePage>,
        reply: oneshot::Sender<ChatResult<HistoryPage>>,
    },
    /// Server answer to a message posted while polling.
    PolledSend {
        result: ChatResult<Message>,
        reply: oneshot::Sender<ChatResult<()>>,
    },
}

/// Owns the collaborators of one chat session until [`ConnectionManager::start`].
pub struct ConnectionManager {
    config: ManagerConfig,
    probe: Arc<dyn EnvironmentProbe>,
    connector: Arc<dyn StreamConnector>,
    api: Arc<dyn ChatApi>,
}

impl ConnectionManager {
    pub fn new(
        config: ManagerConfig,
        probe: Arc<dyn EnvironmentProbe>,
        connector: Arc<dyn StreamConnector>,
        api: Arc<dyn ChatApi>,
    ) -> Self {
        Self {
            config,
            probe,
            connector,
            api,
        }
    }

    /// Wires the real HTTP API, WebSocket connector and environment probe.
    pub fn from_client_config(config: &ClientConfig) -> ChatResult<Self> {
        config.validate()?;
        let conversation_id = config.require_conversation()?;
        let api_endpoints = ApiEndpoints::parse(&config.base_url)?;
        let endpoints = api_endpoints.conversation(conversation_id);
        let http = HttpClient::new(api_endpoints.clone(), &config.auth)?;
        let connector = WebSocketConnector::new(&endpoints, &config.auth)?;
        let probe: Arc<dyn EnvironmentProbe> = if config.force_polling {
            Arc::new(StaticProbe(true))
        } else {
            Arc::new(HostSuffixProbe::new(
                api_endpoints.host(),
                &config.no_stream_hosts,
            ))
        };
        Ok(Self::new(
            config.manager_config(),
            probe,
            Arc::new(connector),
            Arc::new(http.conversation(conversation_id)),
        ))
    }

    /// Spawns the session actor. Must be called within a Tokio runtime.
    pub fn start(self) -> (ChatHandle, mpsc::UnboundedReceiver<ChatEvent>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (ticks_tx, ticks_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        let session = Session {
            machine: Machine::new(self.config.machine),
            ledger: MessageLedger::new(),
            pagination: PaginationController::new(),
            typing: TypingSignaler::new(self.config.typing_quiet_period),
            remote_typing: RemoteTyping::new(),
            stream: None,
            poll: None,
            timers: Timers::new(ticks_tx),
            requests: JoinSet::new(),
            inbound_tx,
            completions_tx,
            events: events_tx,
            state_tx,
            config: self.config,
            probe: self.probe,
            connector: self.connector,
            api: self.api,
        };
        tokio::spawn(session.run(commands_rx, inbound_rx, ticks_rx, completions_rx));

        let handle = ChatHandle {
            commands: commands_tx,
            state: state_rx,
        };
        (handle, events_rx)
    }
}

/// Application-facing handle to a running session.
///
/// Clones share the session. Dropping every clone shuts the session down
/// just like [`ChatHandle::close`].
#[derive(Debug, Clone)]
pub struct ChatHandle {
    commands: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<ConnectionState>,
}

impl ChatHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Sends over whichever transport is live. Fails with
    /// [`ChatError::NotConnected`] while connecting or reconnecting.
    ///
    /// While polling this resolves only after the server answers: `Ok` once
    /// the stored message is in the ledger, or the server's error.
    pub async fn send_message(&self, content: impl Into<String>) -> ChatResult<()> {
        let content = content.into();
        self.request(|reply| Command::Send { content, reply })
            .await?
    }

    /// Reports a keystroke; debounced into typing start/stop signals.
    pub fn notify_input_activity(&self) -> ChatResult<()> {
        self.commands
            .send(Request::Command(Command::InputActivity))
            .map_err(|_| ChatError::Closed)
    }

    pub async fn mark_read(&self, message_id: MessageId) -> ChatResult<()> {
        self.request(|reply| Command::MarkRead { message_id, reply })
            .await?
    }

    /// Pages back from the oldest message currently known.
    pub async fn load_older(&self) -> ChatResult<HistoryPage> {
        self.request(|reply| Command::LoadOlder {
            before: None,
            reply,
        })
        .await?
    }

    pub async fn load_older_before(&self, before: MessageId) -> ChatResult<HistoryPage> {
        self.request(|reply| Command::LoadOlder {
            before: Some(before),
            reply,
        })
        .await?
    }

    /// Every message in the ledger, ascending by id.
    pub async fn messages(&self) -> ChatResult<Vec<Message>> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Shuts the session down and waits until every resource is released.
    pub async fn close(&self) -> ChatResult<()> {
        let (done, finished) = oneshot::channel();
        if self.commands.send(Request::Close(done)).is_err() {
            return Ok(());
        }
        let _ = finished.await;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> ChatResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Request::Command(build(reply)))
            .map_err(|_| ChatError::Closed)?;
        response.await.map_err(|_| ChatError::Closed)
    }
}

struct Session {
    config: ManagerConfig,
    probe: Arc<dyn EnvironmentProbe>,
    connector: Arc<dyn StreamConnector>,
    api: Arc<dyn ChatApi>,
    machine: Machine,
    ledger: MessageLedger,
    pagination: PaginationController,
    typing: TypingSignaler,
    remote_typing: RemoteTyping,
    stream: Option<Box<dyn Transport>>,
    poll: Option<PollTransport>,
    timers: Timers<Tick>,
    requests: JoinSet<()>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    events: mpsc::UnboundedSender<ChatEvent>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Session {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Request>,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
        mut ticks: mpsc::UnboundedReceiver<Tick>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        let skip_stream = self.probe.should_skip_stream();
        info!(target = "chat.manager", skip_stream, "chat session starting");
        let effects = self.machine.handle(MachineEvent::Start { skip_stream });
        self.apply(effects);
        self.fetch_initial_page();

        let done = loop {
            tokio::select! {
                request = commands.recv() => match request {
                    None => break None,
                    Some(Request::Close(done)) => break Some(done),
                    Some(Request::Command(command)) => self.on_command(command),
                },
                Some(inbound) = inbound.recv() => self.on_inbound(inbound),
                Some(tick) = ticks.recv() => self.on_tick(tick),
                Some(completion) = completions.recv() => self.on_completion(completion),
            }
        };

        let effects = self.machine.handle(MachineEvent::Shutdown);
        self.apply(effects);
        info!(target = "chat.manager", messages = self.ledger.len(), "chat session closed");
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn on_command(&mut self, command: Command) {
        trace!(target = "chat.manager", ?command, "command");
        match command {
            Command::Send { content, reply } => self.send_message(&content, reply),
            Command::InputActivity => self.input_activity(),
            Command::MarkRead { message_id, reply } => {
                let _ = reply.send(self.route(ClientFrame::ReadReceipt { message_id }));
            }
            Command::LoadOlder { before, reply } => self.load_older(before, reply),
            Command::Snapshot { reply } => {
                let _ = reply.send(self.ledger.iter().cloned().collect());
            }
        }
    }

    fn send_message(&mut self, raw: &str, reply: oneshot::Sender<ChatResult<()>>) {
        let message = match prepare_content(raw) {
            Ok(message) => message,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        if self.machine.state() == ConnectionState::Polling {
            if let Some(poll) = self.poll.as_mut() {
                let completions = self.completions_tx.clone();
                poll.send_message(message, move |result| {
                    let _ = completions.send(Completion::PolledSend { result, reply });
                });
                self.typing_after_send();
                return;
            }
        }
        let result = self.route(ClientFrame::ChatMessage { message });
        if result.is_ok() {
            self.typing_after_send();
        }
        let _ = reply.send(result);
    }

    fn typing_after_send(&mut self) {
        self.timers.cancel(TimerKind::TypingQuiet);
        if let Some(is_typing) = self.typing.on_message_sent() {
            self.send_typing(is_typing);
        }
    }

    /// Hands a frame to the live transport for the current state.
    fn route(&mut self, frame: ClientFrame) -> ChatResult<()> {
        let state = self.machine.state();
        match state {
            ConnectionState::Connected => match self.stream.as_mut() {
                Some(stream) => stream.send(frame),
                None => Err(ChatError::NotConnected(state)),
            },
            ConnectionState::Polling => match self.poll.as_mut() {
                Some(poll) => poll.send(frame),
                None => Err(ChatError::NotConnected(state)),
            },
            ConnectionState::Closed => Err(ChatError::Closed),
            _ => Err(ChatError::NotConnected(state)),
        }
    }

    fn input_activity(&mut self) {
        let outcome = self.typing.on_activity();
        self.timers.once(
            TimerKind::TypingQuiet,
            outcome.quiet_after,
            Tick::TypingQuiet(outcome.quiet_epoch),
        );
        if let Some(is_typing) = outcome.emit {
            self.send_typing(is_typing);
        }
    }

    /// Typing only travels over a connected stream.
    fn send_typing(&mut self, is_typing: bool) {
        if self.machine.state() != ConnectionState::Connected {
            trace!(target = "chat.manager", is_typing, "typing signal dropped");
            return;
        }
        if let Some(stream) = self.stream.as_mut() {
            if let Err(err) = stream.send(ClientFrame::Typing { is_typing }) {
                debug!(target = "chat.manager", error = %err, "failed to send typing signal");
            }
        }
    }

    fn fetch_initial_page(&mut self) {
        let api = Arc::clone(&self.api);
        let completions = self.completions_tx.clone();
        let query = ListQuery::latest(self.config.page_limit);
        self.requests.spawn(async move {
            let result = api.list_messages(query).await;
            let _ = completions.send(Completion::InitialPage(result));
        });
    }

    fn load_older(
        &mut self,
        before: Option<MessageId>,
        reply: oneshot::Sender<ChatResult<HistoryPage>>,
    ) {
        let decision = match before {
            Some(before) => self.pagination.begin(before),
            None => self.pagination.begin_from(&self.ledger),
        };
        let before = match decision {
            LoadDecision::Fetch { before } => before,
            LoadDecision::Exhausted => {
                let _ = reply.send(Err(ChatError::HistoryExhausted));
                return;
            }
            LoadDecision::InFlight => {
                let _ = reply.send(Err(ChatError::HistoryInFlight));
                return;
            }
            LoadDecision::NoCursor => {
                let _ = reply.send(Err(ChatError::NoHistoryCursor));
                return;
            }
        };
        debug!(target = "chat.manager", before, "loading older messages");
        let api = Arc::clone(&self.api);
        let completions = self.completions_tx.clone();
        let query = ListQuery::before(before, self.config.page_limit);
        self.reap_requests();
        self.requests.spawn(async move {
            let result = api.list_messages(query).await;
            let _ = completions.send(Completion::OlderPage { result, reply });
        });
    }

    fn reap_requests(&mut self) {
        while self.requests.try_join_next().is_some() {}
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::InitialPage(Ok(page)) => {
                let outcome = self.pagination.seed(page, &mut self.ledger);
                debug!(
                    target = "chat.manager",
                    added = outcome.added.len(),
                    has_more = outcome.has_more,
                    "initial history loaded"
                );
                self.emit(ChatEvent::HistoryLoaded {
                    messages: outcome.added,
                    has_more: outcome.has_more,
                });
            }
            Completion::InitialPage(Err(err)) => {
                warn!(target = "chat.manager", error = %err, "failed to load recent messages");
                self.emit(ChatEvent::Error {
                    message: format!("failed to load messages: {err}"),
                });
            }
            Completion::OlderPage {
                result: Ok(page),
                reply,
            } => {
                let outcome = self.pagination.finish(page, &mut self.ledger);
                debug!(
                    target = "chat.manager",
                    added = outcome.added.len(),
                    has_more = outcome.has_more,
                    oldest = ?outcome.oldest_id,
                    "older messages loaded"
                );
                self.emit(ChatEvent::HistoryLoaded {
                    messages: outcome.added.clone(),
                    has_more: outcome.has_more,
                });
                let _ = reply.send(Ok(HistoryPage {
                    messages: outcome.added,
                    has_more: outcome.has_more,
                    oldest_id: outcome.oldest_id,
                }));
            }
            Completion::OlderPage {
                result: Err(err),
                reply,
            } => {
                self.pagination.abort();
                warn!(target = "chat.manager", error = %err, "failed to load older messages");
                self.emit(ChatEvent::Error {
                    message: format!("failed to load older messages: {err}"),
                });
                let _ = reply.send(Err(err));
            }
            Completion::PolledSend {
                result: Ok(message),
                reply,
            } => {
                debug!(target = "chat.manager", id = message.id, "polled send stored");
                self.dispatch(ServerFrame::ChatMessage { message });
                let _ = reply.send(Ok(()));
            }
            Completion::PolledSend {
                result: Err(err),
                reply,
            } => {
                let _ = reply.send(Err(err));
            }
        }
    }

    fn on_tick(&mut self, tick: Tick) {
        let event = match tick {
            Tick::ConnectTimeout(generation) => {
                debug!(target = "chat.manager", generation, "connect timed out");
                MachineEvent::ConnectTimeout { generation }
            }
            Tick::Backoff(generation) => MachineEvent::BackoffElapsed { generation },
            Tick::KeepAlive => MachineEvent::KeepAliveTick,
            Tick::Poll => {
                if self.machine.state() == ConnectionState::Polling {
                    if let Some(poll) = self.poll.as_mut() {
                        poll.pull(self.ledger.newest_id());
                    }
                }
                return;
            }
            Tick::TypingQuiet(epoch) => {
                if let Some(is_typing) = self.typing.on_quiet_elapsed(epoch) {
                    self.send_typing(is_typing);
                }
                return;
            }
        };
        let effects = self.machine.handle(event);
        self.apply(effects);
    }

    fn on_inbound(&mut self, inbound: Inbound) {
        let Inbound {
            kind,
            generation,
            event,
        } = inbound;
        match kind {
            TransportKind::Stream => self.on_stream_event(generation, event),
            TransportKind::Poll => self.on_poll_event(generation, event),
        }
    }

    fn on_stream_event(&mut self, generation: Generation, event: TransportEvent) {
        let event = match event {
            TransportEvent::Opened => MachineEvent::StreamOpened { generation },
            TransportEvent::Failed(reason) => MachineEvent::StreamFailed { generation, reason },
            TransportEvent::Closed { code, reason } => {
                debug!(target = "chat.manager", generation, ?code, %reason, "stream closed");
                MachineEvent::StreamClosed { generation, code }
            }
            TransportEvent::Frame(frame) => {
                if self.machine.state() == ConnectionState::Connected
                    && generation == self.machine.generation()
                {
                    self.dispatch(frame);
                } else {
                    trace!(target = "chat.manager", generation, kind = frame.kind(), "stale stream frame dropped");
                }
                return;
            }
        };
        let effects = self.machine.handle(event);
        self.apply(effects);
    }

    fn on_poll_event(&mut self, generation: Generation, event: TransportEvent) {
        if self.machine.state() != ConnectionState::Polling
            || generation != self.machine.generation()
        {
            trace!(target = "chat.manager", generation, "stale poll event dropped");
            return;
        }
        match event {
            TransportEvent::Frame(frame) => self.dispatch(frame),
            TransportEvent::Failed(message) => self.emit(ChatEvent::Error { message }),
            TransportEvent::Opened | TransportEvent::Closed { .. } => {}
        }
    }

    fn dispatch(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::ChatMessage { message } => {
                if !self.ledger.ingest(message.clone()).is_new {
                    trace!(target = "chat.manager", id = message.id, "duplicate message ignored");
                    return;
                }
                for username in self.remote_typing.clear() {
                    self.emit(ChatEvent::TypingChanged {
                        username,
                        is_typing: false,
                    });
                }
                self.emit(ChatEvent::Message(message));
            }
            ServerFrame::Typing {
                user_id,
                username,
                is_typing,
            } => {
                if user_id == Some(self.config.current_user_id) {
                    return;
                }
                if self.remote_typing.apply(&username, is_typing) {
                    self.emit(ChatEvent::TypingChanged {
                        username,
                        is_typing,
                    });
                }
            }
            ServerFrame::ReadReceipt { message_id, .. } => {
                if self.ledger.mark_read(message_id) {
                    self.emit(ChatEvent::ReadReceipt { message_id });
                }
            }
            ServerFrame::Pong => {
                let effects = self.machine.handle(MachineEvent::PongReceived);
                self.apply(effects);
            }
            ServerFrame::Ping => trace!(target = "chat.manager", "server ping"),
            ServerFrame::UserJoin { username, .. } => self.emit(ChatEvent::Presence {
                username,
                joined: true,
            }),
            ServerFrame::UserLeave { username, .. } => self.emit(ChatEvent::Presence {
                username,
                joined: false,
            }),
            ServerFrame::Error { message } => {
                warn!(target = "chat.manager", %message, "server reported an error");
                self.emit(ChatEvent::Error { message });
            }
        }
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::OpenStream { generation } => {
                    self.close_stream();
                    let mut stream = self.connector.connect();
                    stream.open(TransportSink::new(
                        TransportKind::Stream,
                        generation,
                        self.inbound_tx.clone(),
                    ));
                    self.stream = Some(stream);
                }
                Effect::ArmConnectTimeout { generation, after } => self.timers.once(
                    TimerKind::ConnectTimeout,
                    after,
                    Tick::ConnectTimeout(generation),
                ),
                Effect::DisarmConnectTimeout => self.timers.cancel(TimerKind::ConnectTimeout),
                Effect::StartKeepAlive { every } => {
                    self.timers.every(TimerKind::KeepAlive, every, Tick::KeepAlive)
                }
                Effect::StopKeepAlive => self.timers.cancel(TimerKind::KeepAlive),
                Effect::SendPing => {
                    if let Some(stream) = self.stream.as_mut() {
                        if let Err(err) = stream.send(ClientFrame::Ping) {
                            debug!(target = "chat.manager", error = %err, "failed to send keep-alive ping");
                        }
                    }
                }
                Effect::CloseStream => self.close_stream(),
                Effect::ArmReconnect { generation, after } => {
                    counter!("chat_reconnects_total", 1);
                    self.timers
                        .once(TimerKind::Reconnect, after, Tick::Backoff(generation));
                }
                Effect::StartPolling { every, reason } => self.start_polling(every, reason),
                Effect::ReleaseAll => {
                    debug!(
                        target = "chat.manager",
                        timers = self.timers.armed_count(),
                        "releasing session resources"
                    );
                    self.timers.cancel_all();
                    self.close_stream();
                    if let Some(mut poll) = self.poll.take() {
                        poll.close();
                    }
                    self.requests.abort_all();
                }
                Effect::StateChanged { state, text } => {
                    self.state_tx.send_replace(state);
                    info!(target = "chat.manager", %state, %text, "connection state changed");
                    self.emit(ChatEvent::ConnectionStateChanged { state, text });
                }
            }
        }
    }

    fn start_polling(&mut self, every: Duration, reason: FallbackReason) {
        self.close_stream();
        warn!(target = "chat.manager", %reason, "switching to http polling");
        counter!("chat_stream_fallbacks_total", 1, "reason" => fallback_label(&reason));

        let mut poll = PollTransport::new(Arc::clone(&self.api), self.config.page_limit);
        poll.open(TransportSink::new(
            TransportKind::Poll,
            self.machine.generation(),
            self.inbound_tx.clone(),
        ));
        poll.pull(self.ledger.newest_id());
        self.poll = Some(poll);
        self.timers.every(TimerKind::Poll, every, Tick::Poll);
    }

    fn close_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }
}

fn fallback_label(reason: &FallbackReason) -> &'static str {
    match reason {
        FallbackReason::EnvironmentProbe => "environment_probe",
        FallbackReason::InitialConnectFailed => "initial_connect_failed",
        FallbackReason::AbnormalClose { .. } => "abnormal_close",
        FallbackReason::ReconnectsExhausted => "reconnects_exhausted",
    }
}
