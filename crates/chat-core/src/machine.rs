//! Connection state machine.
//!
//! `Machine::handle` is a pure transition function: it consumes one event,
//! updates the state and counters, and returns the side effects the driver
//! must perform (open a socket, arm a timer, start polling...). It never
//! touches a clock or a socket, so every transition can be exercised in
//! plain unit tests.
//!
//! Stream-originated events carry the [`Generation`] of the connect attempt
//! that produced them. Anything tagged with an older generation, or arriving
//! in a state that does not expect it, is dropped.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, trace};

pub type Generation = u64;

/// WebSocket close codes treated as a permanent rejection by the hosting
/// environment rather than a transient drop.
pub const ABNORMAL_CLOSE_CODES: [u16; 5] = [1002, 1003, 1006, 1008, 1015];

/// A close without any close frame is reported as `None` and counts as abnormal.
pub fn is_abnormal_close(code: Option<u16>) -> bool {
    match code {
        None => true,
        Some(code) => ABNORMAL_CLOSE_CODES.contains(&code),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Polling,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Polling => "polling",
            ConnectionState::Closed => "closed",
        }
    }

    /// States in which outgoing messages can be delivered.
    pub fn can_send(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Polling)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineConfig {
    pub max_reconnect_attempts: u32,
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
    pub keepalive_interval: Duration,
    pub poll_interval: Duration,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            connect_timeout: Duration::from_secs(2),
            reconnect_delay: Duration::from_secs(3),
            keepalive_interval: Duration::from_secs(30),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Why the session switched to polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    EnvironmentProbe,
    InitialConnectFailed,
    AbnormalClose { code: Option<u16> },
    ReconnectsExhausted,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::EnvironmentProbe => f.write_str("environment does not allow streaming"),
            FallbackReason::InitialConnectFailed => f.write_str("stream could not be established"),
            FallbackReason::AbnormalClose { code: Some(code) } => {
                write!(f, "stream closed abnormally ({code})")
            }
            FallbackReason::AbnormalClose { code: None } => {
                f.write_str("stream closed without a close frame")
            }
            FallbackReason::ReconnectsExhausted => f.write_str("reconnect attempts exhausted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineEvent {
    Start { skip_stream: bool },
    StreamOpened { generation: Generation },
    StreamFailed { generation: Generation, reason: String },
    StreamClosed { generation: Generation, code: Option<u16> },
    ConnectTimeout { generation: Generation },
    BackoffElapsed { generation: Generation },
    KeepAliveTick,
    PongReceived,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    OpenStream { generation: Generation },
    ArmConnectTimeout { generation: Generation, after: Duration },
    DisarmConnectTimeout,
    StartKeepAlive { every: Duration },
    StopKeepAlive,
    SendPing,
    CloseStream,
    ArmReconnect { generation: Generation, after: Duration },
    StartPolling { every: Duration, reason: FallbackReason },
    ReleaseAll,
    StateChanged { state: ConnectionState, text: String },
}

#[derive(Debug, Clone)]
pub struct Machine {
    config: MachineConfig,
    state: ConnectionState,
    generation: Generation,
    reconnect_attempts: u32,
    awaiting_pong: bool,
    fallback: Option<FallbackReason>,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Idle,
            generation: 0,
            reconnect_attempts: 0,
            awaiting_pong: false,
            fallback: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn fallback_reason(&self) -> Option<&FallbackReason> {
        self.fallback.as_ref()
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Human-readable status for the connection indicator.
    pub fn status_text(&self) -> String {
        let max = self.config.max_reconnect_attempts;
        match self.state {
            ConnectionState::Idle => "Not connected".into(),
            ConnectionState::Connecting if self.reconnect_attempts == 0 => "Connecting...".into(),
            ConnectionState::Connecting => {
                format!("Reconnecting... ({}/{max})", self.reconnect_attempts)
            }
            ConnectionState::Connected => "Connected".into(),
            ConnectionState::Reconnecting => format!(
                "Connection lost, retrying... ({}/{max})",
                self.reconnect_attempts + 1
            ),
            ConnectionState::Polling => "Live updates via polling".into(),
            ConnectionState::Closed => "Disconnected".into(),
        }
    }

    pub fn handle(&mut self, event: MachineEvent) -> Vec<Effect> {
        if self.state == ConnectionState::Closed {
            trace!(target = "chat.machine", ?event, "ignoring event after close");
            return Vec::new();
        }
        let before = self.state;
        let effects = match event {
            MachineEvent::Shutdown => self.shutdown(),
            MachineEvent::Start { skip_stream } => self.start(skip_stream),
            MachineEvent::StreamOpened { generation } => self.stream_opened(generation),
            MachineEvent::StreamFailed { generation, reason } => {
                debug!(target = "chat.machine", generation, %reason, "stream failed");
                self.stream_lost(generation, false, None)
            }
            MachineEvent::ConnectTimeout { generation } => {
                if self.state == ConnectionState::Connecting {
                    self.stream_lost(generation, false, None)
                } else {
                    Vec::new()
                }
            }
            MachineEvent::StreamClosed { generation, code } => {
                self.stream_lost(generation, is_abnormal_close(code), code)
            }
            MachineEvent::BackoffElapsed { generation } => self.backoff_elapsed(generation),
            MachineEvent::KeepAliveTick => self.keepalive_tick(),
            MachineEvent::PongReceived => {
                self.awaiting_pong = false;
                Vec::new()
            }
        };
        if before != self.state {
            debug!(
                target = "chat.machine",
                from = %before,
                to = %self.state,
                generation = self.generation,
                reconnect_attempts = self.reconnect_attempts,
                "connection state transition"
            );
        }
        effects
    }

    fn start(&mut self, skip_stream: bool) -> Vec<Effect> {
        if self.state != ConnectionState::Idle {
            return Vec::new();
        }
        if skip_stream {
            return self.enter_polling(FallbackReason::EnvironmentProbe, Vec::new());
        }
        self.begin_attempt()
    }

    fn begin_attempt(&mut self) -> Vec<Effect> {
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        vec![
            self.state_changed(),
            Effect::OpenStream {
                generation: self.generation,
            },
            Effect::ArmConnectTimeout {
                generation: self.generation,
                after: self.config.connect_timeout,
            },
        ]
    }

    fn stream_opened(&mut self, generation: Generation) -> Vec<Effect> {
        if self.state != ConnectionState::Connecting || generation != self.generation {
            return Vec::new();
        }
        self.state = ConnectionState::Connected;
        self.reconnect_attempts = 0;
        self.awaiting_pong = false;
        vec![
            Effect::DisarmConnectTimeout,
            Effect::StartKeepAlive {
                every: self.config.keepalive_interval,
            },
            self.state_changed(),
        ]
    }

    /// Shared handling for every way a stream attempt or live stream can end.
    fn stream_lost(
        &mut self,
        generation: Generation,
        abnormal: bool,
        code: Option<u16>,
    ) -> Vec<Effect> {
        if generation != self.generation {
            return Vec::new();
        }
        match self.state {
            ConnectionState::Connecting => {
                let effects = vec![Effect::DisarmConnectTimeout, Effect::CloseStream];
                if self.reconnect_attempts == 0 {
                    self.enter_polling(FallbackReason::InitialConnectFailed, effects)
                } else if abnormal {
                    self.enter_polling(FallbackReason::AbnormalClose { code }, effects)
                } else {
                    self.retry_or_fall_back(effects)
                }
            }
            ConnectionState::Connected => {
                let effects = vec![Effect::StopKeepAlive, Effect::CloseStream];
                if abnormal {
                    self.enter_polling(FallbackReason::AbnormalClose { code }, effects)
                } else {
                    self.retry_or_fall_back(effects)
                }
            }
            _ => Vec::new(),
        }
    }

    fn retry_or_fall_back(&mut self, effects: Vec<Effect>) -> Vec<Effect> {
        if self.reconnect_attempts >= self.config.max_reconnect_attempts {
            return self.enter_polling(FallbackReason::ReconnectsExhausted, effects);
        }
        self.state = ConnectionState::Reconnecting;
        let mut effects = effects;
        effects.push(Effect::ArmReconnect {
            generation: self.generation,
            after: self.config.reconnect_delay,
        });
        effects.push(self.state_changed());
        effects
    }

    fn backoff_elapsed(&mut self, generation: Generation) -> Vec<Effect> {
        if self.state != ConnectionState::Reconnecting || generation != self.generation {
            return Vec::new();
        }
        self.reconnect_attempts += 1;
        self.begin_attempt()
    }

    fn keepalive_tick(&mut self) -> Vec<Effect> {
        if self.state != ConnectionState::Connected {
            return Vec::new();
        }
        if self.awaiting_pong {
            debug!(target = "chat.machine", "keep-alive pong missed; dropping stream");
            self.awaiting_pong = false;
            return self.retry_or_fall_back(vec![Effect::StopKeepAlive, Effect::CloseStream]);
        }
        self.awaiting_pong = true;
        vec![Effect::SendPing]
    }

    fn enter_polling(&mut self, reason: FallbackReason, mut effects: Vec<Effect>) -> Vec<Effect> {
        self.state = ConnectionState::Polling;
        self.fallback = Some(reason.clone());
        effects.push(Effect::StartPolling {
            every: self.config.poll_interval,
            reason,
        });
        effects.push(self.state_changed());
        effects
    }

    fn shutdown(&mut self) -> Vec<Effect> {
        self.state = ConnectionState::Closed;
        // Anything a detached transport already queued is now stale.
        self.generation += 1;
        vec![Effect::ReleaseAll, self.state_changed()]
    }

    fn state_changed(&self) -> Effect {
        Effect::StateChanged {
            state: self.state,
            text: self.status_text(),
        }
    }
}
