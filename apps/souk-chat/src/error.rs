use chat_core::{ConnectionState, ProtocolError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The server answered with `success: false` or a non-JSON error status.
    #[error("server rejected request: {0}")]
    Rejected(String),

    #[error("message is empty")]
    EmptyMessage,

    #[error("cannot send while {0}")]
    NotConnected(ConnectionState),

    #[error("no older messages")]
    HistoryExhausted,

    #[error("a history request is already in flight")]
    HistoryInFlight,

    #[error("no messages loaded yet to page back from")]
    NoHistoryCursor,

    #[error("chat session is closed")]
    Closed,
}

pub type ChatResult<T> = Result<T, ChatError>;

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ChatError::WebSocket(err.to_string())
    }
}
