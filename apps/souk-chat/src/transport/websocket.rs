use std::time::Duration;

use chat_core::{ClientFrame, ServerFrame};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{COOKIE, HeaderName, ORIGIN};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info, trace, warn};
use url::Url;

use super::{StreamConnector, Transport, TransportEvent, TransportKind, TransportSink};
use crate::config::SessionAuth;
use crate::endpoints::ChatEndpoints;
use crate::error::{ChatError, ChatResult};

/// How long a closing socket may spend on its close handshake.
const CLOSE_GRACE: Duration = Duration::from_millis(250);

/// Close frame without a status code.
const NO_STATUS_RECEIVED: u16 = 1005;

/// Creates one [`WebSocketTransport`] per connect attempt.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl WebSocketConnector {
    pub fn new(endpoints: &ChatEndpoints, auth: &SessionAuth) -> ChatResult<Self> {
        let mut headers = Vec::new();
        if let Some(cookie) = auth.cookie_header() {
            headers.push((COOKIE, header_value(&cookie)?));
        }
        // The server's origin validator compares this against its allowed hosts.
        headers.push((ORIGIN, header_value(&endpoints.api().origin())?));
        Ok(Self {
            url: endpoints.stream()?,
            headers,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn request(&self) -> ChatResult<Request> {
        let mut request = self.url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        for (name, value) in &self.headers {
            headers.insert(name.clone(), value.clone());
        }
        Ok(request)
    }
}

impl StreamConnector for WebSocketConnector {
    fn connect(&self) -> Box<dyn Transport> {
        Box::new(WebSocketTransport::new(self.clone()))
    }
}

/// Stream transport over a single WebSocket connection.
///
/// All socket I/O happens on a spawned task; the transport itself only holds
/// the outbound queue and the task handle.
pub struct WebSocketTransport {
    connector: WebSocketConnector,
    outbound: Option<mpsc::UnboundedSender<ClientFrame>>,
    sink: Option<TransportSink>,
    task: Option<JoinHandle<()>>,
}

impl WebSocketTransport {
    pub fn new(connector: WebSocketConnector) -> Self {
        Self {
            connector,
            outbound: None,
            sink: None,
            task: None,
        }
    }
}

impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn open(&mut self, sink: TransportSink) {
        if self.task.is_some() {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.outbound = Some(tx);
        self.sink = Some(sink.clone());
        self.task = Some(tokio::spawn(run_socket(self.connector.clone(), rx, sink)));
    }

    fn send(&mut self, frame: ClientFrame) -> ChatResult<()> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| ChatError::WebSocket("stream is not open".into()))?;
        outbound
            .send(frame)
            .map_err(|_| ChatError::WebSocket("stream task has stopped".into()))
    }

    fn close(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.detach();
        }
        // Dropping the queue asks the task to send a close frame and exit.
        self.outbound = None;
        let Some(task) = self.task.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let abort = task.abort_handle();
                runtime.spawn(async move {
                    if tokio::time::timeout(CLOSE_GRACE, task).await.is_err() {
                        abort.abort();
                    }
                });
            }
            Err(_) => task.abort(),
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_socket(
    connector: WebSocketConnector,
    mut outbound: mpsc::UnboundedReceiver<ClientFrame>,
    sink: TransportSink,
) {
    let generation = sink.generation();
    let request = match connector.request() {
        Ok(request) => request,
        Err(err) => {
            sink.emit(TransportEvent::Failed(err.to_string()));
            return;
        }
    };

    debug!(target = "chat.transport.ws", url = %connector.url, generation, "connecting");
    let socket = match connect_async(request).await {
        Ok((socket, _response)) => socket,
        Err(err) => {
            debug!(target = "chat.transport.ws", generation, error = %err, "connect failed");
            sink.emit(TransportEvent::Failed(err.to_string()));
            return;
        }
    };
    info!(target = "chat.transport.ws", url = %connector.url, generation, "stream opened");
    if !sink.emit(TransportEvent::Opened) {
        return;
    }

    let (mut writer, mut reader) = socket.split();
    loop {
        tokio::select! {
            outgoing = outbound.recv() => {
                let Some(frame) = outgoing else {
                    let _ = writer.send(Message::Close(None)).await;
                    let _ = writer.close().await;
                    debug!(target = "chat.transport.ws", generation, "stream closed locally");
                    return;
                };
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(target = "chat.transport.ws", kind = frame.kind(), error = %err, "failed to encode frame");
                        continue;
                    }
                };
                trace!(target = "chat.transport.ws", kind = frame.kind(), "sending frame");
                if let Err(err) = writer.send(Message::Text(text)).await {
                    sink.emit(TransportEvent::Closed { code: None, reason: err.to_string() });
                    return;
                }
            }
            incoming = reader.next() => match incoming {
                Some(Ok(Message::Text(text))) => deliver(&sink, &text),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => deliver(&sink, &text),
                    Err(_) => {
                        warn!(target = "chat.transport.ws", generation, "skipping non-utf8 binary frame");
                        counter!("chat_frames_dropped_total", 1, "transport" => "stream");
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.into_owned()),
                        None => (NO_STATUS_RECEIVED, String::new()),
                    };
                    debug!(target = "chat.transport.ws", generation, code, %reason, "peer closed stream");
                    sink.emit(TransportEvent::Closed { code: Some(code), reason });
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(target = "chat.transport.ws", generation, error = %err, "stream read failed");
                    sink.emit(TransportEvent::Closed { code: None, reason: err.to_string() });
                    return;
                }
                None => {
                    sink.emit(TransportEvent::Closed { code: None, reason: "stream ended".into() });
                    return;
                }
            }
        }
    }
}

fn deliver(sink: &TransportSink, text: &str) {
    match ServerFrame::decode(text) {
        Ok(frame) => {
            trace!(target = "chat.transport.ws", kind = frame.kind(), "frame received");
            sink.emit(TransportEvent::Frame(frame));
        }
        Err(err) => {
            warn!(target = "chat.transport.ws", error = %err, "skipping malformed frame");
            counter!("chat_frames_dropped_total", 1, "transport" => "stream");
        }
    }
}

fn header_value(value: &str) -> ChatResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|err| ChatError::Config(format!("invalid header value: {err}")))
}
