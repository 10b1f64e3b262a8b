use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chat_core::{ClientFrame, Message, MessageId, MessagePage, ServerFrame};
use metrics::counter;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use super::{Transport, TransportEvent, TransportKind, TransportSink};
use crate::error::{ChatError, ChatResult};
use crate::http::{ChatApi, ListQuery};

/// Request/response fallback used when the stream is unavailable.
///
/// Sends become `POST send/`. [`PollTransport::send_message`] hands the stored
/// message or the server's rejection to a completion callback; the plain
/// [`Transport::send`] path echoes it back through the sink as if the server
/// had pushed it. Inbound traffic is discovered by
/// [`PollTransport::pull`], which the manager calls on every poll tick; the
/// ledger drops whatever was already seen. Typing frames have no HTTP
/// counterpart and are discarded.
pub struct PollTransport {
    api: Arc<dyn ChatApi>,
    page_limit: u32,
    sink: Option<TransportSink>,
    requests: JoinSet<()>,
    pull_in_flight: Arc<AtomicBool>,
}

impl PollTransport {
    pub fn new(api: Arc<dyn ChatApi>, page_limit: u32) -> Self {
        Self {
            api,
            page_limit,
            sink: None,
            requests: JoinSet::new(),
            pull_in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Fetches the newest page. Skipped while the previous pull is running.
    ///
    /// `newest_known` is the newest id already held by the caller; a full
    /// page that starts beyond it means messages were missed between pulls.
    pub fn pull(&mut self, newest_known: Option<MessageId>) {
        let Some(sink) = self.sink.clone() else {
            return;
        };
        if self.pull_in_flight.swap(true, Ordering::AcqRel) {
            trace!(target = "chat.transport.poll", "previous pull still running");
            return;
        }
        self.reap();
        let api = Arc::clone(&self.api);
        let in_flight = Arc::clone(&self.pull_in_flight);
        let query = ListQuery::latest(self.page_limit);
        self.requests.spawn(async move {
            match api.list_messages(query).await {
                Ok(page) => {
                    if let Some(oldest) = skipped_past(&page, newest_known) {
                        counter!("chat_poll_gaps_total", 1);
                        warn!(
                            target = "chat.transport.poll",
                            newest_known = ?newest_known,
                            oldest_pulled = oldest,
                            "pulled page is full and starts past the newest known message; some messages were skipped"
                        );
                    }
                    let mut messages = page.messages;
                    messages.sort_by_key(|message| message.id);
                    trace!(target = "chat.transport.poll", count = messages.len(), "pulled page");
                    for message in messages {
                        sink.emit(TransportEvent::Frame(ServerFrame::ChatMessage { message }));
                    }
                }
                Err(err) => {
                    warn!(target = "chat.transport.poll", error = %err, "poll request failed");
                }
            }
            in_flight.store(false, Ordering::Release);
        });
    }

    /// Posts one message and reports the server's answer to `done`.
    ///
    /// `done` runs exactly once: with the stored message, with the server's
    /// error, or with [`ChatError::Closed`] when polling has stopped.
    pub fn send_message<F>(&mut self, content: String, done: F)
    where
        F: FnOnce(ChatResult<Message>) + Send + 'static,
    {
        if self.sink.is_none() {
            done(Err(ChatError::Closed));
            return;
        }
        self.reap();
        let api = Arc::clone(&self.api);
        self.requests.spawn(async move {
            let result = api.send_message(&content).await;
            if let Err(err) = &result {
                warn!(target = "chat.transport.poll", error = %err, "send failed");
            }
            done(result);
        });
    }

    fn reap(&mut self) {
        while self.requests.try_join_next().is_some() {}
    }
}

impl Transport for PollTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Poll
    }

    fn open(&mut self, sink: TransportSink) {
        debug!(target = "chat.transport.poll", generation = sink.generation(), "polling started");
        sink.emit(TransportEvent::Opened);
        self.sink = Some(sink);
    }

    fn send(&mut self, frame: ClientFrame) -> ChatResult<()> {
        let sink = self.sink.clone().ok_or(ChatError::Closed)?;
        if let ClientFrame::ChatMessage { message } = frame {
            self.send_message(message, move |result| match result {
                Ok(stored) => {
                    sink.emit(TransportEvent::Frame(ServerFrame::ChatMessage { message: stored }));
                }
                Err(err) => {
                    sink.emit(TransportEvent::Failed(format!("send failed: {err}")));
                }
            });
            return Ok(());
        }
        self.reap();
        let api = Arc::clone(&self.api);
        match frame {
            ClientFrame::ReadReceipt { message_id } => {
                self.requests.spawn(async move {
                    match api.mark_read().await {
                        Ok(()) => {
                            sink.emit(TransportEvent::Frame(ServerFrame::ReadReceipt {
                                message_id,
                                read_by: None,
                            }));
                        }
                        Err(err) => {
                            warn!(target = "chat.transport.poll", error = %err, "mark read failed");
                            sink.emit(TransportEvent::Failed(format!("mark read failed: {err}")));
                        }
                    }
                });
            }
            ClientFrame::ChatMessage { .. } | ClientFrame::Typing { .. } | ClientFrame::Ping => {
                trace!(target = "chat.transport.poll", kind = frame.kind(), "no http equivalent; dropped");
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.detach();
            debug!(target = "chat.transport.poll", generation = sink.generation(), "polling stopped");
        }
        self.requests.abort_all();
    }
}

/// Oldest id of a full page that lies entirely beyond `newest_known`.
fn skipped_past(page: &MessagePage, newest_known: Option<MessageId>) -> Option<MessageId> {
    let newest_known = newest_known?;
    if !page.has_more {
        return None;
    }
    let oldest = page.messages.iter().map(|message| message.id).min()?;
    (oldest > newest_known).then_some(oldest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockApi;
    use test_timeout::tokio_paused_test;
    use time::OffsetDateTime;
    use tokio::sync::{mpsc, oneshot};

    fn page(ids: &[MessageId], has_more: bool) -> MessagePage {
        MessagePage {
            messages: ids
                .iter()
                .map(|&id| Message::new(id, 2, "pulled", OffsetDateTime::UNIX_EPOCH))
                .collect(),
            has_more,
        }
    }

    #[test]
    fn full_page_beyond_newest_known_is_a_gap() {
        assert_eq!(skipped_past(&page(&[30, 29, 28], true), Some(20)), Some(28));
        // Overlaps what we already hold.
        assert_eq!(skipped_past(&page(&[30, 29, 20], true), Some(20)), None);
        // The server says nothing older exists.
        assert_eq!(skipped_past(&page(&[30, 29, 28], false), Some(20)), None);
        // Nothing held yet, so nothing can have been skipped.
        assert_eq!(skipped_past(&page(&[30, 29, 28], true), None), None);
        assert_eq!(skipped_past(&page(&[], true), Some(20)), None);
    }

    #[tokio_paused_test]
    async fn send_message_reports_server_rejection() {
        let api = Arc::new(MockApi::new(1));
        api.reject_sends(Some("conversation is archived"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut poll = PollTransport::new(api.clone(), 20);
        poll.open(TransportSink::new(TransportKind::Poll, 1, tx));
        rx.recv().await;

        let (done, result) = oneshot::channel();
        poll.send_message("hello".into(), move |outcome| {
            let _ = done.send(outcome);
        });
        match result.await.unwrap() {
            Err(ChatError::Rejected(reason)) => assert_eq!(reason, "conversation is archived"),
            other => panic!("unexpected send outcome: {other:?}"),
        }
        assert_eq!(api.sent(), vec!["hello".to_string()]);
        // The rejection goes to the caller only, never through the sink.
        assert!(rx.try_recv().is_err());
    }

    #[tokio_paused_test]
    async fn send_message_after_close_fails_immediately() {
        let api = Arc::new(MockApi::new(1));
        let mut poll = PollTransport::new(api.clone(), 20);
        let (done, result) = oneshot::channel();
        poll.send_message("hello".into(), move |outcome| {
            let _ = done.send(outcome);
        });
        assert!(matches!(result.await.unwrap(), Err(ChatError::Closed)));
        assert!(api.sent().is_empty());
    }
}
