use std::sync::Arc;
use std::time::Duration;

use chat_core::{
    ClientFrame, ConnectionState, MachineConfig, Message, MessageId, MessagePage, ServerFrame,
};
use souk_chat::transport::mock::{ApiCall, MockApi, MockBehavior, MockConnector};
use souk_chat::{ChatError, ChatEvent, ChatHandle, ConnectionManager, ManagerConfig, StaticProbe};
use test_timeout::tokio_paused_test;
use time::OffsetDateTime;
use tokio::sync::mpsc::UnboundedReceiver;

const ME: i64 = 1;
const SELLER: i64 = 2;

struct Harness {
    handle: ChatHandle,
    events: UnboundedReceiver<ChatEvent>,
    connector: MockConnector,
    api: Arc<MockApi>,
}

fn config(max_reconnect_attempts: u32) -> ManagerConfig {
    ManagerConfig {
        machine: MachineConfig {
            max_reconnect_attempts,
            ..MachineConfig::default()
        },
        typing_quiet_period: Duration::from_millis(3000),
        page_limit: 50,
        current_user_id: ME,
    }
}

fn start(config: ManagerConfig, skip_stream: bool, connector: MockConnector) -> Harness {
    start_with_api(config, skip_stream, connector, Arc::new(MockApi::new(ME)))
}

fn start_with_api(
    config: ManagerConfig,
    skip_stream: bool,
    connector: MockConnector,
    api: Arc<MockApi>,
) -> Harness {
    let manager = ConnectionManager::new(
        config,
        Arc::new(StaticProbe(skip_stream)),
        Arc::new(connector.clone()),
        api.clone(),
    );
    let (handle, events) = manager.start();
    Harness {
        handle,
        events,
        connector,
        api,
    }
}

fn message(id: MessageId, sender: i64) -> Message {
    let mut message = Message::new(id, sender, format!("message {id}"), OffsetDateTime::UNIX_EPOCH);
    message.sender_name = Some(if sender == ME { "me" } else { "seller" }.into());
    message
}

async fn wait_state(handle: &ChatHandle, state: ConnectionState) {
    let mut watch = handle.watch_state();
    tokio::time::timeout(Duration::from_secs(120), watch.wait_for(|current| *current == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
        .expect("session dropped its state channel");
}

async fn wait_event<F>(events: &mut UnboundedReceiver<ChatEvent>, matches: F) -> ChatEvent
where
    F: Fn(&ChatEvent) -> bool,
{
    loop {
        let event = tokio::time::timeout(Duration::from_secs(120), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if matches(&event) {
            return event;
        }
    }
}

fn drain(events: &mut UnboundedReceiver<ChatEvent>) -> Vec<ChatEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

fn states(events: &[ChatEvent]) -> Vec<ConnectionState> {
    events
        .iter()
        .filter_map(|event| match event {
            ChatEvent::ConnectionStateChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

fn message_ids(events: &[ChatEvent]) -> Vec<MessageId> {
    events
        .iter()
        .filter_map(|event| match event {
            ChatEvent::Message(message) => Some(message.id),
            _ => None,
        })
        .collect()
}

#[tokio_paused_test(300)]
async fn blocked_environment_polls_from_the_start() {
    let mut h = start(config(5), true, MockConnector::new(MockBehavior::OpenImmediately));
    wait_state(&h.handle, ConnectionState::Polling).await;
    assert_eq!(h.connector.connect_count(), 0);

    h.handle.send_message("  is the flat still available?  ").await.unwrap();
    let echoed = wait_event(&mut h.events, |event| matches!(event, ChatEvent::Message(_))).await;
    let ChatEvent::Message(echoed) = echoed else {
        unreachable!()
    };
    assert_eq!(echoed.content, "is the flat still available?");
    assert!(echoed.is_mine(ME));
    assert_eq!(h.api.sent(), vec!["is the flat still available?".to_string()]);

    h.handle.close().await.unwrap();
    let seen = states(&drain(&mut h.events));
    assert!(!seen.contains(&ConnectionState::Connecting));
}

#[tokio_paused_test(300)]
async fn abnormal_close_before_connect_falls_back_without_retrying() {
    let mut h = start(
        config(5),
        false,
        MockConnector::new(MockBehavior::CloseImmediately(Some(1006))),
    );
    wait_state(&h.handle, ConnectionState::Polling).await;
    tokio::time::sleep(Duration::from_secs(20)).await;

    assert_eq!(h.connector.connect_count(), 1);
    assert!(h.connector.last().unwrap().is_closed());
    let seen = states(&drain(&mut h.events));
    assert_eq!(seen, vec![ConnectionState::Connecting, ConnectionState::Polling]);
    assert_eq!(h.handle.state(), ConnectionState::Polling);
}

#[tokio_paused_test(300)]
async fn abnormal_close_during_reconnect_goes_straight_to_polling() {
    let connector = MockConnector::new(MockBehavior::CloseImmediately(Some(1006)));
    connector.then(MockBehavior::OpenImmediately);
    let mut h = start(config(5), false, connector);
    wait_state(&h.handle, ConnectionState::Connected).await;

    // A clean server restart is worth a retry.
    h.connector.last().unwrap().close_with(Some(1001));
    wait_state(&h.handle, ConnectionState::Polling).await;

    assert_eq!(h.connector.connect_count(), 2);
    let seen = states(&drain(&mut h.events));
    assert_eq!(
        seen,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Polling,
        ]
    );
}

#[tokio_paused_test(300)]
async fn reconnect_attempts_are_bounded() {
    let max = 3;
    let connector = MockConnector::new(MockBehavior::FailImmediately("refused".into()));
    connector.then(MockBehavior::OpenImmediately);
    let mut h = start(config(max), false, connector);
    wait_state(&h.handle, ConnectionState::Connected).await;

    h.connector.last().unwrap().close_with(Some(1001));
    wait_state(&h.handle, ConnectionState::Polling).await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(h.connector.connect_count(), 1 + max as usize);
    let seen = states(&drain(&mut h.events));
    let reconnecting = seen
        .iter()
        .filter(|state| **state == ConnectionState::Reconnecting)
        .count();
    assert_eq!(reconnecting, max as usize);
    assert_eq!(seen.last(), Some(&ConnectionState::Polling));
}

#[tokio_paused_test(300)]
async fn connect_timeout_on_first_attempt_falls_back() {
    let h = start(config(5), false, MockConnector::new(MockBehavior::Manual));
    wait_state(&h.handle, ConnectionState::Connecting).await;

    tokio::time::sleep(Duration::from_millis(1900)).await;
    assert_eq!(h.handle.state(), ConnectionState::Connecting);

    wait_state(&h.handle, ConnectionState::Polling).await;
    let stale = h.connector.last().unwrap();
    assert!(stale.is_closed());
    // The abandoned attempt can no longer reach the session.
    assert!(!stale.open());
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.handle.state(), ConnectionState::Polling);
}

#[tokio_paused_test(300)]
async fn message_seen_on_both_transports_is_recorded_once() {
    let api = Arc::new(MockApi::new(ME));
    let mut h = start_with_api(
        config(5),
        false,
        MockConnector::new(MockBehavior::OpenImmediately),
        api,
    );
    wait_state(&h.handle, ConnectionState::Connected).await;

    let m42 = message(42, SELLER);
    h.connector.last().unwrap().push(ServerFrame::ChatMessage {
        message: m42.clone(),
    });
    wait_event(&mut h.events, |event| matches!(event, ChatEvent::Message(m) if m.id == 42)).await;

    // The server also lists it; polling after a drop must not duplicate it.
    h.api.deliver(m42);
    h.api.deliver(message(43, SELLER));
    h.connector.last().unwrap().close_with(None);
    wait_state(&h.handle, ConnectionState::Polling).await;
    tokio::time::sleep(Duration::from_secs(7)).await;

    let ledger = h.handle.messages().await.unwrap();
    let ids: Vec<_> = ledger.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![42, 43]);
    assert_eq!(message_ids(&drain(&mut h.events)), vec![43]);
}

#[tokio_paused_test(300)]
async fn load_older_stops_after_final_page() {
    let api = Arc::new(MockApi::new(ME));
    api.set_latest(vec![message(100, SELLER)], true);
    api.push_older(MessagePage {
        messages: vec![message(95, SELLER), message(90, ME)],
        has_more: false,
    });
    let mut h = start_with_api(
        config(5),
        false,
        MockConnector::new(MockBehavior::OpenImmediately),
        api,
    );
    let initial = wait_event(&mut h.events, |event| {
        matches!(event, ChatEvent::HistoryLoaded { .. })
    })
    .await;
    assert_eq!(
        initial,
        ChatEvent::HistoryLoaded {
            messages: vec![message(100, SELLER)],
            has_more: true,
        }
    );

    let page = h.handle.load_older().await.unwrap();
    let ids: Vec<_> = page.messages.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![90, 95]);
    assert!(!page.has_more);
    assert_eq!(page.oldest_id, Some(90));

    assert!(matches!(
        h.handle.load_older().await,
        Err(ChatError::HistoryExhausted)
    ));
    assert!(matches!(
        h.handle.load_older_before(90).await,
        Err(ChatError::HistoryExhausted)
    ));
    assert_eq!(h.api.history_requests(), vec![100]);
}

#[tokio_paused_test(300)]
async fn sends_are_refused_until_a_transport_is_live() {
    let h = start(config(5), false, MockConnector::new(MockBehavior::Manual));
    wait_state(&h.handle, ConnectionState::Connecting).await;

    assert!(matches!(
        h.handle.send_message("hello").await,
        Err(ChatError::NotConnected(ConnectionState::Connecting))
    ));
    assert!(matches!(
        h.handle.send_message("   ").await,
        Err(ChatError::EmptyMessage)
    ));

    let stream = h.connector.last().unwrap();
    stream.open();
    wait_state(&h.handle, ConnectionState::Connected).await;
    h.handle.send_message("hello").await.unwrap();
    assert_eq!(
        stream.sent(),
        vec![ClientFrame::ChatMessage {
            message: "hello".into()
        }]
    );
    assert!(h.api.sent().is_empty());
}

#[tokio_paused_test(300)]
async fn typing_burst_emits_one_start_and_one_stop() {
    let h = start(config(5), false, MockConnector::new(MockBehavior::OpenImmediately));
    wait_state(&h.handle, ConnectionState::Connected).await;
    let stream = h.connector.last().unwrap();

    for _ in 0..5 {
        h.handle.notify_input_activity().unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    // Last keystroke at 2.0s, so the stop is due at 5.0s.
    tokio::time::sleep(Duration::from_millis(2400)).await;
    assert_eq!(stream.sent(), vec![ClientFrame::Typing { is_typing: true }]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        stream.sent(),
        vec![
            ClientFrame::Typing { is_typing: true },
            ClientFrame::Typing { is_typing: false },
        ]
    );

    h.handle.notify_input_activity().unwrap();
    h.handle.send_message("done typing").await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(
        stream.sent()[2..].to_vec(),
        vec![
            ClientFrame::Typing { is_typing: true },
            ClientFrame::ChatMessage {
                message: "done typing".into()
            },
            ClientFrame::Typing { is_typing: false },
        ]
    );
}

#[tokio_paused_test(300)]
async fn typing_is_not_sent_while_polling() {
    let h = start(config(5), true, MockConnector::new(MockBehavior::OpenImmediately));
    wait_state(&h.handle, ConnectionState::Polling).await;
    h.handle.notify_input_activity().unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(
        h.api
            .calls()
            .iter()
            .all(|call| matches!(call, ApiCall::List(_)))
    );
}

#[tokio_paused_test(300)]
async fn incoming_message_clears_remote_typing() {
    let mut h = start(config(5), false, MockConnector::new(MockBehavior::OpenImmediately));
    wait_state(&h.handle, ConnectionState::Connected).await;
    drain(&mut h.events);
    let stream = h.connector.last().unwrap();

    stream.push(ServerFrame::Typing {
        user_id: Some(SELLER),
        username: "seller".into(),
        is_typing: true,
    });
    // Our own echo is ignored.
    stream.push(ServerFrame::Typing {
        user_id: Some(ME),
        username: "me".into(),
        is_typing: true,
    });
    stream.push(ServerFrame::ChatMessage {
        message: message(7, SELLER),
    });

    let mut seen = Vec::new();
    loop {
        let event = wait_event(&mut h.events, |event| {
            !matches!(event, ChatEvent::HistoryLoaded { .. })
        })
        .await;
        let done = matches!(event, ChatEvent::Message(_));
        seen.push(event);
        if done {
            break;
        }
    }
    assert_eq!(
        seen,
        vec![
            ChatEvent::TypingChanged {
                username: "seller".into(),
                is_typing: true,
            },
            ChatEvent::TypingChanged {
                username: "seller".into(),
                is_typing: false,
            },
            ChatEvent::Message(message(7, SELLER)),
        ]
    );
}

#[tokio_paused_test(300)]
async fn missed_pong_drops_the_stream_and_reconnects() {
    let h = start(config(5), false, MockConnector::new(MockBehavior::OpenImmediately));
    wait_state(&h.handle, ConnectionState::Connected).await;
    let first = h.connector.last().unwrap();

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(first.sent(), vec![ClientFrame::Ping]);
    first.push(ServerFrame::Pong);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.handle.state(), ConnectionState::Connected);
    assert_eq!(first.sent(), vec![ClientFrame::Ping, ClientFrame::Ping]);

    // No pong this time.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.handle.state(), ConnectionState::Reconnecting);
    assert!(first.is_closed());

    wait_state(&h.handle, ConnectionState::Connected).await;
    assert_eq!(h.connector.connect_count(), 2);
}

#[tokio_paused_test(300)]
async fn read_receipts_travel_both_ways() {
    let mut h = start(config(5), false, MockConnector::new(MockBehavior::OpenImmediately));
    wait_state(&h.handle, ConnectionState::Connected).await;
    let stream = h.connector.last().unwrap();

    stream.push(ServerFrame::ChatMessage {
        message: message(7, ME),
    });
    wait_event(&mut h.events, |event| matches!(event, ChatEvent::Message(_))).await;
    stream.push(ServerFrame::ReadReceipt {
        message_id: 7,
        read_by: Some(SELLER),
    });
    let receipt = wait_event(&mut h.events, |event| {
        matches!(event, ChatEvent::ReadReceipt { .. })
    })
    .await;
    assert_eq!(receipt, ChatEvent::ReadReceipt { message_id: 7 });
    let ledger = h.handle.messages().await.unwrap();
    assert!(ledger[0].is_read);

    h.handle.mark_read(12).await.unwrap();
    assert!(stream.sent().contains(&ClientFrame::ReadReceipt { message_id: 12 }));
}

#[tokio_paused_test]
async fn zero_poll_interval_keeps_pulling() {
    let mut config = config(5);
    config.machine.poll_interval = Duration::ZERO;
    let mut h = start(config, true, MockConnector::new(MockBehavior::OpenImmediately));
    wait_state(&h.handle, ConnectionState::Polling).await;

    h.api.deliver(message(9, SELLER));
    wait_event(&mut h.events, |event| matches!(event, ChatEvent::Message(m) if m.id == 9)).await;
    assert_eq!(h.handle.state(), ConnectionState::Polling);
    h.handle.close().await.unwrap();
}

#[tokio_paused_test(300)]
async fn poll_path_reports_rejected_sends_and_marks_read_over_http() {
    let api = Arc::new(MockApi::new(ME));
    api.set_latest(vec![message(5, SELLER)], false);
    let mut h = start_with_api(
        config(5),
        true,
        MockConnector::new(MockBehavior::OpenImmediately),
        api,
    );
    wait_state(&h.handle, ConnectionState::Polling).await;
    wait_event(&mut h.events, |event| matches!(event, ChatEvent::HistoryLoaded { .. })).await;

    h.api.reject_sends(Some("conversation is archived"));
    let result = h.handle.send_message("anyone there?").await;
    assert!(
        matches!(&result, Err(ChatError::Rejected(reason)) if reason == "conversation is archived"),
        "unexpected send result: {result:?}"
    );
    assert_eq!(h.api.sent(), vec!["anyone there?".to_string()]);
    assert_eq!(h.handle.messages().await.unwrap().len(), 1);
    assert_eq!(h.handle.state(), ConnectionState::Polling);

    h.api.reject_sends(None);
    h.handle.send_message("second try").await.unwrap();
    // Acknowledged only once the stored message is in the ledger.
    let ledger = h.handle.messages().await.unwrap();
    assert_eq!(ledger.last().map(|m| m.content.as_str()), Some("second try"));

    h.handle.mark_read(5).await.unwrap();
    let receipt = wait_event(&mut h.events, |event| {
        matches!(event, ChatEvent::ReadReceipt { .. })
    })
    .await;
    assert_eq!(receipt, ChatEvent::ReadReceipt { message_id: 5 });
    assert!(h.api.calls().contains(&ApiCall::MarkRead));
}

#[tokio_paused_test(300)]
async fn presence_and_server_errors_are_forwarded() {
    let mut h = start(config(5), false, MockConnector::new(MockBehavior::OpenImmediately));
    wait_state(&h.handle, ConnectionState::Connected).await;
    let stream = h.connector.last().unwrap();

    stream.push(ServerFrame::UserJoin {
        user_id: Some(SELLER),
        username: "seller".into(),
    });
    stream.push(ServerFrame::Error {
        message: "rate limited".into(),
    });
    let joined = wait_event(&mut h.events, |event| matches!(event, ChatEvent::Presence { .. })).await;
    assert_eq!(
        joined,
        ChatEvent::Presence {
            username: "seller".into(),
            joined: true,
        }
    );
    let error = wait_event(&mut h.events, |event| matches!(event, ChatEvent::Error { .. })).await;
    assert_eq!(
        error,
        ChatEvent::Error {
            message: "rate limited".into()
        }
    );
    assert_eq!(h.handle.state(), ConnectionState::Connected);
}

#[tokio_paused_test(300)]
async fn close_releases_everything_and_is_final() {
    let mut h = start(config(5), false, MockConnector::new(MockBehavior::Manual));
    wait_state(&h.handle, ConnectionState::Connecting).await;
    let stream = h.connector.last().unwrap();

    h.handle.close().await.unwrap();
    assert_eq!(h.handle.state(), ConnectionState::Closed);
    assert!(stream.is_closed());
    assert!(!stream.open());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connector.connect_count(), 1);
    let seen = states(&drain(&mut h.events));
    assert_eq!(seen.last(), Some(&ConnectionState::Closed));
    assert!(h.handle.is_closed());
    assert!(matches!(
        h.handle.send_message("late").await,
        Err(ChatError::Closed)
    ));
    // Closing twice is harmless.
    h.handle.close().await.unwrap();
}

#[tokio_paused_test(300)]
async fn dropping_every_handle_shuts_the_session_down() {
    let connector = MockConnector::new(MockBehavior::OpenImmediately);
    let mut h = start(config(5), false, connector.clone());
    wait_state(&h.handle, ConnectionState::Connected).await;
    let mut watch = h.handle.watch_state();
    drop(h.handle);

    tokio::time::timeout(Duration::from_secs(10), watch.wait_for(|s| *s == ConnectionState::Closed))
        .await
        .expect("session did not shut down")
        .ok();
    assert!(connector.last().unwrap().is_closed());
    wait_event(&mut h.events, |event| {
        matches!(
            event,
            ChatEvent::ConnectionStateChanged {
                state: ConnectionState::Closed,
                ..
            }
        )
    })
    .await;
}
