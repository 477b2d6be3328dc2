/// Session integration tests
/// Inbound dispatch, visibility, local echo and history seeding through the public API

extern crate chatsync_core;

use async_trait::async_trait;
use chatsync_core::history::parse_history_timestamp;
use chatsync_core::protocol::{ChatType, FrameType, HistoryItem, HistoryRequest, HistoryResponse, OutboundFrame};
use chatsync_core::{
    ChatError, ChatSession, ConversationKey, IngestOutcome, LoadOutcome, MessageEnvelope,
    RecencyEntry, Result, SessionConfig, Transport,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Transport double: records outbound frames and history requests, serves scripted pages
#[derive(Default)]
struct MockTransport {
    sent: Mutex<Vec<OutboundFrame>>,
    requests: Mutex<Vec<HistoryRequest>>,
    pages: Mutex<VecDeque<HistoryResponse>>,
}

impl MockTransport {
    fn with_pages(pages: Vec<HistoryResponse>) -> Self {
        Self {
            pages: Mutex::new(pages.into()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn request_history(&self, request: HistoryRequest) -> Result<HistoryResponse> {
        self.requests.lock().unwrap().push(request);
        self.pages
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ChatError::TransportUnavailable("no scripted page".to_string()))
    }
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<String>>,
}

impl Recorder {
    fn contents(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

fn conversation_recorder(recorder: &Arc<Recorder>) -> Arc<dyn chatsync_core::ConversationObserver> {
    let recorder = recorder.clone();
    Arc::new(move |env: &MessageEnvelope| -> Result<()> {
        recorder.seen.lock().unwrap().push(env.content.clone());
        Ok(())
    })
}

fn list_recorder(recorder: &Arc<Recorder>) -> Arc<dyn chatsync_core::ConversationListObserver> {
    let recorder = recorder.clone();
    Arc::new(move |env: &MessageEnvelope, entry: Option<&RecencyEntry>| -> Result<()> {
        let preview = entry.map(|e| e.preview_text.clone()).unwrap_or_default();
        recorder.seen.lock().unwrap().push(format!("{}|{}", env.content, preview));
        Ok(())
    })
}

fn chat_frame(kind: &str, sender: &str, recipient: &str, content: &str, id: Option<&str>) -> Vec<u8> {
    let mut body = serde_json::json!({
        "type": kind,
        "senderId": sender,
        "recipient": recipient,
        "content": content,
        "timestamp": 1_700_000_000_000i64,
    });
    if let Some(id) = id {
        body["messageId"] = serde_json::Value::String(id.to_string());
    }
    body.to_string().into_bytes()
}

fn chat_frame_at(kind: &str, sender: &str, recipient: &str, content: &str, id: &str, timestamp_ms: i64) -> Vec<u8> {
    serde_json::json!({
        "type": kind,
        "senderId": sender,
        "recipient": recipient,
        "content": content,
        "timestamp": timestamp_ms,
        "messageId": id,
    })
    .to_string()
    .into_bytes()
}

fn history_item_without_id(sender: &str, content: &str, ts: &str) -> HistoryItem {
    HistoryItem {
        sender_id: sender.to_string(),
        content: content.to_string(),
        timestamp_string: ts.to_string(),
        message_id: None,
    }
}

fn history_item(sender: &str, content: &str, ts: &str, id: &str) -> HistoryItem {
    HistoryItem {
        sender_id: sender.to_string(),
        content: content.to_string(),
        timestamp_string: ts.to_string(),
        message_id: Some(id.to_string()),
    }
}

fn ok_page(items: Vec<HistoryItem>) -> HistoryResponse {
    HistoryResponse {
        success: true,
        message: None,
        items,
    }
}

fn session_for(user: &str, transport: Arc<MockTransport>) -> ChatSession {
    ChatSession::new(SessionConfig::for_user(user), transport)
}

#[tokio::test]
async fn test_direct_visibility_for_recipient_and_sender() {
    let session = session_for("U1", Arc::new(MockTransport::default()));
    let key = ConversationKey::direct("U1", "U2");

    let conversation = Arc::new(Recorder::default());
    let list = Arc::new(Recorder::default());
    let _c = session.subscribe_conversation(&key, conversation_recorder(&conversation));
    let _l = session.subscribe_conversation_list(list_recorder(&list));

    session
        .handle_raw(&chat_frame("direct_message", "U2", "U1", "to me", Some("a")))
        .await;
    session
        .handle_raw(&chat_frame("direct_message", "U1", "U2", "from me", Some("b")))
        .await;

    assert_eq!(conversation.contents(), vec!["to me", "from me"]);
    assert_eq!(list.contents(), vec!["to me|U2: to me"]);
    // The outgoing copy refreshes the entry without notifying list observers
    assert_eq!(session.messages(&key).await.len(), 2);
    let entry = session.conversation_entry(&key).await.unwrap();
    assert_eq!(entry.preview_text, "Me: from me");
    assert_eq!(entry.unread_count, 1);
}

#[tokio::test]
async fn test_group_always_reaches_list() {
    let session = session_for("U1", Arc::new(MockTransport::default()));
    let list = Arc::new(Recorder::default());
    let _l = session.subscribe_conversation_list(list_recorder(&list));

    session
        .handle_raw(&chat_frame("group_message", "U2", "G", "theirs", Some("1")))
        .await;
    session
        .handle_raw(&chat_frame("group_message", "U1", "G", "mine", Some("2")))
        .await;

    assert_eq!(list.contents(), vec!["theirs|U2: theirs", "mine|Me: mine"]);
    let entry = session
        .conversation_entry(&ConversationKey::group("G"))
        .await
        .unwrap();
    assert!(entry.is_group);
    assert_eq!(entry.unread_count, 1);
}

#[tokio::test]
async fn test_failing_observer_does_not_block_siblings() {
    let session = session_for("U1", Arc::new(MockTransport::default()));
    let key = ConversationKey::group("G");
    let good = Arc::new(Recorder::default());

    let _bad = session.subscribe_conversation(
        &key,
        Arc::new(|_: &MessageEnvelope| -> Result<()> {
            Err(ChatError::Observer("render failed".to_string()))
        }),
    );
    let _panics = session.subscribe_conversation(
        &key,
        Arc::new(|_: &MessageEnvelope| -> Result<()> { panic!("view gone") }),
    );
    let _good = session.subscribe_conversation(&key, conversation_recorder(&good));

    let outcome = session
        .handle_raw(&chat_frame("group_message", "U2", "G", "still here", Some("1")))
        .await;

    match outcome {
        Some(IngestOutcome::Delivered(delivery)) => {
            assert_eq!(delivery.failed, 2);
            assert_eq!(delivery.conversation_notified, 1);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(good.contents(), vec!["still here"]);
}

#[tokio::test]
async fn test_dropped_subscription_gets_nothing() {
    let session = session_for("U1", Arc::new(MockTransport::default()));
    let key = ConversationKey::direct("U1", "U2");
    let recorder = Arc::new(Recorder::default());

    let sub = session.subscribe_conversation(&key, conversation_recorder(&recorder));
    session
        .handle_raw(&chat_frame("direct_message", "U2", "U1", "one", Some("1")))
        .await;
    drop(sub);
    session
        .handle_raw(&chat_frame("direct_message", "U2", "U1", "two", Some("2")))
        .await;

    assert_eq!(recorder.contents(), vec!["one"]);
}

#[tokio::test]
async fn test_explicit_unsubscribe() {
    let session = session_for("U1", Arc::new(MockTransport::default()));
    let recorder = Arc::new(Recorder::default());
    let observer = list_recorder(&recorder);

    let sub = session.subscribe_conversation_list(observer.clone());
    assert!(session.unsubscribe_conversation_list(&observer));
    assert!(!sub.is_active());

    session
        .handle_raw(&chat_frame("group_message", "U2", "G", "hello", Some("1")))
        .await;
    assert!(recorder.contents().is_empty());
}

#[tokio::test]
async fn test_redelivery_without_message_id_is_suppressed() {
    let session = session_for("U1", Arc::new(MockTransport::default()));
    let raw = chat_frame("direct_message", "U2", "U1", "replayed", None);

    assert!(matches!(session.handle_raw(&raw).await, Some(IngestOutcome::Delivered(_))));
    assert_eq!(session.handle_raw(&raw).await, Some(IngestOutcome::Duplicate));
    assert_eq!(session.total_unread().await, 1);
}

#[tokio::test]
async fn test_unread_accounting() {
    let session = session_for("U1", Arc::new(MockTransport::default()));
    let key = ConversationKey::direct("U1", "U2");

    for n in 0..3 {
        let id = format!("m{}", n);
        session
            .handle_raw(&chat_frame("direct_message", "U2", "U1", "ping", Some(&id)))
            .await;
    }
    assert_eq!(session.conversation_entry(&key).await.unwrap().unread_count, 3);

    let read = session.mark_read(&key).await.unwrap();
    assert_eq!(read.unread_count, 0);
    assert!(!read.has_unread);

    session
        .handle_raw(&chat_frame("direct_message", "U2", "U1", "again", Some("m3")))
        .await;
    assert_eq!(session.conversation_entry(&key).await.unwrap().unread_count, 1);
}

#[tokio::test]
async fn test_conversation_list_orders_by_recency() {
    let session = session_for("U1", Arc::new(MockTransport::default()));
    session
        .handle_raw(&chat_frame("direct_message", "U2", "U1", "first", Some("1")))
        .await;
    session
        .handle_raw(&chat_frame("group_message", "U3", "G", "second", Some("2")))
        .await;
    session
        .handle_raw(&chat_frame("direct_message", "U4", "U1", "third", Some("3")))
        .await;

    let order: Vec<String> = session
        .conversations()
        .await
        .into_iter()
        .map(|e| e.conversation_key.to_string())
        .collect();
    assert_eq!(order, vec!["direct:U1:U4", "group:G", "direct:U1:U2"]);
}

#[tokio::test]
async fn test_store_keeps_last_cap_messages() {
    let mut config = SessionConfig::for_user("U1");
    config.direct_log_cap = 3;
    let session = ChatSession::new(config, Arc::new(MockTransport::default()));
    let key = ConversationKey::direct("U1", "U2");

    for n in 0..7 {
        let id = format!("m{}", n);
        let content = format!("msg {}", n);
        session
            .handle_raw(&chat_frame("direct_message", "U2", "U1", &content, Some(&id)))
            .await;
    }
    let contents: Vec<String> = session
        .messages(&key)
        .await
        .iter()
        .map(|m| m.content.clone())
        .collect();
    assert_eq!(contents, vec!["msg 4", "msg 5", "msg 6"]);
}

#[tokio::test]
async fn test_external_frames_are_forwarded_untouched() {
    let session = session_for("U1", Arc::new(MockTransport::default()));
    let mut external = session.external_frames();

    let raw = br#"{"type":"friend_list_response","friends":[{"id":7,"name":"Ann"}]}"#;
    assert_eq!(session.handle_raw(raw).await, Some(IngestOutcome::Forwarded));

    let frame = external.recv().await.unwrap();
    assert_eq!(frame.frame_type, FrameType::FriendListResponse);
    assert_eq!(frame.body["friends"][0]["name"], "Ann");
    assert!(session.conversations().await.is_empty());
}

#[tokio::test]
async fn test_run_inbound_preserves_arrival_order() {
    let session = session_for("U1", Arc::new(MockTransport::default()));
    let key = ConversationKey::group("G");
    let recorder = Arc::new(Recorder::default());
    let _sub = session.subscribe_conversation(&key, conversation_recorder(&recorder));

    let (tx, rx) = session.inbound_channel();
    let dispatch = session.spawn_inbound(rx);
    for n in 0..20 {
        let id = n.to_string();
        let content = format!("{}", n);
        tx.send(chat_frame("group_message", "U2", "G", &content, Some(&id)))
            .await
            .unwrap();
    }
    tx.send(b"garbage".to_vec()).await.unwrap();
    drop(tx);
    dispatch.await.unwrap();

    let expected: Vec<String> = (0..20).map(|n| n.to_string()).collect();
    assert_eq!(recorder.contents(), expected);
    assert_eq!(session.messages(&key).await.len(), 20);
}

#[tokio::test]
async fn test_group_send_echo_is_reconciled_by_client_id() {
    let transport = Arc::new(MockTransport::default());
    let session = session_for("U1", transport.clone());
    let key = ConversationKey::group("G");
    let list = Arc::new(Recorder::default());
    let _l = session.subscribe_conversation_list(list_recorder(&list));

    let echo = session.send_group(&key, "on my way").await.unwrap();
    assert_eq!(session.messages(&key).await.len(), 1);

    let client_id = match &transport.sent.lock().unwrap()[0] {
        OutboundFrame::SendGroup { group_id, client_id, .. } => {
            assert_eq!(group_id, "G");
            *client_id
        }
        other => panic!("unexpected frame {:?}", other),
    };
    assert_eq!(echo.client_id, Some(client_id));

    let server_copy = serde_json::json!({
        "type": "group_message",
        "senderId": "U1",
        "recipient": "G",
        "content": "on my way",
        "timestamp": 1_700_000_000_000i64,
        "messageId": "srv-1",
        "clientId": client_id,
    })
    .to_string();
    let outcome = session.handle_raw(server_copy.as_bytes()).await;

    assert!(matches!(outcome, Some(IngestOutcome::EchoReconciled(d)) if d.list_notified == 1));
    assert_eq!(session.messages(&key).await.len(), 1);
    assert_eq!(list.contents(), vec!["on my way|Me: on my way"]);
}

#[tokio::test]
async fn test_history_cursor_and_seeding() {
    let page_one = ok_page(vec![
        history_item("U2", "five", "2024-03-02 10:00:05", "h5"),
        history_item("U1", "four", "2024-03-02 10:00:04", "h4"),
        history_item("U2", "three", "2024-03-02 10:00:03", "h3"),
        history_item("U2", "two", "2024-03-01 23:59:02", "h2"),
        history_item("U1", "one", "2024-03-01 23:59:01", "h1"),
    ]);
    let page_two = ok_page(vec![
        history_item("U1", "one", "2024-03-01 23:59:01", "h1"),
        history_item("U2", "zero", "2024-03-01 09:00:00", "h0"),
    ]);
    let transport = Arc::new(MockTransport::with_pages(vec![page_one, page_two]));

    let mut config = SessionConfig::for_user("U1");
    config.history_page_size = 5;
    let session = ChatSession::new(config, transport.clone());
    let key = ConversationKey::direct("U1", "U2");

    // Already seen live before the history was opened
    session
        .handle_raw(&chat_frame("direct_message", "U2", "U1", "five", Some("h5")))
        .await;

    let pager = session.history(ChatType::Private, "U2");
    assert_eq!(pager.conversation_key(), key);
    assert_eq!(
        pager.load_more().await.unwrap(),
        LoadOutcome::Loaded { added: 5, exhausted: false }
    );
    assert_eq!(
        pager.load_more().await.unwrap(),
        LoadOutcome::Loaded { added: 1, exhausted: true }
    );
    assert_eq!(pager.load_more().await.unwrap(), LoadOutcome::Exhausted);

    let requests = transport.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].before_timestamp, None);
    assert_eq!(requests[0].limit, 5);
    assert_eq!(
        requests[1].before_timestamp,
        Some(parse_history_timestamp("2024-03-01 23:59:01").timestamp_millis())
    );

    assert_eq!(session.apply_history(&pager).await, 5);
    let contents: Vec<String> = session
        .messages(&key)
        .await
        .iter()
        .map(|m| m.content.clone())
        .collect();
    assert_eq!(contents, vec!["zero", "one", "two", "three", "four", "five"]);

    // Seeding twice adds nothing
    assert_eq!(session.apply_history(&pager).await, 0);
}

#[tokio::test]
async fn test_history_without_ids_does_not_duplicate_live_messages() {
    let seen_at = "2024-03-02 10:00:05";
    let transport = Arc::new(MockTransport::with_pages(vec![ok_page(vec![
        history_item_without_id("U2", "hi", seen_at),
        history_item_without_id("U2", "earlier", "2024-03-02 09:00:00"),
    ])]));
    let session = session_for("U1", transport);
    let key = ConversationKey::direct("U1", "U2");

    let live_ms = parse_history_timestamp(seen_at).timestamp_millis() + 250;
    session
        .handle_raw(&chat_frame_at("direct_message", "U2", "U1", "hi", "m1", live_ms))
        .await;

    let pager = session.history(ChatType::Private, "U2");
    pager.load_more().await.unwrap();
    assert_eq!(session.apply_history(&pager).await, 1);

    let stored: Vec<(String, Option<String>)> = session
        .messages(&key)
        .await
        .iter()
        .map(|m| (m.content.clone(), m.message_id.clone()))
        .collect();
    assert_eq!(
        stored,
        vec![
            ("earlier".to_string(), None),
            ("hi".to_string(), Some("m1".to_string())),
        ]
    );
}

#[tokio::test]
async fn test_history_does_not_duplicate_local_echo() {
    let server_time = (chrono::Local::now() + chrono::Duration::seconds(3))
        .format("%Y-%m-%d %H:%M:%S")
        .to_string();
    let transport = Arc::new(MockTransport::with_pages(vec![ok_page(vec![
        history_item_without_id("U1", "see you at 8", &server_time),
    ])]));
    let session = session_for("U1", transport);
    let key = ConversationKey::group("G");

    session.send_group(&key, "see you at 8").await.unwrap();

    let pager = session.history(ChatType::Group, "G");
    pager.load_more().await.unwrap();
    assert_eq!(session.apply_history(&pager).await, 0);
    assert_eq!(session.messages(&key).await.len(), 1);
}

#[tokio::test]
async fn test_history_failure_keeps_cursor() {
    let transport = Arc::new(MockTransport::with_pages(vec![HistoryResponse {
        success: false,
        message: Some("rate limited".to_string()),
        items: Vec::new(),
    }]));
    let session = session_for("U1", transport.clone());
    let pager = session.history(ChatType::Group, "G");

    let err = pager.load_more().await.unwrap_err();
    assert!(matches!(err, ChatError::History(ref msg) if msg == "rate limited"));
    assert_eq!(pager.next_cursor().await, None);
    assert!(!pager.is_exhausted().await);
    assert_eq!(pager.last_error().await.as_deref(), Some("History request failed: rate limited"));
}

#[tokio::test]
async fn test_logout_drops_observers_and_caches() {
    let session = session_for("U1", Arc::new(MockTransport::default()));
    let recorder = Arc::new(Recorder::default());
    let sub = session.subscribe_conversation_list(list_recorder(&recorder));

    session
        .handle_raw(&chat_frame("group_message", "U2", "G", "before", Some("1")))
        .await;
    session.logout().await;
    assert!(!sub.is_active());

    session
        .handle_raw(&chat_frame("group_message", "U2", "G", "after", Some("2")))
        .await;
    assert_eq!(recorder.contents(), vec!["before|U2: before"]);
    assert_eq!(session.total_unread().await, 1);
}
