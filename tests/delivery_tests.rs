//! Delivery engine tests over an in-memory store
//!
//! Exercises the three recipient classifications, receipt monotonicity, the
//! reconciliation sweep, and the conversation-level read/clear operations.

use std::sync::Arc;

use tokio::sync::mpsc;

use pulse_rtm::config::Config;
use pulse_rtm::error::AppError;
use pulse_rtm::models::*;
use pulse_rtm::store::Store;
use pulse_rtm::AppState;

async fn test_state() -> AppState {
    let config = Arc::new(Config::default());
    let store = Arc::new(Store::in_memory().await.unwrap());
    AppState::new(config, store)
}

/// Attach a fake connection and return its event receiver.
fn connect(state: &AppState, user_id: &str, conn_id: &str) -> mpsc::UnboundedReceiver<ServerEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    state.presence.mark_online(user_id, conn_id, tx);
    rx
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_conversation_identity_is_order_independent() {
    let state = test_state().await;

    let first = state.store.find_or_create_conversation("alice", "bob").await.unwrap();
    let second = state.store.find_or_create_conversation("bob", "alice").await.unwrap();

    assert_eq!(first.conversation_id, second.conversation_id);
    assert_eq!(first.participant_key, participant_key("bob", "alice"));
}

#[tokio::test]
async fn test_concurrent_creation_converges_to_one_record() {
    let state = test_state().await;

    let (a, b) = tokio::join!(
        state.store.find_or_create_conversation("alice", "bob"),
        state.store.find_or_create_conversation("bob", "alice"),
    );

    assert_eq!(a.unwrap().conversation_id, b.unwrap().conversation_id);
    assert_eq!(state.store.conversations_for_user("alice").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_send_to_actively_viewing_recipient() {
    let state = test_state().await;
    let conversation = state.store.find_or_create_conversation("alice", "bob").await.unwrap();

    let mut alice_rx = connect(&state, "alice", "conn-a");
    let mut bob_rx = connect(&state, "bob", "conn-b");
    state.rooms.join("conn-b", &conversation.conversation_id);

    let message = state
        .delivery
        .send_message(&conversation, "alice", "hey", &[])
        .await
        .unwrap();

    assert!(message.delivered_to.contains(&"bob".to_string()));
    assert!(message.read_by.contains(&"bob".to_string()));

    let refreshed = state
        .store
        .find_conversation(&conversation.conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.unread_for("bob"), 0);
    assert_eq!(refreshed.last_message_id.as_deref(), Some(message.message_id.as_str()));

    // Sender gets an immediate read receipt
    let alice_events = drain(&mut alice_rx);
    assert!(alice_events.iter().any(|e| matches!(
        e,
        ServerEvent::MessageRead { reader_id, .. } if reader_id == "bob"
    )));

    // Viewing recipient gets the message live
    let bob_events = drain(&mut bob_rx);
    assert!(bob_events.iter().any(|e| matches!(
        e,
        ServerEvent::NewMessage(m) if m.message_id == message.message_id
    )));
    // No notification for someone already looking at the conversation
    assert!(state.store.notifications_for_user("bob").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_send_to_online_but_not_viewing_recipient() {
    let state = test_state().await;
    let conversation = state.store.find_or_create_conversation("alice", "bob").await.unwrap();

    let mut alice_rx = connect(&state, "alice", "conn-a");
    let mut bob_rx = connect(&state, "bob", "conn-b");

    let message = state
        .delivery
        .send_message(&conversation, "alice", "hey", &[])
        .await
        .unwrap();

    assert!(message.delivered_to.contains(&"bob".to_string()));
    assert!(!message.read_by.contains(&"bob".to_string()));

    let refreshed = state
        .store
        .find_conversation(&conversation.conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.unread_for("bob"), 1);
    assert_eq!(refreshed.unread_for("alice"), 0);

    let alice_events = drain(&mut alice_rx);
    assert!(alice_events.iter().any(|e| matches!(
        e,
        ServerEvent::MessageDelivered { user_id, .. } if user_id == "bob"
    )));

    let bob_events = drain(&mut bob_rx);
    assert!(bob_events.iter().any(|e| matches!(e, ServerEvent::NewMessage(_))));
    assert!(bob_events.iter().any(|e| matches!(e, ServerEvent::Notification(_))));

    let notifications = state.store.notifications_for_user("bob").await.unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].actor_id, "alice");
}

#[tokio::test]
async fn test_send_to_offline_recipient_then_reconcile() {
    let state = test_state().await;
    let conversation = state.store.find_or_create_conversation("alice", "bob").await.unwrap();

    let mut alice_rx = connect(&state, "alice", "conn-a");

    let message = state
        .delivery
        .send_message(&conversation, "alice", "hey", &[])
        .await
        .unwrap();

    assert!(message.delivered_to.is_empty());

    let refreshed = state
        .store
        .find_conversation(&conversation.conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.unread_for("bob"), 1);
    assert_eq!(state.store.notifications_for_user("bob").await.unwrap().len(), 1);

    // No delivery receipt yet
    assert!(!drain(&mut alice_rx).iter().any(|e| matches!(e, ServerEvent::MessageDelivered { .. })));

    // Bob connects; the sweep marks the backlog delivered and tells alice
    let _bob_rx = connect(&state, "bob", "conn-b");
    state.delivery.reconcile_on_connect("bob").await;

    let delivered = state.store.find_message(&message.message_id).await.unwrap().unwrap();
    assert!(delivered.delivered_to.contains(&"bob".to_string()));
    assert!(!delivered.read_by.contains(&"bob".to_string()));

    let alice_events = drain(&mut alice_rx);
    assert!(alice_events.iter().any(|e| matches!(
        e,
        ServerEvent::MessageDelivered { message_ids, user_id, .. }
            if user_id == "bob" && message_ids.contains(&message.message_id)
    )));

    // A second sweep has nothing left to reconcile
    state.delivery.reconcile_on_connect("bob").await;
    assert!(drain(&mut alice_rx).iter().all(|e| !matches!(e, ServerEvent::MessageDelivered { .. })));
}

#[tokio::test]
async fn test_empty_message_rejected_before_persistence() {
    let state = test_state().await;
    let conversation = state.store.find_or_create_conversation("alice", "bob").await.unwrap();

    let result = state.delivery.send_message(&conversation, "alice", "   ", &[]).await;
    assert!(matches!(result, Err(AppError::EmptyMessage)));

    let messages = state
        .store
        .messages_before(&conversation.conversation_id, "alice", None, None, 10)
        .await
        .unwrap();
    assert!(messages.is_empty());

    // An attachment alone is a valid payload
    let attachment = Attachment {
        kind: AttachmentKind::Image,
        location: "/uploads/pic.jpg".to_string(),
        mime: "image/jpeg".to_string(),
        size: 1024,
        original_name: "pic.jpg".to_string(),
    };
    let message = state
        .delivery
        .send_message(&conversation, "alice", "", &[attachment])
        .await
        .unwrap();
    assert_eq!(message.attachments.len(), 1);
}

#[tokio::test]
async fn test_mark_read_resets_unread_and_is_monotonic() {
    let state = test_state().await;
    let conversation = state.store.find_or_create_conversation("alice", "bob").await.unwrap();

    let mut alice_rx = connect(&state, "alice", "conn-a");

    let m1 = state.delivery.send_message(&conversation, "alice", "one", &[]).await.unwrap();
    let m2 = state.delivery.send_message(&conversation, "alice", "two", &[]).await.unwrap();

    let refreshed = state
        .store
        .find_conversation(&conversation.conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.unread_for("bob"), 2);

    state.delivery.mark_read(&refreshed, "bob").await.unwrap();

    let after = state
        .store
        .find_conversation(&conversation.conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.unread_for("bob"), 0);

    for id in [&m1.message_id, &m2.message_id] {
        let message = state.store.find_message(id).await.unwrap().unwrap();
        assert!(message.read_by.contains(&"bob".to_string()));
    }

    let alice_events = drain(&mut alice_rx);
    assert!(alice_events.iter().any(|e| matches!(
        e,
        ServerEvent::MessageRead { reader_id, .. } if reader_id == "bob"
    )));

    // Marking read twice never removes or duplicates the receipt
    state.delivery.mark_read(&after, "bob").await.unwrap();
    let message = state.store.find_message(&m1.message_id).await.unwrap().unwrap();
    assert_eq!(message.read_by.iter().filter(|u| *u == "bob").count(), 1);

    // The sender's own messages never enter their read-by set
    assert!(!message.read_by.contains(&"alice".to_string()));
}

#[tokio::test]
async fn test_clear_conversation_hides_history_for_one_side() {
    let state = test_state().await;
    let conversation = state.store.find_or_create_conversation("alice", "bob").await.unwrap();

    state.delivery.send_message(&conversation, "alice", "one", &[]).await.unwrap();
    state.delivery.send_message(&conversation, "bob", "two", &[]).await.unwrap();

    let before_clear = state
        .store
        .find_conversation(&conversation.conversation_id)
        .await
        .unwrap()
        .unwrap();
    state.delivery.clear_conversation(&before_clear, "bob").await.unwrap();

    let cleared = state
        .store
        .find_conversation(&conversation.conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cleared.unread_for("bob"), 0);
    assert!(cleared.cleared_at_for("bob").is_some());
    assert!(cleared.cleared_at_for("alice").is_none());

    // Bob's history is empty, alice's untouched
    let bob_view = state
        .store
        .messages_before(
            &conversation.conversation_id,
            "bob",
            cleared.cleared_at_for("bob"),
            None,
            50,
        )
        .await
        .unwrap();
    assert!(bob_view.is_empty());

    let alice_view = state
        .store
        .messages_before(&conversation.conversation_id, "alice", None, None, 50)
        .await
        .unwrap();
    assert_eq!(alice_view.len(), 2);

    // Messages sent after the clear are visible again
    let fresh = state.delivery.send_message(&conversation, "alice", "three", &[]).await.unwrap();
    let bob_view = state
        .store
        .messages_before(
            &conversation.conversation_id,
            "bob",
            cleared.cleared_at_for("bob"),
            None,
            50,
        )
        .await
        .unwrap();
    assert_eq!(bob_view.len(), 1);
    assert_eq!(bob_view[0].message_id, fresh.message_id);
}

#[tokio::test]
async fn test_delete_for_everyone_keeps_row_in_history() {
    let state = test_state().await;
    let conversation = state.store.find_or_create_conversation("alice", "bob").await.unwrap();

    let m1 = state.delivery.send_message(&conversation, "alice", "one", &[]).await.unwrap();
    let m2 = state.delivery.send_message(&conversation, "alice", "two", &[]).await.unwrap();
    let m3 = state.delivery.send_message(&conversation, "alice", "three", &[]).await.unwrap();

    state.store.delete_for_everyone(&m2.message_id).await.unwrap();

    let history = state
        .store
        .messages_before(&conversation.conversation_id, "bob", None, None, 50)
        .await
        .unwrap();
    let ids: Vec<&str> = history.iter().map(|m| m.message_id.as_str()).collect();
    assert_eq!(ids, vec![m1.message_id.as_str(), m2.message_id.as_str(), m3.message_id.as_str()]);

    let tombstone = &history[1];
    assert!(tombstone.deleted);
    assert!(tombstone.body.is_empty());
    assert!(tombstone.attachments.is_empty());
}

#[tokio::test]
async fn test_delete_for_me_hides_only_for_that_user() {
    let state = test_state().await;
    let conversation = state.store.find_or_create_conversation("alice", "bob").await.unwrap();

    let message = state.delivery.send_message(&conversation, "alice", "hey", &[]).await.unwrap();
    state.store.delete_for_user(&message.message_id, "bob").await.unwrap();

    let bob_view = state
        .store
        .messages_before(&conversation.conversation_id, "bob", None, None, 50)
        .await
        .unwrap();
    assert!(bob_view.is_empty());

    let alice_view = state
        .store
        .messages_before(&conversation.conversation_id, "alice", None, None, 50)
        .await
        .unwrap();
    assert_eq!(alice_view.len(), 1);
}

#[tokio::test]
async fn test_history_pagination_before_cursor() {
    let state = test_state().await;
    let conversation = state.store.find_or_create_conversation("alice", "bob").await.unwrap();

    let mut ids = Vec::new();
    for i in 0..5 {
        let message = state
            .delivery
            .send_message(&conversation, "alice", &format!("msg {}", i), &[])
            .await
            .unwrap();
        ids.push(message.message_id);
    }

    // Latest page
    let page = state
        .store
        .messages_before(&conversation.conversation_id, "bob", None, None, 2)
        .await
        .unwrap();
    assert_eq!(
        page.iter().map(|m| m.message_id.as_str()).collect::<Vec<_>>(),
        vec![ids[3].as_str(), ids[4].as_str()]
    );

    // Page before the cursor
    let page = state
        .store
        .messages_before(&conversation.conversation_id, "bob", None, Some(&ids[3]), 2)
        .await
        .unwrap();
    assert_eq!(
        page.iter().map(|m| m.message_id.as_str()).collect::<Vec<_>>(),
        vec![ids[1].as_str(), ids[2].as_str()]
    );
}

#[tokio::test]
async fn test_edit_message_updates_body_and_stamp() {
    let state = test_state().await;
    let conversation = state.store.find_or_create_conversation("alice", "bob").await.unwrap();

    let message = state.delivery.send_message(&conversation, "alice", "helo", &[]).await.unwrap();
    assert!(message.edited_at.is_none());

    state
        .store
        .edit_message(&message.message_id, "hello", chrono::Utc::now())
        .await
        .unwrap();

    let edited = state.store.find_message(&message.message_id).await.unwrap().unwrap();
    assert_eq!(edited.body, "hello");
    assert!(edited.edited_at.is_some());
}
