use std::sync::Arc;
use std::time::Duration;
use pulse_rtm::calls::CallSignaling;
use pulse_rtm::models::*;
use pulse_rtm::notify::Notifier;
use pulse_rtm::presence::PresenceRegistry;
use pulse_rtm::store::Store;

#[tokio::test]
async fn scratch_repro() {
    let store = Arc::new(Store::in_memory().await.unwrap());
    let presence = Arc::new(PresenceRegistry::new());
    let notifier = Arc::new(Notifier::new(Arc::clone(&store), Arc::clone(&presence)));
    let signaling = Arc::new(CallSignaling::new(
        Arc::clone(&store),
        Arc::clone(&presence),
        notifier,
        Duration::from_millis(50),
    ));
    let conv = store.find_or_create_conversation("alice", "bob").await.unwrap();
    let cid = conv.conversation_id.clone();

    signaling.invite("alice", &cid, CallMedia::Video).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let msgs = store.messages_before(&cid, "alice", None, None, 50).await.unwrap();
    eprintln!("logs={}", msgs.iter().filter(|m| m.kind == MessageKind::Call).count());
    assert_eq!(msgs.iter().filter(|m| m.kind == MessageKind::Call).count(), 1);
}
