//! Notification fanout
//!
//! Creates the durable notification record first, then pushes it over the
//! live channel if the recipient is connected. Failures here must never fail
//! the primary action, so everything is logged and swallowed.

use std::sync::Arc;

use crate::models::ServerEvent;
use crate::presence::PresenceRegistry;
use crate::store::Store;

pub struct Notifier {
    store: Arc<Store>,
    presence: Arc<PresenceRegistry>,
}

impl Notifier {
    pub fn new(store: Arc<Store>, presence: Arc<PresenceRegistry>) -> Self {
        Self { store, presence }
    }

    pub async fn notify(
        &self,
        user_id: &str,
        actor_id: &str,
        kind: &str,
        body: &str,
        link: Option<&str>,
    ) {
        match self.store.create_notification(user_id, actor_id, kind, body, link).await {
            Ok(notification) => {
                self.presence
                    .send_to_user(user_id, &ServerEvent::Notification(notification));
            }
            Err(e) => {
                tracing::warn!("Notification creation failed for user {}: {}", user_id, e);
            }
        }
    }
}
