//! Pulse real-time core
//!
//! The messaging, presence and call-signaling engine behind the Pulse social
//! app. This service owns:
//! - Presence tracking for live connections
//! - Conversation/message persistence with delivery and read receipts
//! - Recipient classification on send (viewing / online / offline)
//! - Notification fanout for recipients not actively viewing
//! - Ephemeral call signaling with ring timeout and call-log entries
//!
//! Authentication, profiles, feeds and uploads live in collaborating
//! services; this core trusts the identity the gateway hands it.

pub mod calls;
pub mod config;
pub mod delivery;
pub mod error;
pub mod handlers;
pub mod models;
pub mod notify;
pub mod presence;
pub mod rooms;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use crate::calls::CallSignaling;
use crate::config::Config;
use crate::delivery::DeliveryEngine;
use crate::notify::Notifier;
use crate::presence::PresenceRegistry;
use crate::rooms::RoomMembership;
use crate::store::Store;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub presence: Arc<PresenceRegistry>,
    pub rooms: Arc<RoomMembership>,
    pub delivery: Arc<DeliveryEngine>,
    pub calls: Arc<CallSignaling>,
}

impl AppState {
    /// Wire up the in-memory tables and engines around a store. Each table is
    /// owned here and passed by reference to the handlers that need it, so
    /// tests can stand up a fresh instance per case.
    pub fn new(config: Arc<Config>, store: Arc<Store>) -> Self {
        let presence = Arc::new(PresenceRegistry::new());
        let rooms = Arc::new(RoomMembership::new());
        let notifier = Arc::new(Notifier::new(Arc::clone(&store), Arc::clone(&presence)));
        let delivery = Arc::new(DeliveryEngine::new(
            Arc::clone(&store),
            Arc::clone(&presence),
            Arc::clone(&rooms),
            Arc::clone(&notifier),
            &config.delivery,
        ));
        let calls = Arc::new(CallSignaling::new(
            Arc::clone(&store),
            Arc::clone(&presence),
            Arc::clone(&notifier),
            Duration::from_secs(config.call.ring_timeout_seconds),
        ));

        Self {
            config,
            store,
            presence,
            rooms,
            delivery,
            calls,
        }
    }
}
