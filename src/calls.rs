//! Call signaling for the Pulse real-time core
//!
//! One ephemeral session per conversation: Ringing until answered, declined,
//! ended, timed out, or a party disconnects. Every terminal transition writes
//! exactly one call-log message into the conversation history. The session
//! table holds the mutation points; `CallSignaling` executes the side effects
//! (log writes, pushes, notifications, timers) around them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::*;
use crate::notify::Notifier;
use crate::presence::PresenceRegistry;
use crate::store::Store;

/// Ephemeral per-conversation call state. Never persisted; a process restart
/// drops every live call.
#[derive(Clone)]
pub struct CallSession {
    pub session_id: String,
    pub caller: String,
    pub callee: String,
    pub media: CallMedia,
    pub accepted: bool,
    pub started_at: Option<DateTime<Utc>>,
    timer: Option<AbortHandle>,
}

impl CallSession {
    fn new(caller: &str, callee: &str, media: CallMedia) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            caller: caller.to_string(),
            callee: callee.to_string(),
            media,
            accepted: false,
            started_at: None,
            timer: None,
        }
    }

    pub fn involves(&self, user_id: &str) -> bool {
        self.caller == user_id || self.callee == user_id
    }

    fn other_party(&self, user_id: &str) -> &str {
        if self.caller == user_id {
            &self.callee
        } else {
            &self.caller
        }
    }

    fn cancel_timer(&self) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
    }
}

/// In-memory session table keyed by conversation id. Each transition is a
/// single atomic map operation; the ring timer carries the session id it was
/// armed for and is ignored if the slot has since been replaced or emptied.
pub struct CallSessionTable {
    sessions: DashMap<String, CallSession>,
}

impl CallSessionTable {
    pub fn new() -> Self {
        Self { sessions: DashMap::new() }
    }

    /// Install a new ringing session, superseding any existing one for the
    /// conversation (its timer is cancelled).
    fn install(&self, conversation_id: &str, session: CallSession) {
        if let Some(old) = self.sessions.insert(conversation_id.to_string(), session) {
            old.cancel_timer();
        }
    }

    /// Attach the ring timer to the session it was spawned for. If the slot
    /// was replaced or emptied in the meantime, the timer is aborted instead.
    fn arm_timer(&self, conversation_id: &str, session_id: &str, handle: AbortHandle) {
        if let Some(mut session) = self.sessions.get_mut(conversation_id) {
            if session.session_id == session_id {
                session.timer = Some(handle);
                return;
            }
        }
        handle.abort();
    }

    /// Ringing -> Accepted, valid only for the callee of a ringing session.
    fn accept(&self, conversation_id: &str, callee: &str, now: DateTime<Utc>) -> Option<CallSession> {
        let mut session = self.sessions.get_mut(conversation_id)?;
        if session.accepted || session.callee != callee {
            return None;
        }
        if let Some(timer) = session.timer.take() {
            timer.abort();
        }
        session.accepted = true;
        session.started_at = Some(now);
        Some(session.clone())
    }

    /// Remove a ringing session on behalf of its callee (decline path).
    fn take_ringing(&self, conversation_id: &str, callee: &str) -> Option<CallSession> {
        self.sessions
            .remove_if(conversation_id, |_, s| !s.accepted && s.callee == callee)
            .map(|(_, session)| {
                session.cancel_timer();
                session
            })
    }

    /// Remove a session whose ring timer just fired. The session id guard
    /// makes a stale timer (session already replaced or gone) a no-op.
    fn take_expired(&self, conversation_id: &str, session_id: &str) -> Option<CallSession> {
        self.sessions
            .remove_if(conversation_id, |_, s| !s.accepted && s.session_id == session_id)
            .map(|(_, session)| {
                session.cancel_timer();
                session
            })
    }

    /// Remove a session on behalf of either party (end path).
    fn take_for_party(&self, conversation_id: &str, user_id: &str) -> Option<CallSession> {
        self.sessions
            .remove_if(conversation_id, |_, s| s.involves(user_id))
            .map(|(_, session)| {
                session.cancel_timer();
                session
            })
    }

    /// Remove every session a user is a party of (disconnect cleanup).
    fn take_all_for_user(&self, user_id: &str) -> Vec<(String, CallSession)> {
        let conversation_ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().involves(user_id))
            .map(|entry| entry.key().clone())
            .collect();

        conversation_ids
            .into_iter()
            .filter_map(|conversation_id| {
                self.sessions
                    .remove_if(&conversation_id, |_, s| s.involves(user_id))
                    .map(|(id, session)| {
                        session.cancel_timer();
                        (id, session)
                    })
            })
            .collect()
    }

    pub fn get(&self, conversation_id: &str) -> Option<CallSession> {
        self.sessions.get(conversation_id).map(|s| s.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for CallSessionTable {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CallSignaling {
    table: CallSessionTable,
    store: Arc<Store>,
    presence: Arc<PresenceRegistry>,
    notifier: Arc<Notifier>,
    ring_timeout: Duration,
}

impl CallSignaling {
    pub fn new(
        store: Arc<Store>,
        presence: Arc<PresenceRegistry>,
        notifier: Arc<Notifier>,
        ring_timeout: Duration,
    ) -> Self {
        Self {
            table: CallSessionTable::new(),
            store,
            presence,
            notifier,
            ring_timeout,
        }
    }

    pub fn sessions(&self) -> &CallSessionTable {
        &self.table
    }

    /// Start ringing the other participant. An in-flight session for the same
    /// conversation is superseded.
    pub async fn invite(
        self: &Arc<Self>,
        caller: &str,
        conversation_id: &str,
        media: CallMedia,
    ) -> Result<()> {
        let conversation = self
            .store
            .find_conversation(conversation_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("conversation {}", conversation_id)))?;
        if !conversation.is_participant(caller) {
            return Err(AppError::NotParticipant);
        }

        let callee = conversation.other_participant(caller).to_string();
        let session = CallSession::new(caller, &callee, media);
        let session_id = session.session_id.clone();
        self.table.install(conversation_id, session);

        let this = Arc::clone(self);
        let conversation_for_timer = conversation_id.to_string();
        let session_for_timer = session_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(this.ring_timeout).await;
            this.on_ring_timeout(&conversation_for_timer, &session_for_timer).await;
        });
        self.table.arm_timer(conversation_id, &session_id, timer.abort_handle());

        self.presence.send_to_user(
            &callee,
            &ServerEvent::CallInvite {
                conversation_id: conversation_id.to_string(),
                from: caller.to_string(),
                media,
            },
        );

        tracing::info!("Call invite: {} -> {} on {}", caller, callee, conversation_id);
        Ok(())
    }

    /// Accept or decline a ringing call. Answering a conversation with no
    /// live session is a silent no-op; races with disconnect cleanup are
    /// expected.
    pub async fn answer(&self, user_id: &str, conversation_id: &str, accept: bool) {
        if accept {
            let Some(session) = self.table.accept(conversation_id, user_id, Utc::now()) else {
                return;
            };
            self.presence.send_to_user(
                &session.caller,
                &ServerEvent::CallAnswer {
                    conversation_id: conversation_id.to_string(),
                    from: user_id.to_string(),
                    accept: true,
                },
            );
            tracing::info!("Call accepted on {}", conversation_id);
        } else {
            let Some(session) = self.table.take_ringing(conversation_id, user_id) else {
                return;
            };
            self.write_call_log(conversation_id, &session, CallOutcome::Declined).await;
            self.presence.send_to_user(
                &session.caller,
                &ServerEvent::CallAnswer {
                    conversation_id: conversation_id.to_string(),
                    from: user_id.to_string(),
                    accept: false,
                },
            );
            self.emit_call_end(conversation_id, &session.caller, &session.callee);
            self.notifier
                .notify(
                    &session.caller,
                    &session.callee,
                    "call_declined",
                    "declined your call",
                    Some(&format!("/messages/{}", conversation_id)),
                )
                .await;
            tracing::info!("Call declined on {}", conversation_id);
        }
    }

    /// Hang up from either side, from Ringing or Accepted. No live session is
    /// a silent no-op.
    pub async fn end(&self, user_id: &str, conversation_id: &str) {
        let Some(session) = self.table.take_for_party(conversation_id, user_id) else {
            return;
        };

        let outcome = if session.accepted { CallOutcome::Ended } else { CallOutcome::Missed };
        self.write_call_log(conversation_id, &session, outcome).await;
        self.presence.send_to_user(
            session.other_party(user_id),
            &ServerEvent::CallEnd {
                conversation_id: conversation_id.to_string(),
            },
        );
        tracing::info!("Call ended on {} ({:?})", conversation_id, outcome);
    }

    /// Disconnection of either party tears the session down like `end`,
    /// notifying whoever is still there.
    pub async fn handle_disconnect(&self, user_id: &str) {
        for (conversation_id, session) in self.table.take_all_for_user(user_id) {
            let outcome = if session.accepted { CallOutcome::Ended } else { CallOutcome::Missed };
            self.write_call_log(&conversation_id, &session, outcome).await;
            self.presence.send_to_user(
                session.other_party(user_id),
                &ServerEvent::CallEnd {
                    conversation_id: conversation_id.clone(),
                },
            );
            tracing::info!("Call torn down on {} after disconnect of {}", conversation_id, user_id);
        }
    }

    /// Opaque signaling relay (SDP offers/answers, ICE candidates). Not a
    /// state transition; forwarded to the other participant unmodified.
    pub async fn relay_signal(
        &self,
        user_id: &str,
        conversation_id: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let conversation = self
            .store
            .find_conversation(conversation_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("conversation {}", conversation_id)))?;
        if !conversation.is_participant(user_id) {
            return Err(AppError::NotParticipant);
        }

        self.presence.send_to_user(
            conversation.other_participant(user_id),
            &ServerEvent::CallSignal {
                conversation_id: conversation_id.to_string(),
                from: user_id.to_string(),
                payload,
            },
        );
        Ok(())
    }

    async fn on_ring_timeout(&self, conversation_id: &str, session_id: &str) {
        let Some(session) = self.table.take_expired(conversation_id, session_id) else {
            return;
        };

        self.write_call_log(conversation_id, &session, CallOutcome::Missed).await;
        self.emit_call_end(conversation_id, &session.caller, &session.callee);
        self.notifier
            .notify(
                &session.callee,
                &session.caller,
                "call_missed",
                "you missed a call",
                Some(&format!("/messages/{}", conversation_id)),
            )
            .await;
        tracing::info!("Call ring timeout on {}", conversation_id);
    }

    fn emit_call_end(&self, conversation_id: &str, caller: &str, callee: &str) {
        let event = ServerEvent::CallEnd {
            conversation_id: conversation_id.to_string(),
        };
        self.presence.send_to_user(caller, &event);
        self.presence.send_to_user(callee, &event);
    }

    /// Write the call-log message for a terminal transition and refresh the
    /// conversation for both participants. Failures are logged; there is no
    /// caller to surface them to from a timer or disconnect path.
    async fn write_call_log(&self, conversation_id: &str, session: &CallSession, outcome: CallOutcome) {
        let ended_at = Utc::now();
        let duration_secs = match (outcome, session.started_at) {
            (CallOutcome::Ended, Some(started_at)) => (ended_at - started_at).num_seconds().max(0),
            _ => 0,
        };
        let call_info = CallInfo {
            media: session.media,
            outcome,
            initiated_by: session.caller.clone(),
            received_by: session.callee.clone(),
            started_at: session.started_at,
            ended_at,
            duration_secs,
        };

        let message = match self
            .store
            .create_message(
                conversation_id,
                &session.caller,
                "",
                &[],
                MessageKind::Call,
                Some(&call_info),
                &[],
                &[],
            )
            .await
        {
            Ok(message) => message,
            Err(e) => {
                tracing::error!("Failed to write call log for {}: {}", conversation_id, e);
                return;
            }
        };

        if let Err(e) = self
            .store
            .touch_last_message(conversation_id, &message.message_id, message.created_at)
            .await
        {
            tracing::warn!("Failed to touch conversation {}: {}", conversation_id, e);
        }

        let event = ServerEvent::ConversationUpdated {
            conversation_id: conversation_id.to_string(),
        };
        self.presence.send_to_user(&session.caller, &event);
        self.presence.send_to_user(&session.callee, &event);
    }
}
