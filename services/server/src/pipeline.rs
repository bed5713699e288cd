//! Envelope dispatch.
//!
//! The read loop hands every decoded envelope here.  Replies and errors
//! echo the request's `cid`; handler failures never tear the session down
//! directly (queue overflow inside `send` does that on its own).

use crate::error::{ServerError, ServerResult};
use crate::router::MessageRouter;
use crate::session::{Session, WireSink};
use crate::status::StatusRegistry;
use crate::tracker::{PresenceMeta, PresenceReason, PresenceStream, Tracker};
use arena_protocol::{
    Ack, Channel, ChannelJoin, ChannelLeave, ChannelMessage, ChannelMessageSend, Envelope,
    ErrorMessage, Message, Status, StatusFollow, StatusUnfollow, StatusUpdate, UserPresence,
    stream_mode,
};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, Instrument};
use uuid::Uuid;

const MAX_CHANNEL_TARGET_LEN: usize = 64;
const MAX_MESSAGE_CONTENT_BYTES: usize = 4096;
const MAX_STATUS_BYTES: usize = 2048;

pub struct Pipeline {
    tracker: Arc<Tracker>,
    status: Arc<StatusRegistry>,
    router: Arc<MessageRouter>,
}

impl Pipeline {
    pub fn new(
        tracker: Arc<Tracker>,
        status: Arc<StatusRegistry>,
        router: Arc<MessageRouter>,
    ) -> Self {
        Self {
            tracker,
            status,
            router,
        }
    }

    pub async fn process<S: WireSink>(&self, session: &Arc<Session<S>>, envelope: Envelope) {
        let cid = envelope.cid;
        let span = tracing::debug_span!(
            "request",
            session_id = %session.id(),
            cid = cid.as_deref().unwrap_or("")
        );
        let outcome = self
            .handle(session, envelope.message)
            .instrument(span)
            .await;
        match outcome {
            Ok(Some(reply)) => {
                let _ = session.send(&Envelope::with_cid(cid, reply), true);
            }
            Ok(None) => {}
            Err(err) => {
                match &err {
                    ServerError::Db(_) | ServerError::Internal(_) => {
                        error!(session_id = %session.id(), error = %err, "handler failed");
                    }
                    _ => debug!(session_id = %session.id(), error = %err, "request rejected"),
                }
                let reply = Message::Error(ErrorMessage {
                    code: err.code().to_owned(),
                    message: err.client_message(),
                });
                let _ = session.send(&Envelope::with_cid(cid, reply), true);
            }
        }
    }

    async fn handle<S: WireSink>(
        &self,
        session: &Arc<Session<S>>,
        message: Message,
    ) -> ServerResult<Option<Message>> {
        match message {
            Message::ChannelJoin(request) => self.channel_join(session, request),
            Message::ChannelLeave(request) => self.channel_leave(session, &request),
            Message::ChannelMessageSend(request) => self.channel_message_send(session, request),
            Message::StatusFollow(request) => self.status_follow(session, request),
            Message::StatusUnfollow(request) => {
                self.status.unfollow(session.id(), &request.user_ids);
                Ok(Some(Message::Ack(Ack {})))
            }
            Message::StatusUpdate(request) => self.status_update(session, request),
            other => {
                debug!(?other, "unexpected message kind from client");
                Err(ServerError::invalid_input("unexpected message kind"))
            }
        }
    }

    fn channel_join<S: WireSink>(
        &self,
        session: &Arc<Session<S>>,
        request: ChannelJoin,
    ) -> ServerResult<Option<Message>> {
        let target = request.target.trim();
        if target.is_empty() || target.len() > MAX_CHANNEL_TARGET_LEN {
            return Err(ServerError::invalid_input(
                "channel target must be 1-64 characters",
            ));
        }
        if !target
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(ServerError::invalid_input(
                "channel target has invalid characters",
            ));
        }

        let stream = PresenceStream::chat(target);
        let meta = PresenceMeta {
            hidden: request.hidden,
            persistence: request.persistence,
            username: session.name(),
            status: String::new(),
            reason: PresenceReason::Join,
        };
        let (ok, _newly_tracked) =
            self.tracker
                .track(session.id(), stream.clone(), session.user(), meta);
        if !ok {
            return Err(ServerError::internal("presence could not be tracked"));
        }

        let presences: Vec<UserPresence> = self
            .tracker
            .list_by_stream(&stream, false, true)
            .iter()
            .filter(|p| p.session_id != session.id())
            .map(super::tracker::Presence::to_wire)
            .collect();
        let self_presence = UserPresence {
            user_id: session.user(),
            session_id: session.id(),
            username: session.name(),
            status: None,
        };
        Ok(Some(Message::Channel(Channel {
            channel: stream.to_wire(),
            presences,
            self_presence,
        })))
    }

    fn channel_leave<S: WireSink>(
        &self,
        session: &Arc<Session<S>>,
        request: &ChannelLeave,
    ) -> ServerResult<Option<Message>> {
        let stream = PresenceStream::from_wire(&request.channel);
        if !stream_mode::is_unreliable(stream.mode) {
            return Err(ServerError::invalid_input("not a chat channel"));
        }
        self.tracker
            .untrack(session.id(), &stream, session.user(), PresenceReason::Leave);
        Ok(Some(Message::Ack(Ack {})))
    }

    fn channel_message_send<S: WireSink>(
        &self,
        session: &Arc<Session<S>>,
        request: ChannelMessageSend,
    ) -> ServerResult<Option<Message>> {
        let stream = PresenceStream::from_wire(&request.channel);
        if !stream_mode::is_unreliable(stream.mode) {
            return Err(ServerError::invalid_input("not a chat channel"));
        }
        if self
            .tracker
            .get_local_by_session_stream_user(session.id(), &stream, session.user())
            .is_none()
        {
            return Err(ServerError::PermissionDenied(
                "must join the channel before sending messages".to_owned(),
            ));
        }
        if request.content.len() > MAX_MESSAGE_CONTENT_BYTES {
            return Err(ServerError::invalid_input("message content too long"));
        }
        let parsed: serde_json::Value = serde_json::from_str(&request.content)
            .map_err(|_| ServerError::invalid_input("message content must be a JSON object"))?;
        if !parsed.is_object() {
            return Err(ServerError::invalid_input(
                "message content must be a JSON object",
            ));
        }

        let message = ChannelMessage {
            channel: stream.to_wire(),
            message_id: Uuid::new_v4(),
            sender_id: session.user(),
            username: session.name(),
            content: request.content,
            created_at: Utc::now(),
        };
        // Chat-family streams are delivered unreliably: recipients above
        // the priority threshold miss the message instead of dying.
        let reliable = !stream_mode::is_unreliable(stream.mode);
        self.router.send_to_stream(
            &stream,
            &Envelope::new(Message::ChannelMessage(message)),
            reliable,
        );
        Ok(Some(Message::Ack(Ack {})))
    }

    fn status_follow<S: WireSink>(
        &self,
        session: &Arc<Session<S>>,
        request: StatusFollow,
    ) -> ServerResult<Option<Message>> {
        let unique: HashSet<Uuid> = request.user_ids.into_iter().collect();
        let user_ids: Vec<Uuid> = unique.into_iter().collect();
        self.status.follow(session.id(), &user_ids);

        let mut presences = Vec::new();
        for user_id in &user_ids {
            let stream = PresenceStream::status(*user_id);
            presences.extend(
                self.tracker
                    .list_by_stream(&stream, false, true)
                    .iter()
                    .map(super::tracker::Presence::to_wire),
            );
        }
        Ok(Some(Message::Status(Status { presences })))
    }

    fn status_update<S: WireSink>(
        &self,
        session: &Arc<Session<S>>,
        request: StatusUpdate,
    ) -> ServerResult<Option<Message>> {
        if request.status.len() > MAX_STATUS_BYTES {
            return Err(ServerError::invalid_input("status too long"));
        }
        let stream = PresenceStream::status(session.user());
        let meta = PresenceMeta {
            hidden: false,
            persistence: false,
            username: session.name(),
            status: request.status,
            reason: PresenceReason::Update,
        };
        if !self
            .tracker
            .update(session.id(), &stream, session.user(), meta.clone())
        {
            // The status presence is established at connect time; re-track
            // covers a session whose presence was force-removed.
            let (_, _) = self
                .tracker
                .track(session.id(), stream, session.user(), meta);
        }
        Ok(Some(Message::Ack(Ack {})))
    }
}
