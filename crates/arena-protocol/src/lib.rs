// arena-protocol: realtime wire envelope types and serialization.
//
// All WebSocket messages use a top-level `kind` field for discriminated
// deserialization.  A session negotiates text or binary framing at connect
// time; both framings carry the same JSON encoding of these types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

/// Stream mode discriminants.
///
/// A stream is an abstract fan-out channel; the mode decides both routing
/// behavior (chat-family modes are delivered unreliably under backpressure)
/// and which registry reacts to presence changes on it.
pub mod stream_mode {
    pub const NOTIFICATIONS: u8 = 0;
    pub const STATUS: u8 = 1;
    pub const CHAT_CHANNEL: u8 = 2;
    pub const GROUP: u8 = 3;
    pub const DIRECT_MESSAGE: u8 = 4;
    pub const MATCH_AUTHORITATIVE: u8 = 5;
    pub const MATCH_RELAYED: u8 = 6;
    pub const PARTY: u8 = 7;

    /// Modes whose routed messages may be dropped when a recipient's
    /// outgoing queue is above the priority threshold.
    pub fn is_unreliable(mode: u8) -> bool {
        matches!(mode, CHAT_CHANNEL | GROUP | DIRECT_MESSAGE)
    }
}

/// Wire form of a stream identity.
///
/// `subject` and `subcontext` are omitted when zero; `label` when empty.
/// Streams are implicit — they exist whenever at least one presence
/// references them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId {
    pub mode: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subcontext: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

// ---------------------------------------------------------------------------
// Presences
// ---------------------------------------------------------------------------

/// One user session bound to a stream, as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPresence {
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub username: String,
    /// Status string for status-stream presences; absent elsewhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Presence change on a non-status stream, delivered to remaining members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPresenceEvent {
    pub stream: StreamId,
    #[serde(default)]
    pub joins: Vec<UserPresence>,
    #[serde(default)]
    pub leaves: Vec<UserPresence>,
}

/// Online-status change for followed users, delivered to follower sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPresenceEvent {
    #[serde(default)]
    pub joins: Vec<UserPresence>,
    #[serde(default)]
    pub leaves: Vec<UserPresence>,
}

// ---------------------------------------------------------------------------
// Client -> Server messages
// ---------------------------------------------------------------------------

/// Join (or re-join) a chat channel.  The server resolves `target` to a
/// chat stream; re-joining with identical settings is an update and emits
/// no presence event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelJoin {
    /// Room name; 1-64 characters.
    pub target: String,
    #[serde(default)]
    pub persistence: bool,
    /// Hidden members are excluded from listings and presence events but
    /// still receive routed messages.
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLeave {
    pub channel: StreamId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessageSend {
    pub channel: StreamId,
    /// JSON object, at most 4096 bytes encoded.
    pub content: String,
}

/// Follow a set of users for online-status updates.  Idempotent per
/// (session, user) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFollow {
    pub user_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUnfollow {
    pub user_ids: Vec<Uuid>,
}

/// Replace this session's own status string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: String,
}

// ---------------------------------------------------------------------------
// Server -> Client messages
// ---------------------------------------------------------------------------

/// Reply to a successful `channel_join`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub channel: StreamId,
    /// Visible members at join time, excluding the joiner.
    #[serde(default)]
    pub presences: Vec<UserPresence>,
    /// The joiner's own presence.
    pub self_presence: UserPresence,
}

/// A chat message routed to every member of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub channel: StreamId,
    pub message_id: Uuid,
    pub sender_id: Uuid,
    pub username: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Reply to `status_follow`: the currently-online presences among the
/// followed users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    #[serde(default)]
    pub presences: Vec<UserPresence>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: String,
    pub message: String,
}

/// Bare acknowledgement for requests with no payload in the reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Discriminated message union.  The `kind` tag is the wire name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    // client -> server
    ChannelJoin(ChannelJoin),
    ChannelLeave(ChannelLeave),
    ChannelMessageSend(ChannelMessageSend),
    StatusFollow(StatusFollow),
    StatusUnfollow(StatusUnfollow),
    StatusUpdate(StatusUpdate),
    // server -> client
    Channel(Channel),
    ChannelMessage(ChannelMessage),
    StreamPresenceEvent(StreamPresenceEvent),
    StatusPresenceEvent(StatusPresenceEvent),
    Status(Status),
    Error(ErrorMessage),
    Ack(Ack),
}

/// Top-level wire message.
///
/// `cid` is an opaque correlation id: requests may carry one, and the reply
/// (or error) for that request echoes it.  Server-initiated envelopes carry
/// none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    pub fn new(message: Message) -> Self {
        Self { cid: None, message }
    }

    pub fn with_cid(cid: Option<String>, message: Message) -> Self {
        Self { cid, message }
    }
}

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// Wire error codes shared by the WS `error` envelope and HTTP error
/// responses.
pub mod error_codes {
    pub const INVALID_INPUT: &str = "INVALID_INPUT";
    pub const UNAUTHENTICATED: &str = "UNAUTHENTICATED";
    pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const FAILED_PRECONDITION: &str = "FAILED_PRECONDITION";
    pub const ALREADY_EXISTS: &str = "ALREADY_EXISTS";
    pub const RESOURCE_EXHAUSTED: &str = "RESOURCE_EXHAUSTED";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
    pub const INTERNAL: &str = "INTERNAL";
}

// ---------------------------------------------------------------------------
// HTTP DTOs
// ---------------------------------------------------------------------------

/// Body for the authenticate endpoints.  Exactly one identifier field is
/// consulted per endpoint; the others are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Requested username; server-generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Create the account when it does not exist.  Defaults to true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<bool>,
    /// Opaque vars copied into the session token claims.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vars: Option<std::collections::HashMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub token: String,
    pub created: bool,
}

/// Own-account view returned by the account endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub user_id: Uuid,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_id: Option<String>,
    #[serde(default)]
    pub device_ids: Vec<String>,
    pub online: bool,
}

/// Error envelope for HTTP endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpErrorEnvelope {
    pub code: String,
    pub message: String,
}

/// Body for a leaderboard record write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordWrite {
    pub score: i64,
    #[serde(default)]
    pub subscore: i64,
}

/// One leaderboard record in a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEntry {
    pub owner_id: Uuid,
    pub username: Option<String>,
    pub score: i64,
    pub subscore: i64,
    pub num_score: i64,
    /// 1-based rank; 0 when ranks are unavailable for this leaderboard.
    pub rank: i64,
}

/// Paged leaderboard record listing.  `cursor` is an opaque base64 blob;
/// clients must round-trip it untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordList {
    pub records: Vec<RecordEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_kind_tag_and_cid() {
        let env = Envelope::with_cid(
            Some("42".to_owned()),
            Message::StatusFollow(StatusFollow {
                user_ids: vec![Uuid::nil()],
            }),
        );
        let json = serde_json::to_string(&env).expect("serialize envelope");
        let value: serde_json::Value = serde_json::from_str(&json).expect("parse envelope json");
        assert_eq!(value["kind"], "status_follow");
        assert_eq!(value["cid"], "42");

        let back: Envelope = serde_json::from_str(&json).expect("deserialize envelope");
        assert_eq!(back, env);
    }

    #[test]
    fn envelope_without_cid_omits_the_field() {
        let env = Envelope::new(Message::Ack(Ack {}));
        let json = serde_json::to_string(&env).expect("serialize envelope");
        assert!(!json.contains("cid"), "cid must be omitted, got {json}");
    }

    #[test]
    fn stream_id_omits_zero_components() {
        let stream = StreamId {
            mode: stream_mode::CHAT_CHANNEL,
            subject: None,
            subcontext: None,
            label: Some("general".to_owned()),
        };
        let json = serde_json::to_string(&stream).expect("serialize stream");
        assert!(!json.contains("subject"));
        assert!(!json.contains("subcontext"));
        let back: StreamId = serde_json::from_str(&json).expect("deserialize stream");
        assert_eq!(back, stream);
    }

    #[test]
    fn unreliable_modes_are_the_chat_family() {
        assert!(stream_mode::is_unreliable(stream_mode::CHAT_CHANNEL));
        assert!(stream_mode::is_unreliable(stream_mode::GROUP));
        assert!(stream_mode::is_unreliable(stream_mode::DIRECT_MESSAGE));
        assert!(!stream_mode::is_unreliable(stream_mode::STATUS));
        assert!(!stream_mode::is_unreliable(stream_mode::MATCH_RELAYED));
    }

    #[test]
    fn unknown_kind_fails_deserialization() {
        let err = serde_json::from_str::<Envelope>(r#"{"kind":"bogus"}"#);
        assert!(err.is_err());
    }
}
