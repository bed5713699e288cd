//! Presence tracker.
//!
//! Authoritative in-memory map of `(stream, user, session)` triples.  The
//! stream-keyed side is striped by stream hash so listings on one stream do
//! not contend with writes on another; a separate session index supports
//! `untrack_all` on session cleanup.
//!
//! Every join/leave feeds the status registry's online index.  Status-stream
//! events additionally notify followers; non-status streams fan the event
//! out to the stream's remaining members.

use crate::session_registry::SessionRegistry;
use crate::status::{StatusEvent, StatusRegistry};
use arena_protocol::{
    Envelope, Message, StreamId, StreamPresenceEvent, UserPresence, stream_mode,
};
use std::collections::{HashMap, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

const STRIPE_COUNT: usize = 32;

/// Internal stream identity.  Zero uuids are the "absent" sentinel; the
/// wire form omits them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PresenceStream {
    pub mode: u8,
    pub subject: Uuid,
    pub subcontext: Uuid,
    pub label: String,
}

impl PresenceStream {
    pub fn status(user_id: Uuid) -> Self {
        Self {
            mode: stream_mode::STATUS,
            subject: user_id,
            subcontext: Uuid::nil(),
            label: String::new(),
        }
    }

    pub fn chat(label: impl Into<String>) -> Self {
        Self {
            mode: stream_mode::CHAT_CHANNEL,
            subject: Uuid::nil(),
            subcontext: Uuid::nil(),
            label: label.into(),
        }
    }

    pub fn to_wire(&self) -> StreamId {
        StreamId {
            mode: self.mode,
            subject: (!self.subject.is_nil()).then_some(self.subject),
            subcontext: (!self.subcontext.is_nil()).then_some(self.subcontext),
            label: (!self.label.is_empty()).then(|| self.label.clone()),
        }
    }

    pub fn from_wire(wire: &StreamId) -> Self {
        Self {
            mode: wire.mode,
            subject: wire.subject.unwrap_or_default(),
            subcontext: wire.subcontext.unwrap_or_default(),
            label: wire.label.clone().unwrap_or_default(),
        }
    }
}

/// Why a presence left (or re-joined) a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceReason {
    Join,
    Update,
    Leave,
    Disconnect,
    Kick,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceMeta {
    pub hidden: bool,
    pub persistence: bool,
    pub username: String,
    pub status: String,
    pub reason: PresenceReason,
}

impl PresenceMeta {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            hidden: false,
            persistence: false,
            username: username.into(),
            status: String::new(),
            reason: PresenceReason::Join,
        }
    }

    /// Equality for re-join detection.  `reason` only has meaning on leave,
    /// so it is excluded here.
    fn same(&self, other: &Self) -> bool {
        self.hidden == other.hidden
            && self.persistence == other.persistence
            && self.username == other.username
            && self.status == other.status
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    pub stream: PresenceStream,
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub meta: PresenceMeta,
}

impl Presence {
    pub fn to_wire(&self) -> UserPresence {
        UserPresence {
            user_id: self.user_id,
            session_id: self.session_id,
            username: self.meta.username.clone(),
            status: (self.stream.mode == stream_mode::STATUS)
                .then(|| self.meta.status.clone()),
        }
    }
}

type PresenceKey = (Uuid, Uuid); // (session_id, user_id)

#[derive(Default)]
struct Stripe {
    streams: HashMap<PresenceStream, HashMap<PresenceKey, PresenceMeta>>,
}

pub struct Tracker {
    stripes: Vec<RwLock<Stripe>>,
    /// session_id -> set of (stream, user_id) the session is tracked on.
    sessions: Mutex<HashMap<Uuid, HashSet<(PresenceStream, Uuid)>>>,
    status: Arc<StatusRegistry>,
    registry: Arc<SessionRegistry>,
}

impl Tracker {
    pub fn new(status: Arc<StatusRegistry>, registry: Arc<SessionRegistry>) -> Self {
        Self {
            stripes: (0..STRIPE_COUNT).map(|_| RwLock::new(Stripe::default())).collect(),
            sessions: Mutex::new(HashMap::new()),
            status,
            registry,
        }
    }

    fn stripe(&self, stream: &PresenceStream) -> &RwLock<Stripe> {
        let mut hasher = DefaultHasher::new();
        stream.hash(&mut hasher);
        #[allow(clippy::cast_possible_truncation)]
        let index = (hasher.finish() as usize) % STRIPE_COUNT;
        &self.stripes[index]
    }

    /// Insert or update a presence.  Returns `(success, newly_tracked)`.
    ///
    /// Re-tracking an existing triple never emits a join: with identical
    /// non-reason meta it only refreshes the stored reason, otherwise it
    /// behaves as [`Tracker::update`].
    pub fn track(
        &self,
        session_id: Uuid,
        stream: PresenceStream,
        user_id: Uuid,
        meta: PresenceMeta,
    ) -> (bool, bool) {
        let key = (session_id, user_id);
        let mut stripe = self.stripe(&stream).write().expect("tracker stripe poisoned");
        let members = stripe.streams.entry(stream.clone()).or_default();

        let previous = members.get(&key).cloned();
        let _ = members.insert(key, meta.clone());
        let newly_tracked = match previous {
            Some(existing) if existing.same(&meta) => false,
            Some(existing) => {
                self.emit_update(&stream, user_id, session_id, &existing, &meta);
                false
            }
            None => {
                self.emit_join(&stripe, &stream, user_id, session_id, &meta);
                true
            }
        };
        drop(stripe);

        let mut sessions = self.sessions.lock().expect("tracker session index poisoned");
        let _ = sessions.entry(session_id).or_default().insert((stream, user_id));
        (true, newly_tracked)
    }

    /// Same-triple meta update.  Emits no join; status-stream updates are
    /// forwarded to the status registry as a leave+join pair so followers
    /// observe the fresh status.
    pub fn update(
        &self,
        session_id: Uuid,
        stream: &PresenceStream,
        user_id: Uuid,
        meta: PresenceMeta,
    ) -> bool {
        let key = (session_id, user_id);
        let mut stripe = self.stripe(stream).write().expect("tracker stripe poisoned");
        let Some(members) = stripe.streams.get_mut(stream) else {
            return false;
        };
        let Some(old) = members.get(&key).cloned() else {
            return false;
        };
        let _ = members.insert(key, meta.clone());
        self.emit_update(stream, user_id, session_id, &old, &meta);
        true
    }

    pub fn untrack(
        &self,
        session_id: Uuid,
        stream: &PresenceStream,
        user_id: Uuid,
        reason: PresenceReason,
    ) {
        let key = (session_id, user_id);
        let mut stripe = self.stripe(stream).write().expect("tracker stripe poisoned");
        let Some(members) = stripe.streams.get_mut(stream) else {
            return;
        };
        let Some(mut meta) = members.remove(&key) else {
            return;
        };
        if members.is_empty() {
            let _ = stripe.streams.remove(stream);
        }
        meta.reason = reason;
        self.emit_leave(&stripe, stream, user_id, session_id, &meta);
        drop(stripe);

        let mut sessions = self.sessions.lock().expect("tracker session index poisoned");
        if let Some(keys) = sessions.get_mut(&session_id) {
            let _ = keys.remove(&(stream.clone(), user_id));
            if keys.is_empty() {
                let _ = sessions.remove(&session_id);
            }
        }
    }

    /// Remove every presence the session holds; called from session cleanup.
    pub fn untrack_all(&self, session_id: Uuid, reason: PresenceReason) {
        let removed = {
            let mut sessions = self.sessions.lock().expect("tracker session index poisoned");
            sessions.remove(&session_id)
        };
        let Some(keys) = removed else { return };
        debug!(%session_id, presences = keys.len(), "untracking all presences");
        for (stream, user_id) in keys {
            let mut stripe = self.stripe(&stream).write().expect("tracker stripe poisoned");
            let Some(members) = stripe.streams.get_mut(&stream) else {
                continue;
            };
            let Some(mut meta) = members.remove(&(session_id, user_id)) else {
                continue;
            };
            if members.is_empty() {
                let _ = stripe.streams.remove(&stream);
            }
            meta.reason = reason;
            self.emit_leave(&stripe, &stream, user_id, session_id, &meta);
        }
    }

    /// Drop an entire stream.  Remaining members have already gone away or
    /// are being force-removed, so no stream fan-out happens; the status
    /// registry still observes every leave for the online index.
    pub fn untrack_by_stream(&self, stream: &PresenceStream) {
        let members = {
            let mut stripe = self.stripe(stream).write().expect("tracker stripe poisoned");
            stripe.streams.remove(stream)
        };
        let Some(members) = members else { return };

        let mut sessions = self.sessions.lock().expect("tracker session index poisoned");
        for ((session_id, user_id), mut meta) in members {
            if let Some(keys) = sessions.get_mut(&session_id) {
                let _ = keys.remove(&(stream.clone(), user_id));
                if keys.is_empty() {
                    let _ = sessions.remove(&session_id);
                }
            }
            meta.reason = PresenceReason::Kick;
            let presence = Presence {
                stream: stream.clone(),
                user_id,
                session_id,
                meta,
            };
            self.status.queue(StatusEvent {
                user_id,
                joins: Vec::new(),
                leaves: vec![presence.to_wire()],
                notify_followers: stream.mode == stream_mode::STATUS,
            });
        }
    }

    pub fn list_by_stream(
        &self,
        stream: &PresenceStream,
        include_hidden: bool,
        include_visible: bool,
    ) -> Vec<Presence> {
        let stripe = self.stripe(stream).read().expect("tracker stripe poisoned");
        let Some(members) = stripe.streams.get(stream) else {
            return Vec::new();
        };
        members
            .iter()
            .filter(|(_, meta)| {
                if meta.hidden { include_hidden } else { include_visible }
            })
            .map(|(&(session_id, user_id), meta)| Presence {
                stream: stream.clone(),
                user_id,
                session_id,
                meta: meta.clone(),
            })
            .collect()
    }

    pub fn get_local_by_session_stream_user(
        &self,
        session_id: Uuid,
        stream: &PresenceStream,
        user_id: Uuid,
    ) -> Option<PresenceMeta> {
        let stripe = self.stripe(stream).read().expect("tracker stripe poisoned");
        stripe
            .streams
            .get(stream)
            .and_then(|members| members.get(&(session_id, user_id)))
            .cloned()
    }

    pub fn count_by_stream(&self, stream: &PresenceStream) -> usize {
        let stripe = self.stripe(stream).read().expect("tracker stripe poisoned");
        stripe.streams.get(stream).map_or(0, HashMap::len)
    }

    // -----------------------------------------------------------------------
    // Event emission.  Called with the stripe lock held so events for one
    // (stream, user) observe tracker-insertion order.
    // -----------------------------------------------------------------------

    fn emit_join(
        &self,
        stripe: &Stripe,
        stream: &PresenceStream,
        user_id: Uuid,
        session_id: Uuid,
        meta: &PresenceMeta,
    ) {
        let presence = Presence {
            stream: stream.clone(),
            user_id,
            session_id,
            meta: meta.clone(),
        };
        self.status.queue(StatusEvent {
            user_id,
            joins: vec![presence.to_wire()],
            leaves: Vec::new(),
            notify_followers: stream.mode == stream_mode::STATUS,
        });
        if stream.mode != stream_mode::STATUS && !meta.hidden {
            self.fan_out_stream_event(stripe, stream, session_id, vec![presence.to_wire()], Vec::new());
        }
    }

    fn emit_leave(
        &self,
        stripe: &Stripe,
        stream: &PresenceStream,
        user_id: Uuid,
        session_id: Uuid,
        meta: &PresenceMeta,
    ) {
        let presence = Presence {
            stream: stream.clone(),
            user_id,
            session_id,
            meta: meta.clone(),
        };
        self.status.queue(StatusEvent {
            user_id,
            joins: Vec::new(),
            leaves: vec![presence.to_wire()],
            notify_followers: stream.mode == stream_mode::STATUS,
        });
        if stream.mode != stream_mode::STATUS && !meta.hidden {
            self.fan_out_stream_event(stripe, stream, session_id, Vec::new(), vec![presence.to_wire()]);
        }
    }

    fn emit_update(
        &self,
        stream: &PresenceStream,
        user_id: Uuid,
        session_id: Uuid,
        old: &PresenceMeta,
        new: &PresenceMeta,
    ) {
        // No tracker event reaches the stream, but followers see a fresh
        // status through a leave+join pair.
        if stream.mode != stream_mode::STATUS {
            return;
        }
        let leave = Presence {
            stream: stream.clone(),
            user_id,
            session_id,
            meta: PresenceMeta {
                reason: PresenceReason::Update,
                ..old.clone()
            },
        };
        let join = Presence {
            stream: stream.clone(),
            user_id,
            session_id,
            meta: new.clone(),
        };
        self.status.queue(StatusEvent {
            user_id,
            joins: vec![join.to_wire()],
            leaves: vec![leave.to_wire()],
            notify_followers: true,
        });
    }

    /// Deliver a presence event to the stream's other members.  The subject
    /// session is excluded; hidden members receive the event but never
    /// appear in one.
    fn fan_out_stream_event(
        &self,
        stripe: &Stripe,
        stream: &PresenceStream,
        subject_session: Uuid,
        joins: Vec<UserPresence>,
        leaves: Vec<UserPresence>,
    ) {
        let Some(members) = stripe.streams.get(stream) else {
            // The subject was the last member; nobody left to notify.
            return;
        };
        let envelope = Envelope::new(Message::StreamPresenceEvent(StreamPresenceEvent {
            stream: stream.to_wire(),
            joins,
            leaves,
        }));
        let payload = match serde_json::to_vec(&envelope) {
            Ok(payload) => payload,
            Err(err) => {
                debug!(error = %err, "presence event encode failed");
                return;
            }
        };
        for &(session_id, _) in members.keys() {
            if session_id == subject_session {
                continue;
            }
            let Some(session) = self.registry.get(session_id) else {
                continue;
            };
            if let Err(err) = session.send_bytes(payload.clone(), true) {
                debug!(%session_id, error = %err, "presence event delivery failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_registry::test_support::FakeSession;

    fn harness() -> (Arc<Tracker>, Arc<StatusRegistry>, Arc<SessionRegistry>) {
        let registry = Arc::new(SessionRegistry::new());
        let status = Arc::new(StatusRegistry::new(registry.clone()));
        let tracker = Arc::new(Tracker::new(status.clone(), registry.clone()));
        (tracker, status, registry)
    }

    fn decode(payload: &[u8]) -> Envelope {
        serde_json::from_slice(payload).expect("payload should be an envelope")
    }

    #[test]
    fn track_is_idempotent_for_identical_meta() {
        let (tracker, _, _) = harness();
        let stream = PresenceStream::chat("general");
        let session = Uuid::new_v4();
        let user = Uuid::new_v4();

        let (ok, newly) = tracker.track(session, stream.clone(), user, PresenceMeta::new("ana"));
        assert!(ok && newly);
        let (ok, newly) = tracker.track(session, stream.clone(), user, PresenceMeta::new("ana"));
        assert!(ok);
        assert!(!newly, "re-track with identical meta is an update");
        assert_eq!(tracker.count_by_stream(&stream), 1);
    }

    #[test]
    fn join_fans_out_to_other_members_only() {
        let (tracker, _, registry) = harness();
        let stream = PresenceStream::chat("general");

        let a = FakeSession::new(Uuid::new_v4());
        let b = FakeSession::new(Uuid::new_v4());
        registry.add(a.clone());
        registry.add(b.clone());

        let (_, _) = tracker.track(a.session_id, stream.clone(), a.user, PresenceMeta::new("a"));
        assert!(a.payloads().is_empty(), "sole member sees no event");

        let (_, _) = tracker.track(b.session_id, stream.clone(), b.user, PresenceMeta::new("b"));
        let delivered = a.payloads();
        assert_eq!(delivered.len(), 1, "existing member observes the join");
        assert!(b.payloads().is_empty(), "joiner does not observe itself");

        match decode(&delivered[0]).message {
            Message::StreamPresenceEvent(ev) => {
                assert_eq!(ev.joins.len(), 1);
                assert_eq!(ev.joins[0].session_id, b.session_id);
                assert!(ev.leaves.is_empty());
            }
            other => panic!("expected stream presence event, got {other:?}"),
        }
    }

    #[test]
    fn untrack_emits_leave_to_remaining_members() {
        let (tracker, _, registry) = harness();
        let stream = PresenceStream::chat("general");
        let a = FakeSession::new(Uuid::new_v4());
        let b = FakeSession::new(Uuid::new_v4());
        registry.add(a.clone());
        registry.add(b.clone());
        let (_, _) = tracker.track(a.session_id, stream.clone(), a.user, PresenceMeta::new("a"));
        let (_, _) = tracker.track(b.session_id, stream.clone(), b.user, PresenceMeta::new("b"));

        tracker.untrack(b.session_id, &stream, b.user, PresenceReason::Leave);
        let delivered = a.payloads();
        assert_eq!(delivered.len(), 2, "join then leave, in order");
        match decode(&delivered[1]).message {
            Message::StreamPresenceEvent(ev) => {
                assert_eq!(ev.leaves.len(), 1);
                assert_eq!(ev.leaves[0].session_id, b.session_id);
            }
            other => panic!("expected stream presence event, got {other:?}"),
        }
        assert_eq!(tracker.count_by_stream(&stream), 1);
    }

    #[test]
    fn hidden_presences_receive_but_never_appear_in_events_or_listings() {
        let (tracker, _, registry) = harness();
        let stream = PresenceStream::chat("general");
        let visible = FakeSession::new(Uuid::new_v4());
        let lurker = FakeSession::new(Uuid::new_v4());
        registry.add(visible.clone());
        registry.add(lurker.clone());

        let (_, _) = tracker.track(
            visible.session_id,
            stream.clone(),
            visible.user,
            PresenceMeta::new("seen"),
        );
        let mut hidden_meta = PresenceMeta::new("ghost");
        hidden_meta.hidden = true;
        let (_, _) = tracker.track(lurker.session_id, stream.clone(), lurker.user, hidden_meta);

        assert!(
            visible.payloads().is_empty(),
            "hidden join must not be announced"
        );
        let listed = tracker.list_by_stream(&stream, false, true);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session_id, visible.session_id);
        let everyone = tracker.list_by_stream(&stream, true, true);
        assert_eq!(everyone.len(), 2);

        // The hidden member still receives events about visible members.
        tracker.untrack(visible.session_id, &stream, visible.user, PresenceReason::Leave);
        assert_eq!(lurker.payloads().len(), 1);
    }

    #[test]
    fn untrack_all_removes_every_presence_for_the_session() {
        let (tracker, _, _) = harness();
        let general = PresenceStream::chat("general");
        let trade = PresenceStream::chat("trade");
        let session = Uuid::new_v4();
        let user = Uuid::new_v4();

        let (_, _) = tracker.track(session, general.clone(), user, PresenceMeta::new("ana"));
        let (_, _) = tracker.track(session, trade.clone(), user, PresenceMeta::new("ana"));
        let (_, _) = tracker.track(session, PresenceStream::status(user), user, PresenceMeta::new("ana"));

        tracker.untrack_all(session, PresenceReason::Disconnect);
        assert_eq!(tracker.count_by_stream(&general), 0);
        assert_eq!(tracker.count_by_stream(&trade), 0);
        assert_eq!(tracker.count_by_stream(&PresenceStream::status(user)), 0);
        assert!(
            tracker
                .get_local_by_session_stream_user(session, &general, user)
                .is_none()
        );
    }

    #[test]
    fn untrack_by_stream_drops_the_stream_atomically() {
        let (tracker, _, _) = harness();
        let stream = PresenceStream::chat("doomed");
        let (_, _) = tracker.track(Uuid::new_v4(), stream.clone(), Uuid::new_v4(), PresenceMeta::new("x"));
        let (_, _) = tracker.track(Uuid::new_v4(), stream.clone(), Uuid::new_v4(), PresenceMeta::new("y"));
        assert_eq!(tracker.count_by_stream(&stream), 2);

        tracker.untrack_by_stream(&stream);
        assert_eq!(tracker.count_by_stream(&stream), 0);
        assert!(tracker.list_by_stream(&stream, true, true).is_empty());
    }

    #[test]
    fn meta_comparison_excludes_reason() {
        let mut a = PresenceMeta::new("ana");
        let mut b = PresenceMeta::new("ana");
        a.reason = PresenceReason::Join;
        b.reason = PresenceReason::Update;
        assert!(a.same(&b));
        b.status = "afk".to_owned();
        assert!(!a.same(&b));
    }

    #[test]
    fn wire_form_omits_zero_components() {
        let stream = PresenceStream::chat("general");
        let wire = stream.to_wire();
        assert_eq!(wire.subject, None);
        assert_eq!(wire.subcontext, None);
        assert_eq!(wire.label.as_deref(), Some("general"));
        assert_eq!(PresenceStream::from_wire(&wire), stream);
    }
}
