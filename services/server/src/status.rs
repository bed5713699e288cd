//! Status registry: follower graph, online-user index, and the event
//! processor that fans `StatusPresenceEvent` envelopes out to followers.
//!
//! Two locks, never nested: the follower graph lock is released before the
//! online index is touched, matching the processing order of the event
//! loop.  The online index refcounts `(user, session)` pairs so a session
//! present on several streams keeps its user online until the last presence
//! leaves.

use crate::session_registry::SessionRegistry;
use arena_protocol::{Envelope, Message, StatusPresenceEvent, UserPresence};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

/// One batch of presence changes for a single user.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub user_id: Uuid,
    pub joins: Vec<UserPresence>,
    pub leaves: Vec<UserPresence>,
    /// True for status-stream changes; only those reach followers.  All
    /// events feed the online index.
    pub notify_followers: bool,
}

#[derive(Default)]
struct FollowerGraph {
    by_user: HashMap<Uuid, HashSet<Uuid>>,
    by_session: HashMap<Uuid, HashSet<Uuid>>,
}

pub struct StatusRegistry {
    followers: Mutex<FollowerGraph>,
    /// user_id -> session_id -> live presence count.
    online: RwLock<HashMap<Uuid, HashMap<Uuid, u32>>>,
    queue_tx: mpsc::UnboundedSender<StatusEvent>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<StatusEvent>>>,
    stop_tx: watch::Sender<bool>,
    registry: Arc<SessionRegistry>,
}

impl StatusRegistry {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);
        Self {
            followers: Mutex::new(FollowerGraph::default()),
            online: RwLock::new(HashMap::new()),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            stop_tx,
            registry,
        }
    }

    /// Non-blocking submit onto the single processing queue.
    pub fn queue(&self, event: StatusEvent) {
        if self.queue_tx.send(event).is_err() {
            debug!("status event dropped, processor stopped");
        }
    }

    /// Spawn the processor task.  Call exactly once after construction.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        let mut queue_rx = self
            .queue_rx
            .lock()
            .expect("status queue poisoned")
            .take()
            .expect("status processor started twice");
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    event = queue_rx.recv() => {
                        let Some(event) = event else { break };
                        registry.process(&event);
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    fn process(&self, event: &StatusEvent) {
        // Online index first, so a follower reacting to the envelope
        // already observes the updated flag.
        {
            let mut online = self.online.write().expect("online index poisoned");
            for leave in &event.leaves {
                let remove_user = online.get_mut(&event.user_id).is_some_and(|sessions| {
                    if let Some(count) = sessions.get_mut(&leave.session_id) {
                        *count -= 1;
                        if *count == 0 {
                            let _ = sessions.remove(&leave.session_id);
                        }
                    }
                    sessions.is_empty()
                });
                if remove_user {
                    let _ = online.remove(&event.user_id);
                }
            }
            for join in &event.joins {
                *online
                    .entry(event.user_id)
                    .or_default()
                    .entry(join.session_id)
                    .or_insert(0) += 1;
            }
        }

        if !event.notify_followers {
            return;
        }
        let follower_sessions: Vec<Uuid> = {
            let graph = self.followers.lock().expect("follower graph poisoned");
            match graph.by_user.get(&event.user_id) {
                Some(sessions) if !sessions.is_empty() => sessions.iter().copied().collect(),
                _ => return,
            }
        };

        // Encode lazily: skip the cost entirely when every follower has
        // already gone away.
        let mut payload: Option<Vec<u8>> = None;
        let envelope = Envelope::new(Message::StatusPresenceEvent(StatusPresenceEvent {
            joins: event.joins.clone(),
            leaves: event.leaves.clone(),
        }));
        for session_id in follower_sessions {
            let Some(session) = self.registry.get(session_id) else {
                continue;
            };
            let bytes = match &payload {
                Some(bytes) => bytes.clone(),
                None => match serde_json::to_vec(&envelope) {
                    Ok(bytes) => {
                        payload = Some(bytes.clone());
                        bytes
                    }
                    Err(err) => {
                        warn!(error = %err, "status event encode failed");
                        return;
                    }
                },
            };
            if let Err(err) = session.send_bytes(bytes, true) {
                debug!(%session_id, error = %err, "status event delivery failed");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Follower graph
    // -----------------------------------------------------------------------

    /// Idempotent per (session, user) pair; both index directions are
    /// established atomically.
    pub fn follow(&self, session_id: Uuid, user_ids: &[Uuid]) {
        let mut graph = self.followers.lock().expect("follower graph poisoned");
        for &user_id in user_ids {
            let _ = graph.by_user.entry(user_id).or_default().insert(session_id);
            let _ = graph.by_session.entry(session_id).or_default().insert(user_id);
        }
    }

    pub fn unfollow(&self, session_id: Uuid, user_ids: &[Uuid]) {
        let mut graph = self.followers.lock().expect("follower graph poisoned");
        for user_id in user_ids {
            if let Some(sessions) = graph.by_user.get_mut(user_id) {
                let _ = sessions.remove(&session_id);
                if sessions.is_empty() {
                    let _ = graph.by_user.remove(user_id);
                }
            }
            if let Some(users) = graph.by_session.get_mut(&session_id) {
                let _ = users.remove(user_id);
                if users.is_empty() {
                    let _ = graph.by_session.remove(&session_id);
                }
            }
        }
    }

    /// Called from session cleanup.
    pub fn unfollow_all(&self, session_id: Uuid) {
        let mut graph = self.followers.lock().expect("follower graph poisoned");
        let Some(users) = graph.by_session.remove(&session_id) else {
            return;
        };
        for user_id in users {
            if let Some(sessions) = graph.by_user.get_mut(&user_id) {
                let _ = sessions.remove(&session_id);
                if sessions.is_empty() {
                    let _ = graph.by_user.remove(&user_id);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Online-user index
    // -----------------------------------------------------------------------

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.online
            .read()
            .expect("online index poisoned")
            .contains_key(&user_id)
    }

    /// Subset of `user_ids` currently online.
    pub fn filter_online(&self, user_ids: &[Uuid]) -> HashSet<Uuid> {
        let online = self.online.read().expect("online index poisoned");
        user_ids
            .iter()
            .copied()
            .filter(|id| online.contains_key(id))
            .collect()
    }

    /// Stamp the online flag on a bulk listing.
    pub fn fill_online<T: OnlineFlagged>(&self, records: &mut [T]) {
        let online = self.online.read().expect("online index poisoned");
        for record in records {
            let flag = online.contains_key(&record.user_id());
            record.set_online(flag);
        }
    }

    #[cfg(test)]
    pub(crate) fn follower_edge_count(&self) -> (usize, usize) {
        let graph = self.followers.lock().expect("follower graph poisoned");
        let forward = graph.by_user.values().map(HashSet::len).sum();
        let backward = graph.by_session.values().map(HashSet::len).sum();
        (forward, backward)
    }
}

/// Records that carry an online flag, e.g. friend or group-member listings.
pub trait OnlineFlagged {
    fn user_id(&self) -> Uuid;
    fn set_online(&mut self, online: bool);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_registry::test_support::FakeSession;

    fn presence(user_id: Uuid, session_id: Uuid) -> UserPresence {
        UserPresence {
            user_id,
            session_id,
            username: "u".to_owned(),
            status: Some(String::new()),
        }
    }

    #[test]
    fn follow_unfollow_round_trips_both_directions() {
        let registry = Arc::new(SessionRegistry::new());
        let status = StatusRegistry::new(registry);
        let session = Uuid::new_v4();
        let users = [Uuid::new_v4(), Uuid::new_v4()];

        status.follow(session, &users);
        status.follow(session, &users); // idempotent
        assert_eq!(status.follower_edge_count(), (2, 2));

        status.unfollow(session, &users);
        assert_eq!(status.follower_edge_count(), (0, 0));
    }

    #[test]
    fn unfollow_all_clears_every_edge_for_the_session() {
        let registry = Arc::new(SessionRegistry::new());
        let status = StatusRegistry::new(registry);
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();
        let user = Uuid::new_v4();

        status.follow(s1, &[user]);
        status.follow(s2, &[user]);
        status.unfollow_all(s1);
        assert_eq!(status.follower_edge_count(), (1, 1));
    }

    #[tokio::test]
    async fn processor_updates_online_index_before_delivering() {
        let registry = Arc::new(SessionRegistry::new());
        let status = Arc::new(StatusRegistry::new(registry.clone()));
        let _processor = status.start();

        let follower = FakeSession::new(Uuid::new_v4());
        registry.add(follower.clone());

        let user = Uuid::new_v4();
        let session = Uuid::new_v4();
        status.follow(follower.session_id, &[user]);

        status.queue(StatusEvent {
            user_id: user,
            joins: vec![presence(user, session)],
            leaves: Vec::new(),
            notify_followers: true,
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(status.is_online(user));
        assert_eq!(follower.payloads().len(), 1);

        status.queue(StatusEvent {
            user_id: user,
            joins: Vec::new(),
            leaves: vec![presence(user, session)],
            notify_followers: true,
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!status.is_online(user));
        assert_eq!(follower.payloads().len(), 2);
        status.stop();
    }

    #[tokio::test]
    async fn multi_stream_sessions_stay_online_until_the_last_leave() {
        let registry = Arc::new(SessionRegistry::new());
        let status = Arc::new(StatusRegistry::new(registry));
        let _processor = status.start();
        let user = Uuid::new_v4();
        let session = Uuid::new_v4();

        // Two presences (e.g. status stream + chat stream) for one session.
        for _ in 0..2 {
            status.queue(StatusEvent {
                user_id: user,
                joins: vec![presence(user, session)],
                leaves: Vec::new(),
                notify_followers: false,
            });
        }
        status.queue(StatusEvent {
            user_id: user,
            joins: Vec::new(),
            leaves: vec![presence(user, session)],
            notify_followers: false,
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(status.is_online(user), "one presence still remains");

        status.queue(StatusEvent {
            user_id: user,
            joins: Vec::new(),
            leaves: vec![presence(user, session)],
            notify_followers: false,
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!status.is_online(user));
        status.stop();
    }

    #[test]
    fn events_for_users_without_followers_are_cheap() {
        let registry = Arc::new(SessionRegistry::new());
        let status = StatusRegistry::new(registry);
        // Direct call: no followers means no encoding, only index work.
        let user = Uuid::new_v4();
        status.process(&StatusEvent {
            user_id: user,
            joins: vec![presence(user, Uuid::new_v4())],
            leaves: Vec::new(),
            notify_followers: true,
        });
        assert!(status.is_online(user));
    }

    #[test]
    fn fill_online_stamps_bulk_records() {
        struct Row {
            id: Uuid,
            online: bool,
        }
        impl OnlineFlagged for Row {
            fn user_id(&self) -> Uuid {
                self.id
            }
            fn set_online(&mut self, online: bool) {
                self.online = online;
            }
        }

        let registry = Arc::new(SessionRegistry::new());
        let status = StatusRegistry::new(registry);
        let online_user = Uuid::new_v4();
        status.process(&StatusEvent {
            user_id: online_user,
            joins: vec![presence(online_user, Uuid::new_v4())],
            leaves: Vec::new(),
            notify_followers: false,
        });

        let mut rows = vec![
            Row { id: online_user, online: false },
            Row { id: Uuid::new_v4(), online: true },
        ];
        status.fill_online(&mut rows);
        assert!(rows[0].online);
        assert!(!rows[1].online);
    }
}
