//! Live-session index.
//!
//! Components never hold sessions directly; they resolve a session id
//! against this registry at delivery time, so a session that closed between
//! snapshot and send is skipped naturally.

use crate::error::ServerResult;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Session surface the registries and routers depend on.  The concrete
/// [`crate::session::Session`] implements it; tests substitute fakes.
pub trait SessionHandle: Send + Sync {
    fn id(&self) -> Uuid;
    fn user_id(&self) -> Uuid;
    fn username(&self) -> String;
    /// Enqueue a pre-encoded payload on the session's outgoing queue.
    fn send_bytes(self: Arc<Self>, payload: Vec<u8>, reliable: bool) -> ServerResult<()>;
    /// Begin closing the session; cleanup runs on the session's own tasks.
    fn initiate_close(self: Arc<Self>, reason: &'static str);
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<dyn SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, session: Arc<dyn SessionHandle>) {
        let mut sessions = self.sessions.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        let _ = sessions.insert(session.id(), session);
    }

    pub fn get(&self, session_id: Uuid) -> Option<Arc<dyn SessionHandle>> {
        self.sessions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&session_id)
            .cloned()
    }

    pub fn remove(&self, session_id: Uuid) {
        let mut sessions = self.sessions.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        let _ = sessions.remove(&session_id);
    }

    pub fn count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Close one session if it is still live.
    pub fn disconnect(&self, session_id: Uuid, reason: &'static str) {
        if let Some(session) = self.get(session_id) {
            session.initiate_close(reason);
        }
    }

    /// Fan-out close to every live session; used by graceful shutdown.
    pub fn disconnect_all(&self, reason: &'static str) {
        let snapshot: Vec<Arc<dyn SessionHandle>> = self
            .sessions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for session in snapshot {
            session.initiate_close(reason);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// In-memory session stand-in capturing delivered payloads.
    pub struct FakeSession {
        pub session_id: Uuid,
        pub user: Uuid,
        pub name: String,
        pub delivered: Mutex<Vec<Vec<u8>>>,
        pub closed: Mutex<Option<&'static str>>,
    }

    impl FakeSession {
        pub fn new(user: Uuid) -> Arc<Self> {
            Arc::new(Self {
                session_id: Uuid::new_v4(),
                user,
                name: "fake".to_owned(),
                delivered: Mutex::new(Vec::new()),
                closed: Mutex::new(None),
            })
        }

        pub fn payloads(&self) -> Vec<Vec<u8>> {
            self.delivered.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
        }
    }

    impl SessionHandle for FakeSession {
        fn id(&self) -> Uuid {
            self.session_id
        }
        fn user_id(&self) -> Uuid {
            self.user
        }
        fn username(&self) -> String {
            self.name.clone()
        }
        fn send_bytes(self: Arc<Self>, payload: Vec<u8>, _reliable: bool) -> ServerResult<()> {
            self.delivered
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(payload);
            Ok(())
        }
        fn initiate_close(self: Arc<Self>, reason: &'static str) {
            *self.closed.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(reason);
        }
    }
}
