//! Message router.
//!
//! Delivers an envelope either to every presence on a stream or to an
//! explicit list of presence ids.  Membership is snapshotted up front; a
//! session that closed between snapshot and send is skipped silently.  The
//! payload is encoded at most once per delivery batch.

use crate::session_registry::SessionRegistry;
use crate::tracker::{PresenceStream, Tracker};
use arena_protocol::Envelope;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Address of exactly one recipient.  `node` is carried for wire
/// compatibility; this process is always the local node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceId {
    pub session_id: Uuid,
    pub node: String,
}

impl PresenceId {
    pub fn local(session_id: Uuid) -> Self {
        Self {
            session_id,
            node: "local".to_owned(),
        }
    }
}

pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
    tracker: Arc<Tracker>,
}

impl MessageRouter {
    pub fn new(registry: Arc<SessionRegistry>, tracker: Arc<Tracker>) -> Self {
        Self { registry, tracker }
    }

    /// Deliver to every presence on the stream, hidden members included.
    pub fn send_to_stream(&self, stream: &PresenceStream, envelope: &Envelope, reliable: bool) {
        let members = self.tracker.list_by_stream(stream, true, true);
        self.deliver(members.iter().map(|p| p.session_id), envelope, reliable);
    }

    pub fn send_to_presence_ids(&self, ids: &[PresenceId], envelope: &Envelope, reliable: bool) {
        self.deliver(ids.iter().map(|id| id.session_id), envelope, reliable);
    }

    fn deliver(
        &self,
        session_ids: impl Iterator<Item = Uuid>,
        envelope: &Envelope,
        reliable: bool,
    ) {
        let mut payload: Option<Vec<u8>> = None;
        for session_id in session_ids {
            let Some(session) = self.registry.get(session_id) else {
                continue;
            };
            let bytes = match &payload {
                Some(bytes) => bytes.clone(),
                None => match serde_json::to_vec(envelope) {
                    Ok(bytes) => {
                        payload = Some(bytes.clone());
                        bytes
                    }
                    Err(err) => {
                        debug!(error = %err, "envelope encode failed");
                        return;
                    }
                },
            };
            if let Err(err) = session.send_bytes(bytes, reliable) {
                debug!(%session_id, error = %err, "routed delivery failed");
            }
        }
    }
}
