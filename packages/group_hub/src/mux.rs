use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

use crate::error::HubError;
use crate::session::{Session, SessionId};

/// Outcome of a fan-out. Failed sends never abort delivery to the others.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    pub sent: usize,
    pub failed: usize,
}

/// The set of live connections the transport has accepted.
///
/// The transport calls `register`/`unregister` (through the hub's connect
/// and disconnect callbacks); the hub uses it for multicast.
pub trait Multiplexer: Send + Sync {
    fn register(&self, session: Arc<Session>);

    fn unregister(&self, id: &SessionId) -> bool;

    /// Send to every open session accepted by `filter`.
    fn broadcast_filter(
        &self,
        msg: &[u8],
        filter: &dyn Fn(&Session) -> bool,
    ) -> Result<Delivery, HubError>;

    fn broadcast(&self, msg: &[u8]) -> Result<Delivery, HubError> {
        self.broadcast_filter(msg, &|_| true)
    }

    /// Close every session and refuse new ones. Returns how many were closed.
    fn close_with_msg(&self, msg: &[u8]) -> Result<usize, HubError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_closed(&self) -> bool;
}

/// In-memory multiplexer keyed by session id.
#[derive(Default)]
pub struct SessionMux {
    sessions: DashMap<SessionId, Arc<Session>>,
    closed: AtomicBool,
}

impl SessionMux {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Multiplexer for SessionMux {
    fn register(&self, session: Arc<Session>) {
        if self.is_closed() {
            session.close();
            return;
        }
        self.sessions.insert(session.id().clone(), session);
    }

    fn unregister(&self, id: &SessionId) -> bool {
        self.sessions.remove(id).is_some()
    }

    fn broadcast_filter(
        &self,
        msg: &[u8],
        filter: &dyn Fn(&Session) -> bool,
    ) -> Result<Delivery, HubError> {
        if self.is_closed() {
            return Err(HubError::Closed);
        }

        let mut delivery = Delivery::default();
        for entry in self.sessions.iter() {
            let session = entry.value();
            if session.is_closed() || !filter(session) {
                continue;
            }
            match session.write(msg) {
                Ok(()) => delivery.sent += 1,
                Err(e) => {
                    debug!(session_id = %entry.key(), "send failed: {}", e);
                    delivery.failed += 1;
                }
            }
        }

        if delivery.failed > 0 {
            warn!(
                sent = delivery.sent,
                failed = delivery.failed,
                "broadcast partially failed"
            );
        }
        Ok(delivery)
    }

    fn close_with_msg(&self, msg: &[u8]) -> Result<usize, HubError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(HubError::Closed);
        }
        let closed = self
            .sessions
            .iter()
            .filter(|entry| entry.value().close_with_msg(msg))
            .count();
        self.sessions.clear();
        Ok(closed)
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
