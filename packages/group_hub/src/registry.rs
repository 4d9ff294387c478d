use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::session::{Session, SessionId};

/// Tracks which live sessions belong to which group.
///
/// Holds non-owning handles for routing only; the transport owns the
/// sockets. Groups exist only while they have members.
#[derive(Default)]
pub struct Registry {
    groups: RwLock<HashMap<String, HashMap<SessionId, Arc<Session>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to the group named by its attachment. Returns false if
    /// it was already a member.
    pub async fn join(&self, session: Arc<Session>) -> bool {
        let group = session.group().to_string();
        let mut groups = self.groups.write().await;
        let members = groups.entry(group.clone()).or_default();
        let id = session.id().clone();
        let added = members.insert(id.clone(), session).is_none();
        if added {
            debug!(group = group.as_str(), session_id = %id, members = members.len(), "session joined");
        }
        added
    }

    /// Remove a session from its group, closing it first if still open.
    ///
    /// Empty groups are dropped. Returns false if the session was not a member.
    pub async fn release(&self, session: &Session) -> bool {
        // Local and non-blocking: only flips a flag and queues a frame.
        session.close();

        let group = session.group();
        let mut groups = self.groups.write().await;
        let Some(members) = groups.get_mut(group) else {
            return false;
        };
        let removed = members.remove(session.id()).is_some();
        if members.is_empty() {
            groups.remove(group);
            debug!(group, "group emptied");
        }
        removed
    }

    /// Snapshot of the current members. Safe to iterate without any lock.
    pub async fn members(&self, group: &str) -> Vec<Arc<Session>> {
        self.groups
            .read()
            .await
            .get(group)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of members; 0 for an unknown group.
    pub async fn count(&self, group: &str) -> usize {
        self.groups.read().await.get(group).map_or(0, HashMap::len)
    }

    /// Number of groups with at least one member.
    pub async fn group_count(&self) -> usize {
        self.groups.read().await.len()
    }

    /// Diagnostic view: group -> attachment ids, both sorted.
    pub async fn all_sessions_by_group(&self) -> BTreeMap<String, Vec<String>> {
        let groups = self.groups.read().await;
        groups
            .iter()
            .map(|(group, members)| {
                let mut ids: Vec<String> = members
                    .values()
                    .map(|s| s.attachment().id().to_string())
                    .collect();
                ids.sort();
                (group.clone(), ids)
            })
            .collect()
    }
}
