use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::HubError;
use crate::mux::{Delivery, Multiplexer, SessionMux};
use crate::registry::Registry;
use crate::session::Session;
use crate::worker::{Coordinator, WorkerConfig, WorkerControl};

/// Diagnostic snapshot served by the monitoring endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubState {
    pub sessions: BTreeMap<String, Vec<String>>,
    pub workers: Vec<String>,
}

/// Group broadcast hub.
///
/// Composes the registry, the worker coordinator and the connection
/// multiplexer. Construct once at startup and share the `Arc`.
pub struct Hub {
    registry: Registry,
    workers: Coordinator,
    mux: Arc<dyn Multiplexer>,
}

impl Hub {
    pub fn new(mux: Arc<dyn Multiplexer>, config: WorkerConfig) -> Arc<Self> {
        Arc::new(Self {
            registry: Registry::new(),
            workers: Coordinator::new(config),
            mux,
        })
    }

    /// Hub backed by the in-memory [`SessionMux`].
    pub fn with_session_mux(config: WorkerConfig) -> Arc<Self> {
        Self::new(Arc::new(SessionMux::new()), config)
    }

    pub(crate) fn coordinator(&self) -> &Coordinator {
        &self.workers
    }

    // ── Multiplexer callbacks ───────────────────────────────────────────

    /// Called by the transport once a connection is established.
    pub async fn handle_connect(&self, session: Arc<Session>) {
        if self.mux.is_closed() {
            session.close();
            return;
        }

        let group = session.group().to_string();
        self.mux.register(session.clone());
        self.registry.join(session.clone()).await;

        if let Some(greeting) = session.attachment().greeting() {
            if let Err(e) = session.write(greeting.as_bytes()) {
                debug!(group = %group, session_id = %session.id(), "failed to deliver greeting: {}", e);
            }
        }

        debug!(group = %group, session_id = %session.id(), "session connected");
    }

    /// Called by the transport when a connection goes away.
    pub async fn handle_disconnect(&self, session: &Arc<Session>) {
        self.mux.unregister(session.id());
        self.registry.release(session).await;
        debug!(group = session.group(), session_id = %session.id(), "session disconnected");
    }

    // ── Worker lifecycle ────────────────────────────────────────────────

    /// Start `producer` for `group` unless a worker already runs there.
    ///
    /// Returns `Ok(true)` when a new worker was started and `Ok(false)` when
    /// the existing one was reused. The producer is stopped after `ttl`, or
    /// earlier once the group stays empty for an idle check.
    pub async fn notify<F, Fut>(
        self: &Arc<Self>,
        group: &str,
        producer: F,
        ttl: Duration,
    ) -> Result<bool, HubError>
    where
        F: FnOnce(String, WorkerControl, Arc<Hub>) -> Fut + Send,
        Fut: Future<Output = Result<(), HubError>> + Send + 'static,
    {
        if self.is_closed() {
            return Err(HubError::Closed);
        }
        Ok(self.workers.notify(self, group, producer, ttl).await)
    }

    /// Drop the group's worker; safe to call repeatedly.
    pub async fn release_worker(&self, group: &str) -> bool {
        self.workers.release(group).await
    }

    /// Ask the group's producer to stop gracefully.
    pub async fn stop_worker(&self, group: &str) -> bool {
        self.workers.stop(group).await
    }

    /// Groups that currently have a worker, sorted.
    pub async fn workers(&self) -> Vec<String> {
        self.workers.groups().await
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    /// Send to every session of `group`.
    ///
    /// Fails with [`HubError::NoActiveSession`] when the group is empty.
    pub async fn group_broadcast(&self, msg: &[u8], group: &str) -> Result<Delivery, HubError> {
        if self.registry.count(group).await == 0 {
            return Err(HubError::NoActiveSession {
                group: group.to_string(),
            });
        }
        // Re-check membership on the live session, not the registry snapshot.
        self.mux
            .broadcast_filter(msg, &|session: &Session| session.group() == group)
    }

    /// Send to every live session regardless of group.
    pub fn broadcast(&self, msg: &[u8]) -> Result<Delivery, HubError> {
        self.mux.broadcast(msg)
    }

    /// Close every member of `group` with a close payload.
    ///
    /// Registry removal happens through the disconnect callback.
    pub async fn close_group_with_msg(&self, group: &str, msg: &[u8]) -> usize {
        self.registry
            .members(group)
            .await
            .iter()
            .filter(|session| session.close_with_msg(msg))
            .count()
    }

    /// Close all connections and stop every worker.
    pub async fn close(&self) -> Result<usize, HubError> {
        self.close_with_msg(&[]).await
    }

    /// Like [`Hub::close`] with a close payload for every connection.
    pub async fn close_with_msg(&self, msg: &[u8]) -> Result<usize, HubError> {
        let closed = self.mux.close_with_msg(msg)?;
        let released = self.workers.shutdown().await;
        info!(closed, released, "hub closed");
        Ok(closed)
    }

    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.mux.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mux.is_empty()
    }

    /// Number of sessions in `group`.
    pub async fn group_len(&self, group: &str) -> usize {
        self.registry.count(group).await
    }

    pub async fn debug_info(&self) -> HubState {
        HubState {
            sessions: self.registry.all_sessions_by_group().await,
            workers: self.workers().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Attachment, Outbound, Outbox};

    fn connect(group: &str, id: &str) -> (Arc<Session>, Outbox) {
        Session::new(Attachment::new(group, id).unwrap())
    }

    fn drain(rx: &mut Outbox) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Some(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_group_broadcast_reaches_only_the_group() {
        let hub = Hub::with_session_mux(WorkerConfig::default());
        let (a1, mut rx_a1) = connect("a", "a_1");
        let (a2, mut rx_a2) = connect("a", "a_2");
        let (b1, mut rx_b1) = connect("b", "b_1");
        for s in [&a1, &a2, &b1] {
            hub.handle_connect(s.clone()).await;
        }

        let delivery = hub.group_broadcast(b"a: 0", "a").await.unwrap();

        assert_eq!(delivery.sent, 2);
        assert_eq!(drain(&mut rx_a1), vec![Outbound::Message(b"a: 0".to_vec())]);
        assert_eq!(drain(&mut rx_a2), vec![Outbound::Message(b"a: 0".to_vec())]);
        assert!(drain(&mut rx_b1).is_empty());
    }

    #[tokio::test]
    async fn test_group_broadcast_to_empty_group_fails() {
        let hub = Hub::with_session_mux(WorkerConfig::default());
        let (b1, mut rx_b1) = connect("b", "b_1");
        hub.handle_connect(b1).await;

        let err = hub.group_broadcast(b"x", "a").await.unwrap_err();
        assert_eq!(
            err,
            HubError::NoActiveSession {
                group: "a".to_string()
            }
        );
        assert!(drain(&mut rx_b1).is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone() {
        let hub = Hub::with_session_mux(WorkerConfig::default());
        let (a1, mut rx_a1) = connect("a", "a_1");
        let (b1, mut rx_b1) = connect("b", "b_1");
        hub.handle_connect(a1).await;
        hub.handle_connect(b1).await;

        assert_eq!(hub.broadcast(b"all").unwrap().sent, 2);
        assert_eq!(drain(&mut rx_a1).len(), 1);
        assert_eq!(drain(&mut rx_b1).len(), 1);
        assert_eq!(hub.len(), 2);
    }

    #[tokio::test]
    async fn test_greeting_written_once_on_connect() {
        let hub = Hub::with_session_mux(WorkerConfig::default());
        let (s, mut rx) = Session::new(
            Attachment::new("a", "a_1")
                .unwrap()
                .with_greeting("welcome"),
        );
        hub.handle_connect(s).await;

        assert_eq!(
            drain(&mut rx),
            vec![Outbound::Message(b"welcome".to_vec())]
        );
    }

    #[tokio::test]
    async fn test_disconnect_releases_membership() {
        let hub = Hub::with_session_mux(WorkerConfig::default());
        let (s, _rx) = connect("a", "a_1");
        hub.handle_connect(s.clone()).await;
        assert_eq!(hub.group_len("a").await, 1);

        hub.handle_disconnect(&s).await;
        hub.handle_disconnect(&s).await;

        assert_eq!(hub.group_len("a").await, 0);
        assert!(hub.is_empty());
        assert!(s.is_closed());
    }

    #[tokio::test]
    async fn test_close_group_with_msg_keeps_registry_until_disconnect() {
        let hub = Hub::with_session_mux(WorkerConfig::default());
        let (s, mut rx) = connect("a", "a_1");
        hub.handle_connect(s.clone()).await;

        let payload = crate::format_close_message(crate::CLOSE_NORMAL, "done");
        assert_eq!(hub.close_group_with_msg("a", &payload).await, 1);
        assert_eq!(drain(&mut rx), vec![Outbound::Close(payload)]);
        assert_eq!(hub.group_len("a").await, 1);

        hub.handle_disconnect(&s).await;
        assert_eq!(hub.group_len("a").await, 0);
    }

    #[tokio::test]
    async fn test_debug_info() {
        let hub = Hub::with_session_mux(WorkerConfig::default());
        let (s, _rx) = connect("ticker_a", "ticker_a_1");
        hub.handle_connect(s).await;
        hub.notify(
            "ticker_a",
            |_group, mut control, _hub| async move {
                control.stopped().await;
                Ok(())
            },
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        let state = hub.debug_info().await;
        assert_eq!(state.sessions["ticker_a"], vec!["ticker_a_1".to_string()]);
        assert_eq!(state.workers, vec!["ticker_a".to_string()]);

        let json = serde_json::to_value(&state).unwrap();
        assert!(json["sessions"].is_object());
        assert!(json["workers"].is_array());
    }

    #[tokio::test]
    async fn test_close_rejects_further_work() {
        let hub = Hub::with_session_mux(WorkerConfig::default());
        let (s, mut rx) = connect("a", "a_1");
        hub.handle_connect(s).await;

        assert_eq!(hub.close().await, Ok(1));
        assert!(hub.is_closed());
        assert_eq!(drain(&mut rx), vec![Outbound::Close(Vec::new())]);
        assert_eq!(hub.close().await, Err(HubError::Closed));

        let result = hub
            .notify("a", |_, _, _| async { Ok(()) }, Duration::from_secs(1))
            .await;
        assert_eq!(result, Err(HubError::Closed));

        let (late, _rx) = connect("a", "a_2");
        hub.handle_connect(late.clone()).await;
        assert!(late.is_closed());
    }
}
