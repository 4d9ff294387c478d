//! Group Hub - group-scoped broadcast over persistent connections
//!
//! Clients join a named group when they connect; a per-group producer task
//! pushes periodic messages to every connection currently in that group.
//! This crate has no HTTP dependencies: a transport accepts connections,
//! wraps each one in a [`Session`] and reports connect/disconnect to the
//! [`Hub`].
//!
//! Guarantees:
//! - at most one producer runs per group,
//! - a producer is stopped after its ttl or once its group is empty, and is
//!   aborted if it ignores the stop request for longer than the grace window,
//! - when a producer exits, every session of its group is closed and clients
//!   must reconnect to rejoin.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use group_hub::{Attachment, Hub, Session, WorkerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let hub = Hub::with_session_mux(WorkerConfig::default());
//!
//!     // Transport side: a connection was accepted for group "ticker_a"
//!     let attachment = Attachment::new("ticker_a", "ticker_a_1").unwrap();
//!     let (session, mut outbound) = Session::new(attachment);
//!     hub.handle_connect(session).await;
//!
//!     // Request handler side: make sure a producer runs for the group
//!     hub.notify(
//!         "ticker_a",
//!         |group, mut control, hub| async move {
//!             let mut tick = tokio::time::interval(Duration::from_secs(2));
//!             loop {
//!                 tokio::select! {
//!                     _ = control.stopped() => break,
//!                     _ = tick.tick() => {
//!                         let _ = hub.group_broadcast(b"tick", &group).await;
//!                     }
//!                 }
//!             }
//!             control.ack();
//!             Ok(())
//!         },
//!         Duration::from_secs(24 * 3600),
//!     )
//!     .await
//!     .unwrap();
//!
//!     while let Some(frame) = outbound.recv().await {
//!         println!("{:?}", frame);
//!     }
//! }
//! ```

mod error;
mod hub;
mod message;
mod mux;
mod registry;
mod session;
mod worker;

pub use error::HubError;
pub use hub::{Hub, HubState};
pub use message::NotifyMessage;
pub use mux::{Delivery, Multiplexer, SessionMux};
pub use registry::Registry;
pub use session::{
    Attachment, CLOSE_GOING_AWAY, CLOSE_NORMAL, OUTBOUND_CAPACITY, Outbound, Outbox, Session,
    SessionId, format_close_message, parse_close_message,
};
pub use worker::{StopSignal, WorkerConfig, WorkerControl};
