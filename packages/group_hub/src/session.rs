use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

use crate::error::HubError;

/// Normal closure, as defined by RFC 6455.
pub const CLOSE_NORMAL: u16 = 1000;
/// Endpoint is going away (server shutdown).
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Messages a session may have queued before writes are refused.
pub const OUTBOUND_CAPACITY: usize = 100;

/// Unique identifier for a session (server-generated)
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata decided when a connection is accepted. Immutable afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    group: String,
    id: String,
    greeting: Option<String>,
}

impl Attachment {
    /// Build an attachment, rejecting an empty group key.
    pub fn new(group: impl Into<String>, id: impl Into<String>) -> Result<Self, HubError> {
        let group = group.into();
        if group.trim().is_empty() {
            return Err(HubError::InvalidAttachment(
                "group must not be empty".to_string(),
            ));
        }
        let id = id.into();
        Ok(Self {
            group,
            id,
            greeting: None,
        })
    }

    /// Message written to the session once, right after it joins its group.
    pub fn with_greeting(mut self, greeting: impl Into<String>) -> Self {
        self.greeting = Some(greeting.into());
        self
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Display id used in diagnostics. Falls back to "unknown" when empty.
    pub fn id(&self) -> &str {
        if self.id.is_empty() { "unknown" } else { &self.id }
    }

    pub fn greeting(&self) -> Option<&str> {
        self.greeting.as_deref()
    }
}

/// Frames queued for the transport to write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Message(Vec<u8>),
    /// Close frame payload; empty means "no status code".
    Close(Vec<u8>),
}

/// Receiving half of a session, drained by the transport.
///
/// Queued messages come out first; the close frame travels on its own slot
/// so a full queue never holds it back.
#[derive(Debug)]
pub struct Outbox {
    messages: mpsc::Receiver<Vec<u8>>,
    close: Option<oneshot::Receiver<Vec<u8>>>,
}

impl Outbox {
    /// Next frame to write. `None` once the close frame has been handed out
    /// or the session is gone. Cancel safe.
    pub async fn recv(&mut self) -> Option<Outbound> {
        if let Ok(msg) = self.messages.try_recv() {
            return Some(Outbound::Message(msg));
        }
        let close = self.close.as_mut()?;

        let next = tokio::select! {
            biased;
            msg = self.messages.recv() => Ok(msg),
            payload = close => Err(payload.ok()),
        };
        match next {
            Ok(Some(msg)) => Some(Outbound::Message(msg)),
            Ok(None) => {
                let payload = self.close.as_mut()?.await.ok();
                self.close = None;
                payload.map(Outbound::Close)
            }
            Err(payload) => {
                self.close = None;
                payload.map(Outbound::Close)
            }
        }
    }

    /// Non-blocking variant of [`Outbox::recv`].
    pub fn try_recv(&mut self) -> Option<Outbound> {
        if let Ok(msg) = self.messages.try_recv() {
            return Some(Outbound::Message(msg));
        }
        match self.close.as_mut()?.try_recv() {
            Err(TryRecvError::Empty) => None,
            Ok(payload) => {
                self.close = None;
                Some(Outbound::Close(payload))
            }
            Err(TryRecvError::Closed) => {
                self.close = None;
                None
            }
        }
    }
}

/// Handle to a live connection.
///
/// The transport owns the socket and drains the [`Outbox`] returned by
/// [`Session::new`]; everything else only queues frames.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    attachment: Attachment,
    tx: mpsc::Sender<Vec<u8>>,
    close_tx: Mutex<Option<oneshot::Sender<Vec<u8>>>>,
    closed: AtomicBool,
}

impl Session {
    pub fn new(attachment: Attachment) -> (Arc<Self>, Outbox) {
        Self::with_capacity(attachment, OUTBOUND_CAPACITY)
    }

    /// Session whose queue holds at most `capacity` messages (minimum 1).
    pub fn with_capacity(attachment: Attachment, capacity: usize) -> (Arc<Self>, Outbox) {
        let (tx, messages) = mpsc::channel(capacity.max(1));
        let (close_tx, close) = oneshot::channel();
        let session = Arc::new(Self {
            id: SessionId::new(),
            attachment,
            tx,
            close_tx: Mutex::new(Some(close_tx)),
            closed: AtomicBool::new(false),
        });
        let outbox = Outbox {
            messages,
            close: Some(close),
        };
        (session, outbox)
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn attachment(&self) -> &Attachment {
        &self.attachment
    }

    pub fn group(&self) -> &str {
        self.attachment.group()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue a message without waiting.
    ///
    /// Fails with [`HubError::QueueFull`] while the transport is behind, and
    /// with [`HubError::SessionClosed`] once the session is closed or its
    /// transport is gone.
    pub fn write(&self, msg: &[u8]) -> Result<(), HubError> {
        if self.is_closed() {
            return Err(HubError::SessionClosed);
        }
        match self.tx.try_send(msg.to_vec()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(HubError::QueueFull),
            Err(TrySendError::Closed(_)) => {
                // Outbox dropped: the socket pump has already exited.
                self.closed.store(true, Ordering::Release);
                Err(HubError::SessionClosed)
            }
        }
    }

    /// Close without a status payload. Returns false if already closed.
    pub fn close(&self) -> bool {
        self.close_with_msg(&[])
    }

    /// Close with a close-frame payload (see [`format_close_message`]).
    /// Only the first call queues a frame.
    pub fn close_with_msg(&self, msg: &[u8]) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let close_tx = self.close_tx.lock().ok().and_then(|mut slot| slot.take());
        if let Some(tx) = close_tx {
            let _ = tx.send(msg.to_vec());
        }
        true
    }
}

/// Encode a websocket close payload: big-endian status code followed by the
/// UTF-8 reason.
pub fn format_close_message(code: u16, reason: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + reason.len());
    buf.extend_from_slice(&code.to_be_bytes());
    buf.extend_from_slice(reason.as_bytes());
    buf
}

/// Decode a payload produced by [`format_close_message`].
///
/// Returns `None` for an empty payload or one too short to carry a code.
pub fn parse_close_message(payload: &[u8]) -> Option<(u16, String)> {
    if payload.len() < 2 {
        return None;
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    Some((code, reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(group: &str) -> Attachment {
        Attachment::new(group, format!("{group}_1")).unwrap()
    }

    #[test]
    fn test_attachment_rejects_empty_group() {
        assert!(matches!(
            Attachment::new("", "id"),
            Err(HubError::InvalidAttachment(_))
        ));
        assert!(Attachment::new("   ", "id").is_err());
    }

    #[test]
    fn test_attachment_id_falls_back_to_unknown() {
        let a = Attachment::new("ticker_a", "").unwrap();
        assert_eq!(a.id(), "unknown");
        assert!(a.greeting().is_none());

        let a = a.with_greeting("hello");
        assert_eq!(a.greeting(), Some("hello"));
    }

    #[tokio::test]
    async fn test_write_queues_message() {
        let (session, mut rx) = Session::new(attachment("ticker_a"));
        session.write(b"ticker_a: 0").unwrap();
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Message(b"ticker_a: 0".to_vec()))
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (session, mut rx) = Session::new(attachment("ticker_a"));
        assert!(session.close_with_msg(b"bye"));
        assert!(!session.close());
        assert!(session.is_closed());

        assert_eq!(rx.recv().await, Some(Outbound::Close(b"bye".to_vec())));
        assert!(rx.try_recv().is_none());
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_full_queue_refuses_write_until_drained() {
        let (session, mut rx) = Session::with_capacity(attachment("ticker_a"), 2);
        session.write(b"1").unwrap();
        session.write(b"2").unwrap();
        assert_eq!(session.write(b"3"), Err(HubError::QueueFull));
        assert!(!session.is_closed());

        assert_eq!(rx.try_recv(), Some(Outbound::Message(b"1".to_vec())));
        session.write(b"3").unwrap();
    }

    #[tokio::test]
    async fn test_close_frame_skips_full_queue() {
        let (session, mut rx) = Session::with_capacity(attachment("ticker_a"), 1);
        session.write(b"pending").unwrap();
        assert_eq!(session.write(b"dropped"), Err(HubError::QueueFull));
        assert!(session.close_with_msg(b"bye"));

        assert_eq!(rx.recv().await, Some(Outbound::Message(b"pending".to_vec())));
        assert_eq!(rx.recv().await, Some(Outbound::Close(b"bye".to_vec())));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_write_after_close_fails() {
        let (session, _rx) = Session::new(attachment("ticker_a"));
        session.close();
        assert_eq!(session.write(b"late"), Err(HubError::SessionClosed));
    }

    #[test]
    fn test_write_marks_closed_when_transport_gone() {
        let (session, rx) = Session::new(attachment("ticker_a"));
        drop(rx);
        assert_eq!(session.write(b"x"), Err(HubError::SessionClosed));
        assert!(session.is_closed());
    }

    #[test]
    fn test_close_message_format() {
        let payload = format_close_message(CLOSE_GOING_AWAY, "shutting down");
        assert_eq!(&payload[..2], &[0x03, 0xE9]);
        assert_eq!(
            parse_close_message(&payload),
            Some((CLOSE_GOING_AWAY, "shutting down".to_string()))
        );
        assert_eq!(parse_close_message(&[]), None);
        assert_eq!(parse_close_message(&[0x03]), None);
    }
}
