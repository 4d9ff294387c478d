/// Errors that can occur during hub operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    /// Broadcast targeted a group with no connected sessions
    #[error("no active session in group {group}")]
    NoActiveSession { group: String },

    /// The session has already been closed
    #[error("session is closed")]
    SessionClosed,

    /// The session's outbound queue is full; the message was dropped
    #[error("outbound queue is full")]
    QueueFull,

    /// Connection metadata failed validation at connect time
    #[error("invalid attachment: {0}")]
    InvalidAttachment(String),

    /// The hub has been shut down
    #[error("hub is closed")]
    Closed,

    /// A message could not be serialized
    #[error("encode failed: {0}")]
    Encode(String),

    /// A producer gave up with an error of its own
    #[error("producer failed: {0}")]
    Producer(String),
}

impl HubError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::NoActiveSession { .. } => "no_active_session",
            Self::SessionClosed => "session_closed",
            Self::QueueFull => "queue_full",
            Self::InvalidAttachment(_) => "invalid_attachment",
            Self::Closed => "hub_closed",
            Self::Encode(_) => "encode_failed",
            Self::Producer(_) => "producer_failed",
        }
    }
}
