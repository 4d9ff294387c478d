use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HubError;

/// JSON envelope for messages pushed to clients.
///
/// Serializes as `{"type": .., "code": .., "message": .., "data": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyMessage {
    #[serde(rename = "type")]
    pub kind: String,
    /// 0 on success; producers pick their own non-zero codes
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

impl NotifyMessage {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            code: 0,
            message: message.into(),
            data: Value::Null,
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = code;
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Wire form, ready for [`Hub::group_broadcast`](crate::Hub::group_broadcast).
    pub fn to_bytes(&self) -> Result<Vec<u8>, HubError> {
        serde_json::to_vec(self).map_err(|e| HubError::Encode(e.to_string()))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, HubError> {
        serde_json::from_slice(bytes).map_err(|e| HubError::Encode(e.to_string()))
    }
}
