/// Wire formats exchanged with the transport adapter
///
/// Inbound frames are decoded once here into a discriminated union; nothing
/// downstream ever inspects raw text to guess what a frame is.
use crate::conversation::MessageEnvelope;
use crate::error::{ChatError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use uuid::Uuid;

/// Discriminator carried in the `type` field of every inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    DirectMessage,
    GroupMessage,
    FriendListResponse,
    GroupListResponse,
    FriendAddResponse,
    UserProfileResponse,
}

impl FrameType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::DirectMessage => "direct_message",
            FrameType::GroupMessage => "group_message",
            FrameType::FriendListResponse => "friend_list_response",
            FrameType::GroupListResponse => "group_list_response",
            FrameType::FriendAddResponse => "friend_add_response",
            FrameType::UserProfileResponse => "user_profile_response",
        }
    }

    /// Whether frames of this type are handled by the core rather than forwarded
    pub fn is_chat(&self) -> bool {
        matches!(self, FrameType::DirectMessage | FrameType::GroupMessage)
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of a direct or group chat frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    #[serde(deserialize_with = "string_or_number")]
    pub sender_id: String,
    /// Recipient user id (direct) or group id (group)
    #[serde(deserialize_with = "string_or_number")]
    pub recipient: String,
    pub content: String,
    /// Epoch milliseconds
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<Uuid>,
}

impl ChatPayload {
    /// Build the immutable envelope for this payload
    pub fn into_envelope(self, is_group: bool) -> Result<MessageEnvelope> {
        if self.sender_id.is_empty() || self.recipient.is_empty() {
            return Err(ChatError::Parse(
                "chat frame is missing sender or recipient".to_string(),
            ));
        }
        let sent_at = DateTime::<Utc>::from_timestamp_millis(self.timestamp).ok_or_else(|| {
            ChatError::Parse(format!("timestamp out of range: {}", self.timestamp))
        })?;

        let envelope = if is_group {
            MessageEnvelope::group(self.sender_id, self.recipient, self.content, sent_at)
        } else {
            MessageEnvelope::direct(self.sender_id, self.recipient, self.content, sent_at)
        };
        Ok(envelope
            .with_message_id(self.message_id)
            .with_client_id(self.client_id))
    }
}

/// A frame the core does not handle, passed on with its body untouched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalFrame {
    pub frame_type: FrameType,
    pub body: serde_json::Value,
}

/// Decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    DirectMessage(ChatPayload),
    GroupMessage(ChatPayload),
    External(ExternalFrame),
}

impl InboundFrame {
    /// Decode a frame from JSON bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let body: serde_json::Value = serde_json::from_slice(data)?;
        Self::from_value(body)
    }

    /// Decode a frame from an already-parsed JSON value
    pub fn from_value(body: serde_json::Value) -> Result<Self> {
        let tag = body
            .get("type")
            .cloned()
            .ok_or_else(|| ChatError::Parse("frame has no type field".to_string()))?;
        let frame_type: FrameType = serde_json::from_value(tag.clone())
            .map_err(|_| ChatError::Parse(format!("unknown frame type: {}", tag)))?;

        match frame_type {
            FrameType::DirectMessage => Ok(InboundFrame::DirectMessage(serde_json::from_value(body)?)),
            FrameType::GroupMessage => Ok(InboundFrame::GroupMessage(serde_json::from_value(body)?)),
            _ => Ok(InboundFrame::External(ExternalFrame { frame_type, body })),
        }
    }

    pub fn frame_type(&self) -> FrameType {
        match self {
            InboundFrame::DirectMessage(_) => FrameType::DirectMessage,
            InboundFrame::GroupMessage(_) => FrameType::GroupMessage,
            InboundFrame::External(frame) => frame.frame_type,
        }
    }
}

/// Frames the core hands to the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum OutboundFrame {
    SendDirect {
        recipient: String,
        content: String,
        client_id: Uuid,
    },
    SendGroup {
        group_id: String,
        content: String,
        client_id: Uuid,
    },
}

impl OutboundFrame {
    /// Serialize frame to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn client_id(&self) -> Uuid {
        match self {
            OutboundFrame::SendDirect { client_id, .. } => *client_id,
            OutboundFrame::SendGroup { client_id, .. } => *client_id,
        }
    }
}

/// Chat type as named by the history endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Private,
    Group,
}

impl ChatType {
    pub fn is_group(&self) -> bool {
        *self == ChatType::Group
    }
}

/// Backward page request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRequest {
    pub chat_type: ChatType,
    pub target_id: String,
    pub limit: usize,
    /// Exclusive upper bound in epoch milliseconds; `None` asks for the most recent page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_timestamp: Option<i64>,
}

/// One message as returned by the history endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    #[serde(deserialize_with = "string_or_number")]
    pub sender_id: String,
    pub content: String,
    /// `YYYY-MM-DD HH:MM:SS`
    pub timestamp_string: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub items: Vec<HistoryItem>,
}

impl HistoryResponse {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

// Servers are inconsistent about numeric vs string user ids.
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    })
}
