use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::StoreSnapshot;

/// Whether a conversation is one-to-one or has several participants.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    /// One-to-one conversation.
    Direct,
    /// Multi-participant conversation; messages carry a sender display name.
    Group,
}

/// Conversation summary row as returned by the list fetch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    /// Thread identifier.
    pub thread_id: String,
    /// Best-effort display name.
    pub display_name: String,
    /// Direct or group conversation.
    pub kind: ConversationKind,
    /// Preview text of the latest message, when any.
    #[serde(default)]
    pub last_message_preview: Option<String>,
    /// Timestamp of the latest message in milliseconds since Unix epoch.
    #[serde(default)]
    pub last_message_at_ms: Option<u64>,
}

/// Who produced a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Sent by the signed-in user, from this client or another session.
    Own,
    /// Sent by another participant.
    Peer,
    /// Synthesized locally, for example a send-failure notice.
    System,
}

/// Coarse content kind used for fingerprinting and previews.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Image,
    Notice,
}

/// Message content as displayed in a thread.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    /// Plain text body.
    Text { body: String },
    /// Image descriptor. The push channel may omit both fields.
    Image {
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        file_name: Option<String>,
    },
    /// Local notice text (never sent over the wire).
    Notice { text: String },
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text { body: body.into() }
    }

    pub fn notice(text: impl Into<String>) -> Self {
        Self::Notice { text: text.into() }
    }

    pub fn kind(&self) -> ContentKind {
        match self {
            Self::Text { .. } => ContentKind::Text,
            Self::Image { .. } => ContentKind::Image,
            Self::Notice { .. } => ContentKind::Notice,
        }
    }

    /// Short text used for conversation list previews.
    pub fn preview_text(&self) -> String {
        match self {
            Self::Text { body } => body.trim().to_owned(),
            Self::Image { .. } => "[image]".to_owned(),
            Self::Notice { text } => text.clone(),
        }
    }
}

/// Message identifier: a local placeholder until the server assigns one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum MessageId {
    Local(String),
    Server(String),
}

impl MessageId {
    /// Generate a fresh local placeholder identifier.
    pub fn new_local() -> Self {
        Self::Local(format!("local-{}", Uuid::new_v4()))
    }

    pub fn server_id(&self) -> Option<&str> {
        match self {
            Self::Server(id) => Some(id),
            Self::Local(_) => None,
        }
    }

    pub fn local_id(&self) -> Option<&str> {
        match self {
            Self::Local(id) => Some(id),
            Self::Server(_) => None,
        }
    }

    /// Raw identifier, whichever scope it belongs to.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Local(id) | Self::Server(id) => id,
        }
    }
}

/// Per-message delivery state for optimistic sends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Shown optimistically, no server confirmation yet.
    Pending,
    /// Confirmed by the server (push echo, history fetch, or peer message).
    Confirmed,
    /// The network send failed; the entry is about to be rolled back.
    Failed,
}

impl DeliveryState {
    /// Only `Pending` may move, and only forward to `Confirmed` or `Failed`.
    pub fn can_advance_to(self, next: DeliveryState) -> bool {
        matches!(
            (self, next),
            (DeliveryState::Pending, DeliveryState::Confirmed)
                | (DeliveryState::Pending, DeliveryState::Failed)
        )
    }
}

/// One entry in a thread's ordered message list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub thread_id: String,
    pub origin: Origin,
    /// Sender display name (group threads only).
    pub sender_name: Option<String>,
    pub content: MessageContent,
    /// Milliseconds since Unix epoch, client- or server-assigned.
    pub timestamp_ms: u64,
    /// Server id of a quoted message, when present.
    pub quote_id: Option<String>,
    pub delivery: DeliveryState,
}

/// Payload of an inbound `message` push frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageEvent {
    pub thread_id: String,
    pub message_id: String,
    /// `true` when the signed-in user sent the message (an echo).
    pub is_self: bool,
    #[serde(default)]
    pub sender_name: Option<String>,
    pub content: MessageContent,
    pub timestamp_ms: u64,
    #[serde(default)]
    pub quote_id: Option<String>,
}

impl MessageEvent {
    pub fn origin(&self) -> Origin {
        if self.is_self { Origin::Own } else { Origin::Peer }
    }

    /// Convert into a confirmed message entry.
    pub fn into_message(self) -> Message {
        let origin = self.origin();
        Message {
            id: MessageId::Server(self.message_id),
            thread_id: self.thread_id,
            origin,
            sender_name: self.sender_name,
            content: self.content,
            timestamp_ms: self.timestamp_ms,
            quote_id: self.quote_id,
            delivery: DeliveryState::Confirmed,
        }
    }
}

/// Sort order requested from the history fetch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOrder {
    Ascending,
    Descending,
}

impl HistoryOrder {
    pub fn as_query_value(self) -> &'static str {
        match self {
            Self::Ascending => "asc",
            Self::Descending => "desc",
        }
    }
}

/// Image file handed to `send_image`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutgoingImage {
    pub file_name: String,
    /// MIME content type, for example `image/png`.
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Content submitted to the request/response send call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum OutgoingContent {
    Text(String),
    Image(OutgoingImage),
}

impl OutgoingContent {
    /// Content shown for the optimistic entry.
    pub fn display_content(&self) -> MessageContent {
        match self {
            Self::Text(body) => MessageContent::text(body.trim()),
            Self::Image(image) => MessageContent::Image {
                url: None,
                file_name: Some(image.file_name.clone()),
            },
        }
    }
}

/// Server acknowledgement of a successful send.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendReceipt {
    /// Server-assigned id; image uploads may not report one.
    #[serde(default)]
    pub message_id: Option<String>,
}

/// Send acknowledgement emitted to subscribers after the network call resolves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendAck {
    /// Local placeholder id of the optimistic entry.
    pub local_id: String,
    pub thread_id: String,
    /// Server id on success, when the server reported one.
    pub message_id: Option<String>,
    /// Stable error code on failure.
    pub error_code: Option<String>,
}

/// Liveness of the persistent push connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection has been attempted in this session.
    Idle,
    /// An open attempt is in flight.
    Connecting,
    /// Connected; keepalive running.
    Open,
    /// Connection closed. `normal` is `true` for intentional teardown.
    Closed { normal: bool },
}

/// Runtime tuning for one sync session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    pub keepalive_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub dedup_window_ms: u64,
    pub history_limit: u16,
    pub timeline_max_items: usize,
    pub conversation_refresh_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: 25_000,
            reconnect_delay_ms: 3_000,
            max_reconnect_attempts: 10,
            dedup_window_ms: 4_000,
            history_limit: 30,
            timeline_max_items: 1_200,
            conversation_refresh_interval_ms: 30_000,
        }
    }
}

impl SyncConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms.max(1))
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn conversation_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.conversation_refresh_interval_ms.max(1))
    }
}

/// Commands accepted by the session runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCommand {
    /// Fetch the conversation list and open the push connection.
    Start,
    /// Re-fetch the conversation list and replace it wholesale.
    RefreshConversations,
    /// Make a thread the open one and load its history.
    OpenThread { thread_id: String },
    /// Clear the open thread. In-flight sends still complete.
    CloseThread,
    SendText { thread_id: String, text: String },
    SendImage { thread_id: String, image: OutgoingImage },
    /// Logout: close the connection and stop the session.
    Teardown,
}

/// Events broadcast by the session runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncEvent {
    /// Push connection liveness changed.
    ConnectionChanged(ConnectionState),
    /// Rendered state changed; carries a full snapshot.
    StoreChanged(StoreSnapshot),
    /// A send finished at the network layer.
    SendAck(SendAck),
    /// Reconnection gave up after the configured number of attempts.
    ConnectionAbandoned { attempts: u32 },
    /// Non-fatal runtime error surfaced for display or logging.
    Error {
        code: String,
        message: String,
        /// Server-provided hint for when retrying may succeed.
        retry_after_ms: Option<u64>,
    },
}
