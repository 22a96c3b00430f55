//! Core model of a live conversation sync session.
//!
//! This crate holds everything that does not touch the network: the command
//! and event protocol, the connection state machine, the dedup ledger, the
//! thread store and the reconciler and send pipeline that mutate it.

/// Async command/event channel primitives.
pub mod channel;
/// Fingerprint ledger matching push echoes to optimistic sends.
pub mod dedup;
/// Stable error types and HTTP classification helpers.
pub mod error;
/// Push frame wire format.
pub mod frame;
/// Event normalization helpers (for example send acknowledgements).
pub mod normalization;
/// Applies inbound message events to the store.
pub mod reconciler;
/// Reconnect policy.
pub mod retry;
/// Optimistic send bookkeeping.
pub mod send;
/// Push connection state machine.
pub mod state_machine;
/// Conversation list and per-thread message lists.
pub mod store;
/// Frontend-facing protocol types (commands, events, payloads).
pub mod types;

pub use channel::{EventStream, SyncChannelError, SyncChannels};
pub use dedup::{DedupLedger, Fingerprint};
pub use error::{SyncError, SyncErrorCategory, classify_http_status};
pub use frame::{FrameError, InboundFrame, NORMAL_CLOSE_CODE, keepalive_frame, parse_frame};
pub use normalization::{SendOutcome, normalize_error_event, normalize_send_outcome};
pub use reconciler::{ReconcileOutcome, ReconcileStats, SyncReconciler};
pub use retry::RetryPolicy;
pub use send::{OutboundSend, SendPipeline};
pub use state_machine::{CloseOutcome, ConnectionStateMachine};
pub use store::{ChangeCallback, StoreError, StoreSnapshot, ThreadStore};
pub use types::{
    ContentKind, Conversation, ConversationKind, ConnectionState, DeliveryState, HistoryOrder,
    Message, MessageContent, MessageEvent, MessageId, Origin, OutgoingContent, OutgoingImage,
    SendAck, SendReceipt, SyncCommand, SyncConfig, SyncEvent,
};
