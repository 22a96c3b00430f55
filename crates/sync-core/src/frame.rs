use serde_json::Value;
use thiserror::Error;

use crate::types::{MessageContent, MessageEvent};

const KEEPALIVE_FRAME: &str = r#"{"type":"ping"}"#;

/// Close code of an intentional, caller-initiated closure.
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// Recognized inbound push frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// New message in a thread, from a peer or an echo of an own send.
    Message(MessageEvent),
    /// Liveness acknowledgement.
    Pong,
    /// Well-formed frame of a type this client does not handle.
    Unknown(String),
}

/// Errors produced while parsing a text frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("frame has no string 'type' field")]
    MissingType,
    #[error("'{kind}' frame has no payload")]
    MissingPayload { kind: String },
    #[error("invalid '{kind}' payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
}

/// Parse one inbound text frame.
pub fn parse_frame(text: &str) -> Result<InboundFrame, FrameError> {
    let mut value: Value =
        serde_json::from_str(text).map_err(|err| FrameError::InvalidJson(err.to_string()))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingType)?
        .to_owned();

    match kind.as_str() {
        "message" => {
            let payload = value
                .get_mut("payload")
                .map(Value::take)
                .filter(|payload| !payload.is_null())
                .ok_or_else(|| FrameError::MissingPayload { kind: kind.clone() })?;
            let event: MessageEvent =
                serde_json::from_value(payload).map_err(|err| FrameError::InvalidPayload {
                    kind: kind.clone(),
                    reason: err.to_string(),
                })?;
            validate_message_event(&kind, &event)?;
            Ok(InboundFrame::Message(event))
        }
        "pong" => Ok(InboundFrame::Pong),
        _ => Ok(InboundFrame::Unknown(kind)),
    }
}

/// Liveness ping sent on every keepalive tick.
pub fn keepalive_frame() -> &'static str {
    KEEPALIVE_FRAME
}

fn validate_message_event(kind: &str, event: &MessageEvent) -> Result<(), FrameError> {
    let invalid = |reason: &str| FrameError::InvalidPayload {
        kind: kind.to_owned(),
        reason: reason.to_owned(),
    };

    if event.thread_id.trim().is_empty() {
        return Err(invalid("empty thread_id"));
    }
    if event.message_id.trim().is_empty() {
        return Err(invalid("empty message_id"));
    }
    if matches!(event.content, MessageContent::Notice { .. }) {
        return Err(invalid("notice content is local-only"));
    }
    Ok(())
}
