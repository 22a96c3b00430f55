use crate::{
    error::SyncError,
    types::{SendAck, SendReceipt, SyncEvent},
};

/// Send call result before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The server accepted the message.
    Success { receipt: SendReceipt },
    /// The network call failed.
    Failure { error: SyncError },
}

impl From<Result<SendReceipt, SyncError>> for SendOutcome {
    fn from(result: Result<SendReceipt, SyncError>) -> Self {
        match result {
            Ok(receipt) => Self::Success { receipt },
            Err(error) => Self::Failure { error },
        }
    }
}

/// Build the stable acknowledgement for a finished send.
pub fn normalize_send_outcome(
    local_id: impl Into<String>,
    thread_id: impl Into<String>,
    outcome: &SendOutcome,
) -> SendAck {
    let local_id = local_id.into();
    let thread_id = thread_id.into();
    match outcome {
        SendOutcome::Success { receipt } => SendAck {
            local_id,
            thread_id,
            message_id: receipt.message_id.clone(),
            error_code: None,
        },
        SendOutcome::Failure { error } => SendAck {
            local_id,
            thread_id,
            message_id: None,
            error_code: Some(error.code.clone()),
        },
    }
}

/// Convert an error into a broadcast `Error` event.
pub fn normalize_error_event(error: &SyncError) -> SyncEvent {
    SyncEvent::Error {
        code: error.code.clone(),
        message: error.message.clone(),
        retry_after_ms: error.retry_after_ms,
    }
}

/// Text of the in-thread notice shown after a failed send.
pub fn send_failure_notice(error: &SyncError) -> String {
    format!("Message could not be sent ({})", error.code)
}
