//! Optimistic send bookkeeping around the request/response call.
//!
//! `begin` runs synchronously before the network call: it records the
//! fingerprint, appends the optimistic entry and updates the preview. The
//! caller then performs the call and hands the result to `complete`, which
//! leaves the entry for the push echo on success and rolls it back on failure.

use std::time::Instant;

use tracing::{debug, warn};

use crate::{
    dedup::{DedupLedger, Fingerprint},
    error::{SyncError, SyncErrorCategory},
    normalization::{SendOutcome, normalize_send_outcome, send_failure_notice},
    store::ThreadStore,
    types::{MessageId, OutgoingContent, SendAck},
};

/// A send whose network call has not resolved yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundSend {
    pub local_id: String,
    pub thread_id: String,
    pub fingerprint: Fingerprint,
    pub content: OutgoingContent,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SendPipeline;

impl SendPipeline {
    /// Register the send locally before the network call.
    pub fn begin(
        &self,
        store: &mut ThreadStore,
        ledger: &mut DedupLedger,
        thread_id: &str,
        content: OutgoingContent,
        now: Instant,
        now_ms: u64,
    ) -> Result<OutboundSend, SyncError> {
        validate(thread_id, &content)?;

        let display = content.display_content();
        let fingerprint = Fingerprint::of(&display);
        let local_id = MessageId::new_local().as_str().to_owned();

        ledger.record(thread_id, fingerprint.clone(), now);
        store.append_optimistic_message(thread_id, local_id.clone(), display.clone(), now_ms);
        store.upsert_conversation_preview(thread_id, display.preview_text(), now_ms);
        debug!(%thread_id, %local_id, "optimistic send registered");

        Ok(OutboundSend {
            local_id,
            thread_id: thread_id.to_owned(),
            fingerprint,
            content,
        })
    }

    /// Settle a send after its network call resolved.
    pub fn complete(
        &self,
        store: &mut ThreadStore,
        ledger: &mut DedupLedger,
        send: &OutboundSend,
        outcome: &SendOutcome,
        now_ms: u64,
    ) -> SendAck {
        if let SendOutcome::Failure { error } = outcome {
            warn!(
                thread_id = %send.thread_id,
                local_id = %send.local_id,
                code = %error.code,
                "send failed; rolling back optimistic entry"
            );
            if self.roll_back(store, ledger, send) {
                store.append_notice(&send.thread_id, send_failure_notice(error), now_ms);
            }
        } else {
            debug!(thread_id = %send.thread_id, local_id = %send.local_id, "send accepted by server");
        }

        normalize_send_outcome(send.local_id.clone(), send.thread_id.clone(), outcome)
    }

    /// Remove the optimistic entry and its ledger record.
    ///
    /// Returns `false` when the entry is no longer pending: an echo already
    /// confirmed it and consumed its record, so the message was delivered.
    fn roll_back(&self, store: &mut ThreadStore, ledger: &mut DedupLedger, send: &OutboundSend) -> bool {
        if let Err(err) = store.mark_failed(&send.thread_id, &send.local_id) {
            debug!(error = %err, "no pending entry to roll back");
            return false;
        }
        if let Err(err) = store.remove_message(&send.thread_id, &send.local_id) {
            warn!(error = %err, "failed entry vanished before rollback");
        }
        ledger.forget(&send.thread_id, &send.fingerprint);
        true
    }
}

fn validate(thread_id: &str, content: &OutgoingContent) -> Result<(), SyncError> {
    if thread_id.trim().is_empty() {
        return Err(SyncError::new(
            SyncErrorCategory::Config,
            "missing_thread",
            "a thread must be selected before sending",
        ));
    }
    match content {
        OutgoingContent::Text(body) if body.trim().is_empty() => Err(SyncError::new(
            SyncErrorCategory::Config,
            "empty_message",
            "message text is empty",
        )),
        OutgoingContent::Image(image) if image.data.is_empty() => Err(SyncError::new(
            SyncErrorCategory::Config,
            "empty_image",
            format!("image '{}' has no data", image.file_name),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        reconciler::SyncReconciler,
        types::{
            Conversation, ConversationKind, DeliveryState, MessageContent, MessageEvent, Origin,
            OutgoingImage, SendReceipt,
        },
    };

    fn setup() -> (ThreadStore, DedupLedger) {
        let mut store = ThreadStore::new(100);
        store.replace_conversations(vec![Conversation {
            thread_id: "T1".into(),
            display_name: "Front desk".into(),
            kind: ConversationKind::Group,
            last_message_preview: None,
            last_message_at_ms: None,
        }]);
        store.open_thread("T1");
        (store, DedupLedger::default())
    }

    fn success() -> SendOutcome {
        SendOutcome::Success {
            receipt: SendReceipt {
                message_id: Some("m-42".into()),
            },
        }
    }

    #[test]
    fn begin_registers_ledger_optimistic_entry_and_preview() {
        let (mut store, mut ledger) = setup();
        let now = Instant::now();

        let send = SendPipeline
            .begin(&mut store, &mut ledger, "T1", OutgoingContent::Text(" Hello ".into()), now, 77)
            .expect("send should begin");

        assert_eq!(send.fingerprint, Fingerprint::Text("Hello".into()));
        assert_eq!(ledger.pending_count("T1", now), 1);
        let messages = store.messages("T1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].origin, Origin::Own);
        assert_eq!(messages[0].delivery, DeliveryState::Pending);
        assert_eq!(messages[0].content, MessageContent::text("Hello"));
        assert_eq!(
            store.conversations()[0].last_message_preview.as_deref(),
            Some("Hello")
        );
    }

    #[test]
    fn rejects_empty_text_without_touching_state() {
        let (mut store, mut ledger) = setup();
        let revision = store.revision();

        let err = SendPipeline
            .begin(&mut store, &mut ledger, "T1", OutgoingContent::Text("   ".into()), Instant::now(), 1)
            .expect_err("empty text must be rejected");

        assert_eq!(err.code, "empty_message");
        assert_eq!(store.revision(), revision);
    }

    #[test]
    fn success_leaves_optimistic_entry_for_echo() {
        let (mut store, mut ledger) = setup();
        let now = Instant::now();
        let send = SendPipeline
            .begin(&mut store, &mut ledger, "T1", OutgoingContent::Text("Hello".into()), now, 1)
            .expect("send should begin");

        let ack = SendPipeline.complete(&mut store, &mut ledger, &send, &success(), 2);

        assert_eq!(ack.message_id.as_deref(), Some("m-42"));
        assert_eq!(ack.error_code, None);
        assert_eq!(store.messages("T1").len(), 1);
        assert_eq!(store.messages("T1")[0].delivery, DeliveryState::Pending);
    }

    #[test]
    fn failure_rolls_back_and_appends_one_notice() {
        let (mut store, mut ledger) = setup();
        let now = Instant::now();
        let send = SendPipeline
            .begin(&mut store, &mut ledger, "T1", OutgoingContent::Text("Hello".into()), now, 1)
            .expect("send should begin");

        let outcome = SendOutcome::Failure {
            error: SyncError::new(SyncErrorCategory::Network, "send_failed", "connection reset"),
        };
        let ack = SendPipeline.complete(&mut store, &mut ledger, &send, &outcome, 2);

        assert_eq!(ack.error_code.as_deref(), Some("send_failed"));
        let messages = store.messages("T1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].origin, Origin::System);
        assert!(matches!(messages[0].content, MessageContent::Notice { .. }));
        assert_eq!(ledger.pending_count("T1", now), 0);
    }

    #[test]
    fn echo_before_response_then_success_keeps_single_entry() {
        let (mut store, mut ledger) = setup();
        let mut reconciler = SyncReconciler::default();
        let now = Instant::now();
        let send = SendPipeline
            .begin(&mut store, &mut ledger, "T1", OutgoingContent::Text("Hello".into()), now, 1)
            .expect("send should begin");

        reconciler.apply_message_event(
            &mut store,
            &mut ledger,
            MessageEvent {
                thread_id: "T1".into(),
                message_id: "m-42".into(),
                is_self: true,
                sender_name: None,
                content: MessageContent::text("Hello"),
                timestamp_ms: 3,
                quote_id: None,
            },
            now + Duration::from_millis(50),
        );
        SendPipeline.complete(&mut store, &mut ledger, &send, &success(), 4);

        let messages = store.messages("T1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id.server_id(), Some("m-42"));
    }

    fn echo(message_id: &str, body: &str, timestamp_ms: u64) -> MessageEvent {
        MessageEvent {
            thread_id: "T1".into(),
            message_id: message_id.into(),
            is_self: true,
            sender_name: None,
            content: MessageContent::text(body),
            timestamp_ms,
            quote_id: None,
        }
    }

    #[test]
    fn failure_after_echo_confirmed_entry_leaves_other_send_intact() {
        let (mut store, mut ledger) = setup();
        let mut reconciler = SyncReconciler::default();
        let now = Instant::now();
        let first = SendPipeline
            .begin(&mut store, &mut ledger, "T1", OutgoingContent::Text("ok".into()), now, 1)
            .expect("first send should begin");
        let second = SendPipeline
            .begin(&mut store, &mut ledger, "T1", OutgoingContent::Text("ok".into()), now, 2)
            .expect("second send should begin");

        reconciler.apply_message_event(&mut store, &mut ledger, echo("m-1", "ok", 3), now);
        let outcome = SendOutcome::Failure {
            error: SyncError::new(SyncErrorCategory::Network, "send_failed", "timed out"),
        };
        SendPipeline.complete(&mut store, &mut ledger, &first, &outcome, 4);

        assert_eq!(ledger.pending_count("T1", now), 1);
        reconciler.apply_message_event(&mut store, &mut ledger, echo("m-2", "ok", 5), now);
        SendPipeline.complete(&mut store, &mut ledger, &second, &success(), 6);

        let messages = store.messages("T1");
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|message| message.origin == Origin::Own));
        assert_eq!(messages[0].id.server_id(), Some("m-1"));
        assert_eq!(messages[1].id.server_id(), Some("m-2"));
        assert!(messages.iter().all(|message| message.delivery == DeliveryState::Confirmed));
        assert_eq!(ledger.pending_count("T1", now), 0);
    }

    #[test]
    fn send_to_background_thread_completes_after_close() {
        let (mut store, mut ledger) = setup();
        let now = Instant::now();
        let send = SendPipeline
            .begin(&mut store, &mut ledger, "T1", OutgoingContent::Text("bye".into()), now, 1)
            .expect("send should begin");
        store.close_thread();

        let outcome = SendOutcome::Failure {
            error: SyncError::new(SyncErrorCategory::Network, "send_failed", "offline"),
        };
        SendPipeline.complete(&mut store, &mut ledger, &send, &outcome, 2);

        assert_eq!(store.messages("T1").len(), 1);
        assert_eq!(store.messages("T1")[0].origin, Origin::System);
    }

    #[test]
    fn image_send_uses_kind_fingerprint() {
        let (mut store, mut ledger) = setup();
        let send = SendPipeline
            .begin(
                &mut store,
                &mut ledger,
                "T1",
                OutgoingContent::Image(OutgoingImage {
                    file_name: "repair.jpg".into(),
                    content_type: "image/jpeg".into(),
                    data: vec![0xFF, 0xD8],
                }),
                Instant::now(),
                1,
            )
            .expect("image send should begin");

        assert_eq!(
            send.fingerprint,
            Fingerprint::Kind(crate::types::ContentKind::Image)
        );
        assert_eq!(
            store.conversations()[0].last_message_preview.as_deref(),
            Some("[image]")
        );
    }
}
