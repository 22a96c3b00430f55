//! Turns one inbound message event into exactly one store mutation.

use std::time::Instant;

use tracing::{debug, warn};

use crate::{
    dedup::{DedupLedger, Fingerprint},
    frame::FrameError,
    store::ThreadStore,
    types::{Message, MessageEvent, Origin},
};

/// What the reconciler did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Only the conversation preview was touched.
    PreviewOnly,
    /// An own echo matched a pending send; the optimistic entry was confirmed.
    Promoted { local_id: String, message_id: String },
    /// A new confirmed entry was appended.
    Appended,
    /// The server id was already present; nothing changed.
    Duplicate,
}

/// Running totals, mostly for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub promoted: u64,
    pub appended: u64,
    pub duplicates: u64,
    pub preview_only: u64,
    pub absorbed_by_history: u64,
    pub dropped_frames: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SyncReconciler {
    stats: ReconcileStats,
}

impl SyncReconciler {
    pub fn stats(&self) -> ReconcileStats {
        self.stats
    }

    /// Count and log a frame that failed to parse.
    pub fn record_dropped(&mut self, err: &FrameError) {
        self.stats.dropped_frames += 1;
        warn!(error = %err, "dropping malformed push frame");
    }

    /// Apply one message event.
    ///
    /// The preview is always updated. The message list is touched only when
    /// the thread is open, or when it is a known thread and the event came
    /// from a peer. Own echoes first try to consume a pending send.
    pub fn apply_message_event(
        &mut self,
        store: &mut ThreadStore,
        ledger: &mut DedupLedger,
        event: MessageEvent,
        now: Instant,
    ) -> ReconcileOutcome {
        let thread_id = event.thread_id.clone();
        let origin = event.origin();

        store.upsert_conversation_preview(&thread_id, event.content.preview_text(), event.timestamp_ms);

        let relevant = store.is_open(&thread_id)
            || (store.knows_conversation(&thread_id) && origin == Origin::Peer);
        if !relevant {
            self.stats.preview_only += 1;
            return ReconcileOutcome::PreviewOnly;
        }

        if origin == Origin::Own {
            let fingerprint = Fingerprint::of(&event.content);
            if ledger.try_consume(&thread_id, &fingerprint, now)
                && let Some(local_id) = store.find_pending(&thread_id, &fingerprint)
            {
                let message_id = event.message_id.clone();
                match store.promote_optimistic_to_confirmed(
                    &thread_id,
                    &local_id,
                    &message_id,
                    event.content.clone(),
                    event.timestamp_ms,
                ) {
                    Ok(()) => {
                        debug!(%thread_id, %local_id, %message_id, "echo promoted optimistic entry");
                        self.stats.promoted += 1;
                        return ReconcileOutcome::Promoted {
                            local_id,
                            message_id,
                        };
                    }
                    Err(err) => {
                        warn!(%thread_id, error = %err, "promotion failed; appending echo instead");
                    }
                }
            }
        }

        self.append_confirmed(store, event)
    }

    /// Install fetched history (oldest first) for a thread.
    ///
    /// Pending sends whose server copy is already in the history leave the
    /// list, and their ledger records are consumed. This covers echoes that
    /// arrived while the thread was closed.
    pub fn apply_history(
        &mut self,
        store: &mut ThreadStore,
        ledger: &mut DedupLedger,
        thread_id: &str,
        history: Vec<Message>,
        now: Instant,
    ) {
        let skew_ms = u64::try_from(ledger.window().as_millis()).unwrap_or(u64::MAX);
        for fingerprint in store.replace_history(thread_id, history, skew_ms) {
            ledger.try_consume(thread_id, &fingerprint, now);
            self.stats.absorbed_by_history += 1;
        }
    }

    fn append_confirmed(&mut self, store: &mut ThreadStore, event: MessageEvent) -> ReconcileOutcome {
        if store.append_confirmed_message(event.into_message()) {
            self.stats.appended += 1;
            ReconcileOutcome::Appended
        } else {
            self.stats.duplicates += 1;
            ReconcileOutcome::Duplicate
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::types::{
        Conversation, ConversationKind, DeliveryState, MessageContent, MessageId,
    };

    fn conversation(thread_id: &str) -> Conversation {
        Conversation {
            thread_id: thread_id.to_owned(),
            display_name: thread_id.to_owned(),
            kind: ConversationKind::Direct,
            last_message_preview: None,
            last_message_at_ms: None,
        }
    }

    fn event(thread_id: &str, message_id: &str, is_self: bool, body: &str) -> MessageEvent {
        MessageEvent {
            thread_id: thread_id.to_owned(),
            message_id: message_id.to_owned(),
            is_self,
            sender_name: None,
            content: MessageContent::text(body),
            timestamp_ms: 1_700_000_000_500,
            quote_id: None,
        }
    }

    fn setup() -> (ThreadStore, DedupLedger, SyncReconciler) {
        let mut store = ThreadStore::new(100);
        store.replace_conversations(vec![conversation("T1"), conversation("T2")]);
        store.open_thread("T1");
        (store, DedupLedger::default(), SyncReconciler::default())
    }

    #[test]
    fn echo_of_own_send_promotes_instead_of_duplicating() {
        let (mut store, mut ledger, mut reconciler) = setup();
        let sent_at = Instant::now();
        ledger.record("T1", Fingerprint::of(&MessageContent::text("Hello")), sent_at);
        store.append_optimistic_message("T1", "local-1", MessageContent::text("Hello"), 1);

        let outcome = reconciler.apply_message_event(
            &mut store,
            &mut ledger,
            event("T1", "m-42", true, "Hello"),
            sent_at + Duration::from_millis(200),
        );

        assert_eq!(
            outcome,
            ReconcileOutcome::Promoted {
                local_id: "local-1".into(),
                message_id: "m-42".into(),
            }
        );
        let messages = store.messages("T1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, MessageId::Server("m-42".into()));
        assert_eq!(messages[0].delivery, DeliveryState::Confirmed);
        assert_eq!(ledger.pending_count("T1", sent_at), 0);
    }

    #[test]
    fn own_message_from_another_session_is_appended() {
        let (mut store, mut ledger, mut reconciler) = setup();

        let outcome = reconciler.apply_message_event(
            &mut store,
            &mut ledger,
            event("T1", "m-50", true, "sent from phone"),
            Instant::now(),
        );

        assert_eq!(outcome, ReconcileOutcome::Appended);
        assert_eq!(store.messages("T1")[0].origin, Origin::Own);
    }

    #[test]
    fn late_echo_after_window_appends_alongside_optimistic_entry() {
        let (mut store, mut ledger, mut reconciler) = setup();
        let sent_at = Instant::now();
        ledger.record("T1", Fingerprint::of(&MessageContent::text("Hello")), sent_at);
        store.append_optimistic_message("T1", "local-1", MessageContent::text("Hello"), 1);

        let outcome = reconciler.apply_message_event(
            &mut store,
            &mut ledger,
            event("T1", "m-42", true, "Hello"),
            sent_at + Duration::from_millis(4_500),
        );

        assert_eq!(outcome, ReconcileOutcome::Appended);
        assert_eq!(store.messages("T1").len(), 2);
    }

    #[test]
    fn repeated_push_event_is_idempotent() {
        let (mut store, mut ledger, mut reconciler) = setup();
        let now = Instant::now();

        reconciler.apply_message_event(&mut store, &mut ledger, event("T1", "m-1", false, "Hi"), now);
        let before = store.messages("T1").len();
        let outcome =
            reconciler.apply_message_event(&mut store, &mut ledger, event("T1", "m-1", false, "Hi"), now);

        assert_eq!(outcome, ReconcileOutcome::Duplicate);
        assert_eq!(store.messages("T1").len(), before);
        assert_eq!(reconciler.stats().duplicates, 1);
    }

    #[test]
    fn peer_message_in_background_thread_updates_preview_not_open_list() {
        let (mut store, mut ledger, mut reconciler) = setup();
        let open_before = store.snapshot().messages;

        reconciler.apply_message_event(
            &mut store,
            &mut ledger,
            event("T2", "m-9", false, "Hi"),
            Instant::now(),
        );

        let snapshot = store.snapshot();
        assert_eq!(snapshot.messages, open_before);
        let t2 = snapshot
            .conversations
            .iter()
            .find(|conversation| conversation.thread_id == "T2")
            .expect("T2 should be listed");
        assert_eq!(t2.last_message_preview.as_deref(), Some("Hi"));
    }

    #[test]
    fn own_echo_for_background_thread_only_updates_preview() {
        let (mut store, mut ledger, mut reconciler) = setup();
        let now = Instant::now();
        ledger.record("T2", Fingerprint::of(&MessageContent::text("later")), now);

        let outcome =
            reconciler.apply_message_event(&mut store, &mut ledger, event("T2", "m-3", true, "later"), now);

        assert_eq!(outcome, ReconcileOutcome::PreviewOnly);
        assert!(store.messages("T2").is_empty());
        assert_eq!(ledger.pending_count("T2", now), 1);
    }

    #[test]
    fn history_reload_absorbs_send_echoed_while_thread_was_closed() {
        let (mut store, mut ledger, mut reconciler) = setup();
        let now = Instant::now();
        ledger.record("T1", Fingerprint::of(&MessageContent::text("Hello")), now);
        store.append_optimistic_message("T1", "local-1", MessageContent::text("Hello"), 1_700_000_000_000);
        store.close_thread();

        let outcome =
            reconciler.apply_message_event(&mut store, &mut ledger, event("T1", "m-42", true, "Hello"), now);
        assert_eq!(outcome, ReconcileOutcome::PreviewOnly);

        store.open_thread("T1");
        reconciler.apply_history(
            &mut store,
            &mut ledger,
            "T1",
            vec![event("T1", "m-42", true, "Hello").into_message()],
            now + Duration::from_millis(300),
        );

        let messages = store.messages("T1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, MessageId::Server("m-42".into()));
        assert_eq!(messages[0].delivery, DeliveryState::Confirmed);
        assert_eq!(ledger.pending_count("T1", now), 0);
        assert_eq!(reconciler.stats().absorbed_by_history, 1);
    }

    #[test]
    fn unknown_thread_peer_message_is_not_displayed() {
        let (mut store, mut ledger, mut reconciler) = setup();

        let outcome = reconciler.apply_message_event(
            &mut store,
            &mut ledger,
            event("T404", "m-1", false, "who?"),
            Instant::now(),
        );

        assert_eq!(outcome, ReconcileOutcome::PreviewOnly);
        assert!(!store.knows_conversation("T404"));
        assert!(store.messages("T404").is_empty());
    }

    #[test]
    fn image_echo_promotes_pending_image() {
        let (mut store, mut ledger, mut reconciler) = setup();
        let now = Instant::now();
        let local = MessageContent::Image {
            url: None,
            file_name: Some("invoice.png".into()),
        };
        ledger.record("T1", Fingerprint::of(&local), now);
        store.append_optimistic_message("T1", "local-img", local, 1);

        let mut echo = event("T1", "m-img", true, "");
        echo.content = MessageContent::Image {
            url: Some("https://cdn.example.com/invoice.png".into()),
            file_name: None,
        };
        let outcome = reconciler.apply_message_event(&mut store, &mut ledger, echo, now);

        assert!(matches!(outcome, ReconcileOutcome::Promoted { .. }));
        assert_eq!(store.messages("T1").len(), 1);
        assert!(matches!(
            &store.messages("T1")[0].content,
            MessageContent::Image { url: Some(_), .. }
        ));
    }

    #[test]
    fn dropped_frames_are_counted() {
        let (_, _, mut reconciler) = setup();

        reconciler.record_dropped(&FrameError::MissingType);
        reconciler.record_dropped(&FrameError::InvalidJson("eof".into()));

        assert_eq!(reconciler.stats().dropped_frames, 2);
        assert_eq!(reconciler.stats().appended, 0);
    }
}
