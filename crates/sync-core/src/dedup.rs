//! Short-lived record of local sends awaiting their push echo.
//!
//! A send is recorded before its network call starts, because the echo can
//! arrive on the push channel before the request/response call returns. An
//! echo consumes at most one matching record.
//!
//! Text is matched by exact trimmed body. Images are matched by kind only,
//! since the push channel does not carry enough to compare payloads; a second
//! image sent to the same thread inside the window can therefore absorb the
//! first image's echo. That is a known limitation of fingerprinting, not of
//! this ledger.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use tracing::trace;

use crate::types::{ContentKind, MessageContent};

/// Comparable identity of a message's content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fingerprint {
    /// Exact trimmed text body.
    Text(String),
    /// Kind-only marker for content that cannot be compared by value.
    Kind(ContentKind),
}

impl Fingerprint {
    pub fn of(content: &MessageContent) -> Self {
        match content {
            MessageContent::Text { body } => Self::Text(body.trim().to_owned()),
            other => Self::Kind(other.kind()),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingSend {
    fingerprint: Fingerprint,
    recorded_at: Instant,
}

/// Per-thread pending-send records with a fixed expiry window.
#[derive(Debug, Clone)]
pub struct DedupLedger {
    window: Duration,
    pending: HashMap<String, Vec<PendingSend>>,
}

impl DedupLedger {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a send at initiation time.
    ///
    /// Expired records for the thread are pruned first, so a thread whose
    /// echoes never arrive does not grow without bound.
    pub fn record(&mut self, thread_id: &str, fingerprint: Fingerprint, now: Instant) {
        trace!(%thread_id, ?fingerprint, "recording pending send");
        self.prune_thread(thread_id, now);
        self.pending
            .entry(thread_id.to_owned())
            .or_default()
            .push(PendingSend {
                fingerprint,
                recorded_at: now,
            });
    }

    /// Consume the oldest live record matching `fingerprint`.
    ///
    /// Expired records for the thread are pruned first. Returns `true` when a
    /// record was consumed, meaning the echo duplicates a local send.
    pub fn try_consume(&mut self, thread_id: &str, fingerprint: &Fingerprint, now: Instant) -> bool {
        self.prune_thread(thread_id, now);
        let Some(records) = self.pending.get_mut(thread_id) else {
            return false;
        };

        let Some(index) = records
            .iter()
            .position(|record| record.fingerprint == *fingerprint)
        else {
            return false;
        };

        records.remove(index);
        if records.is_empty() {
            self.pending.remove(thread_id);
        }
        true
    }

    /// Drop the newest record matching `fingerprint`, used when a send fails.
    pub fn forget(&mut self, thread_id: &str, fingerprint: &Fingerprint) -> bool {
        let Some(records) = self.pending.get_mut(thread_id) else {
            return false;
        };
        let Some(index) = records
            .iter()
            .rposition(|record| record.fingerprint == *fingerprint)
        else {
            return false;
        };

        records.remove(index);
        if records.is_empty() {
            self.pending.remove(thread_id);
        }
        true
    }

    /// Number of live records for a thread as of `now`.
    pub fn pending_count(&self, thread_id: &str, now: Instant) -> usize {
        self.pending
            .get(thread_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|record| !self.is_expired(record, now))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Drop every record. Called when the session or connection is recreated.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    fn prune_thread(&mut self, thread_id: &str, now: Instant) {
        let window = self.window;
        let Some(records) = self.pending.get_mut(thread_id) else {
            return;
        };
        records.retain(|record| now.saturating_duration_since(record.recorded_at) <= window);
        if records.is_empty() {
            self.pending.remove(thread_id);
        }
    }

    fn is_expired(&self, record: &PendingSend, now: Instant) -> bool {
        now.saturating_duration_since(record.recorded_at) > self.window
    }
}

impl Default for DedupLedger {
    fn default() -> Self {
        Self::new(Duration::from_millis(4_000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(body: &str) -> Fingerprint {
        Fingerprint::of(&MessageContent::text(body))
    }

    fn image() -> Fingerprint {
        Fingerprint::of(&MessageContent::Image {
            url: None,
            file_name: Some("receipt.png".into()),
        })
    }

    #[test]
    fn consumes_matching_text_once() {
        let mut ledger = DedupLedger::default();
        let now = Instant::now();
        ledger.record("T1", text("Hello"), now);

        assert!(ledger.try_consume("T1", &text("Hello"), now + Duration::from_millis(200)));
        assert!(!ledger.try_consume("T1", &text("Hello"), now + Duration::from_millis(300)));
        assert_eq!(ledger.pending_count("T1", now), 0);
    }

    #[test]
    fn text_fingerprint_ignores_surrounding_whitespace() {
        assert_eq!(text("  Hello \n"), text("Hello"));
        assert_ne!(text("Hello"), text("hello"));
    }

    #[test]
    fn does_not_match_across_threads() {
        let mut ledger = DedupLedger::default();
        let now = Instant::now();
        ledger.record("T1", text("Hello"), now);

        assert!(!ledger.try_consume("T2", &text("Hello"), now));
        assert_eq!(ledger.pending_count("T1", now), 1);
    }

    #[test]
    fn expired_records_are_pruned_before_matching() {
        let mut ledger = DedupLedger::new(Duration::from_millis(4_000));
        let now = Instant::now();
        ledger.record("T1", text("Hello"), now);

        assert!(!ledger.try_consume("T1", &text("Hello"), now + Duration::from_millis(4_001)));
        assert_eq!(ledger.pending_count("T1", now), 0);
    }

    #[test]
    fn recording_prunes_expired_records_of_the_thread() {
        let mut ledger = DedupLedger::new(Duration::from_millis(4_000));
        let now = Instant::now();
        for offset in 0..3 {
            ledger.record("T1", text("unanswered"), now + Duration::from_millis(offset));
        }
        ledger.record("T2", text("other"), now);

        let later = now + Duration::from_millis(10_000);
        ledger.record("T1", text("fresh"), later);

        let records = ledger.pending.get("T1").expect("thread should keep the fresh record");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fingerprint, text("fresh"));
        assert_eq!(ledger.pending.get("T2").map(Vec::len), Some(1));
    }

    #[test]
    fn record_at_window_edge_still_matches() {
        let mut ledger = DedupLedger::new(Duration::from_millis(4_000));
        let now = Instant::now();
        ledger.record("T1", text("Hello"), now);

        assert!(ledger.try_consume("T1", &text("Hello"), now + Duration::from_millis(4_000)));
    }

    #[test]
    fn images_match_by_kind_only() {
        let mut ledger = DedupLedger::default();
        let now = Instant::now();
        ledger.record("T1", image(), now);

        let echoed = Fingerprint::of(&MessageContent::Image {
            url: Some("https://cdn.example.com/a.png".into()),
            file_name: None,
        });
        assert!(ledger.try_consume("T1", &echoed, now));
    }

    #[test]
    fn image_record_does_not_absorb_text_echo() {
        let mut ledger = DedupLedger::default();
        let now = Instant::now();
        ledger.record("T1", image(), now);

        assert!(!ledger.try_consume("T1", &text("[image]"), now));
    }

    #[test]
    fn identical_texts_are_consumed_one_per_echo() {
        let mut ledger = DedupLedger::default();
        let now = Instant::now();
        ledger.record("T1", text("ok"), now);
        ledger.record("T1", text("ok"), now);

        assert!(ledger.try_consume("T1", &text("ok"), now));
        assert!(ledger.try_consume("T1", &text("ok"), now));
        assert!(!ledger.try_consume("T1", &text("ok"), now));
    }

    #[test]
    fn forget_removes_failed_send_record() {
        let mut ledger = DedupLedger::default();
        let now = Instant::now();
        ledger.record("T1", text("Hello"), now);

        assert!(ledger.forget("T1", &text("Hello")));
        assert!(!ledger.forget("T1", &text("Hello")));
        assert!(!ledger.try_consume("T1", &text("Hello"), now));
    }

    #[test]
    fn clear_drops_everything() {
        let mut ledger = DedupLedger::default();
        let now = Instant::now();
        ledger.record("T1", text("a"), now);
        ledger.record("T2", text("b"), now);
        ledger.clear();

        assert_eq!(ledger.pending_count("T1", now), 0);
        assert_eq!(ledger.pending_count("T2", now), 0);
    }
}
