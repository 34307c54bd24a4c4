//! Transcript store for a chat session
//!
//! An append-only log of the envelopes a channel has received and sent,
//! kept in local arrival order. Entries are never mutated once appended;
//! the log is only emptied as a whole when the session ends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::envelope::Envelope;
use crate::error::Result;

/// Which way an envelope travelled
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Received from the server
    Inbound,
    /// Sent by this client
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

/// One recorded envelope
#[derive(Debug, Clone)]
pub struct TranscriptEntry {
    /// Local id, unique per entry
    pub id: String,

    /// Arrival position; strictly increasing within a store
    pub seq: u64,

    pub direction: Direction,

    /// Wall-clock time of the append. Informational only, never used for ordering.
    pub recorded_at: DateTime<Utc>,

    pub envelope: Arc<Envelope>,
}

#[derive(Default)]
struct Log {
    next_seq: u64,
    entries: Vec<Arc<TranscriptEntry>>,
}

impl Log {
    fn push(&mut self, direction: Direction, envelope: Arc<Envelope>) -> Arc<TranscriptEntry> {
        let entry = Arc::new(TranscriptEntry {
            id: uuid::Uuid::new_v4().to_string(),
            seq: self.next_seq,
            direction,
            recorded_at: Utc::now(),
            envelope,
        });
        self.next_seq += 1;
        self.entries.push(entry.clone());
        entry
    }
}

/// Append-only transcript
///
/// Clones share the same log, so one store can be written by a channel and
/// read by the presentation layer. The lock is never held across an
/// `.await`, so every operation is synchronous and safe to call from drop
/// paths and handlers.
#[derive(Clone, Default)]
pub struct TranscriptStore {
    log: Arc<Mutex<Log>>,
}

impl TranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Log> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an envelope at the end of the log
    pub fn append(&self, direction: Direction, envelope: Arc<Envelope>) -> Arc<TranscriptEntry> {
        self.lock().push(direction, envelope)
    }

    /// Run `commit` under the log lock and append only if it succeeds
    ///
    /// Work done in `commit` is ordered with every other append and with
    /// [`clear`](Self::clear): nothing committed here can land after a
    /// clear that has already returned.
    pub fn append_with<F>(
        &self,
        direction: Direction,
        envelope: Arc<Envelope>,
        commit: F,
    ) -> Result<Arc<TranscriptEntry>>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut log = self.lock();
        commit()?;
        Ok(log.push(direction, envelope))
    }

    /// Entries as of now, in arrival order
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            entries: self.lock().entries.iter().cloned().collect(),
        }
    }

    /// Drop every entry. Sequence numbers keep increasing afterwards.
    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn stats(&self) -> TranscriptStats {
        let log = self.lock();
        let inbound = log
            .entries
            .iter()
            .filter(|e| e.direction == Direction::Inbound)
            .count();

        TranscriptStats {
            total: log.entries.len(),
            inbound,
            outbound: log.entries.len() - inbound,
        }
    }
}

/// Point-in-time view of a transcript
///
/// Finite and restartable: iterate it as many times as needed. Later
/// appends are not reflected.
#[derive(Debug, Clone)]
pub struct Snapshot {
    entries: Arc<[Arc<TranscriptEntry>]>,
}

impl Snapshot {
    pub fn iter(&self) -> impl Iterator<Item = &Arc<TranscriptEntry>> + '_ {
        self.entries.iter()
    }

    /// Envelopes only, lazily
    pub fn envelopes(&self) -> impl Iterator<Item = &Envelope> + '_ {
        self.entries.iter().map(|entry| entry.envelope.as_ref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a Arc<TranscriptEntry>;
    type IntoIter = std::slice::Iter<'a, Arc<TranscriptEntry>>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Transcript counters
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranscriptStats {
    pub total: usize,
    pub inbound: usize,
    pub outbound: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::TargetKind;
    use crate::error::ChatError;

    fn msg(text: &str) -> Arc<Envelope> {
        Arc::new(Envelope::message("u2", TargetKind::User, text))
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::Inbound.to_string(), "inbound");
        assert_eq!(Direction::Outbound.to_string(), "outbound");
    }

    #[test]
    fn test_snapshot_preserves_append_order() {
        let store = TranscriptStore::new();
        let texts: Vec<String> = (0..20).map(|i| format!("m{i}")).collect();

        for (i, text) in texts.iter().enumerate() {
            let direction = if i % 3 == 0 {
                Direction::Outbound
            } else {
                Direction::Inbound
            };
            store.append(direction, msg(text));
        }

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), texts.len());

        let seen: Vec<&str> = snapshot.envelopes().filter_map(|e| e.text()).collect();
        assert_eq!(seen, texts.iter().map(String::as_str).collect::<Vec<_>>());

        let seqs: Vec<u64> = snapshot.iter().map(|e| e.seq).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_snapshot_is_restartable_and_detached() {
        let store = TranscriptStore::new();
        store.append(Direction::Inbound, msg("a"));
        store.append(Direction::Inbound, msg("b"));

        let snapshot = store.snapshot();
        store.append(Direction::Inbound, msg("c"));

        assert_eq!(snapshot.iter().count(), 2);
        assert_eq!(snapshot.iter().count(), 2);
        assert_eq!((&snapshot).into_iter().count(), 2);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_clones_share_the_log() {
        let store = TranscriptStore::new();
        let view = store.clone();

        store.append(Direction::Outbound, msg("hi"));
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn test_clear_keeps_sequence_monotonic() {
        let store = TranscriptStore::new();
        store.append(Direction::Inbound, msg("a"));
        store.append(Direction::Inbound, msg("b"));
        store.clear();

        assert!(store.is_empty());
        let entry = store.append(Direction::Inbound, msg("c"));
        assert_eq!(entry.seq, 2);
    }

    #[test]
    fn test_stats() {
        let store = TranscriptStore::new();
        store.append(Direction::Inbound, msg("a"));
        store.append(Direction::Outbound, msg("b"));
        store.append(Direction::Inbound, msg("c"));

        let stats = store.stats();
        assert_eq!(
            stats,
            TranscriptStats {
                total: 3,
                inbound: 2,
                outbound: 1
            }
        );
    }

    #[test]
    fn test_concurrent_appends_are_not_lost() {
        let store = TranscriptStore::new();
        let mut handles = Vec::new();
        for task in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..25 {
                    store.append(Direction::Inbound, msg(&format!("{task}-{i}")));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 200);
        let seqs: Vec<u64> = snapshot.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn test_append_with_commits_before_pushing() {
        let store = TranscriptStore::new();

        let err = store
            .append_with(Direction::Outbound, msg("refused"), || Err(ChatError::NotConnected))
            .unwrap_err();
        assert_eq!(err, ChatError::NotConnected);
        assert!(store.is_empty());

        let mut committed = false;
        let entry = store
            .append_with(Direction::Outbound, msg("sent"), || {
                committed = true;
                Ok(())
            })
            .unwrap();
        assert!(committed);
        assert_eq!(entry.seq, 0);
        assert_eq!(store.len(), 1);
    }
}
