use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::SystemTime;

use tokio::sync::broadcast;
use tracing::debug;

use canopy_types::RepoPath;

use crate::delta::{DeltaKind, JournalDelta};
use crate::error::{JournalError, JournalResult};

/// Configuration for a [`Journal`].
#[derive(Clone, Debug)]
pub struct JournalConfig {
    /// Maximum number of deltas kept in the ring.
    pub ring_capacity: usize,
    /// Capacity of per-subscriber broadcast channels.
    pub channel_capacity: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 100_000,
            channel_capacity: 1024,
        }
    }
}

/// Result of a range read.
///
/// Late readers asking for sequence numbers that have fallen out of the
/// ring get `Truncated`, carrying the earliest sequence still available
/// alongside whatever deltas remain in range.
#[derive(Clone, Debug, PartialEq)]
pub enum DeltaRange {
    /// Every requested delta is present.
    Complete(Vec<JournalDelta>),
    /// The journal was truncated past the start of the request.
    Truncated {
        earliest_available: u64,
        deltas: Vec<JournalDelta>,
    },
}

impl DeltaRange {
    /// The deltas carried, regardless of truncation.
    pub fn deltas(&self) -> &[JournalDelta] {
        match self {
            Self::Complete(d) => d,
            Self::Truncated { deltas, .. } => deltas,
        }
    }
}

struct JournalState {
    /// Sequence number the next delta will receive.
    next_seq: u64,
    /// Ring of the most recent deltas, oldest first.
    ring: VecDeque<JournalDelta>,
}

/// Append-only record of path-level mutations.
///
/// Logically single-writer: the tail pointer is serialized behind one lock,
/// which is what guarantees strict sequence monotonicity. Readers request
/// ranges or subscribe for live delivery; a subscription sees every delta
/// appended after it was created, in order and gap-free, as long as the
/// receiver keeps up with the channel capacity.
pub struct Journal {
    state: Mutex<JournalState>,
    sender: broadcast::Sender<JournalDelta>,
    config: JournalConfig,
}

impl Journal {
    pub fn new(config: JournalConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity);
        Self {
            state: Mutex::new(JournalState {
                next_seq: 1,
                ring: VecDeque::new(),
            }),
            sender,
            config,
        }
    }

    /// Append one delta, assigning the next sequence number.
    pub fn append(&self, kind: DeltaKind, paths: Vec<RepoPath>) -> JournalDelta {
        let delta = {
            let mut state = self.state.lock().expect("lock poisoned");
            let delta = JournalDelta {
                seq: state.next_seq,
                timestamp: SystemTime::now(),
                kind,
                paths,
            };
            state.next_seq += 1;
            state.ring.push_back(delta.clone());
            while state.ring.len() > self.config.ring_capacity {
                state.ring.pop_front();
            }
            delta
        };

        // Delivery failures just mean nobody is subscribed right now.
        let _ = self.sender.send(delta.clone());
        debug!(seq = delta.seq, kind = %delta.kind, "journal append");
        delta
    }

    /// Sequence number of the most recent delta; 0 if none were appended.
    pub fn latest_seq(&self) -> u64 {
        self.state.lock().expect("lock poisoned").next_seq - 1
    }

    /// Earliest sequence number still held in the ring; `None` when empty.
    pub fn earliest_seq(&self) -> Option<u64> {
        self.state
            .lock()
            .expect("lock poisoned")
            .ring
            .front()
            .map(|d| d.seq)
    }

    /// Read deltas with sequence numbers in `[from_seq, to_seq]`, inclusive.
    pub fn read_range(&self, from_seq: u64, to_seq: u64) -> JournalResult<DeltaRange> {
        if from_seq == 0 || from_seq > to_seq {
            return Err(JournalError::InvalidRange {
                from: from_seq,
                to: to_seq,
            });
        }

        let state = self.state.lock().expect("lock poisoned");
        let deltas: Vec<JournalDelta> = state
            .ring
            .iter()
            .filter(|d| d.seq >= from_seq && d.seq <= to_seq)
            .cloned()
            .collect();

        match state.ring.front() {
            Some(front) if from_seq < front.seq => Ok(DeltaRange::Truncated {
                earliest_available: front.seq,
                deltas,
            }),
            None if state.next_seq > 1 => Ok(DeltaRange::Truncated {
                earliest_available: state.next_seq,
                deltas,
            }),
            _ => Ok(DeltaRange::Complete(deltas)),
        }
    }

    /// Subscribe to live delta delivery.
    pub fn subscribe(&self) -> broadcast::Receiver<JournalDelta> {
        self.sender.subscribe()
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new(JournalConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_types::PathComponent;

    fn path(s: &str) -> RepoPath {
        RepoPath::root().join(&PathComponent::new(s).unwrap())
    }

    #[test]
    fn sequence_numbers_are_strictly_monotonic() {
        let journal = Journal::default();
        let a = journal.append(DeltaKind::Created, vec![path("a")]);
        let b = journal.append(DeltaKind::Changed, vec![path("a")]);
        let c = journal.append(DeltaKind::Removed, vec![path("a")]);
        assert_eq!((a.seq, b.seq, c.seq), (1, 2, 3));
        assert_eq!(journal.latest_seq(), 3);
    }

    #[test]
    fn read_range_is_inclusive() {
        let journal = Journal::default();
        for i in 0..5 {
            journal.append(DeltaKind::Changed, vec![path(&format!("f{i}"))]);
        }
        let range = journal.read_range(2, 4).unwrap();
        let deltas = range.deltas();
        assert_eq!(deltas.len(), 3);
        assert_eq!(deltas[0].seq, 2);
        assert_eq!(deltas[2].seq, 4);
        assert!(matches!(range, DeltaRange::Complete(_)));
    }

    #[test]
    fn invalid_ranges_rejected() {
        let journal = Journal::default();
        assert!(journal.read_range(0, 1).is_err());
        assert!(journal.read_range(3, 2).is_err());
    }

    #[test]
    fn late_reader_sees_truncation_marker() {
        let journal = Journal::new(JournalConfig {
            ring_capacity: 3,
            ..Default::default()
        });
        for i in 0..6 {
            journal.append(DeltaKind::Changed, vec![path(&format!("f{i}"))]);
        }
        // Deltas 1-3 have fallen out; 4-6 remain.
        assert_eq!(journal.earliest_seq(), Some(4));

        match journal.read_range(1, 6).unwrap() {
            DeltaRange::Truncated {
                earliest_available,
                deltas,
            } => {
                assert_eq!(earliest_available, 4);
                assert_eq!(deltas.len(), 3);
                assert_eq!(deltas[0].seq, 4);
            }
            other => panic!("expected truncation, got {other:?}"),
        }

        // A range entirely inside the ring is complete.
        assert!(matches!(
            journal.read_range(4, 6).unwrap(),
            DeltaRange::Complete(_)
        ));
    }

    #[test]
    fn renamed_carries_both_paths() {
        let journal = Journal::default();
        let delta = journal.append(DeltaKind::Renamed, vec![path("old"), path("new")]);
        assert_eq!(delta.paths.len(), 2);
        assert_eq!(delta.paths[0].as_str(), "old");
        assert_eq!(delta.paths[1].as_str(), "new");
    }

    #[tokio::test]
    async fn subscription_is_gap_free_and_ordered() {
        let journal = Journal::default();
        let mut rx = journal.subscribe();

        for i in 0..10 {
            journal.append(DeltaKind::Created, vec![path(&format!("f{i}"))]);
        }

        for expected_seq in 1..=10 {
            let delta = rx.recv().await.unwrap();
            assert_eq!(delta.seq, expected_seq);
        }
    }

    #[test]
    fn concurrent_appends_never_duplicate_sequences() {
        use std::collections::HashSet;
        use std::sync::Arc;
        use std::thread;

        let journal = Arc::new(Journal::default());
        let mut handles = Vec::new();
        for t in 0..4 {
            let journal = Arc::clone(&journal);
            handles.push(thread::spawn(move || {
                let mut seqs = Vec::new();
                for i in 0..50 {
                    let delta =
                        journal.append(DeltaKind::Changed, vec![path(&format!("t{t}-{i}"))]);
                    seqs.push(delta.seq);
                }
                seqs
            }));
        }

        let mut all = HashSet::new();
        for handle in handles {
            for seq in handle.join().unwrap() {
                assert!(all.insert(seq), "duplicate sequence {seq}");
            }
        }
        assert_eq!(all.len(), 200);
        assert_eq!(journal.latest_seq(), 200);
    }
}
