use super::{Configuration, MemberId, Term};
use crate::encoding::{self, Value as _};
use crate::error::{Error, Result};
use crate::storage;

use serde::{Deserialize, Serialize};
use std::ops::{Bound, RangeBounds};

/// A log index. Starts at 1; 0 denotes the position before the first entry.
pub type Index = u64;

/// A log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The entry index.
    pub index: Index,
    /// The leader's term when the entry was appended.
    pub term: Term,
    /// The entry payload.
    pub payload: Payload,
}

impl encoding::Value for Entry {}

/// A log entry payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// A no-op. Appended when a leader is elected, to commit entries from
    /// previous terms (see section 5.4.2 in the Raft paper).
    Noop,
    /// A state machine change proposed by a client.
    Change(Vec<u8>),
    /// A cluster configuration change (see section 6 in the Raft paper).
    Config(Configuration),
}

/// A snapshot of the state machine at a committed index, replacing all log
/// entries up to and including that index. The configuration as of the
/// snapshot index is included, since the log entries that carried it are gone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The index of the last entry covered by the snapshot.
    pub index: Index,
    /// The term of the last entry covered by the snapshot.
    pub term: Term,
    /// The effective configuration as of the snapshot index.
    pub config: Configuration,
    /// The serialized state machine.
    pub state: Vec<u8>,
}

impl encoding::Value for Snapshot {}

/// A log storage key. Entry keys must be ordered by index, so the index is
/// encoded in big-endian after a tag byte.
enum Key {
    /// A log entry, keyed by index.
    Entry(Index),
    /// The current term and vote (if any).
    TermVote,
    /// The snapshot record covering the log prefix.
    Snapshot,
}

impl Key {
    fn encode(&self) -> Vec<u8> {
        match self {
            Key::Entry(index) => {
                let mut key = vec![0x00];
                key.extend_from_slice(&index.to_be_bytes());
                key
            }
            Key::TermVote => vec![0x01],
            Key::Snapshot => vec![0x02],
        }
    }
}

/// The replicated Raft log: an append-only sequence of entries, anchored by a
/// snapshot covering the prefix up to and including prev_index. Entries above
/// the commit index are tentative and may be replaced when leadership
/// changes; entries at or below it are immutable and guaranteed to eventually
/// reach every member.
///
/// Invariants:
///
/// * Entry indexes are contiguous starting at prev_index + 1 (no gaps).
/// * Entry terms never decrease, and never exceed the current term.
/// * The entry at prev_index had term prev_term.
/// * If two logs contain an entry with the same index and term, the logs are
///   identical up to that index (section 5.3 in the Raft paper).
/// * The current term never decreases, and the vote never changes within a
///   term once cast.
/// * All mutations are flushed to the storage engine before returning, so a
///   reply depending on them can never be sent before they are durable.
///
/// The current term and vote are stored here too: they share the engine's
/// flush discipline with the entries, which together make up the member's
/// entire persistent state. The commit index is deliberately not persisted;
/// after a restart it resets to the snapshot prefix and is re-derived from
/// the leader (it is recoverable from a log quorum, per the Raft paper).
pub struct Log {
    /// The underlying storage engine. A trait object allows runtime engine
    /// selection without propagating a generic parameter through Raft.
    engine: Box<dyn storage::Engine>,
    /// The current term.
    term: Term,
    /// Our vote in the current term, if any.
    vote: Option<MemberId>,
    /// The index of the last entry swallowed by the snapshot.
    prev_index: Index,
    /// The term of the last entry swallowed by the snapshot.
    prev_term: Term,
    /// The index of the last stored entry.
    last_index: Index,
    /// The term of the last stored entry.
    last_term: Term,
    /// The index of the last committed entry (volatile).
    commit_index: Index,
    /// The term of the last committed entry (volatile).
    commit_term: Term,
}

impl Log {
    /// Opens a log from the given storage engine, recovering the persisted
    /// term, vote, snapshot, and entries. The engine must have been seeded
    /// with [`Log::initialize`] at some point.
    pub fn new(mut engine: Box<dyn storage::Engine>) -> Result<Self> {
        let (term, vote) = engine
            .get(&Key::TermVote.encode())?
            .map(|v| encoding::deserialize(&v))
            .transpose()?
            .unwrap_or((0, None));
        let snapshot = match engine.get(&Key::Snapshot.encode())? {
            Some(v) => Snapshot::decode(&v)?,
            None => return Err(Error::InvalidData("log has no snapshot record".into())),
        };
        let (last_index, last_term) = engine
            .scan(entry_range(..))
            .last()
            .transpose()?
            .map(|(_, v)| Entry::decode(&v))
            .transpose()?
            .map(|e| (e.index, e.term))
            .unwrap_or((snapshot.index, snapshot.term));
        Ok(Self {
            engine,
            term,
            vote,
            prev_index: snapshot.index,
            prev_term: snapshot.term,
            last_index,
            last_term,
            commit_index: snapshot.index,
            commit_term: snapshot.term,
        })
    }

    /// Seeds a fresh storage engine with an initial snapshot at index 0
    /// holding the initial configuration and state, then opens the log.
    pub fn initialize(
        mut engine: Box<dyn storage::Engine>,
        config: Configuration,
        state: Vec<u8>,
    ) -> Result<Self> {
        assert!(
            engine.get(&Key::Snapshot.encode())?.is_none(),
            "engine is already initialized"
        );
        let snapshot = Snapshot { index: 0, term: 0, config, state };
        engine.set(&Key::Snapshot.encode(), snapshot.encode())?;
        engine.flush()?;
        Self::new(engine)
    }

    /// Returns the current term (0 if none) and vote.
    pub fn get_term(&self) -> (Term, Option<MemberId>) {
        (self.term, self.vote)
    }

    /// Returns the snapshot prefix index and term.
    pub fn get_prev_index(&self) -> (Index, Term) {
        (self.prev_index, self.prev_term)
    }

    /// Returns the last log index and term.
    pub fn get_last_index(&self) -> (Index, Term) {
        (self.last_index, self.last_term)
    }

    /// Returns the commit index and term.
    pub fn get_commit_index(&self) -> (Index, Term) {
        (self.commit_index, self.commit_term)
    }

    /// Stores the current term and cast vote (if any), durably. Enforces that
    /// the term never regresses and that the vote never changes within a term.
    pub fn set_term(&mut self, term: Term, vote: Option<MemberId>) -> Result<()> {
        assert!(term > 0, "can't set term 0");
        assert!(term >= self.term, "term regression {} → {}", self.term, term);
        assert!(
            term > self.term || self.vote.is_none() || vote == self.vote,
            "can't change vote within term {term}"
        );
        if term == self.term && vote == self.vote {
            return Ok(());
        }
        self.engine.set(&Key::TermVote.encode(), encoding::serialize(&(term, vote)))?;
        self.engine.flush()?;
        self.term = term;
        self.vote = vote;
        Ok(())
    }

    /// Appends a payload to the log at the current term and flushes it to
    /// durable storage, returning its index.
    pub fn append(&mut self, payload: Payload) -> Result<Index> {
        assert!(self.term > 0, "can't append entry in term 0");
        let entry = Entry { index: self.last_index + 1, term: self.term, payload };
        self.engine.set(&Key::Entry(entry.index).encode(), entry.encode())?;
        self.engine.flush()?;
        self.last_index = entry.index;
        self.last_term = entry.term;
        Ok(entry.index)
    }

    /// Fetches an entry at an index, or None if it does not exist (including
    /// entries swallowed by the snapshot).
    pub fn get(&mut self, index: Index) -> Result<Option<Entry>> {
        self.engine.get(&Key::Entry(index).encode())?.map(|v| Entry::decode(&v)).transpose()
    }

    /// Returns the term of the entry at the given index: prev_term at the
    /// snapshot boundary, or None outside [prev_index, last_index].
    pub fn term_of(&mut self, index: Index) -> Result<Option<Term>> {
        if index == self.prev_index {
            return Ok(Some(self.prev_term));
        }
        if index == self.last_index {
            return Ok(Some(self.last_term));
        }
        Ok(self.get(index)?.map(|e| e.term))
    }

    /// Checks if the log contains an entry with the given index and term.
    /// Entries swallowed by the snapshot are necessarily committed, and a
    /// committed entry at a given index has a fixed term cluster-wide, so
    /// they match unconditionally.
    pub fn has(&mut self, index: Index, term: Term) -> Result<bool> {
        if index == 0 && term == 0 {
            return Ok(true);
        }
        if index < self.prev_index {
            return Ok(true);
        }
        Ok(self.term_of(index)?.map(|t| t == term).unwrap_or(false))
    }

    /// Returns an iterator over log entries in the given index range.
    pub fn scan(&mut self, range: impl RangeBounds<Index>) -> Scan<'_> {
        Scan { inner: self.engine.scan(entry_range(range)) }
    }

    /// Splices entries received from a leader into the log and flushes them
    /// to durable storage. The entries must be contiguous with equal or
    /// increasing terms, and must connect to the existing log. Entries
    /// already present (same index and term) are ignored; a conflicting entry
    /// (same index, different term) truncates the log from there before the
    /// new entries are written. Idempotent: splicing the same entries twice
    /// leaves the log unchanged. Returns the last index covered.
    pub fn splice(&mut self, entries: Vec<Entry>) -> Result<Index> {
        // Entries at or below the snapshot prefix are already committed here;
        // skip them.
        let mut entries = entries.as_slice();
        while let Some(first) = entries.first() {
            if first.index > self.prev_index {
                break;
            }
            entries = &entries[1..];
        }
        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return Ok(self.last_index); // nothing left to do
        };

        // Check that the entries are well-formed and connect to the log.
        assert!(first.index > 0 && first.term > 0, "spliced entry has index or term 0");
        assert!(
            entries.windows(2).all(|w| w[0].index + 1 == w[1].index),
            "spliced entries are not contiguous"
        );
        assert!(
            entries.windows(2).all(|w| w[0].term <= w[1].term),
            "spliced entries have term regression"
        );
        assert!(last.term <= self.term, "splice term {} beyond current {}", last.term, self.term);
        assert!(
            first.index <= self.last_index + 1,
            "first index {} must touch existing log",
            first.index
        );
        let base_term = self.term_of(first.index - 1)?.expect("missing base entry");
        assert!(first.term >= base_term, "splice term regression {} → {}", base_term, first.term);

        // Skip entries that are already in the log, stopping at the first
        // conflict (same index, different term).
        let mut scan = self.scan(first.index..=last.index);
        while let Some(entry) = scan.next().transpose()? {
            assert_eq!(entry.index, entries[0].index, "index mismatch at {entry:?}");
            if entry.term != entries[0].term {
                break;
            }
            assert_eq!(entry.payload, entries[0].payload, "payload mismatch at {entry:?}");
            entries = &entries[1..];
        }
        drop(scan);

        // If all entries were already present, we're done.
        let Some(first) = entries.first() else {
            return Ok(self.last_index);
        };

        // Write the remaining entries, and truncate any conflicting tail of
        // the old log. Entries below the commit index are immutable.
        assert!(first.index > self.commit_index, "spliced entries below commit index");
        for entry in entries {
            self.engine.set(&Key::Entry(entry.index).encode(), entry.encode())?;
        }
        for index in last.index + 1..=self.last_index {
            self.engine.delete(&Key::Entry(index).encode())?;
        }
        self.engine.flush()?;

        self.last_index = last.index;
        self.last_term = last.term;
        Ok(self.last_index)
    }

    /// Deletes all entries at and above the given index, e.g. when a follower
    /// vetoed an uncommitted entry. Committed and snapshotted entries are
    /// immutable and can never be truncated. Returns the new last index.
    pub fn truncate_from(&mut self, index: Index) -> Result<Index> {
        assert!(index > self.prev_index, "can't truncate into the snapshot prefix");
        assert!(index > self.commit_index, "can't truncate committed entries");
        for i in index..=self.last_index {
            self.engine.delete(&Key::Entry(i).encode())?;
        }
        self.engine.flush()?;
        self.last_index = index - 1;
        self.last_term = self.term_of(index - 1)?.expect("missing entry below truncation");
        Ok(self.last_index)
    }

    /// Commits entries up to and including the given index. The entry must
    /// exist, and the commit index can never regress. The commit index is
    /// volatile; it is re-derived after a restart rather than persisted.
    pub fn commit(&mut self, index: Index) -> Result<Index> {
        assert!(index >= self.commit_index, "commit regression {} → {index}", self.commit_index);
        if index == self.commit_index {
            return Ok(index);
        }
        let term = self.term_of(index)?.unwrap_or_else(|| panic!("commit index {index} missing"));
        self.commit_index = index;
        self.commit_term = term;
        Ok(index)
    }

    /// Advances the snapshot prefix to the given applied index, atomically
    /// storing the snapshot record (state and configuration as of that index)
    /// and deleting the entries it swallows. Only applied, committed entries
    /// can be compacted.
    pub fn compact(&mut self, index: Index, config: Configuration, state: Vec<u8>) -> Result<()> {
        assert!(index >= self.prev_index, "can't compact into the snapshot prefix");
        assert!(index <= self.commit_index, "can't compact uncommitted entries");
        if index == self.prev_index {
            return Ok(());
        }
        let term = self.term_of(index)?.expect("missing compaction entry");
        let snapshot = Snapshot { index, term, config, state };
        self.engine.set(&Key::Snapshot.encode(), snapshot.encode())?;
        for i in self.prev_index + 1..=index {
            self.engine.delete(&Key::Entry(i).encode())?;
        }
        self.engine.flush()?;
        self.prev_index = index;
        self.prev_term = term;
        Ok(())
    }

    /// Installs a snapshot received from a leader, replacing the log prefix
    /// and resetting the commit index to the snapshot index. If the log
    /// contains the snapshot's last entry, the suffix beyond it is retained;
    /// otherwise the entire log is discarded. Returns false if the snapshot
    /// is stale (at or below our commit index): everything it covers is
    /// already committed here, and accepting it would regress the commit
    /// index.
    pub fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<bool> {
        if snapshot.index <= self.commit_index {
            return Ok(false);
        }
        if self.has(snapshot.index, snapshot.term)? {
            // Our log matches through the snapshot index: retain the suffix.
            for index in self.prev_index + 1..=snapshot.index {
                self.engine.delete(&Key::Entry(index).encode())?;
            }
        } else {
            // Our log diverges from the snapshot: discard it entirely.
            for index in self.prev_index + 1..=self.last_index {
                self.engine.delete(&Key::Entry(index).encode())?;
            }
            self.last_index = snapshot.index;
            self.last_term = snapshot.term;
        }
        self.engine.set(&Key::Snapshot.encode(), snapshot.encode())?;
        self.engine.flush()?;
        self.prev_index = snapshot.index;
        self.prev_term = snapshot.term;
        self.commit_index = snapshot.index;
        self.commit_term = snapshot.term;
        Ok(true)
    }

    /// Reads back the snapshot record, e.g. for a leader to send to a
    /// follower that has fallen behind the snapshot prefix.
    pub fn snapshot(&mut self) -> Result<Snapshot> {
        let bytes = self.engine.get(&Key::Snapshot.encode())?.expect("log has no snapshot");
        Snapshot::decode(&bytes)
    }
}

/// Maps an entry index range onto the corresponding engine key range.
fn entry_range(range: impl RangeBounds<Index>) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let from = match range.start_bound() {
        Bound::Included(&index) => Bound::Included(Key::Entry(index).encode()),
        Bound::Excluded(&index) => Bound::Excluded(Key::Entry(index).encode()),
        Bound::Unbounded => Bound::Included(Key::Entry(0).encode()),
    };
    let to = match range.end_bound() {
        Bound::Included(&index) => Bound::Included(Key::Entry(index).encode()),
        Bound::Excluded(&index) => Bound::Excluded(Key::Entry(index).encode()),
        Bound::Unbounded => Bound::Included(Key::Entry(Index::MAX).encode()),
    };
    (from, to)
}

/// A log entry iterator.
pub struct Scan<'a> {
    inner: Box<dyn storage::ScanIterator + 'a>,
}

impl Iterator for Scan<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|r| r.and_then(|(_, v)| Entry::decode(&v)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::Membership;
    use super::*;
    use crate::storage::Memory;

    use pretty_assertions::assert_eq;

    fn config() -> Configuration {
        Configuration::Stable(Membership::new([MemberId::new()]))
    }

    fn setup() -> Log {
        let mut log = Log::initialize(Box::new(Memory::new()), config(), Vec::new()).unwrap();
        log.set_term(1, None).unwrap();
        log
    }

    fn change(index: Index, term: Term, byte: u8) -> Entry {
        Entry { index, term, payload: Payload::Change(vec![byte]) }
    }

    #[test]
    fn initialize_and_append() -> Result<()> {
        let mut log = setup();
        assert_eq!(log.get_prev_index(), (0, 0));
        assert_eq!(log.get_last_index(), (0, 0));
        assert_eq!(log.get_commit_index(), (0, 0));

        assert_eq!(log.append(Payload::Change(vec![0x01]))?, 1);
        assert_eq!(log.append(Payload::Noop)?, 2);
        assert_eq!(log.get_last_index(), (2, 1));
        assert_eq!(log.get(1)?, Some(change(1, 1, 0x01)));
        assert_eq!(log.get(3)?, None);
        assert_eq!(log.term_of(0)?, Some(0));
        assert_eq!(log.term_of(2)?, Some(1));
        assert_eq!(log.term_of(3)?, None);
        Ok(())
    }

    #[test]
    fn set_term_persists_and_protects_vote() -> Result<()> {
        let id = MemberId::new();
        let other = MemberId::new();
        let mut log = setup();
        log.set_term(2, Some(id))?;
        assert_eq!(log.get_term(), (2, Some(id)));

        // Same vote in the same term is a no-op.
        log.set_term(2, Some(id))?;

        // A new term clears the vote.
        log.set_term(3, None)?;
        assert_eq!(log.get_term(), (3, None));
        log.set_term(3, Some(other))?;
        assert_eq!(log.get_term(), (3, Some(other)));
        Ok(())
    }

    #[test]
    #[should_panic(expected = "can't change vote")]
    fn set_term_vote_change_panics() {
        let mut log = setup();
        log.set_term(2, Some(MemberId::new())).unwrap();
        log.set_term(2, Some(MemberId::new())).unwrap();
    }

    #[test]
    fn splice_append_overlap_conflict() -> Result<()> {
        let mut log = setup();
        log.set_term(3, None)?;
        for entry in [change(1, 1, 0x01), change(2, 1, 0x02), change(3, 2, 0x03)] {
            log.splice(vec![entry])?;
        }

        // Appending beyond the end.
        assert_eq!(log.splice(vec![change(4, 3, 0x04)])?, 4);

        // Splicing an overlapping prefix is a no-op and doesn't truncate.
        assert_eq!(log.splice(vec![change(1, 1, 0x01), change(2, 1, 0x02)])?, 4);
        assert_eq!(log.get_last_index(), (4, 3));

        // A conflicting entry truncates the tail before writing.
        assert_eq!(log.splice(vec![change(3, 3, 0x05)])?, 3);
        assert_eq!(log.get_last_index(), (3, 3));
        assert_eq!(log.get(3)?, Some(change(3, 3, 0x05)));
        assert_eq!(log.get(4)?, None);

        // Splicing is idempotent.
        assert_eq!(log.splice(vec![change(3, 3, 0x05)])?, 3);
        assert_eq!(log.get(3)?, Some(change(3, 3, 0x05)));
        Ok(())
    }

    #[test]
    fn commit_and_compact() -> Result<()> {
        let mut log = setup();
        for byte in 1..=3 {
            log.append(Payload::Change(vec![byte]))?;
        }
        log.commit(2)?;
        assert_eq!(log.get_commit_index(), (2, 1));

        log.compact(2, config(), vec![0xaa])?;
        assert_eq!(log.get_prev_index(), (2, 1));
        assert_eq!(log.get(1)?, None);
        assert_eq!(log.get(2)?, None);
        assert_eq!(log.get(3)?, Some(change(3, 1, 3)));
        assert_eq!(log.term_of(2)?, Some(1));

        let snapshot = log.snapshot()?;
        assert_eq!((snapshot.index, snapshot.term), (2, 1));
        assert_eq!(snapshot.state, vec![0xaa]);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "can't compact uncommitted")]
    fn compact_uncommitted_panics() {
        let mut log = setup();
        log.append(Payload::Noop).unwrap();
        log.compact(1, config(), Vec::new()).unwrap();
    }

    #[test]
    #[should_panic(expected = "can't truncate committed")]
    fn truncate_committed_panics() {
        let mut log = setup();
        log.append(Payload::Noop).unwrap();
        log.commit(1).unwrap();
        log.truncate_from(1).unwrap();
    }

    #[test]
    fn truncate_from() -> Result<()> {
        let mut log = setup();
        for byte in 1..=3 {
            log.append(Payload::Change(vec![byte]))?;
        }
        log.commit(1)?;
        assert_eq!(log.truncate_from(2)?, 1);
        assert_eq!(log.get_last_index(), (1, 1));
        assert_eq!(log.get(2)?, None);
        Ok(())
    }

    #[test]
    fn install_snapshot_discards_divergent_log() -> Result<()> {
        let mut log = setup();
        for byte in 1..=3 {
            log.append(Payload::Change(vec![byte]))?;
        }

        let snapshot = Snapshot { index: 5, term: 2, config: config(), state: vec![0xbb] };
        assert!(log.install_snapshot(snapshot.clone())?);
        assert_eq!(log.get_prev_index(), (5, 2));
        assert_eq!(log.get_last_index(), (5, 2));
        assert_eq!(log.get_commit_index(), (5, 2));
        assert_eq!(log.get(1)?, None);
        assert_eq!(log.snapshot()?, snapshot);

        // A stale snapshot is ignored.
        let stale = Snapshot { index: 3, term: 1, config: config(), state: vec![0xcc] };
        assert!(!log.install_snapshot(stale)?);
        assert_eq!(log.get_prev_index(), (5, 2));
        Ok(())
    }

    #[test]
    fn install_snapshot_retains_matching_suffix() -> Result<()> {
        let mut log = setup();
        for byte in 1..=3 {
            log.append(Payload::Change(vec![byte]))?;
        }

        let snapshot = Snapshot { index: 2, term: 1, config: config(), state: vec![0xbb] };
        assert!(log.install_snapshot(snapshot)?);
        assert_eq!(log.get_prev_index(), (2, 1));
        assert_eq!(log.get_last_index(), (3, 1));
        assert_eq!(log.get(3)?, Some(change(3, 1, 3)));
        Ok(())
    }

    #[test]
    fn reload_resets_commit_to_prefix() -> Result<()> {
        // Replaying a persisted log must recover term, vote, snapshot and
        // entries; the commit index resets to the snapshot prefix.
        let id = MemberId::new();
        let mut log = Log::initialize(Box::new(Memory::new()), config(), Vec::new())?;
        log.set_term(2, Some(id))?;
        for byte in 1..=3 {
            log.append(Payload::Change(vec![byte]))?;
        }
        log.commit(2)?;
        log.compact(1, config(), vec![0xaa])?;

        let engine = std::mem::replace(&mut log.engine, Box::new(Memory::new()));
        drop(log);

        let mut log = Log::new(engine)?;
        assert_eq!(log.get_term(), (2, Some(id)));
        assert_eq!(log.get_prev_index(), (1, 2));
        assert_eq!(log.get_last_index(), (3, 2));
        assert_eq!(log.get_commit_index(), (1, 2));
        assert_eq!(log.get(2)?, Some(change(2, 2, 2)));
        Ok(())
    }
}
