mod candidate;
mod follower;
mod leader;

use super::{
    ChangeToken, Configuration, Entry, Envelope, Index, Log, MemberId, Membership, Message,
    Payload, State, Term, Ticks, ELECTION_TIMEOUT_RANGE,
};
use crate::error::{Error, Result};
use crate::raft::AppendOutcome;
use candidate::Candidate;
use follower::Follower;
use leader::Leader;

use ::log::debug;
use itertools::Itertools as _;
use rand::Rng as _;
use std::collections::BTreeSet;

/// Generates a randomized election timeout.
fn rand_election_timeout() -> Ticks {
    rand::thread_rng().gen_range(ELECTION_TIMEOUT_RANGE)
}

/// A Raft cluster member with a dynamic role. The member is a single-writer
/// automaton, driven synchronously by stepping inbound messages via step() or
/// by advancing logical time via tick(). These methods consume the current
/// member and return a new one with a possibly different role; outbound
/// messages are emitted on the node_tx channel. All persistence happens
/// before the corresponding response message is emitted, so a reply can never
/// outrun the durable state it depends on.
///
/// This enum wraps the RawMember<Role> types, which implement the actual
/// member logic. It exists for ergonomic use across role transitions, i.e.
/// member = member.step(msg)?.
pub enum Member {
    Candidate(RawMember<Candidate>),
    Follower(RawMember<Follower>),
    Leader(RawMember<Leader>),
}

impl Member {
    /// Creates a new member from a persisted log, starting as a leaderless
    /// follower, or as leader immediately if it is the sole voter. The state
    /// machine is restored from the log's snapshot.
    pub fn new(
        id: MemberId,
        log: Log,
        state: Box<dyn State>,
        node_tx: crossbeam::channel::Sender<Envelope>,
    ) -> Result<Self> {
        let member = RawMember::new(id, log, state, node_tx)?;
        if member.config.voters() == BTreeSet::from([id]) {
            // A sole voter elects itself immediately.
            return Ok(member.into_candidate()?.into_leader()?.into());
        }
        Ok(member.into())
    }

    /// Returns the member ID.
    pub fn id(&self) -> MemberId {
        match self {
            Member::Candidate(m) => m.id,
            Member::Follower(m) => m.id,
            Member::Leader(m) => m.id,
        }
    }

    /// Returns the member's current term.
    pub fn term(&self) -> Term {
        match self {
            Member::Candidate(m) => m.term,
            Member::Follower(m) => m.term,
            Member::Leader(m) => m.term,
        }
    }

    /// Returns the current leader, if known: ourself if leader, the member
    /// we've heard from this term if follower. Used as a client retry hint.
    pub fn leader_hint(&self) -> Option<MemberId> {
        match self {
            Member::Candidate(_) => None,
            Member::Follower(m) => m.role.leader,
            Member::Leader(m) => Some(m.id),
        }
    }

    /// Returns true if this member is a leader that is ready to serve
    /// proposals: it has committed an entry in its own term, so its commit
    /// index is up to date (section 8 in the Raft paper).
    pub fn ready_for_change(&self) -> bool {
        match self {
            Member::Leader(m) => m.log.get_commit_index().1 == m.term,
            _ => false,
        }
    }

    /// Returns the commit index.
    pub fn commit_index(&self) -> Index {
        match self {
            Member::Candidate(m) => m.log.get_commit_index().0,
            Member::Follower(m) => m.log.get_commit_index().0,
            Member::Leader(m) => m.log.get_commit_index().0,
        }
    }

    /// Returns the applied index.
    pub fn applied_index(&self) -> Index {
        match self {
            Member::Candidate(m) => m.applied_index,
            Member::Follower(m) => m.applied_index,
            Member::Leader(m) => m.applied_index,
        }
    }

    /// Returns the effective cluster configuration.
    pub fn configuration(&self) -> &Configuration {
        match self {
            Member::Candidate(m) => &m.config,
            Member::Follower(m) => &m.config,
            Member::Leader(m) => &m.config,
        }
    }

    /// Proposes a state machine change. Returns a token resolving to the
    /// change's eventual outcome. Fails with NotLeader on non-leaders, with
    /// the current leader (if known) as a hint.
    pub fn propose_change(&mut self, change: Vec<u8>) -> Result<ChangeToken> {
        let leader = self.leader_hint();
        match self {
            Member::Leader(m) => m.propose_change(change),
            _ => Err(Error::NotLeader { leader }),
        }
    }

    /// Proposes a cluster configuration change via joint consensus. Fails
    /// with NotLeader on non-leaders, and with ConfigChangeInProgress if a
    /// previous configuration change has not yet completed.
    pub fn propose_config_change(&mut self, membership: Membership) -> Result<ChangeToken> {
        let leader = self.leader_hint();
        match self {
            Member::Leader(m) => m.propose_config_change(membership),
            _ => Err(Error::NotLeader { leader }),
        }
    }

    /// Processes an inbound message.
    pub fn step(self, msg: Envelope) -> Result<Self> {
        debug!("Stepping {msg:?}");
        match self {
            Member::Candidate(m) => m.step(msg),
            Member::Follower(m) => m.step(msg),
            Member::Leader(m) => m.step(msg),
        }
    }

    /// Moves logical time forward by one tick.
    pub fn tick(self) -> Result<Self> {
        match self {
            Member::Candidate(m) => m.tick(),
            Member::Follower(m) => m.tick(),
            Member::Leader(m) => m.tick(),
        }
    }

    /// Checks cluster-wide invariants across a set of members, panicking on
    /// any violation. Intended to be run periodically by test harnesses;
    /// these properties span members and can't be asserted locally.
    pub fn check_invariants(members: &mut [&mut Member]) -> Result<()> {
        struct Summary {
            id: MemberId,
            term: Term,
            leads: bool,
            prev_index: Index,
            last_index: Index,
            commit_index: Index,
            applied_index: Index,
            entries: Vec<Entry>,
        }

        let mut summaries = Vec::new();
        for member in members.iter_mut() {
            let (id, term, leads, applied_index, log) = match &mut **member {
                Member::Candidate(m) => (m.id, m.term, false, m.applied_index, &mut m.log),
                Member::Follower(m) => (m.id, m.term, false, m.applied_index, &mut m.log),
                Member::Leader(m) => (m.id, m.term, true, m.applied_index, &mut m.log),
            };
            let entries = log.scan(..).collect::<Result<Vec<_>>>()?;
            summaries.push(Summary {
                id,
                term,
                leads,
                prev_index: log.get_prev_index().0,
                last_index: log.get_last_index().0,
                commit_index: log.get_commit_index().0,
                applied_index,
                entries,
            });
        }

        // Per-member invariants.
        for s in &summaries {
            assert!(s.prev_index <= s.applied_index, "{}: snapshot beyond applied index", s.id);
            assert!(s.applied_index <= s.commit_index, "{}: applied beyond commit index", s.id);
            assert!(s.commit_index <= s.last_index, "{}: commit beyond last index", s.id);
            let mut prev = s.prev_index;
            let mut prev_term = 0;
            for entry in &s.entries {
                assert_eq!(entry.index, prev + 1, "{}: log has index gap", s.id);
                assert!(entry.term >= prev_term, "{}: log has term regression", s.id);
                assert!(entry.term <= s.term, "{}: entry term beyond current term", s.id);
                (prev, prev_term) = (entry.index, entry.term);
            }
        }

        // Election safety: at most one leader per term.
        let leaders: Vec<_> = summaries.iter().filter(|s| s.leads).collect();
        for (a, b) in leaders.iter().tuple_combinations() {
            assert!(a.term != b.term, "two leaders in term {}: {} and {}", a.term, a.id, b.id);
        }

        // Log matching and committed-prefix agreement, pairwise over the
        // overlapping (non-snapshotted) index ranges.
        let entry_at = |s: &Summary, index: Index| -> Entry {
            s.entries[(index - s.prev_index - 1) as usize].clone()
        };
        for (a, b) in summaries.iter().tuple_combinations() {
            let lo = a.prev_index.max(b.prev_index) + 1;
            let hi = a.last_index.min(b.last_index);

            // Find the highest overlapping index with matching terms; all
            // entries at and below it must be identical.
            let matched = (lo..=hi).rev().find(|&i| entry_at(a, i).term == entry_at(b, i).term);
            if let Some(matched) = matched {
                for i in lo..=matched {
                    assert_eq!(
                        entry_at(a, i),
                        entry_at(b, i),
                        "log mismatch between {} and {} at index {i}",
                        a.id,
                        b.id
                    );
                }
            }

            // Committed entries must agree everywhere, matching terms or not.
            for i in lo..=hi.min(a.commit_index).min(b.commit_index) {
                assert_eq!(
                    entry_at(a, i),
                    entry_at(b, i),
                    "committed entry mismatch between {} and {} at index {i}",
                    a.id,
                    b.id
                );
            }
        }
        Ok(())
    }
}

impl From<RawMember<Candidate>> for Member {
    fn from(m: RawMember<Candidate>) -> Self {
        Member::Candidate(m)
    }
}

impl From<RawMember<Follower>> for Member {
    fn from(m: RawMember<Follower>) -> Self {
        Member::Follower(m)
    }
}

impl From<RawMember<Leader>> for Member {
    fn from(m: RawMember<Leader>) -> Self {
        Member::Leader(m)
    }
}

/// A Raft role: follower, candidate, or leader.
pub trait Role: std::fmt::Debug {}

/// A Raft member with the concrete role R. This implements the typestate
/// pattern, where individual member states (roles) are encoded as
/// RawMember<Role>. See: http://cliffle.com/blog/rust-typestate/
pub struct RawMember<R: Role = Follower> {
    id: MemberId,
    term: Term,
    log: Log,
    state: Box<dyn State>,
    /// The effective cluster configuration: the latest configuration entry
    /// anywhere in the log (committed or not, per joint consensus), falling
    /// back to the snapshot's configuration.
    config: Configuration,
    /// The log index of the effective configuration entry, or the snapshot
    /// index if the configuration came from the snapshot. The configuration
    /// is committed iff this is at or below the commit index.
    config_index: Index,
    /// The configuration as of applied_index; stored in snapshots.
    applied_config: Configuration,
    /// The index of the last entry applied to the state machine.
    applied_index: Index,
    node_tx: crossbeam::channel::Sender<Envelope>,
    role: R,
}

impl RawMember<Follower> {
    /// Creates a new member as a leaderless follower, restoring the state
    /// machine and configuration from the log.
    fn new(
        id: MemberId,
        mut log: Log,
        mut state: Box<dyn State>,
        node_tx: crossbeam::channel::Sender<Envelope>,
    ) -> Result<Self> {
        let snapshot = log.snapshot()?;
        state.restore(&snapshot.state)?;
        let (term, voted_for) = log.get_term();
        let mut member = Self {
            id,
            term,
            log,
            state,
            config: Configuration::Stable(Membership::new([id])),
            config_index: 0,
            applied_config: snapshot.config.clone(),
            applied_index: snapshot.index,
            node_tx,
            role: Follower::new(None, voted_for, rand_election_timeout()),
        };
        member.refresh_config()?;
        Ok(member)
    }
}

impl<R: Role> RawMember<R> {
    /// Helper for role transitions.
    fn into_role<T: Role>(self, role: T) -> RawMember<T> {
        RawMember {
            id: self.id,
            term: self.term,
            log: self.log,
            state: self.state,
            config: self.config,
            config_index: self.config_index,
            applied_config: self.applied_config,
            applied_index: self.applied_index,
            node_tx: self.node_tx,
            role,
        }
    }

    /// Returns all peers: the configured members except ourself.
    fn peers(&self) -> BTreeSet<MemberId> {
        let mut peers = self.config.members();
        peers.remove(&self.id);
        peers
    }

    /// Recomputes the effective configuration after the log suffix changed
    /// (splice, truncation, snapshot install, or a config append).
    fn refresh_config(&mut self) -> Result<()> {
        let mut config = None;
        let mut scan = self.log.scan(..);
        while let Some(entry) = scan.next().transpose()? {
            if let Payload::Config(c) = entry.payload {
                config = Some((c, entry.index));
            }
        }
        drop(scan);
        // Without a configuration entry in the log, the effective
        // configuration is the snapshot's, which equals applied_config
        // whenever no configuration entry follows the snapshot.
        let prev_index = self.log.get_prev_index().0;
        (self.config, self.config_index) =
            config.unwrap_or_else(|| (self.applied_config.clone(), prev_index));
        Ok(())
    }

    /// Applies any pending committed entries to the state machine, then
    /// advances the snapshot prefix to the applied index. Snapshotting after
    /// every apply batch keeps the log retention window minimal; lagging
    /// followers are caught up via snapshot install instead.
    fn maybe_apply(&mut self) -> Result<()> {
        let commit_index = self.log.get_commit_index().0;
        assert!(commit_index >= self.applied_index, "commit index below applied index");
        if self.applied_index >= commit_index {
            return Ok(());
        }
        let entries: Vec<Entry> =
            self.log.scan(self.applied_index + 1..=commit_index).collect::<Result<_>>()?;
        for entry in entries {
            debug!("Applying {entry:?}");
            match entry.payload {
                Payload::Change(change) => self.state.apply(&change),
                Payload::Config(config) => self.applied_config = config,
                Payload::Noop => {}
            }
            self.applied_index = entry.index;
        }
        let state = self.state.snapshot();
        self.log.compact(self.applied_index, self.applied_config.clone(), state)?;
        Ok(())
    }

    /// Sends a message to the given member.
    fn send(&self, to: MemberId, message: Message) -> Result<()> {
        let msg = Envelope { from: self.id, to, term: self.term, message };
        debug!("Sending {msg:?}");
        Ok(self.node_tx.send(msg)?)
    }

    /// Broadcasts a message to the given members, except ourself. BTreeSet
    /// iteration orders the sends, for test determinism.
    fn broadcast(&self, to: BTreeSet<MemberId>, message: Message) -> Result<()> {
        for id in to {
            if id != self.id {
                self.send(id, message.clone())?;
            }
        }
        Ok(())
    }

    /// Refuses a request from a past term, returning our current term (on
    /// the envelope) so the sender can catch up. Responses from past terms
    /// are dropped.
    fn refuse_stale(&self, msg: &Envelope) -> Result<()> {
        match msg.message {
            Message::AppendEntries { .. } => {
                self.send(msg.from, Message::AppendEntriesResponse { outcome: AppendOutcome::Retry })
            }
            Message::RequestVote { .. } => {
                self.send(msg.from, Message::RequestVoteResponse { granted: false })
            }
            Message::InstallSnapshot { .. } => {
                self.send(msg.from, Message::InstallSnapshotResponse { last_index: 0 })
            }
            _ => {
                debug!("Dropping message from past term: {msg:?}");
                Ok(())
            }
        }
    }

    /// Asserts common member invariants.
    fn assert_member(&mut self) {
        debug_assert_eq!(self.term, self.log.get_term().0, "term does not match log");
        debug_assert!(
            self.config_index <= self.log.get_last_index().0,
            "config index beyond last index"
        );
    }
}
