use super::{rand_election_timeout, Follower, Member, RawMember, Role};
use crate::error::{Error, Result};
use crate::raft::state::Resolver;
use crate::raft::{
    AppendOutcome, ChangeToken, Configuration, Envelope, Index, MemberId, Membership, Message,
    Outcome, Payload, Term, Ticks, HEARTBEAT_INTERVAL,
};

use ::log::{debug, info};
use std::collections::{BTreeMap, BTreeSet};

/// A leader serves client proposals and replicates the log to its peers.
#[derive(Debug)]
pub struct Leader {
    /// Replication progress per peer: every configured member except ourself.
    pub(super) progress: BTreeMap<MemberId, Progress>,
    /// Ticks since the last heartbeat broadcast.
    pub(super) since_heartbeat: Ticks,
    /// Outstanding proposals by log index. Resolved by exactly one of: the
    /// commit advancement, the rejection handler, the leadership-loss
    /// transition, or the drop on shutdown.
    pub(super) proposals: BTreeMap<Index, Resolver>,
}

/// Replication progress for a single peer.
#[derive(Clone, Debug, PartialEq)]
pub(super) struct Progress {
    /// The next log index to replicate to the peer.
    pub(super) next_index: Index,
    /// The highest log index known to be replicated on the peer.
    pub(super) match_index: Index,
}

impl Leader {
    /// Creates a new leader role for the given peers and last log index.
    /// next_index is optimistically the entry after the leader's last; it is
    /// walked back when the peer asks for retries.
    pub fn new(peers: BTreeSet<MemberId>, last_index: Index) -> Self {
        let progress = peers
            .into_iter()
            .map(|id| (id, Progress { next_index: last_index + 1, match_index: 0 }))
            .collect();
        Self { progress, since_heartbeat: 0, proposals: BTreeMap::new() }
    }

    /// Resolves all proposals at or below the given index.
    fn resolve_to(&mut self, index: Index, outcome: Outcome) {
        let keep = self.proposals.split_off(&(index + 1));
        for (_, resolver) in std::mem::replace(&mut self.proposals, keep) {
            resolver.resolve(outcome);
        }
    }

    /// Resolves all proposals at or above the given index.
    fn resolve_from(&mut self, index: Index, outcome: Outcome) {
        for (_, resolver) in self.proposals.split_off(&index) {
            resolver.resolve(outcome);
        }
    }

    /// Resolves all outstanding proposals.
    fn resolve_all(&mut self, outcome: Outcome) {
        for (_, resolver) in std::mem::take(&mut self.proposals) {
            resolver.resolve(outcome);
        }
    }
}

impl Role for Leader {}

impl RawMember<Leader> {
    /// Asserts internal invariants.
    fn assert(&mut self) {
        self.assert_member();
        assert_ne!(self.term, 0, "leaders can't have term 0");
        debug_assert_eq!(Some(self.id), self.log.get_term().1, "log vote does not match self");
    }

    /// Transitions the leader into a follower, either because a higher term
    /// was discovered or because a committed configuration change removed us
    /// from the voters. Outstanding proposals resolve LostLeadership: we can
    /// no longer know whether they survive, the client must retry.
    pub(super) fn into_follower(
        mut self,
        term: Term,
        leader: Option<MemberId>,
    ) -> Result<RawMember<Follower>> {
        assert!(term >= self.term, "term regression {} → {term}", self.term);
        self.role.resolve_all(Outcome::LostLeadership);
        let election_timeout = rand_election_timeout();
        if term > self.term {
            info!("Discovered new term {term}, stepping down");
            self.term = term;
            self.log.set_term(term, None)?;
            Ok(self.into_role(Follower::new(leader, None, election_timeout)))
        } else {
            info!("Stepping down as leader in term {term}");
            let voted_for = Some(self.id); // by definition
            Ok(self.into_role(Follower::new(leader, voted_for, election_timeout)))
        }
    }

    /// Processes an inbound message.
    pub fn step(mut self, msg: Envelope) -> Result<Member> {
        self.assert();
        assert_eq!(msg.to, self.id, "message to other member");

        if msg.term > self.term {
            return self.into_follower(msg.term, None)?.step(msg);
        }
        if msg.term < self.term {
            self.refuse_stale(&msg)?;
            return Ok(self.into());
        }

        match msg.message {
            // Election safety: there can only be one leader per term.
            Message::AppendEntries { .. } | Message::InstallSnapshot { .. } => {
                panic!("saw other leader {} in term {}", msg.from, self.term)
            }

            // We already voted for ourself in this term.
            Message::RequestVote { .. } => {
                self.send(msg.from, Message::RequestVoteResponse { granted: false })?
            }

            // Late votes from the election we already won.
            Message::RequestVoteResponse { .. } => {}

            Message::AppendEntriesResponse { outcome: AppendOutcome::Success { last_index } } => {
                self.advance_progress(msg.from, last_index)?;
            }

            Message::AppendEntriesResponse { outcome: AppendOutcome::Retry } => {
                self.handle_retry(msg.from)?;
            }

            Message::AppendEntriesResponse { outcome: AppendOutcome::Rejected { index } } => {
                self.handle_rejected(msg.from, index)?;
            }

            Message::InstallSnapshotResponse { last_index } => {
                self.advance_progress(msg.from, last_index)?;
                // Ship any entries beyond the installed snapshot.
                let (log_last_index, _) = self.log.get_last_index();
                let pending = self
                    .role
                    .progress
                    .get(&msg.from)
                    .is_some_and(|p| p.next_index <= log_last_index);
                if pending {
                    self.send_append(msg.from)?;
                }
            }
        }

        // A committed configuration change may have removed us from the
        // voters; hand leadership over.
        if self.should_step_down() {
            let term = self.term;
            return Ok(self.into_follower(term, None)?.into());
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick, sending heartbeats (and any pending
    /// entries) to all peers at the heartbeat interval. This doubles as the
    /// retransmission path for lost messages.
    pub fn tick(mut self) -> Result<Member> {
        self.assert();
        self.role.since_heartbeat += 1;
        if self.role.since_heartbeat >= HEARTBEAT_INTERVAL {
            self.role.since_heartbeat = 0;
            self.heartbeat()?;
        }
        if self.should_step_down() {
            let term = self.term;
            return Ok(self.into_follower(term, None)?.into());
        }
        Ok(self.into())
    }

    /// Proposes a state machine change, returning a token that resolves with
    /// the change's eventual outcome. The change is validated before it
    /// enters the log; a rejected change resolves immediately.
    pub(super) fn propose_change(&mut self, change: Vec<u8>) -> Result<ChangeToken> {
        if !self.state.consider(&change) {
            debug!("Rejecting proposed change");
            return Ok(ChangeToken::resolved(Outcome::Rejected));
        }
        let (resolver, token) = ChangeToken::new();
        let index = self.propose_payload(Payload::Change(change), Some(resolver))?;
        debug!("Proposed change at index {index}");
        Ok(token)
    }

    /// Proposes a cluster configuration change using joint consensus: a
    /// C(old,new) entry takes effect (for quorum purposes) as soon as it is
    /// appended; once it commits, the leader appends the final C(new) entry.
    /// The token resolves Committed when the joint entry commits, after
    /// which the transition completes without further client involvement
    /// (any future leader finishes it).
    ///
    /// Only one configuration change may be in flight: proposals while any
    /// configuration entry is uncommitted (or a joint transition is still
    /// incomplete) fail with ConfigChangeInProgress.
    pub(super) fn propose_config_change(&mut self, membership: Membership) -> Result<ChangeToken> {
        membership.validate()?;
        let (commit_index, _) = self.log.get_commit_index();
        let old = match &self.config {
            Configuration::Joint(..) => return Err(Error::ConfigChangeInProgress),
            _ if self.config_index > commit_index => return Err(Error::ConfigChangeInProgress),
            Configuration::Stable(membership) => membership.clone(),
        };
        let (resolver, token) = ChangeToken::new();
        let config = Configuration::Joint(old, membership);
        let index = self.propose_payload(Payload::Config(config), Some(resolver))?;
        info!("Began configuration change at index {index}");
        Ok(token)
    }

    /// Appends a payload to the log and replicates it to all peers,
    /// registering an optional resolver for it. Configuration payloads take
    /// effect immediately.
    pub(super) fn propose_payload(
        &mut self,
        payload: Payload,
        resolver: Option<Resolver>,
    ) -> Result<Index> {
        let is_config = matches!(payload, Payload::Config(_));
        let index = self.log.append(payload)?;
        if let Some(resolver) = resolver {
            self.role.proposals.insert(index, resolver);
        }
        if is_config {
            self.refresh_config()?;
            self.sync_progress();
        }
        self.heartbeat()?;
        // Without peers (or with a quorum of one), this commits immediately.
        self.maybe_commit()?;
        Ok(index)
    }

    /// Sends pending entries (or an empty heartbeat) to all peers.
    fn heartbeat(&mut self) -> Result<()> {
        let peers: Vec<MemberId> = self.role.progress.keys().copied().collect();
        for peer in peers {
            self.send_append(peer)?;
        }
        Ok(())
    }

    /// Sends entries from the peer's next index onwards, or our snapshot if
    /// the peer is so far behind that the entries it needs are compacted
    /// away.
    fn send_append(&mut self, peer: MemberId) -> Result<()> {
        let Some(progress) = self.role.progress.get(&peer) else {
            return Ok(());
        };
        let next_index = progress.next_index;
        let (snapshot_index, _) = self.log.get_prev_index();
        if next_index <= snapshot_index {
            let snapshot = self.log.snapshot()?;
            debug!("Peer {peer} is behind the log, sending snapshot at {}", snapshot.index);
            return self.send(peer, Message::InstallSnapshot { snapshot });
        }
        let prev_index = next_index - 1;
        let prev_term = self.log.term_of(prev_index)?.expect("missing base entry");
        let entries = self.log.scan(next_index..).collect::<Result<Vec<_>>>()?;
        let (commit_index, _) = self.log.get_commit_index();
        debug!("Replicating {} entries at base {prev_index} to {peer}", entries.len());
        self.send(
            peer,
            Message::AppendEntries { prev_index, prev_term, entries, commit_index },
        )
    }

    /// Advances a peer's replication progress after it acknowledged entries
    /// up to last_index, and advances the commit index if a quorum has them.
    /// Stale and duplicate acknowledgements are ignored.
    fn advance_progress(&mut self, peer: MemberId, last_index: Index) -> Result<()> {
        let Some(progress) = self.role.progress.get_mut(&peer) else {
            return Ok(()); // no longer a configured member
        };
        if last_index > progress.match_index {
            progress.match_index = last_index;
            progress.next_index = progress.next_index.max(last_index + 1);
            self.maybe_commit()?;
        }
        Ok(())
    }

    /// Handles a retry request: the peer's log diverges before next_index,
    /// so walk back one entry and try again. Below the snapshot prefix the
    /// peer can't be caught up entry by entry, so send the snapshot.
    fn handle_retry(&mut self, peer: MemberId) -> Result<()> {
        let (snapshot_index, _) = self.log.get_prev_index();
        let Some(progress) = self.role.progress.get_mut(&peer) else {
            return Ok(());
        };
        if progress.next_index > snapshot_index + 1 {
            progress.next_index = (progress.next_index - 1).max(progress.match_index + 1);
            self.send_append(peer)
        } else {
            let snapshot = self.log.snapshot()?;
            self.send(peer, Message::InstallSnapshot { snapshot })
        }
    }

    /// Handles a veto: a peer's state machine rejected the (uncommitted)
    /// entry at the given index. Validation is deterministic, so no quorum
    /// can ever accept the entry: abandon it and everything after it, and
    /// surface the rejection to the affected proposals. The peer's
    /// next_index is left alone; replication resumes from the truncated log.
    fn handle_rejected(&mut self, peer: MemberId, index: Index) -> Result<()> {
        if !self.role.progress.contains_key(&peer) {
            return Ok(());
        }
        let (commit_index, _) = self.log.get_commit_index();
        assert!(index > commit_index, "entry {index} rejected below commit index {commit_index}");
        let (last_index, _) = self.log.get_last_index();
        if index > last_index {
            return Ok(()); // already truncated by an earlier rejection
        }
        info!("Peer {peer} rejected entry {index}, abandoning it");
        self.log.truncate_from(index)?;
        self.refresh_config()?;
        self.sync_progress();
        self.role.resolve_from(index, Outcome::Rejected);
        let (last_index, _) = self.log.get_last_index();
        for progress in self.role.progress.values_mut() {
            progress.next_index = progress.next_index.min(last_index + 1);
            progress.match_index = progress.match_index.min(last_index);
        }
        Ok(())
    }

    /// Advances the commit index to the highest index replicated to a quorum,
    /// but only if the entry there is from our own term: entries from earlier
    /// terms must never be counted directly, only committed transitively
    /// (figure 8 in the Raft paper). Newly committed entries are applied,
    /// their proposals resolved, and a committed joint configuration advanced.
    fn maybe_commit(&mut self) -> Result<Index> {
        let (last_index, _) = self.log.get_last_index();
        let id = self.id;
        let progress = &self.role.progress;
        let quorum_index = self.config.quorum_value(|peer| {
            if peer == id {
                last_index
            } else {
                progress.get(&peer).map(|p| p.match_index).unwrap_or(0)
            }
        });

        let (commit_index, _) = self.log.get_commit_index();
        if quorum_index <= commit_index {
            return Ok(commit_index);
        }
        match self.log.term_of(quorum_index)? {
            Some(term) if term == self.term => {}
            _ => return Ok(commit_index),
        }

        let commit_index = self.log.commit(quorum_index)?;
        debug!("Committed entries up to {commit_index}");
        self.role.resolve_to(commit_index, Outcome::Committed);
        self.maybe_apply()?;
        self.maybe_advance_config()?;
        Ok(commit_index)
    }

    /// Completes a committed joint configuration by appending the final
    /// stable configuration. Also run when assuming leadership, to finish a
    /// transition a previous leader started.
    pub(super) fn maybe_advance_config(&mut self) -> Result<()> {
        let (commit_index, _) = self.log.get_commit_index();
        if self.config_index > commit_index {
            return Ok(());
        }
        if let Configuration::Joint(_, new) = &self.config {
            info!("Joint configuration committed, completing transition");
            let config = Configuration::Stable(new.clone());
            self.propose_payload(Payload::Config(config), None)?;
        }
        Ok(())
    }

    /// Reconciles the progress map with the effective configuration: new
    /// members start from the end of the log (and are walked back or sent a
    /// snapshot as needed), removed members stop being replicated to.
    fn sync_progress(&mut self) {
        let (last_index, _) = self.log.get_last_index();
        let members = self.config.members();
        self.role.progress.retain(|id, _| members.contains(id));
        for id in members {
            if id != self.id {
                self.role
                    .progress
                    .entry(id)
                    .or_insert(Progress { next_index: last_index + 1, match_index: 0 });
            }
        }
    }

    /// Returns true if a committed stable configuration no longer includes
    /// us as a voter: the leader serves until the transition commits, then
    /// steps down.
    fn should_step_down(&self) -> bool {
        let (commit_index, _) = self.log.get_commit_index();
        matches!(&self.config, Configuration::Stable(membership)
            if self.config_index <= commit_index && !membership.voting.contains(&self.id))
    }
}
