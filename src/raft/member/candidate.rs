use super::{rand_election_timeout, Follower, Leader, Member, Message, RawMember, Role};
use crate::error::Result;
use crate::raft::{Envelope, MemberId, Payload, Term, Ticks};

use ::log::{debug, info};
use std::collections::BTreeSet;

/// A candidate is campaigning to become leader.
#[derive(Clone, Debug)]
pub struct Candidate {
    /// Votes received, including our own.
    pub(super) votes: BTreeSet<MemberId>,
    /// Ticks elapsed since the election started.
    pub(super) election_duration: Ticks,
    /// The election timeout, in ticks. When it expires without a winner, a
    /// new election is called in the next term.
    pub(super) election_timeout: Ticks,
}

impl Candidate {
    pub fn new(election_timeout: Ticks) -> Self {
        Self { votes: BTreeSet::new(), election_duration: 0, election_timeout }
    }
}

impl Role for Candidate {}

impl RawMember<Candidate> {
    /// Asserts internal invariants.
    fn assert(&mut self) {
        self.assert_member();
        assert_ne!(self.term, 0, "candidates can't have term 0");
        assert!(self.role.votes.contains(&self.id), "candidate did not vote for self");
        assert!(self.config.is_voter(self.id), "non-voter campaigning");
        debug_assert_eq!(Some(self.id), self.log.get_term().1, "log vote does not match self");
    }

    /// Returns true if the received votes win the election: a majority of
    /// voters, in both memberships under a joint configuration.
    pub(super) fn has_quorum(&self) -> bool {
        self.config.has_vote_quorum(&self.role.votes)
    }

    /// Transitions the candidate into a follower. Either we lost the election
    /// and follow the winner, or we discovered a new term and step into it as
    /// a leaderless follower.
    pub(super) fn into_follower(
        mut self,
        term: Term,
        leader: Option<MemberId>,
    ) -> Result<RawMember<Follower>> {
        assert!(term >= self.term, "term regression {} → {term}", self.term);

        let election_timeout = rand_election_timeout();
        if let Some(leader) = leader {
            // We lost the election; follow the winner.
            assert_eq!(term, self.term, "can't follow leader in a different term");
            info!("Lost election, following leader {leader} in term {term}");
            let voted_for = Some(self.id); // by definition
            Ok(self.into_role(Follower::new(Some(leader), voted_for, election_timeout)))
        } else {
            // We found a new term, but don't yet know who leads it.
            assert_ne!(term, self.term, "can't become leaderless follower in current term");
            info!("Discovered new term {term}");
            self.term = term;
            self.log.set_term(term, None)?;
            Ok(self.into_role(Follower::new(None, None, election_timeout)))
        }
    }

    /// Transitions the candidate into a leader: we won the election. Appends
    /// a no-op entry and replicates it to all peers; committing it commits
    /// all earlier entries too, which is required before the leader can
    /// serve (section 8 in the Raft paper).
    pub(super) fn into_leader(self) -> Result<RawMember<Leader>> {
        info!("Won election for term {}, becoming leader", self.term);
        let (last_index, _) = self.log.get_last_index();
        let peers = self.peers();
        let mut leader = self.into_role(Leader::new(peers, last_index));
        leader.propose_payload(Payload::Noop, None)?;
        // A previous leader may have gotten a joint configuration committed
        // without completing the transition; finish it.
        leader.maybe_advance_config()?;
        Ok(leader)
    }

    /// Processes an inbound message.
    pub fn step(mut self, msg: Envelope) -> Result<Member> {
        self.assert();
        assert_eq!(msg.to, self.id, "message to other member");

        // If the sender's term is ahead, become a leaderless follower in it
        // and step the message there.
        if msg.term > self.term {
            return self.into_follower(msg.term, None)?.step(msg);
        }
        if msg.term < self.term {
            self.refuse_stale(&msg)?;
            return Ok(self.into());
        }

        match msg.message {
            // Our vote went to ourself, don't grant it to other candidates.
            Message::RequestVote { .. } => {
                self.send(msg.from, Message::RequestVoteResponse { granted: false })?
            }

            // Tally votes; a quorum makes us leader.
            Message::RequestVoteResponse { granted: true } => {
                self.role.votes.insert(msg.from);
                if self.has_quorum() {
                    return Ok(self.into_leader()?.into());
                }
            }
            Message::RequestVoteResponse { granted: false } => {}

            // A leader exists in this term: we lost the election. Follow it
            // and step the message there.
            Message::AppendEntries { .. } | Message::InstallSnapshot { .. } => {
                return self.into_follower(msg.term, Some(msg.from))?.step(msg);
            }

            // Stale responses from a past life as leader.
            Message::AppendEntriesResponse { .. } | Message::InstallSnapshotResponse { .. } => {
                debug!("Ignoring stale response {msg:?}")
            }
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick. If the election times out without a
    /// winner, call a new one in the next term.
    pub fn tick(mut self) -> Result<Member> {
        self.assert();
        self.role.election_duration += 1;
        if self.role.election_duration >= self.role.election_timeout {
            self.campaign()?;
            if self.has_quorum() {
                return Ok(self.into_leader()?.into());
            }
        }
        Ok(self.into())
    }

    /// Campaigns for leadership: bump the term, vote for ourself (durably),
    /// and solicit votes from all voters.
    pub(super) fn campaign(&mut self) -> Result<()> {
        let term = self.term + 1;
        info!("Starting election for term {term}");
        self.role = Candidate::new(rand_election_timeout());
        self.role.votes.insert(self.id);
        self.term = term;
        self.log.set_term(term, Some(self.id))?;

        let (last_index, last_term) = self.log.get_last_index();
        self.broadcast(self.config.voters(), Message::RequestVote { last_index, last_term })
    }
}
