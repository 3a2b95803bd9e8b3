use super::{rand_election_timeout, Candidate, Member, RawMember, Role};
use crate::error::Result;
use crate::raft::{
    AppendOutcome, Entry, Envelope, Index, MemberId, Message, Payload, Snapshot, Term, Ticks,
};

use ::log::{debug, info};

/// A follower replicates entries from a leader, grants votes to candidates,
/// and calls an election when its leader goes quiet.
#[derive(Clone, Debug, PartialEq)]
pub struct Follower {
    /// The leader in the current term, or None if not yet known. At most one
    /// leader can exist per term.
    pub(super) leader: Option<MemberId>,
    /// The member we voted for in the current term, if any. Mirrors the
    /// persisted vote in the log.
    pub(super) voted_for: Option<MemberId>,
    /// Ticks since the last message from the leader (or granted vote).
    pub(super) leader_seen: Ticks,
    /// The election timeout, in ticks.
    pub(super) election_timeout: Ticks,
}

impl Follower {
    pub fn new(
        leader: Option<MemberId>,
        voted_for: Option<MemberId>,
        election_timeout: Ticks,
    ) -> Self {
        Self { leader, voted_for, leader_seen: 0, election_timeout }
    }
}

impl Role for Follower {}

impl RawMember<Follower> {
    /// Asserts internal invariants.
    fn assert(&mut self) {
        self.assert_member();
        debug_assert_eq!(self.role.voted_for, self.log.get_term().1, "vote does not match log");
    }

    /// Transitions into a candidate and campaigns for leadership.
    pub(super) fn into_candidate(self) -> Result<RawMember<Candidate>> {
        let mut candidate = self.into_role(Candidate::new(rand_election_timeout()));
        candidate.campaign()?;
        Ok(candidate)
    }

    /// Records the leader for the current term. The Raft election safety
    /// property guarantees at most one leader per term, so a conflicting
    /// claim is a fatal protocol violation.
    fn follow(&mut self, leader: MemberId) {
        assert_ne!(leader, self.id, "can't follow self");
        match self.role.leader {
            Some(l) => assert_eq!(l, leader, "multiple leaders in term {}", self.term),
            None => {
                info!("Following leader {leader} in term {}", self.term);
                self.role.leader = Some(leader);
            }
        }
        self.role.leader_seen = 0;
    }

    /// Processes an inbound message.
    pub fn step(mut self, msg: Envelope) -> Result<Member> {
        self.assert();
        assert_eq!(msg.to, self.id, "message to other member");

        // If the sender's term is ahead, adopt it as a leaderless follower.
        if msg.term > self.term {
            info!("Discovered new term {}", msg.term);
            self.term = msg.term;
            self.log.set_term(msg.term, None)?;
            self.role = Follower::new(None, None, rand_election_timeout());
        }
        // Requests from a past term are refused with our current term, so
        // the sender can catch up.
        if msg.term < self.term {
            self.refuse_stale(&msg)?;
            return Ok(self.into());
        }

        match msg.message {
            Message::AppendEntries { prev_index, prev_term, entries, commit_index } => {
                self.handle_append_entries(msg.from, prev_index, prev_term, entries, commit_index)?
            }
            Message::RequestVote { last_index, last_term } => {
                self.handle_request_vote(msg.from, last_index, last_term)?
            }
            Message::InstallSnapshot { snapshot } => {
                self.handle_install_snapshot(msg.from, snapshot)?
            }
            // Stale responses from a past life as leader or candidate.
            Message::AppendEntriesResponse { .. }
            | Message::RequestVoteResponse { .. }
            | Message::InstallSnapshotResponse { .. } => {}
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick. When the leader has gone quiet for an
    /// election timeout, campaign for leadership -- but only voters do;
    /// non-voting members wait to be caught up and promoted.
    pub fn tick(mut self) -> Result<Member> {
        self.assert();
        self.role.leader_seen += 1;
        if self.role.leader_seen >= self.role.election_timeout {
            if self.config.is_voter(self.id) {
                let candidate = self.into_candidate()?;
                if candidate.has_quorum() {
                    // A sole voter wins immediately.
                    return Ok(candidate.into_leader()?.into());
                }
                return Ok(candidate.into());
            }
            self.role.leader_seen = 0;
        }
        Ok(self.into())
    }

    /// Handles an AppendEntries request (section 5.3 in the Raft paper, plus
    /// the rejection extension): validate the proposed entries with the
    /// state machine, check that the log contains the base entry, truncate
    /// any conflicting suffix, append, and advance the commit index. The
    /// entries are durable before the response is sent.
    fn handle_append_entries(
        &mut self,
        from: MemberId,
        prev_index: Index,
        prev_term: Term,
        entries: Vec<Entry>,
        commit_index: Index,
    ) -> Result<()> {
        self.follow(from);

        // Give the state machine a veto over uncommitted proposals. The
        // verdict is deterministic, so rejecting here means no quorum could
        // ever accept the entry, and the leader can abandon it outright.
        let committed = commit_index.max(self.log.get_commit_index().0);
        for entry in &entries {
            if entry.index <= committed {
                continue;
            }
            if let Payload::Change(change) = &entry.payload {
                if !self.state.consider(change) {
                    debug!("Rejecting proposed entry {}", entry.index);
                    let outcome = AppendOutcome::Rejected { index: entry.index };
                    return self.send(from, Message::AppendEntriesResponse { outcome });
                }
            }
        }

        // The log must contain the base entry, otherwise the leader must
        // back up and retry from an earlier index.
        if !self.log.has(prev_index, prev_term)? {
            debug!("Missing base entry {prev_index}@{prev_term}, asking leader to retry");
            let outcome = AppendOutcome::Retry;
            return self.send(from, Message::AppendEntriesResponse { outcome });
        }

        // Append the entries, skipping duplicates and truncating conflicts,
        // and record the last index this request vouches for (not our last
        // index: we may hold divergent entries beyond it).
        let last_index = entries.last().map(|e| e.index).unwrap_or(prev_index);
        self.log.splice(entries)?;
        self.refresh_config()?;

        // Advance the commit index up to the leader's, within this request's
        // range, and apply.
        if commit_index.min(last_index) > self.log.get_commit_index().0 {
            self.log.commit(commit_index.min(last_index))?;
            self.maybe_apply()?;
            self.refresh_config()?;
        }

        let outcome = AppendOutcome::Success { last_index };
        self.send(from, Message::AppendEntriesResponse { outcome })
    }

    /// Handles a RequestVote request (section 5.2 in the Raft paper). Grants
    /// the vote iff we haven't voted for anyone else this term and the
    /// candidate's log is at least as up-to-date as ours. The vote is durable
    /// before the response is sent.
    fn handle_request_vote(
        &mut self,
        from: MemberId,
        last_index: Index,
        last_term: Term,
    ) -> Result<()> {
        if let Some(voted_for) = self.role.voted_for {
            if voted_for != from {
                return self.send(from, Message::RequestVoteResponse { granted: false });
            }
        }
        let (our_last_index, our_last_term) = self.log.get_last_index();
        let up_to_date = last_term > our_last_term
            || (last_term == our_last_term && last_index >= our_last_index);
        if !up_to_date {
            return self.send(from, Message::RequestVoteResponse { granted: false });
        }
        if self.role.voted_for.is_none() {
            info!("Voting for {from} in term {} election", self.term);
            self.log.set_term(self.term, Some(from))?;
            self.role.voted_for = Some(from);
        }
        // A granted vote also resets the election timer, to avoid disrupting
        // the election we just participated in.
        self.role.leader_seen = 0;
        self.send(from, Message::RequestVoteResponse { granted: true })
    }

    /// Handles an InstallSnapshot request (section 7 in the Raft paper). The
    /// snapshot replaces the log prefix and the state machine; a log suffix
    /// beyond the snapshot is retained if it matches. Stale snapshots (at or
    /// below our commit index) are acknowledged without effect.
    fn handle_install_snapshot(&mut self, from: MemberId, snapshot: Snapshot) -> Result<()> {
        self.follow(from);
        let (index, config) = (snapshot.index, snapshot.config.clone());
        let state = snapshot.state.clone();
        if self.log.install_snapshot(snapshot)? {
            info!("Installed snapshot at index {index}");
            self.state.restore(&state)?;
            self.applied_index = index;
            self.applied_config = config;
            self.refresh_config()?;
        }
        self.send(from, Message::InstallSnapshotResponse { last_index: index })
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{assert_member, assert_messages, ids, setup_follower, TestState};
    use super::*;
    use crate::raft::{Configuration, Membership, State as _};

    use pretty_assertions::assert_eq;

    /// Builds an envelope.
    fn msg(from: MemberId, to: MemberId, term: Term, message: Message) -> Envelope {
        Envelope { from, to, term, message }
    }

    fn change(index: Index, term: Term, byte: u8) -> Entry {
        Entry { index, term, payload: Payload::Change(vec![byte]) }
    }

    /// Sets up a 5-member cluster follower at term 3 following peer 1, with
    /// log entries 1@1 2@1 3@2 4@2, of which 1-2 are committed, applied and
    /// compacted away.
    fn setup() -> Result<(
        Vec<MemberId>,
        RawMember<Follower>,
        crossbeam::channel::Receiver<Envelope>,
    )> {
        let ids = ids(5);
        let changes: &[(Term, &[u8])] = &[(1, &[1]), (1, &[2]), (2, &[3]), (2, &[4])];
        let (mut member, rx) = setup_follower(ids[0], &ids, changes, 2)?;
        member.log.set_term(3, None)?;
        member.term = 3;
        member.role = Follower::new(Some(ids[1]), None, member.role.election_timeout);
        Ok((ids, member, rx))
    }

    #[test]
    fn append_entries_appends_and_commits() -> Result<()> {
        let (ids, follower, rx) = setup()?;
        let leader = ids[1];
        let mut member = follower.step(msg(
            leader,
            ids[0],
            3,
            Message::AppendEntries {
                prev_index: 4,
                prev_term: 2,
                entries: vec![change(5, 3, 5)],
                commit_index: 4,
            },
        ))?;
        // Entries 3-4 commit and apply; 5 is appended but uncommitted.
        assert_member(&mut member)
            .is_follower()
            .term(3)
            .leader(Some(leader))
            .committed(4)
            .applied(4)
            .last(5)
            .entry(change(5, 3, 5));
        assert_messages(
            &rx,
            vec![msg(
                ids[0],
                leader,
                3,
                Message::AppendEntriesResponse {
                    outcome: AppendOutcome::Success { last_index: 5 },
                },
            )],
        );
        Ok(())
    }

    #[test]
    fn append_entries_duplicate_is_idempotent() -> Result<()> {
        let (ids, follower, rx) = setup()?;
        let leader = ids[1];
        let append = Message::AppendEntries {
            prev_index: 2,
            prev_term: 1,
            entries: vec![change(3, 2, 3), change(4, 2, 4)],
            commit_index: 3,
        };

        let mut member: Member = follower.into();
        for _ in 0..2 {
            member = member.step(msg(leader, ids[0], 3, append.clone()))?;
            assert_member(&mut member).is_follower().term(3).committed(3).applied(3).last(4);
            assert_messages(
                &rx,
                vec![msg(
                    ids[0],
                    leader,
                    3,
                    Message::AppendEntriesResponse {
                        outcome: AppendOutcome::Success { last_index: 4 },
                    },
                )],
            );
        }
        Ok(())
    }

    #[test]
    fn append_entries_truncates_conflict() -> Result<()> {
        let (ids, follower, rx) = setup()?;
        let leader = ids[1];
        // A new leader in term 3 overwrites our uncommitted entry 4@2.
        let mut member = follower.step(msg(
            leader,
            ids[0],
            3,
            Message::AppendEntries {
                prev_index: 3,
                prev_term: 2,
                entries: vec![change(4, 3, 9)],
                commit_index: 2,
            },
        ))?;
        assert_member(&mut member).is_follower().last(4).entry(change(4, 3, 9));
        assert_messages(
            &rx,
            vec![msg(
                ids[0],
                leader,
                3,
                Message::AppendEntriesResponse {
                    outcome: AppendOutcome::Success { last_index: 4 },
                },
            )],
        );
        Ok(())
    }

    #[test]
    fn append_entries_missing_base_asks_retry() -> Result<()> {
        // Both a base beyond our log and a base with a conflicting term must
        // make the leader back up and retry.
        for (prev_index, prev_term) in [(6, 3), (4, 3)] {
            let (ids, follower, rx) = setup()?;
            let leader = ids[1];
            let mut member = follower.step(msg(
                leader,
                ids[0],
                3,
                Message::AppendEntries {
                    prev_index,
                    prev_term,
                    entries: vec![],
                    commit_index: 4,
                },
            ))?;
            assert_member(&mut member).is_follower().committed(2).last(4);
            assert_messages(
                &rx,
                vec![msg(
                    ids[0],
                    leader,
                    3,
                    Message::AppendEntriesResponse { outcome: AppendOutcome::Retry },
                )],
            );
        }
        Ok(())
    }

    #[test]
    fn append_entries_rejects_poison_change() -> Result<()> {
        let (ids, follower, rx) = setup()?;
        let leader = ids[1];
        let poison = Entry { index: 5, term: 3, payload: Payload::Change(TestState::POISON.into()) };
        let mut member = follower.step(msg(
            leader,
            ids[0],
            3,
            Message::AppendEntries {
                prev_index: 4,
                prev_term: 2,
                entries: vec![poison],
                commit_index: 2,
            },
        ))?;
        // Nothing is appended, and the leader is told to abandon the entry.
        assert_member(&mut member).is_follower().committed(2).last(4);
        assert_messages(
            &rx,
            vec![msg(
                ids[0],
                leader,
                3,
                Message::AppendEntriesResponse {
                    outcome: AppendOutcome::Rejected { index: 5 },
                },
            )],
        );
        Ok(())
    }

    #[test]
    fn append_entries_from_past_term_is_refused() -> Result<()> {
        let (ids, follower, rx) = setup()?;
        let mut member = follower.step(msg(
            ids[2],
            ids[0],
            2,
            Message::AppendEntries { prev_index: 4, prev_term: 2, entries: vec![], commit_index: 4 },
        ))?;
        // Refused at our term 3, so the stale leader can catch up.
        assert_member(&mut member).is_follower().term(3).committed(2);
        assert_messages(
            &rx,
            vec![msg(
                ids[0],
                ids[2],
                3,
                Message::AppendEntriesResponse { outcome: AppendOutcome::Retry },
            )],
        );
        Ok(())
    }

    #[test]
    fn request_vote_granted_once_per_term() -> Result<()> {
        let (ids, follower, rx) = setup()?;
        let candidate = ids[2];

        // The first sufficiently up-to-date candidate gets the vote, which
        // is persisted before replying.
        let mut member = follower.step(msg(
            candidate,
            ids[0],
            3,
            Message::RequestVote { last_index: 4, last_term: 2 },
        ))?;
        assert_member(&mut member).is_follower().term(3).voted_for(Some(candidate));
        assert_messages(
            &rx,
            vec![msg(ids[0], candidate, 3, Message::RequestVoteResponse { granted: true })],
        );

        // Repeated requests from the same candidate are granted again.
        member = member.step(msg(
            candidate,
            ids[0],
            3,
            Message::RequestVote { last_index: 4, last_term: 2 },
        ))?;
        assert_messages(
            &rx,
            vec![msg(ids[0], candidate, 3, Message::RequestVoteResponse { granted: true })],
        );

        // A different candidate in the same term is refused.
        member = member.step(msg(
            ids[3],
            ids[0],
            3,
            Message::RequestVote { last_index: 4, last_term: 2 },
        ))?;
        assert_member(&mut member).voted_for(Some(candidate));
        assert_messages(
            &rx,
            vec![msg(ids[0], ids[3], 3, Message::RequestVoteResponse { granted: false })],
        );
        Ok(())
    }

    #[test]
    fn request_vote_refuses_outdated_log() -> Result<()> {
        let (ids, follower, rx) = setup()?;
        let mut member: Member = follower.into();
        // Candidates whose log is shorter or in an older term are refused.
        for (last_index, last_term) in [(3, 2), (4, 1)] {
            member = member.step(msg(
                ids[2],
                ids[0],
                3,
                Message::RequestVote { last_index, last_term },
            ))?;
            assert_member(&mut member).voted_for(None);
            assert_messages(
                &rx,
                vec![msg(ids[0], ids[2], 3, Message::RequestVoteResponse { granted: false })],
            );
        }
        // A log in a newer term wins even if shorter.
        member = member.step(msg(
            ids[2],
            ids[0],
            3,
            Message::RequestVote { last_index: 1, last_term: 3 },
        ))?;
        assert_messages(
            &rx,
            vec![msg(ids[0], ids[2], 3, Message::RequestVoteResponse { granted: true })],
        );
        Ok(())
    }

    #[test]
    fn higher_term_is_adopted() -> Result<()> {
        let (ids, follower, rx) = setup()?;
        let mut member = follower.step(msg(
            ids[2],
            ids[0],
            5,
            Message::RequestVote { last_index: 4, last_term: 2 },
        ))?;
        assert_member(&mut member).is_follower().term(5).leader(None).voted_for(Some(ids[2]));
        assert_messages(
            &rx,
            vec![msg(ids[0], ids[2], 5, Message::RequestVoteResponse { granted: true })],
        );
        Ok(())
    }

    #[test]
    fn install_snapshot_replaces_state() -> Result<()> {
        let (ids, follower, rx) = setup()?;
        let leader = ids[1];
        let mut snapshotted = TestState::new();
        for byte in 1..=6_u8 {
            snapshotted.apply(&[byte]);
        }
        let state = snapshotted.snapshot();
        let snapshot = Snapshot {
            index: 6,
            term: 3,
            config: Configuration::Stable(Membership::new(ids.iter().copied())),
            state,
        };
        let mut member = follower.step(msg(
            leader,
            ids[0],
            3,
            Message::InstallSnapshot { snapshot },
        ))?;
        assert_member(&mut member).is_follower().committed(6).applied(6).last(6);
        assert_messages(
            &rx,
            vec![msg(ids[0], leader, 3, Message::InstallSnapshotResponse { last_index: 6 })],
        );

        // A stale snapshot is acknowledged without effect.
        let stale = Snapshot {
            index: 2,
            term: 1,
            config: Configuration::Stable(Membership::new(ids.iter().copied())),
            state: Vec::new(),
        };
        member = member.step(msg(leader, ids[0], 3, Message::InstallSnapshot { snapshot: stale }))?;
        assert_member(&mut member).committed(6).applied(6);
        assert_messages(
            &rx,
            vec![msg(ids[0], leader, 3, Message::InstallSnapshotResponse { last_index: 2 })],
        );
        Ok(())
    }

    #[test]
    fn tick_campaigns_after_election_timeout() -> Result<()> {
        let (ids, follower, rx) = setup()?;
        let leader = ids[1];
        let timeout = follower.role.election_timeout;
        assert!(timeout > 0);
        let mut member: Member = follower.into();

        // Heartbeats reset the election timer.
        for _ in 0..3 * timeout {
            member = member.tick()?;
            member = member.step(msg(
                leader,
                ids[0],
                3,
                Message::AppendEntries {
                    prev_index: 4,
                    prev_term: 2,
                    entries: vec![],
                    commit_index: 2,
                },
            ))?;
            assert_member(&mut member).is_follower().term(3);
            rx.try_iter().count(); // drain responses
        }

        // Without a leader, the timeout fires and we campaign.
        for _ in 0..timeout {
            assert_member(&mut member).is_follower();
            member = member.tick()?;
        }
        assert_member(&mut member).is_candidate().term(4).voted_for(Some(ids[0]));
        let requests: Vec<Envelope> = rx.try_iter().collect();
        assert_eq!(requests.len(), 4);
        for (request, id) in requests.iter().zip(ids.iter().skip(1)) {
            assert_eq!(
                request,
                &msg(ids[0], *id, 4, Message::RequestVote { last_index: 4, last_term: 2 })
            );
        }
        Ok(())
    }

    #[test]
    fn non_voter_does_not_campaign() -> Result<()> {
        let ids = ids(3);
        let outsider = MemberId::new();
        let (member, rx) = setup_follower(outsider, &ids, &[], 0)?;
        let timeout = member.role.election_timeout;
        let mut member: Member = member.into();
        for _ in 0..3 * timeout {
            member = member.tick()?;
        }
        assert_member(&mut member).is_follower().term(0);
        assert_messages(&rx, vec![]);
        Ok(())
    }
}
