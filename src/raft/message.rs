use super::{Entry, Index, MemberId, Snapshot, Term};

use serde::{Deserialize, Serialize};

/// A message envelope routed between Raft members.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The sender.
    pub from: MemberId,
    /// The recipient.
    pub to: MemberId,
    /// The sender's current term.
    pub term: Term,
    /// The message payload.
    pub message: Message,
}

/// A message between Raft members. The term of the sender is carried on the
/// envelope; any message with a higher term than the recipient's causes the
/// recipient to adopt it, and any request with a lower term is refused with
/// the recipient's term so the sender can catch up.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Leaders replicate log entries to followers, and send empty
    /// AppendEntries as heartbeats to assert leadership.
    AppendEntries {
        /// The index of the entry immediately preceding the submitted entries.
        prev_index: Index,
        /// The term of the entry immediately preceding the submitted entries.
        prev_term: Term,
        /// Entries to replicate, starting at prev_index + 1.
        entries: Vec<Entry>,
        /// The leader's commit index; followers advance their own up to it.
        commit_index: Index,
    },

    /// Followers respond to AppendEntries with an outcome.
    AppendEntriesResponse { outcome: AppendOutcome },

    /// Candidates solicit votes from all voters when campaigning.
    RequestVote {
        /// The index of the candidate's last log entry.
        last_index: Index,
        /// The term of the candidate's last log entry.
        last_term: Term,
    },

    /// Voters may grant a single vote per term, on a first-come basis, and
    /// only to candidates whose log is at least as up-to-date as their own.
    RequestVoteResponse { granted: bool },

    /// Leaders install a snapshot on followers that have fallen behind the
    /// leader's snapshot prefix and can no longer be caught up entry by entry.
    InstallSnapshot { snapshot: Snapshot },

    /// Followers acknowledge an installed (or already covered) snapshot.
    InstallSnapshotResponse {
        /// The snapshot index now covered by the follower.
        last_index: Index,
    },
}

/// The outcome of an AppendEntries request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AppendOutcome {
    /// The entries were appended (or already present).
    Success {
        /// The last log index covered by the request: the leader may advance
        /// the follower's match index to it.
        last_index: Index,
    },
    /// The follower's log does not contain the entry at prev_index with
    /// prev_term; the leader should back up and retry.
    Retry,
    /// The follower's state machine vetoed the proposed entry at the given
    /// index. The leader abandons the entry rather than retrying forever.
    /// This is an extension to plain Raft: validation is deterministic, so a
    /// veto by any member means no quorum could ever have accepted the entry.
    Rejected { index: Index },
}
