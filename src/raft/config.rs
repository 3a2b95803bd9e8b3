use crate::error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// A unique Raft member identifier, assigned when the member first joins the
/// cluster and kept across restarts.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(Uuid);

impl MemberId {
    /// Generates a new random member ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MemberId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        // The first 8 hex digits are plenty to tell members apart in logs.
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

impl std::fmt::Debug for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

/// A set of cluster members: voters, which participate in elections and
/// quorums, and non-voting members, which only receive replicated entries
/// (e.g. while catching up before being promoted).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub voting: BTreeSet<MemberId>,
    pub non_voting: BTreeSet<MemberId>,
}

impl Membership {
    /// Creates a membership with the given voters and no non-voting members.
    pub fn new(voting: impl IntoIterator<Item = MemberId>) -> Self {
        Self { voting: voting.into_iter().collect(), non_voting: BTreeSet::new() }
    }

    /// Validates the membership.
    pub fn validate(&self) -> Result<()> {
        if self.voting.is_empty() {
            return Err(Error::InvalidInput("membership must have at least one voter".into()));
        }
        if let Some(id) = self.voting.intersection(&self.non_voting).next() {
            return Err(Error::InvalidInput(format!("member {id} is both voting and non-voting")));
        }
        Ok(())
    }

    /// Returns true if the given votes (or any per-member values that count
    /// towards a quorum) constitute a strict majority of the voters.
    fn has_quorum(&self, votes: &BTreeSet<MemberId>) -> bool {
        let granted = self.voting.intersection(votes).count();
        granted >= quorum_size(self.voting.len())
    }

    /// Returns the quorum (median) of the voters' values, e.g. the highest
    /// log index replicated to a strict majority of voters.
    fn quorum_value<T: Ord + Copy>(&self, value_of: &mut impl FnMut(MemberId) -> T) -> T {
        quorum_value(self.voting.iter().map(|&id| value_of(id)).collect())
    }
}

/// A cluster configuration: either a stable membership, or a joint
/// configuration while transitioning from an old to a new membership. Under
/// joint consensus, elections and commits require a majority in both
/// memberships, which makes the transition safe regardless of when which
/// member learns of it. The two memberships are a single tagged value, never
/// two independent fields, so quorum logic can't forget one of them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Configuration {
    Stable(Membership),
    Joint(Membership, Membership),
}

impl Configuration {
    /// Returns true if the given member is a voter. Under a joint
    /// configuration, a voter in either membership is a voter.
    pub fn is_voter(&self, id: MemberId) -> bool {
        match self {
            Configuration::Stable(membership) => membership.voting.contains(&id),
            Configuration::Joint(old, new) => {
                old.voting.contains(&id) || new.voting.contains(&id)
            }
        }
    }

    /// Returns all members, voting and non-voting. These are the replication
    /// targets.
    pub fn members(&self) -> BTreeSet<MemberId> {
        match self {
            Configuration::Stable(membership) => {
                membership.voting.union(&membership.non_voting).copied().collect()
            }
            Configuration::Joint(old, new) => old
                .voting
                .union(&old.non_voting)
                .chain(new.voting.union(&new.non_voting))
                .copied()
                .collect(),
        }
    }

    /// Returns all voters.
    pub fn voters(&self) -> BTreeSet<MemberId> {
        match self {
            Configuration::Stable(membership) => membership.voting.clone(),
            Configuration::Joint(old, new) => old.voting.union(&new.voting).copied().collect(),
        }
    }

    /// Returns true if the given votes win an election: a majority of the
    /// membership, or of both memberships under a joint configuration.
    pub fn has_vote_quorum(&self, votes: &BTreeSet<MemberId>) -> bool {
        match self {
            Configuration::Stable(membership) => membership.has_quorum(votes),
            Configuration::Joint(old, new) => old.has_quorum(votes) && new.has_quorum(votes),
        }
    }

    /// Returns the highest value replicated to a quorum, given each voter's
    /// value (typically its match index). Under a joint configuration this is
    /// the lower of the two memberships' quorum values, since an entry is only
    /// committed once a majority of both memberships have it.
    pub fn quorum_value<T: Ord + Copy>(&self, mut value_of: impl FnMut(MemberId) -> T) -> T {
        match self {
            Configuration::Stable(membership) => membership.quorum_value(&mut value_of),
            Configuration::Joint(old, new) => std::cmp::min(
                old.quorum_value(&mut value_of),
                new.quorum_value(&mut value_of),
            ),
        }
    }
}

/// Returns the size of a quorum (strict majority), given a total size.
fn quorum_size(size: usize) -> usize {
    size / 2 + 1
}

/// Returns the quorum (median) value of the given unsorted values, in
/// descending order. The slice cannot be empty.
fn quorum_value<T: Ord + Copy>(mut values: Vec<T>) -> T {
    assert!(!values.is_empty(), "no values provided");
    let index = quorum_size(values.len()) - 1;
    *values.select_nth_unstable_by(index, |a, b: &T| a.cmp(b).reverse()).1
}
