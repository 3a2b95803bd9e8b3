use crate::raft::MemberId;

use serde::{Deserialize, Serialize};

/// A quorum error. Errors are passed along to clients, so they are
/// serializable. Invariant violations are not errors: they indicate a bug and
/// panic, since the cluster state can no longer be trusted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The operation was aborted and must be retried, e.g. because the member
    /// is shutting down.
    Abort,
    /// A cluster configuration change is already in progress. Only one
    /// configuration change can be underway at a time.
    ConfigChangeInProgress,
    /// Invalid data, e.g. decoding errors or storage corruption.
    InvalidData(String),
    /// Invalid user input, e.g. a malformed configuration.
    InvalidInput(String),
    /// The member is not the leader and can't serve proposals. Contains the
    /// current leader, if known, as a hint for the client's retry.
    NotLeader { leader: Option<MemberId> },
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Abort => write!(f, "operation aborted"),
            Error::ConfigChangeInProgress => write!(f, "configuration change in progress"),
            Error::InvalidData(message) => write!(f, "invalid data: {message}"),
            Error::InvalidInput(message) => write!(f, "invalid input: {message}"),
            Error::NotLeader { leader: Some(leader) } => write!(f, "not leader, try {leader}"),
            Error::NotLeader { leader: None } => write!(f, "not leader, leader unknown"),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(_: crossbeam::channel::SendError<T>) -> Self {
        Error::Abort
    }
}

/// A quorum result returning Error.
pub type Result<T> = std::result::Result<T, Error>;
