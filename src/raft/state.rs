use crate::error::Result;

/// A Raft-managed state machine. The state machine must be deterministic:
/// applying the same sequence of changes to the same initial state must
/// always produce the same result on every member.
pub trait State: Send {
    /// Validates a proposed change without applying it. Must be pure and
    /// deterministic, so that every member reaches the same verdict: a change
    /// accepted by a quorum can never be rejected by another member later.
    fn consider(&self, change: &[u8]) -> bool;

    /// Applies a committed change to the state.
    fn apply(&mut self, change: &[u8]);

    /// Serializes the current state for a snapshot.
    fn snapshot(&self) -> Vec<u8>;

    /// Replaces the state with a previously taken snapshot.
    fn restore(&mut self, snapshot: &[u8]) -> Result<()>;
}

/// The final outcome of a proposed change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The change was committed and will be applied on every member.
    Committed,
    /// The change was rejected by the state machine and removed from the log.
    Rejected,
    /// The proposing member lost leadership before the change committed. The
    /// change may or may not survive; the client must retry via the new
    /// leader (retries must therefore be idempotent).
    LostLeadership,
    /// The proposing member was shut down.
    Cancelled,
}

/// The proposer's handle to the eventual outcome of a proposed change. The
/// other half is a [`Resolver`] held by the leader until the entry commits,
/// is rejected, or leadership is lost.
pub struct ChangeToken {
    rx: crossbeam::channel::Receiver<Outcome>,
    outcome: Option<Outcome>,
}

impl ChangeToken {
    /// Creates a new unresolved token and its resolver.
    pub(crate) fn new() -> (Resolver, Self) {
        let (tx, rx) = crossbeam::channel::bounded(1);
        (Resolver { tx }, Self { rx, outcome: None })
    }

    /// Creates a token that is already resolved with the given outcome.
    pub(crate) fn resolved(outcome: Outcome) -> Self {
        let (resolver, token) = Self::new();
        resolver.resolve(outcome);
        token
    }

    /// Returns the outcome if the change has resolved, without blocking. A
    /// token whose member was dropped resolves as Cancelled.
    pub fn poll(&mut self) -> Option<Outcome> {
        use crossbeam::channel::TryRecvError;
        if self.outcome.is_none() {
            self.outcome = match self.rx.try_recv() {
                Ok(outcome) => Some(outcome),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => Some(Outcome::Cancelled),
            };
        }
        self.outcome
    }

    /// Blocks until the change resolves.
    pub fn wait(&mut self) -> Outcome {
        if self.outcome.is_none() {
            self.outcome = Some(self.rx.recv().unwrap_or(Outcome::Cancelled));
        }
        self.outcome.expect("outcome must be set")
    }
}

/// Resolves a change token. Consumed on resolve: every token has exactly one
/// resolution (the commit advancement, the rejection handler, the
/// leadership-loss handler, or implicitly the drop on shutdown).
#[derive(Debug)]
pub(crate) struct Resolver {
    tx: crossbeam::channel::Sender<Outcome>,
}

impl Resolver {
    pub(crate) fn resolve(self, outcome: Outcome) {
        // The proposer may have dropped the token; that's fine.
        let _ = self.tx.send(outcome);
    }
}
