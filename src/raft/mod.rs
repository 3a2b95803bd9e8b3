//! The Raft consensus protocol: a cluster of members maintains a replicated,
//! deterministic state machine. Clients propose changes at any member; the
//! protocol guarantees that all non-faulty members apply an identical sequence
//! of committed changes, tolerating crashes, partitions, and message
//! reordering of a minority of members. See the Raft paper for background:
//! "In Search of an Understandable Consensus Algorithm" (Ongaro & Ousterhout).

mod config;
mod log;
mod member;
mod message;
mod state;

pub use config::{Configuration, MemberId, Membership};
pub use log::{Entry, Index, Log, Payload, Snapshot};
pub use member::Member;
pub use message::{AppendOutcome, Envelope, Message};
pub use state::{ChangeToken, Outcome, State};

use std::ops::Range;
use std::time::Duration;

/// A leader term.
pub type Term = u64;

/// A logical clock interval as a number of ticks.
pub type Ticks = u8;

/// The interval between logical clock ticks. All Raft timeouts are measured
/// in ticks; the engine itself never reads a wall clock.
pub const TICK_INTERVAL: Duration = Duration::from_millis(15);

/// The randomized election timeout range, in ticks. This avoids election ties
/// by prioritizing the member with the shortest timeout. 10-20 ticks of 15 ms
/// gives the commonly recommended 150-300 ms.
pub const ELECTION_TIMEOUT_RANGE: Range<Ticks> = 10..20;

/// The interval between leader heartbeats, in ticks. Must be well below the
/// minimum election timeout, or followers will call spurious elections.
pub const HEARTBEAT_INTERVAL: Ticks = 4;
