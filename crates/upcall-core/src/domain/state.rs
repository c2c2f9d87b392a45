//! Operation state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle state of an operation record.
///
/// State transitions:
/// - Created -> Queued -> Claimed -> Serviced
/// - Queued | Claimed -> TimedOut (deadline elapsed before a response)
/// - Queued | Claimed -> Cancelled (the submitting caller gave up)
/// - Created | Queued | Claimed -> Purged (engine teardown)
/// - Claimed -> Queued (reissue after the service agent restarted)
///
/// A record sits in the pending queue iff it is `Queued`, and in the
/// in-progress table iff it is `Claimed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpState {
    /// Allocated, not yet visible to the service agent.
    Created,

    /// Waiting in the pending queue.
    Queued,

    /// Handed to the service agent, waiting for its response.
    Claimed,

    /// Response attached.
    Serviced,

    /// Deadline elapsed first.
    TimedOut,

    /// Abandoned by the submitting caller.
    Cancelled,

    /// Forced to terminate by the engine.
    Purged,
}

impl OpState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OpState::Serviced | OpState::TimedOut | OpState::Cancelled | OpState::Purged
        )
    }

    /// Can the service agent claim a record in this state?
    pub fn is_claimable(self) -> bool {
        matches!(self, OpState::Queued)
    }

    /// Is `self -> next` a legal transition?
    pub fn can_transition_to(self, next: OpState) -> bool {
        use OpState::*;
        match (self, next) {
            (Created, Queued) => true,
            (Queued, Claimed) => true,
            (Claimed, Serviced) => true,
            (Claimed, Queued) => true,
            (Queued | Claimed, TimedOut | Cancelled) => true,
            (Created | Queued | Claimed, Purged) => true,
            _ => false,
        }
    }
}
