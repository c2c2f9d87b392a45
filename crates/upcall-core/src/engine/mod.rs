//! Dispatch engine: matches synchronous call sites with an asynchronous
//! service agent.
//!
//! Call sites `submit` an operation and `wait` for it. The service agent
//! `claim_next`s operations and answers them with `complete` or `fail`.
//! Timeout, cancellation, and shutdown can force any outstanding operation to a
//! terminal state; see [`lifecycle`] for those paths.
//!
//! Lock order is always: pending queue, then table bucket, then record.

mod lifecycle;
mod pending;
mod record;
mod table;

pub use self::lifecycle::{PurgeReport, ReissueReport};
pub use self::pending::PendingQueue;
pub use self::record::{OpHandle, Operation};
pub use self::table::{ClaimedOp, InProgressTable};

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use self::record::Reply;
use crate::config::EngineConfig;
use crate::domain::{OpState, Tag, TagAllocator};
use crate::error::{DispatchError, EngineError};
use crate::observability::{EngineCounts, EngineStats};

/// Deadline policy for one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    /// Use the engine's configured `op_timeout`.
    #[default]
    Default,
    After(Duration),
    Never,
}

/// One dispatch engine. Build it once, share it behind an `Arc`.
pub struct Engine<Req, Resp> {
    config: EngineConfig,
    tags: TagAllocator,
    pending: PendingQueue<Req, Resp>,
    table: InProgressTable<Req, Resp>,
    stats: EngineStats,
}

impl<Req, Resp> Engine<Req, Resp> {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let table = InProgressTable::with_buckets(config.hash_table_size)?;
        info!(
            buckets = config.hash_table_size,
            op_timeout_secs = config.op_timeout_secs,
            pending_capacity = ?config.pending_capacity,
            "dispatch engine initialized"
        );
        Ok(Self {
            pending: PendingQueue::new(config.pending_capacity),
            table,
            tags: TagAllocator::new(),
            stats: EngineStats::default(),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.pending.is_closed()
    }

    fn resolve_deadline(&self, timeout: Timeout) -> Option<Instant> {
        let after = match timeout {
            Timeout::Default => self.config.op_timeout(),
            Timeout::After(duration) => Some(duration),
            Timeout::Never => None,
        };
        // A deadline past the clock's range can never elapse: treat it as none.
        after.and_then(|duration| Instant::now().checked_add(duration))
    }

    // ---------------------------------------------------------------
    // Call-site API
    // ---------------------------------------------------------------

    /// Queue `request` for the service agent under a fresh tag.
    pub fn submit(&self, request: Req, timeout: Timeout) -> Result<OpHandle<Req, Resp>, DispatchError> {
        let tag = self.tags.next_tag();
        let op = Operation::create(tag, request, self.resolve_deadline(timeout));
        self.pending.push(Arc::clone(&op))?;
        debug!(%tag, "operation queued");
        Ok(OpHandle::new(op))
    }

    /// Wait until the operation is terminal and return its outcome.
    ///
    /// If the operation's deadline passes first, the record is forced to
    /// `TimedOut` here, without waiting for the background sweep.
    pub async fn wait(&self, handle: &OpHandle<Req, Resp>) -> Result<Resp, DispatchError> {
        let op = handle.op();
        let mut rx = op.subscribe();
        match op.deadline() {
            Some(deadline) => {
                let elapsed =
                    tokio::time::timeout_at(deadline, rx.wait_for(|state| state.is_terminal()))
                        .await
                        .is_err();
                if elapsed {
                    self.finalize(op, OpState::TimedOut);
                }
            }
            None => {
                // The sender lives in the record, which the handle keeps alive.
                let _ = rx.wait_for(|state| state.is_terminal()).await;
            }
        }
        handle.read_result().1
    }

    /// Like [`Engine::wait`], but gives up when `token` is cancelled. A
    /// response that wins the race is still returned.
    pub async fn wait_or_cancel(
        &self,
        handle: &OpHandle<Req, Resp>,
        token: &CancellationToken,
    ) -> Result<Resp, DispatchError> {
        tokio::select! {
            result = self.wait(handle) => result,
            () = token.cancelled() => {
                self.cancel(handle);
                handle.read_result().1
            }
        }
    }

    /// Abandon the operation. Later responses for its tag are ignored.
    /// Returns `false` if it had already reached a terminal state.
    pub fn cancel(&self, handle: &OpHandle<Req, Resp>) -> bool {
        self.finalize(handle.op(), OpState::Cancelled)
    }

    // ---------------------------------------------------------------
    // Service-agent API
    // ---------------------------------------------------------------

    /// Claim the oldest queued operation, waiting while there is none.
    /// Returns `None` once the engine is shutting down.
    pub async fn claim_next(&self) -> Option<ClaimedOp<Req>> {
        let claimed = self
            .pending
            .pop_blocking_for_agent(|op| self.table.claim(op))
            .await?;
        debug!(tag = %claimed.tag, attempt = claimed.attempt, "operation claimed");
        Some(claimed)
    }

    /// Non-blocking [`Engine::claim_next`].
    pub fn try_claim_next(&self) -> Option<ClaimedOp<Req>> {
        self.pending.try_pop(|op| self.table.claim(op))
    }

    /// Deliver the response for `tag`. Returns `false` if no claimed
    /// operation has that tag (it already finished, timed out, was
    /// cancelled or purged, or never existed).
    pub fn complete(&self, tag: Tag, response: Resp) -> bool {
        self.finish(tag, Ok(response))
    }

    /// Report that the agent could not perform `tag`. Same matching rules as
    /// [`Engine::complete`]; the waiter receives `DispatchError::Service`.
    pub fn fail(&self, tag: Tag, reason: impl Into<String>) -> bool {
        self.finish(tag, Err(reason.into()))
    }

    fn finish(&self, tag: Tag, reply: Reply<Resp>) -> bool {
        if self.table.complete(tag, reply) {
            self.stats.record_terminal(OpState::Serviced);
            debug!(%tag, "operation serviced");
            true
        } else {
            self.stats.record_stray();
            debug!(%tag, "ignoring response for unknown tag");
            false
        }
    }

    pub fn counts(&self) -> EngineCounts {
        self.stats.snapshot(self.pending.len(), self.table.len())
    }
}

impl<Req, Resp> Drop for Engine<Req, Resp> {
    fn drop(&mut self) {
        if !self.pending.is_closed() {
            self.shutdown();
        }
    }
}
