//! Operation record: request, response slot, state, and the waiter's wakeup.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::domain::{OpState, Tag};
use crate::error::DispatchError;

/// What the completion path attaches: the response, or the agent's failure reason.
pub(crate) type Reply<Resp> = Result<Resp, String>;

struct OpInner<Resp> {
    state: OpState,
    reply: Option<Reply<Resp>>,
    attempts: u32,
    consumed: bool,
    released: bool,
}

/// One outstanding unit of work.
///
/// Design:
/// - The request is shared read-only with the service agent (`Arc<Req>`).
/// - `inner` is the per-record lock; every state change goes through it.
/// - `state_tx` republishes each transition so waiters can sleep on it.
///   It is only written while `inner` is held, so the two never disagree.
pub struct Operation<Req, Resp> {
    tag: Tag,
    request: Arc<Req>,
    deadline: Option<Instant>,
    inner: Mutex<OpInner<Resp>>,
    state_tx: watch::Sender<OpState>,
}

impl<Req, Resp> Operation<Req, Resp> {
    /// Allocate a record in the `Created` state.
    pub fn create(tag: Tag, request: Req, deadline: Option<Instant>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(OpState::Created);
        Arc::new(Self {
            tag,
            request: Arc::new(request),
            deadline,
            inner: Mutex::new(OpInner {
                state: OpState::Created,
                reply: None,
                attempts: 0,
                consumed: false,
                released: false,
            }),
            state_tx,
        })
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn request(&self) -> &Arc<Req> {
        &self.request
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Lock-free snapshot of the state. May be stale by the time it is used;
    /// decisions must be rechecked under `lock()`.
    pub fn state(&self) -> OpState {
        *self.state_tx.borrow()
    }

    pub fn attempts(&self) -> u32 {
        self.inner.lock().attempts
    }

    pub(crate) fn lock(&self) -> OpGuard<'_, Resp> {
        OpGuard {
            inner: self.inner.lock(),
            state_tx: &self.state_tx,
        }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<OpState> {
        self.state_tx.subscribe()
    }

    /// Terminal state plus the outcome. Takes the response out of the record,
    /// so only the first call after `Serviced` returns it.
    pub fn read_result(&self) -> (OpState, Result<Resp, DispatchError>) {
        let mut inner = self.inner.lock();
        let state = inner.state;
        let result = match state {
            OpState::Serviced => {
                if inner.consumed || inner.released {
                    Err(DispatchError::ResultConsumed)
                } else {
                    inner.consumed = true;
                    match inner.reply.take() {
                        Some(Ok(response)) => Ok(response),
                        Some(Err(reason)) => Err(DispatchError::Service(reason)),
                        None => Err(DispatchError::ResultConsumed),
                    }
                }
            }
            OpState::TimedOut => Err(DispatchError::TimedOut),
            OpState::Cancelled => Err(DispatchError::Cancelled),
            OpState::Purged => Err(DispatchError::Purged),
            OpState::Created | OpState::Queued | OpState::Claimed => {
                Err(DispatchError::NotFinished)
            }
        };
        (state, result)
    }

    /// Drop any unread response. Returns `false` if already released.
    pub fn release(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.released {
            return false;
        }
        inner.released = true;
        inner.reply = None;
        true
    }
}

/// Held per-record lock.
pub(crate) struct OpGuard<'a, Resp> {
    inner: MutexGuard<'a, OpInner<Resp>>,
    state_tx: &'a watch::Sender<OpState>,
}

impl<Resp> OpGuard<'_, Resp> {
    pub(crate) fn state(&self) -> OpState {
        self.inner.state
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.inner.attempts
    }

    /// Move to `next` and wake waiters. Illegal transitions leave the record
    /// untouched and return `false`.
    pub(crate) fn transition(&mut self, next: OpState) -> bool {
        if !self.inner.state.can_transition_to(next) {
            return false;
        }
        self.inner.state = next;
        self.state_tx.send_replace(next);
        true
    }

    /// Attach the reply and move `Claimed -> Serviced`.
    pub(crate) fn service(&mut self, reply: Reply<Resp>) -> bool {
        if self.inner.state != OpState::Claimed {
            return false;
        }
        self.inner.reply = Some(reply);
        self.transition(OpState::Serviced)
    }

    /// `Claimed -> Queued`, counting the attempt.
    pub(crate) fn reissue(&mut self) -> bool {
        if self.inner.state != OpState::Claimed {
            return false;
        }
        self.inner.attempts += 1;
        self.transition(OpState::Queued)
    }
}

/// Caller-side handle to a submitted operation.
pub struct OpHandle<Req, Resp> {
    op: Arc<Operation<Req, Resp>>,
}

impl<Req, Resp> OpHandle<Req, Resp> {
    pub(crate) fn new(op: Arc<Operation<Req, Resp>>) -> Self {
        Self { op }
    }

    pub(crate) fn op(&self) -> &Arc<Operation<Req, Resp>> {
        &self.op
    }

    pub fn tag(&self) -> Tag {
        self.op.tag()
    }

    pub fn state(&self) -> OpState {
        self.op.state()
    }

    pub fn attempts(&self) -> u32 {
        self.op.attempts()
    }

    pub fn request(&self) -> &Req {
        self.op.request()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.op.deadline()
    }

    /// See [`Operation::read_result`]. Call only after the wait returned.
    pub fn read_result(&self) -> (OpState, Result<Resp, DispatchError>) {
        self.op.read_result()
    }

    pub fn release(&self) -> bool {
        self.op.release()
    }
}

impl<Req, Resp> Clone for OpHandle<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            op: Arc::clone(&self.op),
        }
    }
}

impl<Req, Resp> std::fmt::Debug for OpHandle<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpHandle")
            .field("tag", &self.tag())
            .field("state", &self.state())
            .finish()
    }
}
