//! Pending queue: FIFO of operations waiting for the service agent.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::Notify;

use super::record::Operation;
use crate::domain::{OpState, Tag};
use crate::error::DispatchError;

/// Queue contents. Every record in `ops` is `Queued`.
pub(crate) struct PendingInner<Req, Resp> {
    ops: VecDeque<Arc<Operation<Req, Resp>>>,
    closed: bool,
}

impl<Req, Resp> PendingInner<Req, Resp> {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn len(&self) -> usize {
        self.ops.len()
    }

    /// Append without a capacity check (reissued work was already admitted).
    pub(crate) fn push_back(&mut self, op: Arc<Operation<Req, Resp>>) {
        self.ops.push_back(op);
    }

    pub(crate) fn unlink(&mut self, tag: Tag) -> Option<Arc<Operation<Req, Resp>>> {
        let index = self.ops.iter().position(|op| op.tag() == tag)?;
        self.ops.remove(index)
    }

    /// Remove every record matching `pred`, keeping the rest in order.
    pub(crate) fn drain_where(
        &mut self,
        mut pred: impl FnMut(&Operation<Req, Resp>) -> bool,
    ) -> Vec<Arc<Operation<Req, Resp>>> {
        let (gone, keep): (VecDeque<_>, VecDeque<_>) =
            std::mem::take(&mut self.ops).into_iter().partition(|op| pred(&**op));
        self.ops = keep;
        gone.into()
    }

    /// Refuse further pushes and hand back everything still queued.
    pub(crate) fn close(&mut self) -> Vec<Arc<Operation<Req, Resp>>> {
        self.closed = true;
        self.ops.drain(..).collect()
    }
}

/// FIFO shared by submitting callers (producers) and the service agent.
///
/// Capacity is unbounded unless configured; a bounded queue rejects new
/// submissions with `QueueFull` instead of blocking the caller.
pub struct PendingQueue<Req, Resp> {
    inner: Mutex<PendingInner<Req, Resp>>,
    notify: Notify,
    capacity: Option<usize>,
}

impl<Req, Resp> PendingQueue<Req, Resp> {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(PendingInner {
                ops: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PendingInner<Req, Resp>> {
        self.inner.lock()
    }

    /// Move a fresh record `Created -> Queued` and append it.
    pub fn push(&self, op: Arc<Operation<Req, Resp>>) -> Result<(), DispatchError> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(DispatchError::Shutdown);
            }
            if let Some(capacity) = self.capacity {
                if inner.ops.len() >= capacity {
                    return Err(DispatchError::QueueFull(capacity));
                }
            }
            let mut record = op.lock();
            debug_assert_eq!(record.state(), OpState::Created);
            if !record.transition(OpState::Queued) {
                return Err(DispatchError::Shutdown);
            }
            drop(record);
            inner.ops.push_back(op);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Take the head without waiting. `take` runs under the queue lock and may
    /// decline a record by returning `None`, in which case the next one is tried.
    pub fn try_pop<T>(
        &self,
        mut take: impl FnMut(Arc<Operation<Req, Resp>>) -> Option<T>,
    ) -> Option<T> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        while let Some(op) = inner.ops.pop_front() {
            if let Some(value) = take(op) {
                return Some(value);
            }
        }
        None
    }

    /// Take the head, waiting while the queue is empty.
    /// Returns `None` once the queue is closed.
    pub async fn pop_blocking_for_agent<T>(
        &self,
        mut take: impl FnMut(Arc<Operation<Req, Resp>>) -> Option<T>,
    ) -> Option<T> {
        loop {
            // Register before looking so a push between the check and the
            // await still wakes us.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return None;
                }
                while let Some(op) = inner.ops.pop_front() {
                    if let Some(value) = take(op) {
                        return Some(value);
                    }
                }
            }

            notified.await;
        }
    }

    /// Wake every waiting agent, e.g. after a close or a bulk requeue.
    pub(crate) fn wake_all(&self) {
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_closed()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    type Op = Operation<u32, ()>;

    fn op(tag: u64) -> Arc<Op> {
        Operation::create(Tag::new(tag), tag as u32, None)
    }

    #[test]
    fn push_marks_queued() {
        let queue = PendingQueue::new(None);
        let record = op(1);
        queue.push(Arc::clone(&record)).unwrap();
        assert_eq!(record.state(), OpState::Queued);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn pops_in_fifo_order() {
        let queue = PendingQueue::new(None);
        for tag in 1..=3 {
            queue.push(op(tag)).unwrap();
        }
        let order: Vec<u64> = std::iter::from_fn(|| queue.try_pop(|op| Some(op.tag().as_u64())))
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn bounded_queue_rejects_when_full() {
        let queue = PendingQueue::new(Some(2));
        queue.push(op(1)).unwrap();
        queue.push(op(2)).unwrap();
        let rejected = op(3);
        assert_eq!(
            queue.push(Arc::clone(&rejected)),
            Err(DispatchError::QueueFull(2))
        );
        assert_eq!(rejected.state(), OpState::Created);
    }

    #[test]
    fn closed_queue_rejects_push() {
        let queue = PendingQueue::new(None);
        queue.push(op(1)).unwrap();
        let drained = queue.lock().close();
        assert_eq!(drained.len(), 1);
        assert_eq!(queue.push(op(2)), Err(DispatchError::Shutdown));
        assert!(queue.try_pop(Some).is_none());
    }

    #[test]
    fn unlink_removes_from_the_middle() {
        let queue = PendingQueue::new(None);
        for tag in 1..=3 {
            queue.push(op(tag)).unwrap();
        }
        let removed = queue.lock().unlink(Tag::new(2)).unwrap();
        assert_eq!(removed.tag(), Tag::new(2));
        assert!(queue.lock().unlink(Tag::new(2)).is_none());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn drain_where_keeps_order_of_the_rest() {
        let queue = PendingQueue::new(None);
        for tag in 1..=5 {
            queue.push(op(tag)).unwrap();
        }
        let gone = queue.lock().drain_where(|op| op.tag().as_u64() % 2 == 0);
        assert_eq!(gone.len(), 2);
        let rest: Vec<u64> = std::iter::from_fn(|| queue.try_pop(|op| Some(op.tag().as_u64())))
            .collect();
        assert_eq!(rest, vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn blocked_agent_wakes_on_push() {
        let queue = Arc::new(PendingQueue::<u32, ()>::new(None));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue
                    .pop_blocking_for_agent(|op| Some(op.tag()))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        queue.push(op(9)).unwrap();
        let tag = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tag, Some(Tag::new(9)));
    }

    #[tokio::test]
    async fn blocked_agent_sees_close() {
        let queue = Arc::new(PendingQueue::<u32, ()>::new(None));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop_blocking_for_agent(|op| Some(op.tag())).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        queue.lock().close();
        queue.wake_all();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, None);
    }
}
