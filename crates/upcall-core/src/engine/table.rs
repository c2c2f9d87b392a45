//! In-progress table: claimed operations waiting for a response, keyed by tag.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::record::{Operation, Reply};
use crate::domain::{OpState, Tag};
use crate::error::EngineError;

/// An operation handed to the service agent.
#[derive(Debug)]
pub struct ClaimedOp<Req> {
    pub tag: Tag,
    pub request: Arc<Req>,
    /// Reissue count at claim time (0 on the first delivery).
    pub attempt: u32,
}

/// One hash chain. Every record in it is `Claimed`.
pub(crate) struct Bucket<Req, Resp> {
    chain: Vec<Arc<Operation<Req, Resp>>>,
}

impl<Req, Resp> Bucket<Req, Resp> {
    fn position(&self, tag: Tag) -> Option<usize> {
        self.chain.iter().position(|op| op.tag() == tag)
    }

    pub(crate) fn find(&self, tag: Tag) -> Option<&Arc<Operation<Req, Resp>>> {
        self.chain.iter().find(|op| op.tag() == tag)
    }

    pub(crate) fn unlink(&mut self, tag: Tag) -> Option<Arc<Operation<Req, Resp>>> {
        let index = self.position(tag)?;
        Some(self.chain.swap_remove(index))
    }

    pub(crate) fn drain_where(
        &mut self,
        mut pred: impl FnMut(&Operation<Req, Resp>) -> bool,
    ) -> Vec<Arc<Operation<Req, Resp>>> {
        let (gone, keep) = std::mem::take(&mut self.chain)
            .into_iter()
            .partition(|op| pred(&**op));
        self.chain = keep;
        gone
    }

    pub(crate) fn drain_all(&mut self) -> Vec<Arc<Operation<Req, Resp>>> {
        std::mem::take(&mut self.chain)
    }

    pub(crate) fn len(&self) -> usize {
        self.chain.len()
    }
}

/// Fixed-size hash table of chains. Bucket index is `tag mod bucket_count`;
/// the table never rehashes, since it only holds in-flight work.
///
/// Each bucket has its own lock for structural changes. Record contents are
/// guarded by the record's lock, always taken after the bucket's.
pub struct InProgressTable<Req, Resp> {
    buckets: Box<[Mutex<Bucket<Req, Resp>>]>,
}

impl<Req, Resp> InProgressTable<Req, Resp> {
    /// Allocate `bucket_count` empty chains. Allocation failure is reported
    /// instead of aborting, since it must keep the engine from starting.
    pub fn with_buckets(bucket_count: usize) -> Result<Self, EngineError> {
        if bucket_count == 0 {
            return Err(EngineError::InvalidTableSize);
        }
        let mut buckets = Vec::new();
        buckets
            .try_reserve_exact(bucket_count)
            .map_err(|source| EngineError::TableAllocation {
                buckets: bucket_count,
                source,
            })?;
        buckets.extend((0..bucket_count).map(|_| Mutex::new(Bucket { chain: Vec::new() })));
        Ok(Self {
            buckets: buckets.into_boxed_slice(),
        })
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket_index(&self, tag: Tag) -> usize {
        (tag.as_u64() % self.buckets.len() as u64) as usize
    }

    pub(crate) fn bucket(&self, tag: Tag) -> MutexGuard<'_, Bucket<Req, Resp>> {
        self.buckets[self.bucket_index(tag)].lock()
    }

    pub(crate) fn bucket_at(&self, index: usize) -> MutexGuard<'_, Bucket<Req, Resp>> {
        self.buckets[index].lock()
    }

    /// Move a `Queued` record to `Claimed` and insert it under its tag.
    /// Returns `None`, leaving the record alone, if it is no longer `Queued`.
    pub fn claim(&self, op: Arc<Operation<Req, Resp>>) -> Option<ClaimedOp<Req>> {
        let mut bucket = self.bucket(op.tag());
        let mut record = op.lock();
        if !record.state().is_claimable() || !record.transition(OpState::Claimed) {
            return None;
        }
        let claimed = ClaimedOp {
            tag: op.tag(),
            request: Arc::clone(op.request()),
            attempt: record.attempts(),
        };
        drop(record);
        debug_assert!(bucket.find(op.tag()).is_none(), "tag collision");
        bucket.chain.push(op);
        Some(claimed)
    }

    /// Attach `reply` to the claimed record for `tag`, mark it `Serviced`,
    /// and unlink it. Returns `false` for an unknown tag: a late or duplicate
    /// response is expected and ignored.
    pub fn complete(&self, tag: Tag, reply: Reply<Resp>) -> bool {
        let mut bucket = self.bucket(tag);
        let Some(index) = bucket.position(tag) else {
            return false;
        };
        if !bucket.chain[index].lock().service(reply) {
            return false;
        }
        bucket.chain.swap_remove(index);
        true
    }

    pub fn lookup(&self, tag: Tag) -> Option<Arc<Operation<Req, Resp>>> {
        self.bucket(tag).find(tag).cloned()
    }

    /// Total claimed records. Buckets are locked one at a time, so this is
    /// only exact when the table is quiet.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
