//! Forced termination: timeout sweep, shutdown purge, and reissue after an
//! agent restart.
//!
//! Every path here unlinks a record under its container's lock and only then
//! takes the record's lock to change its state. A concurrent `complete` on the
//! same tag contends for the same bucket lock, so exactly one of them finalizes
//! the record and the other sees it gone.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::Engine;
use super::record::Operation;
use crate::domain::OpState;

/// What a shutdown purge removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub pending: usize,
    pub in_progress: usize,
}

/// What an agent-restart reissue did with the claimed operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReissueReport {
    pub requeued: usize,
    pub purged: usize,
}

impl<Req, Resp> Engine<Req, Resp> {
    /// Force one record to the terminal `target`, unlinking it from whichever
    /// container holds it. Returns `false` if something else finalized it first.
    pub(crate) fn finalize(&self, op: &Arc<Operation<Req, Resp>>, target: OpState) -> bool {
        loop {
            // The snapshot only picks the container; the state is rechecked
            // under that container's lock.
            let done = match op.state() {
                OpState::Queued => {
                    let mut queue = self.pending.lock();
                    let mut record = op.lock();
                    if record.state() != OpState::Queued {
                        continue;
                    }
                    queue.unlink(op.tag());
                    record.transition(target)
                }
                OpState::Claimed => {
                    let mut bucket = self.table.bucket(op.tag());
                    let mut record = op.lock();
                    if record.state() != OpState::Claimed {
                        continue;
                    }
                    bucket.unlink(op.tag());
                    record.transition(target)
                }
                OpState::Created => {
                    let mut record = op.lock();
                    if record.state() != OpState::Created {
                        continue;
                    }
                    record.transition(target)
                }
                OpState::Serviced | OpState::TimedOut | OpState::Cancelled | OpState::Purged => {
                    return false;
                }
            };
            if done {
                self.stats.record_terminal(target);
                debug!(tag = %op.tag(), state = ?target, "operation finalized");
            }
            return done;
        }
    }

    /// Time out every queued or claimed record whose deadline has passed.
    /// Returns how many were expired.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut expired = 0;

        {
            let mut queue = self.pending.lock();
            for op in queue.drain_where(|op| op.is_expired(now)) {
                if op.lock().transition(OpState::TimedOut) {
                    expired += 1;
                    debug!(tag = %op.tag(), "queued operation timed out");
                }
            }
        }

        for index in 0..self.table.bucket_count() {
            let mut bucket = self.table.bucket_at(index);
            for op in bucket.drain_where(|op| op.is_expired(now)) {
                if op.lock().transition(OpState::TimedOut) {
                    expired += 1;
                    debug!(tag = %op.tag(), "in-progress operation timed out");
                }
            }
        }

        for _ in 0..expired {
            self.stats.record_terminal(OpState::TimedOut);
        }
        expired
    }

    /// Close the engine and purge everything outstanding.
    ///
    /// Closing the queue first stops new submissions and claims, so nothing
    /// can enter either container behind the sweep. Each bucket is then
    /// visited once under its own lock, leaving completions for other buckets
    /// free to proceed. Calling this again is a no-op.
    pub fn shutdown(&self) -> PurgeReport {
        let mut report = PurgeReport::default();

        {
            let mut queue = self.pending.lock();
            if queue.is_closed() {
                return report;
            }
            for op in queue.close() {
                if op.lock().transition(OpState::Purged) {
                    report.pending += 1;
                    debug!(tag = %op.tag(), "purging pending operation");
                }
            }
        }
        self.pending.wake_all();

        for index in 0..self.table.bucket_count() {
            let mut bucket = self.table.bucket_at(index);
            for op in bucket.drain_all() {
                if op.lock().transition(OpState::Purged) {
                    report.in_progress += 1;
                    debug!(tag = %op.tag(), "purging in-progress operation");
                }
            }
        }

        for _ in 0..report.pending + report.in_progress {
            self.stats.record_terminal(OpState::Purged);
        }
        info!(
            pending = report.pending,
            in_progress = report.in_progress,
            "dispatch engine shut down"
        );
        report
    }

    /// The service agent went away: hand every claimed operation back to the
    /// pending queue so the next agent instance sees it again. Operations that
    /// have used up `max_reissues`, or any at all once shutdown has begun, are
    /// purged instead.
    pub fn reissue_in_progress(&self) -> ReissueReport {
        let mut report = ReissueReport::default();
        let max_reissues = self.config.max_reissues;

        for index in 0..self.table.bucket_count() {
            let mut queue = self.pending.lock();
            let mut bucket = self.table.bucket_at(index);
            for op in bucket.drain_all() {
                let mut record = op.lock();
                if !queue.is_closed() && record.attempts() < max_reissues && record.reissue() {
                    drop(record);
                    queue.push_back(op);
                    report.requeued += 1;
                    self.stats.record_reissue();
                } else if record.transition(OpState::Purged) {
                    warn!(
                        tag = %op.tag(),
                        attempts = record.attempts(),
                        "reissue limit reached, purging operation"
                    );
                    report.purged += 1;
                    self.stats.record_terminal(OpState::Purged);
                }
            }
        }

        if report.requeued > 0 {
            self.pending.wake_all();
        }
        info!(
            requeued = report.requeued,
            purged = report.purged,
            "reissued in-progress operations"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::Timeout;
    use crate::error::DispatchError;

    fn engine(max_reissues: u32) -> Arc<Engine<u32, u32>> {
        Arc::new(
            Engine::new(EngineConfig {
                hash_table_size: 7,
                op_timeout_secs: 0,
                max_reissues,
                ..EngineConfig::default()
            })
            .unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn unclaimed_operation_expires_after_deadline() {
        let engine = engine(5);
        let handle = engine
            .submit(1, Timeout::After(Duration::from_millis(1)))
            .unwrap();
        assert_eq!(engine.sweep_expired(), 0);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(engine.sweep_expired(), 1);
        assert_eq!(handle.state(), OpState::TimedOut);
        assert_eq!(engine.counts().pending, 0);
        assert_eq!(engine.counts().timed_out, 1);
        assert_eq!(engine.wait(&handle).await, Err(DispatchError::TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_expires_claimed_and_keeps_the_rest() {
        let engine = engine(5);
        let short = engine
            .submit(1, Timeout::After(Duration::from_millis(10)))
            .unwrap();
        let long = engine
            .submit(2, Timeout::After(Duration::from_secs(10)))
            .unwrap();
        let untimed = engine.submit(3, Timeout::Never).unwrap();
        engine.try_claim_next().unwrap();
        engine.try_claim_next().unwrap();

        tokio::time::advance(Duration::from_millis(10)).await;
        assert_eq!(engine.sweep_expired(), 1);
        assert_eq!(short.state(), OpState::TimedOut);
        assert_eq!(long.state(), OpState::Claimed);
        assert_eq!(untimed.state(), OpState::Queued);
        assert!(!engine.complete(short.tag(), 10));
        assert!(engine.complete(long.tag(), 20));
    }

    #[tokio::test]
    async fn shutdown_purges_queued_and_claimed() {
        let engine = engine(5);
        let claimed = engine.submit(1, Timeout::Never).unwrap();
        let queued = engine.submit(2, Timeout::Never).unwrap();
        engine.try_claim_next().unwrap();
        assert_eq!(claimed.state(), OpState::Claimed);
        assert_eq!(queued.state(), OpState::Queued);

        let report = engine.shutdown();
        assert_eq!(report, PurgeReport { pending: 1, in_progress: 1 });
        assert_eq!(engine.wait(&queued).await, Err(DispatchError::Purged));
        assert_eq!(engine.wait(&claimed).await, Err(DispatchError::Purged));
        assert_eq!(engine.counts().purged, 2);

        assert_eq!(engine.shutdown(), PurgeReport::default());
        assert!(!engine.complete(queued.tag(), 1));
    }

    #[tokio::test]
    async fn shutdown_leaves_serviced_results_readable() {
        let engine = engine(5);
        let handle = engine.submit(1, Timeout::Never).unwrap();
        let claimed = engine.try_claim_next().unwrap();
        assert!(engine.complete(claimed.tag, 100));

        assert_eq!(engine.shutdown(), PurgeReport::default());
        assert_eq!(engine.wait(&handle).await, Ok(100));
    }

    #[tokio::test]
    async fn reissue_requeues_claimed_operations() {
        let engine = engine(5);
        let handle = engine.submit(7, Timeout::Never).unwrap();
        let first = engine.try_claim_next().unwrap();
        assert_eq!(first.attempt, 0);

        let report = engine.reissue_in_progress();
        assert_eq!(report, ReissueReport { requeued: 1, purged: 0 });
        assert_eq!(handle.state(), OpState::Queued);
        assert!(!engine.complete(first.tag, 1));

        let second = engine.claim_next().await.unwrap();
        assert_eq!(second.tag, handle.tag());
        assert_eq!(second.attempt, 1);
        assert!(engine.complete(second.tag, 49));
        assert_eq!(engine.wait(&handle).await, Ok(49));
        assert_eq!(engine.counts().reissued, 1);
    }

    #[tokio::test]
    async fn reissue_purges_after_limit() {
        let engine = engine(1);
        let handle = engine.submit(7, Timeout::Never).unwrap();

        engine.try_claim_next().unwrap();
        assert_eq!(engine.reissue_in_progress().requeued, 1);
        engine.try_claim_next().unwrap();
        assert_eq!(
            engine.reissue_in_progress(),
            ReissueReport { requeued: 0, purged: 1 }
        );
        assert_eq!(engine.wait(&handle).await, Err(DispatchError::Purged));
        assert_eq!(handle.attempts(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sweep_racing_completions_finalizes_each_once() {
        let engine = engine(5);
        let handles: Vec<_> = (0..200)
            .map(|i| {
                engine
                    .submit(i, Timeout::After(Duration::from_millis(20)))
                    .unwrap()
            })
            .collect();
        let claimed: Vec<_> = std::iter::from_fn(|| engine.try_claim_next()).collect();
        assert_eq!(claimed.len(), 200);
        tokio::time::sleep(Duration::from_millis(30)).await;

        let completer = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                let mut won = 0usize;
                for op in claimed {
                    if engine.complete(op.tag, *op.request * 2) {
                        won += 1;
                    }
                    tokio::task::yield_now().await;
                }
                won
            })
        };
        tokio::task::yield_now().await;
        let expired = engine.sweep_expired();
        let won = completer.await.unwrap();

        assert_eq!(won + expired, 200);
        for (i, handle) in handles.iter().enumerate() {
            match engine.wait(handle).await {
                Ok(value) => assert_eq!(value, i as u32 * 2),
                Err(DispatchError::TimedOut) => {}
                Err(other) => panic!("unexpected {other:?}"),
            }
        }
        let counts = engine.counts();
        assert_eq!(counts.in_progress, 0);
        assert_eq!(counts.serviced + counts.timed_out, 200);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shutdown_racing_completions_finalizes_each_once() {
        let engine = engine(5);
        let handles: Vec<_> = (0..200)
            .map(|i| engine.submit(i, Timeout::Never).unwrap())
            .collect();
        let claimed: Vec<_> = std::iter::from_fn(|| engine.try_claim_next()).collect();
        assert_eq!(claimed.len(), 200);

        let completer = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                let mut won = 0u64;
                for op in claimed {
                    if engine.complete(op.tag, *op.request * 2) {
                        won += 1;
                    }
                    tokio::task::yield_now().await;
                }
                won
            })
        };
        tokio::task::yield_now().await;
        let report = engine.shutdown();
        let won = completer.await.unwrap();

        assert_eq!(won + report.in_progress as u64, 200);
        for (i, handle) in handles.iter().enumerate() {
            match engine.wait(handle).await {
                Ok(value) => assert_eq!(value, i as u32 * 2),
                Err(DispatchError::Purged) => {}
                Err(other) => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(engine.counts().in_progress, 0);
    }
}
