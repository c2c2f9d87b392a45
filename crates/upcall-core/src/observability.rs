use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::domain::OpState;

/// Point-in-time view of an engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub serviced: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub purged: u64,
    pub reissued: u64,
    pub stray_completions: u64,
}

#[derive(Debug, Default)]
pub(crate) struct EngineStats {
    serviced: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    purged: AtomicU64,
    reissued: AtomicU64,
    stray_completions: AtomicU64,
}

impl EngineStats {
    pub(crate) fn record_terminal(&self, state: OpState) {
        let counter = match state {
            OpState::Serviced => &self.serviced,
            OpState::TimedOut => &self.timed_out,
            OpState::Cancelled => &self.cancelled,
            OpState::Purged => &self.purged,
            OpState::Created | OpState::Queued | OpState::Claimed => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reissue(&self) {
        self.reissued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stray(&self) {
        self.stray_completions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, pending: usize, in_progress: usize) -> EngineCounts {
        EngineCounts {
            pending,
            in_progress,
            serviced: self.serviced.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            purged: self.purged.load(Ordering::Relaxed),
            reissued: self.reissued.load(Ordering::Relaxed),
            stray_completions: self.stray_completions.load(Ordering::Relaxed),
        }
    }
}
