//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Prime bucket count for the in-progress table.
pub const DEFAULT_HASH_TABLE_SIZE: usize = 509;
pub const DEFAULT_OP_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_MAX_REISSUES: u32 = 5;

/// Tunables for one dispatch engine.
///
/// Missing fields fall back to their defaults when deserialized, so a config
/// file only needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bucket count of the in-progress table. Fixed for the engine's lifetime.
    pub hash_table_size: usize,

    /// Default per-operation timeout. 0 disables the deadline, as does a value
    /// too large to add to the current instant.
    pub op_timeout_secs: u64,

    /// Period of the background timeout sweep.
    pub sweep_interval_ms: u64,

    /// Upper bound on queued operations. `None` means unbounded.
    pub pending_capacity: Option<usize>,

    /// How many times a claimed operation is requeued after an agent restart
    /// before it is purged instead.
    pub max_reissues: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hash_table_size: DEFAULT_HASH_TABLE_SIZE,
            op_timeout_secs: DEFAULT_OP_TIMEOUT_SECS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            pending_capacity: None,
            max_reissues: DEFAULT_MAX_REISSUES,
        }
    }
}

impl EngineConfig {
    /// Default deadline applied by `Timeout::Default`.
    pub fn op_timeout(&self) -> Option<Duration> {
        match self.op_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.hash_table_size == 0 {
            return Err(EngineError::InvalidTableSize);
        }
        if self.sweep_interval_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "sweep_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.pending_capacity == Some(0) {
            return Err(EngineError::InvalidConfig(
                "pending_capacity must be non-zero when set".to_string(),
            ));
        }
        Ok(())
    }
}
