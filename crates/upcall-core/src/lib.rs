//! upcall-core
//!
//! Dispatch engine that bridges call sites which block on a result to an
//! asynchronous service agent which pulls work, performs it, and pushes
//! results back.
//!
//! # Modules
//! - **domain**: tags and the operation state machine
//! - **engine**: operation records, pending queue, in-progress table, and the
//!   submit / wait / claim / complete API with timeout, cancel, and purge paths
//! - **app**: background drivers (periodic timeout sweep)
//! - **agent**: service-agent worker pool and the `ServiceHandler` seam
//! - **config**: `EngineConfig`
//! - **observability**: `EngineCounts` snapshots
//! - **error**: `DispatchError`, `EngineError`

pub mod agent;
pub mod app;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod observability;

pub use agent::{AgentGroup, Disposition, ServiceHandler};
pub use app::ReaperLoop;
pub use config::EngineConfig;
pub use domain::{OpState, Tag};
pub use engine::{ClaimedOp, Engine, OpHandle, PurgeReport, ReissueReport, Timeout};
pub use error::{DispatchError, EngineError};
pub use observability::EngineCounts;
