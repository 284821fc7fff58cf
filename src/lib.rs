pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod registry;
pub mod session;
pub mod storage;

pub use core::{CancellationToken, Operation, Orchestrator, OutputSink, RunSummary, SyncEngine, SyncReport};
pub use error::TaskError;
pub use registry::{HostTarget, Registry};
