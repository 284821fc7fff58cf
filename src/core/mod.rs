pub mod cancel;
pub mod comparator;
pub mod engine;
pub mod oracle;
pub mod orchestrator;
pub mod output;
pub mod scanner;

pub use cancel::CancellationToken;
pub use comparator::{compare_files, needs_transfer, FileRelation};
pub use engine::{Direction, SyncEngine, SyncReport, TransferRequest};
pub use oracle::PathOracle;
pub use orchestrator::{HostTaskResult, HostTaskState, Operation, Orchestrator, Outcome, RunSummary};
pub use output::{LineStyle, OutputAggregator, OutputLine, OutputMode, OutputSink};
pub use scanner::{FileScanner, ScanConfig};
