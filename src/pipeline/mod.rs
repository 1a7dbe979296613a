// Curation pipeline: storage, processing stages, and the orchestrator that runs them

pub mod orchestrator;
pub mod processing;
pub mod report;
pub mod retry;
pub mod storage;

pub use orchestrator::CurationOrchestrator;
pub use report::{AggregateReport, PartitionReport, RunReport};
pub use storage::{FsPartitionStore, IdentityIndex, InMemoryPartitionStore, PartitionStore};
