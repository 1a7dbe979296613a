// Pipeline processing: validation, cleaning, dedup, aggregation and cataloging

pub mod aggregate;
pub mod catalog;
pub mod dedup;
pub mod schema;
pub mod transform;

pub use aggregate::{aggregate, AggregateState};
pub use catalog::{CatalogEntry, CatalogPublisher, EntryMetadata, ExternalTriple, PublishOutcome};
pub use dedup::{DedupOutcome, Deduplicator};
pub use schema::{Rejected, SchemaEnforcer, ValidatedBatch};
pub use transform::{transform, TransformOutcome, Transformer};
