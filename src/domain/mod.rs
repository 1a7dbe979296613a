// Domain data shapes shared across layers

pub mod coerce;
pub mod dataset;
pub mod partition;
pub mod record;
pub mod rules;
pub mod value;

pub use dataset::{AggregateSpec, Dataset, FieldSpec, Reduction};
pub use partition::{PartitionKey, RejectArea, Tier, WriteMode};
pub use record::{IdentityKey, RawRecord, Record};
pub use rules::{ArithmeticOp, CalendarField, DatePart, FilterPredicate, ReplaceMode, TransformRule};
pub use value::{FieldType, Value};
